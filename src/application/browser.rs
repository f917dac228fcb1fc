//! Lifecycle of the shared headless browser.
//!
//! Every render opens a short-lived page on one long-lived browser process.
//! [`BrowserManager`] launches that process lazily, shares a single launch
//! between concurrent callers and relaunches after the connection drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tracing::{info, warn};

use crate::util::lock::mutex_lock;

const TARGET: &str = "ogsync::application::browser";

/// Card dimensions in CSS pixels.
pub const CARD_WIDTH: u32 = 1200;
pub const CARD_HEIGHT: u32 = 630;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Image,
    Font,
    Script,
    Media,
    Other,
}

impl ResourceKind {
    /// Cards are static markup; scripts, media and XHR never need to load.
    pub fn is_allowed_for_cards(self) -> bool {
        matches!(
            self,
            ResourceKind::Document
                | ResourceKind::Stylesheet
                | ResourceKind::Image
                | ResourceKind::Font
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureClip {
    pub width: u32,
    pub height: u32,
}

impl CaptureClip {
    pub const CARD: CaptureClip = CaptureClip {
        width: CARD_WIDTH,
        height: CARD_HEIGHT,
    };
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    #[error("browser unavailable: launch failed: {0}")]
    Launch(String),
    #[error("browser unavailable: connection lost")]
    Disconnected,
    #[error("browser unavailable: could not open page: {0}")]
    Page(String),
}

impl BrowserError {
    pub fn launch(message: impl ToString) -> Self {
        Self::Launch(message.to_string())
    }

    pub fn page(message: impl ToString) -> Self {
        Self::Page(message.to_string())
    }
}

#[derive(Debug, Error)]
#[error("{op} failed: {message}")]
pub struct PageError {
    pub op: &'static str,
    pub message: String,
}

impl PageError {
    pub fn new(op: &'static str, message: impl ToString) -> Self {
        Self {
            op,
            message: message.to_string(),
        }
    }
}

/// One isolated browser tab.
#[async_trait]
pub trait PageHandle: Send {
    async fn set_viewport(&mut self, width: u32, height: u32) -> Result<(), PageError>;

    /// Aborts every subsequent request whose resource kind fails `allow`.
    async fn filter_requests(&mut self, allow: fn(ResourceKind) -> bool) -> Result<(), PageError>;

    async fn set_content(&mut self, html: &str) -> Result<(), PageError>;

    /// Resolves once no request has been in flight for `quiet`.
    async fn wait_for_network_idle(&mut self, quiet: Duration) -> Result<(), PageError>;

    async fn capture_jpeg(&mut self, clip: CaptureClip, quality: u8) -> Result<Vec<u8>, PageError>;

    async fn close(&mut self) -> Result<(), PageError>;
}

#[async_trait]
pub trait BrowserHandle: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError>;

    async fn close(&self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError>;
}

type LaunchFuture = Shared<BoxFuture<'static, Result<Arc<dyn BrowserHandle>, BrowserError>>>;

enum Slot {
    Empty,
    Launching { generation: u64, future: LaunchFuture },
    Ready(Arc<dyn BrowserHandle>),
}

pub struct BrowserManager {
    launcher: Arc<dyn BrowserLauncher>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

impl BrowserManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            slot: Mutex::new(Slot::Empty),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the connected browser, launching one if needed.
    ///
    /// Callers arriving while a launch is in progress await that same launch.
    /// A failed launch is not cached: the next call starts a fresh attempt.
    pub async fn acquire(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        let (generation, future) = {
            let mut slot = mutex_lock(&self.slot, TARGET, "browser::acquire");
            let pending = match &*slot {
                Slot::Ready(handle) if handle.is_connected() => return Ok(Arc::clone(handle)),
                Slot::Ready(_) => {
                    warn!(
                        target = TARGET,
                        op = "browser::acquire",
                        result = "disconnected",
                        "Browser connection lost; relaunching"
                    );
                    None
                }
                Slot::Launching { generation, future } => Some((*generation, future.clone())),
                Slot::Empty => None,
            };
            match pending {
                Some(pending) => pending,
                None => self.begin_launch(&mut slot),
            }
        };

        let result = future.await;

        let mut slot = mutex_lock(&self.slot, TARGET, "browser::acquire");
        let current = matches!(
            &*slot,
            Slot::Launching { generation: active, .. } if *active == generation
        );
        if current {
            *slot = match &result {
                Ok(handle) => Slot::Ready(Arc::clone(handle)),
                Err(_) => Slot::Empty,
            };
        }
        result
    }

    fn begin_launch(&self, slot: &mut Slot) -> (u64, LaunchFuture) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let launcher = Arc::clone(&self.launcher);
        let future = async move {
            let result = launcher.launch().await;
            match &result {
                Ok(_) => info!(
                    target = TARGET,
                    op = "browser::launch",
                    result = "ok",
                    generation,
                    "Browser launched"
                ),
                Err(err) => warn!(
                    target = TARGET,
                    op = "browser::launch",
                    result = "error",
                    generation,
                    error = %err,
                    "Browser launch failed"
                ),
            }
            result
        }
        .boxed()
        .shared();

        *slot = Slot::Launching {
            generation,
            future: future.clone(),
        };
        (generation, future)
    }

    /// Closes the browser if one is running or launching. Later acquires
    /// relaunch.
    pub async fn shutdown(&self) {
        let taken = {
            let mut slot = mutex_lock(&self.slot, TARGET, "browser::shutdown");
            std::mem::replace(&mut *slot, Slot::Empty)
        };
        let handle = match taken {
            Slot::Ready(handle) => Some(handle),
            // The pending launch is no longer cached by its callers.
            Slot::Launching { future, .. } => future.await.ok(),
            Slot::Empty => None,
        };

        if let Some(handle) = handle {
            handle.close().await;
            info!(
                target = TARGET,
                op = "browser::shutdown",
                result = "ok",
                "Browser closed"
            );
        }
    }
}
