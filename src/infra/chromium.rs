//! Headless Chromium driven over the DevTools protocol.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, ErrorReason, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport};
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::browser::{
    BrowserError, BrowserHandle, BrowserLauncher, CARD_HEIGHT, CARD_WIDTH, CaptureClip,
    PageError, PageHandle, ResourceKind,
};
use crate::config::{BrowserMode, BrowserSettings};

const TARGET: &str = "ogsync::infra::chromium";
const BLANK_PAGE: &str = "about:blank";

const BASE_ARGS: [&str; 11] = [
    "--disable-web-security",
    "--disable-features=VizDisplayCompositor",
    "--disable-gpu",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-plugins",
];

const SANDBOXED_ARGS: [&str; 2] = ["--single-process", "--no-zygote"];

/// Launches Chromium according to [`BrowserSettings`].
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
    mode: BrowserMode,
    extra_args: Vec<String>,
    request_timeout: Duration,
}

impl ChromiumLauncher {
    pub fn new(settings: &BrowserSettings, request_timeout: Duration) -> Self {
        Self {
            executable: settings.executable.clone(),
            mode: settings.mode,
            extra_args: settings.extra_args.clone(),
            request_timeout,
        }
    }

    fn launch_args(&self) -> Vec<String> {
        let mut args: Vec<String> = BASE_ARGS.iter().map(|arg| arg.to_string()).collect();
        if self.mode == BrowserMode::Sandboxed {
            args.extend(SANDBOXED_ARGS.iter().map(|arg| arg.to_string()));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn config(&self) -> Result<BrowserConfig, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .window_size(CARD_WIDTH, CARD_HEIGHT)
            .request_timeout(self.request_timeout)
            .args(self.launch_args());
        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }
        if self.mode == BrowserMode::Sandboxed {
            builder = builder.no_sandbox();
        }
        builder.build().map_err(BrowserError::launch)
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        let config = self.config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(BrowserError::launch)?;

        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let event_loop = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(
                        target = TARGET,
                        op = "chromium::handler",
                        error = %err,
                        "DevTools event error"
                    );
                }
            }
            flag.store(false, Ordering::Release);
            warn!(
                target = TARGET,
                op = "chromium::handler",
                result = "closed",
                "Browser connection closed"
            );
        });

        info!(
            target = TARGET,
            op = "chromium::launch",
            result = "ok",
            mode = ?self.mode,
            "Chromium started"
        );
        let handle: Arc<dyn BrowserHandle> = Arc::new(ChromiumBrowser {
            browser: Mutex::new(browser),
            connected,
            event_loop,
        });
        Ok(handle)
    }
}

struct ChromiumBrowser {
    browser: Mutex<Browser>,
    connected: Arc<AtomicBool>,
    event_loop: JoinHandle<()>,
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.event_loop.is_finished()
    }

    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        if !self.is_connected() {
            return Err(BrowserError::Disconnected);
        }
        let page = self
            .browser
            .lock()
            .await
            .new_page(BLANK_PAGE)
            .await
            .map_err(BrowserError::page)?;
        let page: Box<dyn PageHandle> = Box::new(ChromiumPage::new(page));
        Ok(page)
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(err) = browser.close().await {
            warn!(
                target = TARGET,
                op = "chromium::close",
                result = "error",
                error = %err,
                "Failed to close browser cleanly"
            );
        }
        if let Err(err) = browser.wait().await {
            debug!(
                target = TARGET,
                op = "chromium::close",
                error = %err,
                "Browser process wait failed"
            );
        }
        self.connected.store(false, Ordering::Release);
        self.event_loop.abort();
    }
}

struct ChromiumPage {
    page: Option<Page>,
    in_flight: Option<watch::Receiver<usize>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChromiumPage {
    fn new(page: Page) -> Self {
        Self {
            page: Some(page),
            in_flight: None,
            tasks: Vec::new(),
        }
    }

    fn page(&self, op: &'static str) -> Result<&Page, PageError> {
        self.page
            .as_ref()
            .ok_or_else(|| PageError::new(op, "page already closed"))
    }

    /// Counts requests between `requestWillBeSent` and their terminal event.
    async fn track_network(&mut self) -> Result<watch::Receiver<usize>, PageError> {
        if let Some(receiver) = &self.in_flight {
            return Ok(receiver.clone());
        }
        let page = self.page("track_network")?.clone();
        let started = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|err| PageError::new("track_network", err))?;
        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(|err| PageError::new("track_network", err))?;
        let failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(|err| PageError::new("track_network", err))?;
        page.execute(network::EnableParams::default())
            .await
            .map_err(|err| PageError::new("track_network", err))?;

        enum NetworkEvent {
            Started(String),
            Done(String),
        }
        let events = futures::stream::select_all([
            started
                .map(|event| NetworkEvent::Started(event.request_id.inner().clone()))
                .boxed(),
            finished
                .map(|event| NetworkEvent::Done(event.request_id.inner().clone()))
                .boxed(),
            failed
                .map(|event| NetworkEvent::Done(event.request_id.inner().clone()))
                .boxed(),
        ]);

        let (sender, receiver) = watch::channel(0usize);
        self.tasks.push(tokio::spawn(async move {
            let mut pending: HashSet<String> = HashSet::new();
            let mut events = events;
            while let Some(event) = events.next().await {
                match event {
                    NetworkEvent::Started(id) => {
                        pending.insert(id);
                    }
                    NetworkEvent::Done(id) => {
                        pending.remove(&id);
                    }
                }
                sender.send_replace(pending.len());
            }
        }));
        self.in_flight = Some(receiver.clone());
        Ok(receiver)
    }
}

fn resource_kind(resource: &ResourceType) -> ResourceKind {
    match resource {
        ResourceType::Document => ResourceKind::Document,
        ResourceType::Stylesheet => ResourceKind::Stylesheet,
        ResourceType::Image => ResourceKind::Image,
        ResourceType::Font => ResourceKind::Font,
        ResourceType::Script => ResourceKind::Script,
        ResourceType::Media => ResourceKind::Media,
        _ => ResourceKind::Other,
    }
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn set_viewport(&mut self, width: u32, height: u32) -> Result<(), PageError> {
        self.page("set_viewport")?
            .execute(SetDeviceMetricsOverrideParams::new(
                i64::from(width),
                i64::from(height),
                1.0,
                false,
            ))
            .await
            .map_err(|err| PageError::new("set_viewport", err))?;
        Ok(())
    }

    async fn filter_requests(&mut self, allow: fn(ResourceKind) -> bool) -> Result<(), PageError> {
        self.track_network().await?;
        let page = self.page("filter_requests")?.clone();
        let mut paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|err| PageError::new("filter_requests", err))?;

        let interceptor = page.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let kind = resource_kind(&event.resource_type);
                let outcome = if allow(kind) {
                    interceptor
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                } else {
                    debug!(
                        target = TARGET,
                        op = "chromium::filter",
                        url = %event.request.url,
                        kind = ?kind,
                        "Request blocked"
                    );
                    interceptor
                        .execute(FailRequestParams::new(
                            event.request_id.clone(),
                            ErrorReason::BlockedByClient,
                        ))
                        .await
                        .map(|_| ())
                };
                if let Err(err) = outcome {
                    debug!(
                        target = TARGET,
                        op = "chromium::filter",
                        error = %err,
                        "Failed to resolve paused request"
                    );
                }
            }
        }));

        let pattern = RequestPattern::builder()
            .url_pattern("*")
            .request_stage(RequestStage::Request)
            .build();
        page.execute(fetch::EnableParams::builder().pattern(pattern).build())
            .await
            .map_err(|err| PageError::new("filter_requests", err))?;
        Ok(())
    }

    async fn set_content(&mut self, html: &str) -> Result<(), PageError> {
        self.page("set_content")?
            .set_content(html)
            .await
            .map_err(|err| PageError::new("set_content", err))?;
        Ok(())
    }

    async fn wait_for_network_idle(&mut self, quiet: Duration) -> Result<(), PageError> {
        let mut in_flight = self.track_network().await?;
        loop {
            in_flight
                .wait_for(|count| *count == 0)
                .await
                .map_err(|err| PageError::new("wait_for_network_idle", err))?;
            match tokio::time::timeout(quiet, in_flight.changed()).await {
                Err(_) => return Ok(()),
                Ok(Ok(())) => continue,
                Ok(Err(err)) => return Err(PageError::new("wait_for_network_idle", err)),
            }
        }
    }

    async fn capture_jpeg(&mut self, clip: CaptureClip, quality: u8) -> Result<Vec<u8>, PageError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(i64::from(quality))
            .clip(Viewport {
                x: 0.0,
                y: 0.0,
                width: f64::from(clip.width),
                height: f64::from(clip.height),
                scale: 1.0,
            })
            .build();
        self.page("capture_jpeg")?
            .screenshot(params)
            .await
            .map_err(|err| PageError::new("capture_jpeg", err))
    }

    async fn close(&mut self) -> Result<(), PageError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.in_flight = None;
        match self.page.take() {
            Some(page) => page
                .close()
                .await
                .map_err(|err| PageError::new("close", err)),
            None => Ok(()),
        }
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mode: BrowserMode) -> BrowserSettings {
        BrowserSettings {
            executable: None,
            mode,
            extra_args: vec!["--lang=en-US".to_string()],
        }
    }

    #[test]
    fn sandboxed_mode_adds_constrained_flags() {
        let local = ChromiumLauncher::new(&settings(BrowserMode::Local), Duration::from_secs(30));
        let sandboxed =
            ChromiumLauncher::new(&settings(BrowserMode::Sandboxed), Duration::from_secs(30));

        let local_args = local.launch_args();
        let sandboxed_args = sandboxed.launch_args();

        assert!(!local_args.iter().any(|arg| arg == "--single-process"));
        assert!(sandboxed_args.iter().any(|arg| arg == "--single-process"));
        assert!(sandboxed_args.iter().any(|arg| arg == "--no-zygote"));
        assert_eq!(local_args.last().map(String::as_str), Some("--lang=en-US"));
    }

    #[test]
    fn resource_types_map_onto_card_policy() {
        assert!(resource_kind(&ResourceType::Image).is_allowed_for_cards());
        assert!(resource_kind(&ResourceType::Font).is_allowed_for_cards());
        assert!(!resource_kind(&ResourceType::Script).is_allowed_for_cards());
        assert!(!resource_kind(&ResourceType::Xhr).is_allowed_for_cards());
    }
}
