//! Card rendering through the shared headless browser.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::browser::{
    BrowserError, BrowserManager, CARD_HEIGHT, CARD_WIDTH, CaptureClip, PageError, PageHandle,
    ResourceKind,
};
use crate::application::card::{self, SiteBranding};
use crate::domain::artifact::ArtifactKey;
use crate::domain::route::CardTarget;
use crate::domain::snapshot::{Locale, Snapshot};

const TARGET: &str = "ogsync::application::render";

pub const JPEG_QUALITY: u8 = 90;

/// A card to render for `target_url`, using `snapshot` as the content source.
#[derive(Debug, Clone)]
pub struct RenderTask {
    pub key: Option<ArtifactKey>,
    pub target_url: String,
    pub snapshot: Arc<Snapshot>,
    pub image_override: Option<String>,
    pub base_url: Option<String>,
}

impl RenderTask {
    pub fn for_artifact(key: &ArtifactKey, snapshot: Arc<Snapshot>) -> Self {
        Self {
            key: Some(key.clone()),
            target_url: key.target_url(),
            snapshot,
            image_override: None,
            base_url: None,
        }
    }

    pub fn for_url(target_url: impl Into<String>, snapshot: Arc<Snapshot>) -> Self {
        Self {
            key: None,
            target_url: target_url.into(),
            snapshot,
            image_override: None,
            base_url: None,
        }
    }

    pub fn with_image_override(mut self, image_url: Option<String>) -> Self {
        self.image_override = image_url;
        self
    }

    /// Resolves relative assets against `base_url` instead of the configured one.
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error(transparent)]
    BrowserUnavailable(#[from] BrowserError),
    #[error("failed to compose card for `{target}`: {message}")]
    Template { target: String, message: String },
    #[error("failed to render `{target}`: {message}")]
    Page { target: String, message: String },
    #[error("rendering `{target}` timed out after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },
    #[error("screenshot of `{target}` is not a valid card: {message}")]
    InvalidOutput { target: String, message: String },
}

impl RenderError {
    pub fn is_browser_unavailable(&self) -> bool {
        matches!(self, RenderError::BrowserUnavailable(_))
    }

    fn as_label(&self) -> &'static str {
        match self {
            RenderError::BrowserUnavailable(_) => "browser_unavailable",
            RenderError::Template { .. } => "template",
            RenderError::Page { .. } => "page",
            RenderError::Timeout { .. } => "timeout",
            RenderError::InvalidOutput { .. } => "invalid_output",
        }
    }
}

#[async_trait]
pub trait CardRenderer: Send + Sync {
    /// Prepares whatever rendering depends on, so failures surface before
    /// any artifact is touched.
    async fn warm_up(&self) -> Result<(), RenderError> {
        Ok(())
    }

    /// Renders one card and returns the encoded JPEG.
    async fn render(&self, task: &RenderTask) -> Result<Vec<u8>, RenderError>;
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub base_url: String,
    pub navigation_timeout: Duration,
    pub network_idle: Duration,
    pub locales: Vec<Locale>,
    pub site: SiteBranding,
}

/// [`CardRenderer`] that screenshots the card template in a browser page.
pub struct RenderEngine {
    browser: Arc<BrowserManager>,
    options: RenderOptions,
}

impl RenderEngine {
    pub fn new(browser: Arc<BrowserManager>, options: RenderOptions) -> Self {
        Self { browser, options }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Full HTML document for `task`.
    pub fn compose_document(&self, task: &RenderTask) -> Result<String, RenderError> {
        let mut locales = self.options.locales.clone();
        locales.extend(
            task.snapshot
                .locales()
                .into_iter()
                .filter(|locale| !self.options.locales.iter().any(|known| known.as_str() == *locale))
                .map(str::to_string),
        );

        let base_url = task.base_url.as_deref().unwrap_or(&self.options.base_url);
        let target = CardTarget::parse(&task.target_url, &locales);
        let view = card::compose(
            &target,
            &task.snapshot,
            &self.options.site,
            base_url,
            task.image_override.as_deref(),
        );
        card::render_document(&view, base_url).map_err(|err| RenderError::Template {
            target: task.target_url.clone(),
            message: err.to_string(),
        })
    }

    async fn capture(
        &self,
        page: &mut dyn PageHandle,
        html: &str,
    ) -> Result<Vec<u8>, PageError> {
        page.set_viewport(CARD_WIDTH, CARD_HEIGHT).await?;
        page.filter_requests(ResourceKind::is_allowed_for_cards).await?;
        page.set_content(html).await?;
        page.wait_for_network_idle(self.options.network_idle).await?;
        page.capture_jpeg(CaptureClip::CARD, JPEG_QUALITY).await
    }

    async fn render_in_page(&self, task: &RenderTask, html: &str) -> Result<Vec<u8>, RenderError> {
        let browser = self.browser.acquire().await?;
        let mut page = browser.new_page().await?;

        let timeout = self.options.navigation_timeout;
        let outcome = tokio::time::timeout(timeout, self.capture(page.as_mut(), html)).await;

        if let Err(err) = page.close().await {
            warn!(
                target = TARGET,
                op = "render::close_page",
                result = "error",
                render_target = %task.target_url,
                error = %err,
                "Failed to close browser page"
            );
        }

        match outcome {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) if !browser.is_connected() => {
                debug!(
                    target = TARGET,
                    op = "render::capture",
                    render_target = %task.target_url,
                    error = %err,
                    "Page failed after browser disconnect"
                );
                Err(RenderError::BrowserUnavailable(BrowserError::Disconnected))
            }
            Ok(Err(err)) => Err(RenderError::Page {
                target: task.target_url.clone(),
                message: err.to_string(),
            }),
            Err(_) => Err(RenderError::Timeout {
                target: task.target_url.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl CardRenderer for RenderEngine {
    async fn warm_up(&self) -> Result<(), RenderError> {
        self.browser.acquire().await?;
        Ok(())
    }

    async fn render(&self, task: &RenderTask) -> Result<Vec<u8>, RenderError> {
        let started_at = Instant::now();
        let result = match self.compose_document(task) {
            Ok(html) => self
                .render_in_page(task, &html)
                .await
                .and_then(|bytes| ensure_card_jpeg(&task.target_url, bytes)),
            Err(err) => Err(err),
        };
        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!("ogsync_render_ms").record(elapsed_ms as f64);

        match &result {
            Ok(bytes) => {
                counter!("ogsync_render_total", "result" => "ok").increment(1);
                info!(
                    target = TARGET,
                    op = "render::card",
                    result = "ok",
                    render_target = %task.target_url,
                    elapsed_ms,
                    jpeg_bytes = bytes.len(),
                    "Card rendered"
                );
            }
            Err(err) => {
                counter!("ogsync_render_total", "result" => err.as_label()).increment(1);
                warn!(
                    target = TARGET,
                    op = "render::card",
                    result = "error",
                    error_code = err.as_label(),
                    render_target = %task.target_url,
                    elapsed_ms,
                    error = %err,
                    "Card render failed"
                );
            }
        }
        result
    }
}

fn ensure_card_jpeg(target: &str, bytes: Vec<u8>) -> Result<Vec<u8>, RenderError> {
    let invalid = |message: String| RenderError::InvalidOutput {
        target: target.to_string(),
        message,
    };

    match imagesize::image_type(&bytes) {
        Ok(imagesize::ImageType::Jpeg) => {}
        Ok(other) => return Err(invalid(format!("unexpected image type {other:?}"))),
        Err(err) => return Err(invalid(err.to_string())),
    }
    let size = imagesize::blob_size(&bytes).map_err(|err| invalid(err.to_string()))?;
    if size.width != CARD_WIDTH as usize || size.height != CARD_HEIGHT as usize {
        return Err(invalid(format!(
            "expected {CARD_WIDTH}x{CARD_HEIGHT}, got {}x{}",
            size.width, size.height
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use time::macros::datetime;

    use super::*;
    use crate::application::browser::{BrowserHandle, BrowserLauncher};

    /// Smallest byte sequence `imagesize` accepts as a JPEG of the given size.
    fn fake_jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xC0, 0x00, 0x11, 0x08];
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&[0x03, 0x01, 0x22, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        bytes
    }

    #[derive(Default)]
    struct PageLog {
        calls: Mutex<Vec<String>>,
        closed: AtomicUsize,
    }

    struct ScriptedPage {
        log: Arc<PageLog>,
        hang: bool,
        output: Vec<u8>,
    }

    #[async_trait]
    impl PageHandle for ScriptedPage {
        async fn set_viewport(&mut self, width: u32, height: u32) -> Result<(), PageError> {
            self.log.calls.lock().expect("lock").push(format!("viewport {width}x{height}"));
            Ok(())
        }

        async fn filter_requests(
            &mut self,
            allow: fn(ResourceKind) -> bool,
        ) -> Result<(), PageError> {
            let script_allowed = allow(ResourceKind::Script);
            self.log
                .calls
                .lock()
                .expect("lock")
                .push(format!("filter scripts={script_allowed}"));
            Ok(())
        }

        async fn set_content(&mut self, html: &str) -> Result<(), PageError> {
            self.log.calls.lock().expect("lock").push(format!("content {}", !html.is_empty()));
            Ok(())
        }

        async fn wait_for_network_idle(&mut self, _quiet: Duration) -> Result<(), PageError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.log.calls.lock().expect("lock").push("idle".into());
            Ok(())
        }

        async fn capture_jpeg(
            &mut self,
            clip: CaptureClip,
            quality: u8,
        ) -> Result<Vec<u8>, PageError> {
            self.log
                .calls
                .lock()
                .expect("lock")
                .push(format!("capture {}x{} q{quality}", clip.width, clip.height));
            Ok(self.output.clone())
        }

        async fn close(&mut self) -> Result<(), PageError> {
            self.log.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedBrowser {
        log: Arc<PageLog>,
        hang: bool,
        output: Vec<u8>,
        connected: AtomicBool,
    }

    #[async_trait]
    impl BrowserHandle for ScriptedBrowser {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
            let page: Box<dyn PageHandle> = Box::new(ScriptedPage {
                log: Arc::clone(&self.log),
                hang: self.hang,
                output: self.output.clone(),
            });
            Ok(page)
        }

        async fn close(&self) {}
    }

    struct ScriptedLauncher {
        browser: Arc<ScriptedBrowser>,
    }

    #[async_trait]
    impl BrowserLauncher for ScriptedLauncher {
        async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
            let browser: Arc<dyn BrowserHandle> = self.browser.clone();
            Ok(browser)
        }
    }

    struct BrokenLauncher;

    #[async_trait]
    impl BrowserLauncher for BrokenLauncher {
        async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
            Err(BrowserError::launch("chrome not found"))
        }
    }

    fn options(timeout: Duration) -> RenderOptions {
        RenderOptions {
            base_url: "https://example.com".into(),
            navigation_timeout: timeout,
            network_idle: Duration::from_millis(1),
            locales: vec!["en".into()],
            site: SiteBranding {
                name: "Field Notes".into(),
                icon: "/icon.png".into(),
                default_background: "/default_background.png".into(),
                default_locale: "en".into(),
            },
        }
    }

    fn engine(hang: bool, output: Vec<u8>, timeout: Duration) -> (RenderEngine, Arc<PageLog>) {
        let log = Arc::new(PageLog::default());
        let browser = Arc::new(ScriptedBrowser {
            log: Arc::clone(&log),
            hang,
            output,
            connected: AtomicBool::new(true),
        });
        let manager = Arc::new(BrowserManager::new(Arc::new(ScriptedLauncher { browser })));
        (RenderEngine::new(manager, options(timeout)), log)
    }

    fn task() -> RenderTask {
        let snapshot = Arc::new(Snapshot::new(datetime!(2024-01-01 0:00 UTC)));
        RenderTask::for_artifact(&ArtifactKey::post("en", "hello"), snapshot)
    }

    #[tokio::test]
    async fn renders_through_page_lifecycle() {
        let (engine, log) = engine(false, fake_jpeg(1200, 630), Duration::from_secs(5));

        let bytes = engine.render(&task()).await.expect("render");

        assert_eq!(bytes, fake_jpeg(1200, 630));
        assert_eq!(
            *log.calls.lock().expect("lock"),
            vec![
                "viewport 1200x630",
                "filter scripts=false",
                "content true",
                "idle",
                "capture 1200x630 q90",
            ]
        );
        assert_eq!(log.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_still_closes_page() {
        let (engine, log) = engine(true, fake_jpeg(1200, 630), Duration::from_millis(20));

        let err = engine.render(&task()).await.expect_err("timeout");

        assert!(matches!(err, RenderError::Timeout { .. }));
        assert_eq!(log.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_wrongly_sized_output() {
        let (engine, _log) = engine(false, fake_jpeg(800, 600), Duration::from_secs(5));

        let err = engine.render(&task()).await.expect_err("invalid");

        assert!(matches!(err, RenderError::InvalidOutput { .. }));
    }

    #[tokio::test]
    async fn launch_failure_is_browser_unavailable() {
        let manager = Arc::new(BrowserManager::new(Arc::new(BrokenLauncher)));
        let engine = RenderEngine::new(manager, options(Duration::from_secs(5)));

        let err = engine.warm_up().await.expect_err("warm up");
        assert!(err.is_browser_unavailable());

        let err = engine.render(&task()).await.expect_err("render");
        assert!(err.is_browser_unavailable());
    }

    #[test]
    fn document_targets_configured_base_url() {
        let (engine, _log) = engine(false, Vec::new(), Duration::from_secs(5));
        let html = engine.compose_document(&task()).expect("compose");
        assert!(html.contains(r#"<base href="https://example.com/">"#));

        let overridden = task().with_base_url(Some("http://localhost:4000".into()));
        let html = engine.compose_document(&overridden).expect("compose");
        assert!(html.contains(r#"<base href="http://localhost:4000/">"#));
    }
}
