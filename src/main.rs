use std::{
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    process,
    sync::Arc,
};

use ogsync::{
    application::{
        batch::BatchScheduler,
        browser::BrowserManager,
        bulk::BulkGenerator,
        card::SiteBranding,
        diff::DiffOptions,
        error::{AppError, SyncError},
        render::{CardRenderer, RenderEngine, RenderOptions, RenderTask},
        state::SnapshotStore,
        sync::{SnapshotRefreshed, SyncOptions, SyncOrchestrator, SyncOutcome},
    },
    config,
    domain::snapshot::Snapshot,
    infra::{
        artifacts::{ArtifactStore, write_artifact},
        chromium::ChromiumLauncher,
        error::InfraError,
        http::{self, HttpState, LocalServer, PublicDir, SnapshotCell},
        state_store::JsonFileSnapshotStore,
        telemetry,
    },
};
use futures::FutureExt;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Sync(args) => run_sync(settings, args).await,
        config::Command::GenerateAll(args) => run_generate_all(settings, args).await,
        config::Command::Render(args) => run_render(settings, args).await,
    }
}

/// Adapters shared by every command.
struct Pipeline {
    browser: Arc<BrowserManager>,
    renderer: Arc<dyn CardRenderer>,
    artifacts: Arc<ArtifactStore>,
    store: Arc<dyn SnapshotStore>,
    locales: Vec<String>,
}

impl Pipeline {
    fn build(settings: &config::Settings, base_url: String) -> Self {
        let launcher = ChromiumLauncher::new(&settings.browser, settings.render.navigation_timeout);
        let browser = Arc::new(BrowserManager::new(Arc::new(launcher)));
        let options = RenderOptions {
            base_url,
            navigation_timeout: settings.render.navigation_timeout,
            network_idle: settings.render.network_idle,
            locales: settings.site.locales.clone(),
            site: SiteBranding {
                name: settings.site.name.clone(),
                icon: settings.site.icon.clone(),
                default_background: settings.site.default_background.clone(),
                default_locale: settings.site.default_locale.clone(),
            },
        };
        let renderer: Arc<dyn CardRenderer> =
            Arc::new(RenderEngine::new(browser.clone(), options));
        let store: Arc<dyn SnapshotStore> =
            Arc::new(JsonFileSnapshotStore::new(&settings.paths.state_file));

        Self {
            browser,
            renderer,
            artifacts: Arc::new(ArtifactStore::new(&settings.paths.public_dir)),
            store,
            locales: settings.site.locales.clone(),
        }
    }

    fn orchestrator(&self, settings: &config::Settings) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.renderer.clone(),
            self.artifacts.clone(),
            self.store.clone(),
            self.locales.clone(),
            SyncOptions {
                concurrency: settings.sync.concurrency,
                diff: DiffOptions {
                    force_regenerate: settings.sync.force_regenerate,
                },
            },
        )
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    // Without a deployed site the server renders against its own static tree.
    let base_url = settings
        .render
        .base_url
        .clone()
        .unwrap_or_else(|| loopback_url(local_addr));
    let pipeline = Pipeline::build(&settings, base_url);

    let initial = match pipeline.store.load().await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => Snapshot::new(OffsetDateTime::now_utc()),
        Err(err) => {
            warn!(
                target = "ogsync::serve",
                error = %err,
                "Sync state unreadable; serving an empty snapshot"
            );
            Snapshot::new(OffsetDateTime::now_utc())
        }
    };

    let state = HttpState {
        renderer: pipeline.renderer.clone(),
        orchestrator: Arc::new(pipeline.orchestrator(&settings)),
        snapshots: SnapshotCell::new(Arc::new(initial)),
        public: Arc::new(PublicDir::new(&settings.paths.public_dir)),
        base_url: settings.render.base_url.clone(),
    };
    let public_router = http::build_router(state.clone());
    let admin_router = http::build_admin_router(state);

    info!(
        target = "ogsync::serve",
        addr = %local_addr,
        admin_addr = %settings.server.admin_addr,
        public_dir = %settings.paths.public_dir.display(),
        "HTTP server listening"
    );

    let shutdown = shutdown_signal().boxed().shared();
    let public_server = axum::serve(listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown.clone());
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown);

    let result = try_join!(public_server, admin_server)
        .map(|_| ())
        .map_err(|err| AppError::from(InfraError::server(err.to_string())));

    pipeline.browser.shutdown().await;
    result
}

async fn run_sync(settings: config::Settings, args: config::SyncArgs) -> Result<(), AppError> {
    let snapshot = read_snapshot(&args.snapshot).await?;
    let (base_url, local) = resolve_base_url(&settings).await?;
    let pipeline = Pipeline::build(&settings, base_url);

    info!(
        target = "ogsync::sync",
        snapshot = %args.snapshot.display(),
        force = settings.sync.force_regenerate,
        concurrency = settings.sync.concurrency.get(),
        "Starting sync"
    );

    let outcome = pipeline
        .orchestrator(&settings)
        .sync(SnapshotRefreshed::new(snapshot))
        .await;

    finish(&pipeline, local).await;

    match outcome {
        SyncOutcome::Completed(report) => {
            if report.failed > 0 {
                warn!(
                    target = "ogsync::sync",
                    failed = report.failed,
                    "Sync finished with failed renders; they are retried on the next run"
                );
            }
            print_report(&report)
        }
        SyncOutcome::Dropped => Err(AppError::unexpected("sync already in progress")),
        SyncOutcome::Failed(err) => Err(AppError::from(err)),
    }
}

async fn run_generate_all(
    settings: config::Settings,
    args: config::GenerateAllArgs,
) -> Result<(), AppError> {
    let snapshot = read_snapshot(&args.snapshot).await?;
    let (base_url, local) = resolve_base_url(&settings).await?;
    let pipeline = Pipeline::build(&settings, base_url);

    info!(
        target = "ogsync::generate_all",
        snapshot = %args.snapshot.display(),
        concurrency = settings.sync.concurrency.get(),
        "Starting generate-all"
    );

    let generator = BulkGenerator::new(
        BatchScheduler::new(pipeline.renderer.clone()),
        pipeline.artifacts.clone(),
        pipeline.store.clone(),
        pipeline.locales.clone(),
        settings.sync.concurrency,
    );
    let result = generator.run(Arc::new(snapshot)).await;

    finish(&pipeline, local).await;

    let report = result?;
    print_report(&report)
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let snapshot = read_snapshot(&args.snapshot).await?;
    let (base_url, local) = resolve_base_url(&settings).await?;
    let pipeline = Pipeline::build(&settings, base_url);

    let task = RenderTask::for_url(args.path.clone(), Arc::new(snapshot))
        .with_image_override(args.image_url.clone());
    let rendered = pipeline.renderer.render(&task).await;

    finish(&pipeline, local).await;

    let jpeg = rendered?;
    if let Some(parent) = args.output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?;
    }
    write_artifact(&args.output, &jpeg)
        .await
        .map_err(|err| AppError::from(SyncError::from(err)))?;

    info!(
        target = "ogsync::render",
        path = %args.path,
        output = %args.output.display(),
        bytes = jpeg.len(),
        "Card written"
    );
    Ok(())
}

/// The configured base URL, or a loopback server over the public directory.
async fn resolve_base_url(
    settings: &config::Settings,
) -> Result<(String, Option<LocalServer>), AppError> {
    if let Some(base_url) = settings.render.base_url.clone() {
        return Ok((base_url, None));
    }
    let server = LocalServer::start(PublicDir::new(&settings.paths.public_dir)).await?;
    Ok((server.base_url(), Some(server)))
}

async fn finish(pipeline: &Pipeline, local: Option<LocalServer>) {
    pipeline.browser.shutdown().await;
    if let Some(server) = local {
        server.stop().await;
    }
}

async fn read_snapshot(path: &Path) -> Result<Snapshot, AppError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|err| {
        AppError::validation(format!(
            "snapshot `{}` is not valid JSON: {err}",
            path.display()
        ))
    })?;
    snapshot.validate()?;
    Ok(snapshot)
}

fn print_report<T: Serialize>(report: &T) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
    println!("{json}");
    Ok(())
}

fn loopback_url(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("http://{}", SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port())))
    } else {
        format!("http://{addr}")
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            target = "ogsync::serve",
            error = %err,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    info!(target = "ogsync::serve", "Shutdown signal received");
}
