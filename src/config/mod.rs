//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{
    CliArgs, Command, CommonOverrides, GenerateAllArgs, RenderArgs, ServeArgs, ServeOverrides,
    SyncArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "ogsync";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_SITE_NAME: &str = "ogsync";
const DEFAULT_LOCALE: &str = "en";
const DEFAULT_BACKGROUND: &str = "/default_background.png";
const DEFAULT_ICON: &str = "/icon.png";
const DEFAULT_PUBLIC_DIR: &str = "public";
const DEFAULT_STATE_FILE: &str = ".ogsync/social-images-state.json";
const DEFAULT_NAVIGATION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_NETWORK_IDLE_MS: u64 = 500;
const DEFAULT_SYNC_CONCURRENCY: u64 = 8;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub site: SiteSettings,
    pub paths: PathSettings,
    pub render: RenderSettings,
    pub browser: BrowserSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Public listener: on-demand cards and the static site.
    pub addr: SocketAddr,
    /// Administrative listener: snapshot hook and sync status.
    pub admin_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub domain: Option<String>,
    pub name: String,
    /// Ordered; the first entry is the default unless overridden.
    pub locales: Vec<String>,
    pub default_locale: String,
    pub default_background: String,
    pub icon: String,
}

#[derive(Debug, Clone)]
pub struct PathSettings {
    pub public_dir: PathBuf,
    pub state_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Explicit base URL, or `https://<site.domain>` when only the domain is set.
    pub base_url: Option<String>,
    pub navigation_timeout: Duration,
    pub network_idle: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserMode {
    Local,
    /// Constrained container or serverless sandbox.
    Sandboxed,
}

impl FromStr for BrowserMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BrowserMode::Local),
            "sandboxed" => Ok(BrowserMode::Sandboxed),
            other => Err(format!("unknown browser mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub executable: Option<PathBuf>,
    pub mode: BrowserMode,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub concurrency: NonZeroUsize,
    pub force_regenerate: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("OGSYNC")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("site.locales")
            .with_list_parse_key("browser.extra_args")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Sync(args)) => {
            raw.apply_common_overrides(&args.overrides);
            if args.force {
                raw.sync.force_regenerate = Some(true);
            }
            if let Some(concurrency) = args.concurrency {
                raw.sync.concurrency = Some(concurrency);
            }
        }
        Some(Command::GenerateAll(args)) => {
            raw.apply_common_overrides(&args.overrides);
            if let Some(concurrency) = args.concurrency {
                raw.sync.concurrency = Some(concurrency);
            }
        }
        Some(Command::Render(args)) => raw.apply_common_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    site: RawSiteSettings,
    paths: RawPathSettings,
    render: RawRenderSettings,
    browser: RawBrowserSettings,
    sync: RawSyncSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_common_overrides(&overrides.common);
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.server_admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(concurrency) = overrides.sync_concurrency {
            self.sync.concurrency = Some(concurrency);
        }
    }

    fn apply_common_overrides(&mut self, overrides: &CommonOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(dir) = overrides.public_dir.as_ref() {
            self.paths.public_dir = Some(dir.clone());
        }
        if let Some(file) = overrides.state_file.as_ref() {
            self.paths.state_file = Some(file.clone());
        }
        if let Some(url) = overrides.base_url.as_ref() {
            self.render.base_url = Some(url.clone());
        }
        if let Some(path) = overrides.browser_executable.as_ref() {
            self.browser.executable = Some(path.clone());
        }
        if let Some(mode) = overrides.browser_mode.as_ref() {
            self.browser.mode = Some(mode.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            site,
            paths,
            render,
            browser,
            sync,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let site = build_site_settings(site)?;
        let paths = build_path_settings(paths)?;
        let render = build_render_settings(render, &site)?;
        let browser = build_browser_settings(browser)?;
        let sync = build_sync_settings(sync)?;

        Ok(Self {
            server,
            logging,
            site,
            paths,
            render,
            browser,
            sync,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());
    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if admin_addr.port() == addr.port() {
        return Err(LoadError::invalid(
            "server.admin_port",
            "must differ from server.port",
        ));
    }

    Ok(ServerSettings { addr, admin_addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_site_settings(site: RawSiteSettings) -> Result<SiteSettings, LoadError> {
    let domain = non_empty(site.domain);
    if let Some(domain) = domain.as_deref()
        && domain.contains("://")
    {
        return Err(LoadError::invalid(
            "site.domain",
            "expected a bare host name without a scheme",
        ));
    }

    let mut locales: Vec<String> = Vec::new();
    for locale in site.locales.unwrap_or_else(|| vec![DEFAULT_LOCALE.to_string()]) {
        let locale = locale.trim().to_string();
        if locale.is_empty() || locale.contains(['/', '\\']) {
            return Err(LoadError::invalid(
                "site.locales",
                format!("`{locale}` is not a valid locale segment"),
            ));
        }
        if !locales.contains(&locale) {
            locales.push(locale);
        }
    }
    let Some(first) = locales.first().cloned() else {
        return Err(LoadError::invalid("site.locales", "must not be empty"));
    };

    let default_locale = non_empty(site.default_locale).unwrap_or(first);
    if !locales.contains(&default_locale) {
        return Err(LoadError::invalid(
            "site.default_locale",
            format!("`{default_locale}` is not listed in site.locales"),
        ));
    }

    Ok(SiteSettings {
        domain,
        name: non_empty(site.name).unwrap_or_else(|| DEFAULT_SITE_NAME.to_string()),
        locales,
        default_locale,
        default_background: non_empty(site.default_background)
            .unwrap_or_else(|| DEFAULT_BACKGROUND.to_string()),
        icon: non_empty(site.icon).unwrap_or_else(|| DEFAULT_ICON.to_string()),
    })
}

fn build_path_settings(paths: RawPathSettings) -> Result<PathSettings, LoadError> {
    let public_dir = paths
        .public_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLIC_DIR));
    if public_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "paths.public_dir",
            "path must not be empty",
        ));
    }

    let state_file = paths
        .state_file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
    if state_file.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "paths.state_file",
            "path must not be empty",
        ));
    }

    Ok(PathSettings {
        public_dir,
        state_file,
    })
}

fn build_render_settings(
    render: RawRenderSettings,
    site: &SiteSettings,
) -> Result<RenderSettings, LoadError> {
    let base_url = match non_empty(render.base_url) {
        Some(url) => {
            let parsed = url::Url::parse(&url)
                .map_err(|err| LoadError::invalid("render.base_url", err.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "render.base_url",
                    "scheme must be http or https",
                ));
            }
            Some(url.trim_end_matches('/').to_string())
        }
        None => site.domain.as_ref().map(|domain| format!("https://{domain}")),
    };

    let timeout_secs = render
        .navigation_timeout_seconds
        .unwrap_or(DEFAULT_NAVIGATION_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "render.navigation_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let idle_ms = render.network_idle_ms.unwrap_or(DEFAULT_NETWORK_IDLE_MS);
    if idle_ms == 0 {
        return Err(LoadError::invalid(
            "render.network_idle_ms",
            "must be greater than zero",
        ));
    }

    Ok(RenderSettings {
        base_url,
        navigation_timeout: Duration::from_secs(timeout_secs),
        network_idle: Duration::from_millis(idle_ms),
    })
}

fn build_browser_settings(browser: RawBrowserSettings) -> Result<BrowserSettings, LoadError> {
    let mode = match non_empty(browser.mode) {
        Some(mode) => {
            BrowserMode::from_str(&mode).map_err(|reason| LoadError::invalid("browser.mode", reason))?
        }
        None => BrowserMode::Local,
    };

    let executable = browser
        .executable
        .filter(|path| !path.as_os_str().is_empty());

    Ok(BrowserSettings {
        executable,
        mode,
        extra_args: browser
            .extra_args
            .unwrap_or_default()
            .into_iter()
            .filter(|arg| !arg.trim().is_empty())
            .collect(),
    })
}

fn build_sync_settings(sync: RawSyncSettings) -> Result<SyncSettings, LoadError> {
    let concurrency = non_zero_usize(
        sync.concurrency.unwrap_or(DEFAULT_SYNC_CONCURRENCY),
        "sync.concurrency",
    )?;
    Ok(SyncSettings {
        concurrency,
        force_regenerate: sync.force_regenerate.unwrap_or(false),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    admin_host: Option<String>,
    admin_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    domain: Option<String>,
    name: Option<String>,
    locales: Option<Vec<String>>,
    default_locale: Option<String>,
    default_background: Option<String>,
    icon: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPathSettings {
    public_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    base_url: Option<String>,
    navigation_timeout_seconds: Option<u64>,
    network_idle_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBrowserSettings {
    executable: Option<PathBuf>,
    mode: Option<String>,
    extra_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSyncSettings {
    concurrency: Option<u64>,
    force_regenerate: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
