use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the ogsync binary.
#[derive(Debug, Parser)]
#[command(
    name = "ogsync",
    version,
    about = "Social preview card renderer and artifact synchronizer"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "OGSYNC_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the on-demand endpoint and the artifact tree, plus the admin hook.
    Serve(Box<ServeArgs>),
    /// Run one incremental sync against a snapshot file.
    Sync(SyncArgs),
    /// Render every artifact of a snapshot that does not exist yet.
    #[command(name = "generate-all")]
    GenerateAll(GenerateAllArgs),
    /// Render a single card to a file.
    Render(RenderArgs),
}

/// Overrides shared by every command.
#[derive(Debug, Args, Default, Clone)]
pub struct CommonOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the directory that holds the static site and its artifacts.
    #[arg(long = "public-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub public_dir: Option<PathBuf>,

    /// Override the location of the sync state file.
    #[arg(long = "state-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub state_file: Option<PathBuf>,

    /// Override the base URL that card assets resolve against.
    #[arg(long = "base-url", value_name = "URL")]
    pub base_url: Option<String>,

    /// Override the Chromium executable.
    #[arg(long = "browser-executable", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub browser_executable: Option<PathBuf>,

    /// Override the browser launch mode (local|sandboxed).
    #[arg(long = "browser-mode", value_name = "MODE")]
    pub browser_mode: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub common: CommonOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub server_admin_port: Option<u16>,

    /// Override the number of cards rendered concurrently.
    #[arg(long = "sync-concurrency", value_name = "COUNT")]
    pub sync_concurrency: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,

    /// Snapshot JSON file to sync.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub snapshot: PathBuf,

    /// Regenerate every page and tag instead of only the changed ones.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub force: bool,

    /// Maximum number of concurrent render tasks.
    #[arg(long, value_name = "COUNT")]
    pub concurrency: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct GenerateAllArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,

    /// Snapshot JSON file to generate artifacts for.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub snapshot: PathBuf,

    /// Maximum number of concurrent render tasks.
    #[arg(long, value_name = "COUNT")]
    pub concurrency: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,

    /// Page path or URL to render the card for.
    #[arg(long, value_name = "PATH")]
    pub path: String,

    /// Snapshot JSON file providing the page content.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub snapshot: PathBuf,

    /// Destination JPEG file.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,

    /// Background image to use instead of the page cover.
    #[arg(long = "image-url", value_name = "URL")]
    pub image_url: Option<String>,
}
