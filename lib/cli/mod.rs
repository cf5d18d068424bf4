use crate::backfill::normalize_keywords::MAX_PAGE;
use crate::backfill::{is_valid_listing_id, NormalizeSettings};
use crate::build_info;
use crate::config::Config;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    about = "Marketplace event scripts and backfill triggers",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[clap(long, value_delimiter = ',')]
    /// Run only these scripts (comma separated). Overrides ENABLED_SCRIPTS.
    pub scripts: Vec<String>,

    #[clap(long)]
    /// Log events instead of posting them to EVENT_SINK_URL
    pub dry_run: bool,

    #[clap(long)]
    /// Do not start the HTTP server
    pub no_server: bool,

    #[clap(long)]
    /// HTTP port. Overrides PORT.
    pub port: Option<u16>,

    #[clap(long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Folds command-line overrides into the environment-derived config.
    pub fn apply_to(&self, config: &mut Config) {
        if !self.scripts.is_empty() {
            config.enabled_scripts = self.scripts.clone();
        }
        if self.dry_run {
            config.event_sink_url = None;
        }
        if let Some(port) = self.port {
            config.server_port = port;
        }
    }
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

/// One-shot keyword normalization, shared by the `normalize_keywords` binary.
#[derive(Debug, Parser, Clone)]
#[command(
    about = "Normalize product listing keywords once and exit",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct NormalizeKeywordsArgs {
    #[arg(long = "listing-id")]
    /// Normalize a single listing instead of sweeping every page.
    pub listing_id: Option<String>,

    #[arg(long = "start-page", default_value_t = 1)]
    pub start_page: u32,
    #[arg(long = "max-page")]
    pub max_page: Option<u32>,
    #[arg(long = "per-page")]
    pub per_page: Option<u32>,
    #[arg(long = "concurrency")]
    pub concurrency: Option<usize>,
    #[arg(long = "page-delay-ms", default_value_t = 0)]
    pub page_delay_ms: u64,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

pub fn validate_normalize_args(args: &NormalizeKeywordsArgs) -> Result<(), String> {
    if let Some(listing_id) = &args.listing_id {
        if !is_valid_listing_id(listing_id) {
            return Err(format!("--listing-id must be a listing UUID, got {listing_id:?}"));
        }
    }
    if args.start_page == 0 {
        return Err("--start-page must be > 0".to_string());
    }
    match args.max_page {
        Some(max_page) if max_page < args.start_page => {
            return Err(format!(
                "--max-page ({max_page}) must be >= --start-page ({})",
                args.start_page
            ));
        }
        None if args.start_page > MAX_PAGE => {
            return Err(format!(
                "--start-page ({}) must be <= the default --max-page ({MAX_PAGE})",
                args.start_page
            ));
        }
        _ => {}
    }
    if args.per_page == Some(0) {
        return Err("--per-page must be > 0".to_string());
    }
    if args.concurrency == Some(0) {
        return Err("--concurrency must be > 0".to_string());
    }

    Ok(())
}

/// Applies the command-line overrides on top of the configured settings.
pub fn resolve_normalize_settings(
    args: &NormalizeKeywordsArgs,
    base: &NormalizeSettings,
) -> NormalizeSettings {
    NormalizeSettings {
        start_page: args.start_page,
        max_page: args.max_page.unwrap_or(base.max_page),
        per_page: args.per_page.unwrap_or(base.per_page),
        concurrency: args.concurrency.unwrap_or(base.concurrency),
        inter_page_delay: std::time::Duration::from_millis(args.page_delay_ms),
        ..base.clone()
    }
}
