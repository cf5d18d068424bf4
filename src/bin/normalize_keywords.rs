use event_worker_lib::{
    backfill::{run_normalize_keywords, KeywordNormalizer, ListingPageSource},
    cli::{resolve_normalize_settings, validate_normalize_args, NormalizeKeywordsArgs},
    config::Config,
    logging::{format_error_report, init_logging},
    marketplace::MarketplaceClient,
};
use clap::Parser;
use dotenv::dotenv;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    dotenv().ok();

    let args = NormalizeKeywordsArgs::parse();
    let logging_context = init_logging("marketplace_event_worker", "normalize_keywords", &args.log_level);
    let run_span = tracing::info_span!(
        "worker_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id
    );
    let _run_guard = run_span.enter();

    if let Err(err) = validate_normalize_args(&args) {
        eprintln!("{err}");
        process::exit(2);
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            process::exit(2);
        }
    };
    let settings = resolve_normalize_settings(&args, &config.normalize);

    let client = match MarketplaceClient::new(config.marketplace.clone()) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(
                event = "client_init_failed",
                error = %format_error_report(&err),
                "could not build marketplace client"
            );
            process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(event = "shutdown_signal", "interrupt received; stopping after the current page");
            ctrl_c_cancel.cancel();
        }
    });

    info!(
        event = "normalize_keywords_starting",
        listing_id = ?args.listing_id,
        start_page = settings.start_page,
        max_page = settings.max_page,
        per_page = settings.per_page,
        concurrency = settings.concurrency,
        "starting keyword normalization"
    );

    let source = ListingPageSource::new(Arc::clone(&client), &settings);
    let processor = KeywordNormalizer::new(Arc::clone(&client), settings.concurrency, settings.retry_policy);
    let report = match run_normalize_keywords(
        &source,
        &processor,
        &settings,
        args.listing_id.as_deref(),
        cancel,
    )
    .await
    {
        Ok(report) => report,
        Err(err) => {
            error!(
                event = "normalize_keywords_failed",
                error = %format_error_report(&err),
                "keyword normalization failed"
            );
            process::exit(1);
        }
    };

    match serde_json::to_string(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => warn!(event = "report_encode_failed", error = %err, "could not encode report"),
    }

    if let Some(halt) = &report.halted {
        error!(
            event = "normalize_keywords_halted",
            page = halt.page,
            reason = %halt.reason,
            "keyword normalization halted before the last page"
        );
        process::exit(1);
    }
    info!(
        event = "normalize_keywords_finished",
        processed = report.stats.processed,
        updated = report.stats.updated,
        skipped = report.stats.skipped,
        failed = report.stats.failed,
        cancelled = report.cancelled,
        "keyword normalization finished"
    );
}
