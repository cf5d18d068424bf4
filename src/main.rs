use event_worker_lib::{
    checkpoint::{CheckpointStore, FileCheckpointStore},
    cli::parse_args,
    config::Config,
    event_engine::{EventScriptSupervisor, PollLoop},
    logging::{format_error_report, init_logging},
    marketplace::{MarketplaceClient, MarketplaceEventSource},
    scripts::{resolve_enabled, Forwarder, LoggingForwarder, ScriptHandler, WebhookForwarder},
    server::setup_server_with_addr,
    state::AppState,
};
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use dotenv::dotenv;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancels the shared token on the first SIGTERM or SIGINT.
async fn handle_shutdown_signals(shutdown_token: CancellationToken) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(err), _) | (_, Err(err)) => {
            error!(
                event = "signal_handler_failed",
                error = %err,
                "failed to register signal handlers; shutting down"
            );
            shutdown_token.cancel();
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "SIGTERM received, shutting down.");
        }
        _ = sigint.recv() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "SIGINT received, shutting down.");
        }
        _ = shutdown_token.cancelled() => return,
    }

    shutdown_token.cancel();
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let args = parse_args();
    let logging_context = init_logging("marketplace_event_worker", "worker", &args.log_level);
    let run_span = tracing::info_span!(
        "worker_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id
    );
    let _run_guard = run_span.enter();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_invalid", error = %err, "config incorrectly specified");
            process::exit(2);
        }
    };
    args.apply_to(&mut config);

    let definitions = match resolve_enabled(&config.enabled_scripts) {
        Ok(definitions) => definitions,
        Err(err) => {
            error!(event = "config_invalid", error = %err, "unknown script in ENABLED_SCRIPTS");
            process::exit(2);
        }
    };

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

    let forwarder: Arc<dyn Forwarder> = match &config.event_sink_url {
        Some(sink_url) => {
            match WebhookForwarder::new(sink_url, config.marketplace.request_timeout) {
                Ok(forwarder) => Arc::new(forwarder),
                Err(err) => {
                    error!(
                        event = "client_init_failed",
                        error = %format_error_report(&err),
                        "could not build webhook forwarder"
                    );
                    process::exit(1);
                }
            }
        }
        None => {
            warn!(
                event = "event_sink_missing",
                "EVENT_SINK_URL not set; events will only be logged"
            );
            Arc::new(LoggingForwarder)
        }
    };

    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(
        config.checkpoint_dir.clone(),
        config.checkpoint_policy,
    ));

    let mut supervisor = EventScriptSupervisor::new();
    for definition in definitions {
        let source = MarketplaceEventSource::new(
            Arc::clone(&client),
            definition.event_types(),
            config.retry_policy,
        );
        let handler = ScriptHandler::new(definition, Arc::clone(&forwarder), config.retry_policy);
        supervisor.register(PollLoop::new(
            definition.name,
            source,
            handler,
            Arc::clone(&checkpoints),
            config.poll,
        ));
    }

    info!(
        event = "worker_starting",
        scripts = ?supervisor.script_names(),
        development = config.development,
        checkpoint_dir = %config.checkpoint_dir.display(),
        "starting marketplace event worker"
    );

    let shutdown_token = CancellationToken::new();
    let state = Arc::new(AppState::new(
        Arc::clone(&client),
        config.normalize.clone(),
        shutdown_token.clone(),
    ));
    let shutdown_handle = tokio::spawn(handle_shutdown_signals(shutdown_token.clone()));

    let server_handle = if args.no_server {
        None
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
        match setup_server_with_addr(Arc::clone(&state), addr).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(
                    event = "server_start_failed",
                    addr = %addr,
                    error = %err,
                    "failed to start HTTP server"
                );
                shutdown_token.cancel();
                process::exit(1);
            }
        }
    };

    if supervisor.is_empty() {
        warn!(event = "no_scripts_enabled", "no event scripts enabled");
        shutdown_token.cancelled().await;
    } else {
        supervisor.run(shutdown_token.clone()).await;
    }

    if let Err(err) = shutdown_handle.await {
        warn!(event = "shutdown_join_failed", error = %err, "signal handler task failed");
    }
    if let Some(server_handle) = server_handle {
        if let Err(err) = server_handle.await {
            warn!(event = "server_join_failed", error = %err, "HTTP server task failed");
        }
    }
    info!(event = "worker_stopped", "marketplace event worker stopped");
}
