use feature_sync_lib::{
    cli::ClientCli,
    config::ClientConfig,
    db::build_db_pool,
    logging::{format_error_report, init_logging},
    reconcile::{EngineConfig, ReconciliationEngine},
    scheduler::{ScheduleMode, Scheduler},
    server::{ops_router, register_client_metrics, serve},
    state::AppState,
    store::{http::HttpTargetStore, mysql::MysqlStore},
};

use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

const SERVICE: &str = "feature_sync_client";

/// Cancels the shared token on SIGTERM or SIGINT.
async fn handle_shutdown_signals(state: Arc<AppState>) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(err), _) | (_, Err(err)) => {
            error!(event = "signal_handler_failed", error = %err, "cannot listen for signals");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!(event = "shutdown_signal", signal = "SIGTERM", "shutting down"),
        _ = sigint.recv() => info!(event = "shutdown_signal", signal = "SIGINT", "shutting down"),
    }

    state.shutdown_token.cancel();
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let args = ClientCli::parse();
    let mut config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };
    args.apply(&mut config);

    let mode = if config.run_once { "run_once" } else { "continuous" };
    let logging_context = init_logging(SERVICE, mode, config.log_format, &config.log_level);
    let run_span = tracing::info_span!(
        "client_run",
        service = %logging_context.service,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id,
        scope = %config.scope,
    );
    let _run_guard = run_span.enter();

    let pool = match build_db_pool(&config.db_url, config.db_pool_size) {
        Ok(pool) => pool,
        Err(err) => {
            error!(event = "db_pool_failed", error = %format_error_report(&err), "failed to build db pool");
            std::process::exit(1);
        }
    };
    let source = MysqlStore::new(pool, config.retry);
    let target = match HttpTargetStore::new(&config.target_url, config.request_timeout, config.retry) {
        Ok(target) => target,
        Err(err) => {
            error!(event = "http_client_failed", error = %format_error_report(&err), "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(SERVICE, Default::default()));
    register_client_metrics(&state).await;
    let shutdown_handle = tokio::spawn(handle_shutdown_signals(state.clone()));

    let (metrics_addr, server_handle) = match serve(
        ops_router(state.clone()),
        config.metrics_addr,
        state.shutdown_token.clone(),
    )
    .await
    {
        Ok(bound) => bound,
        Err(err) => {
            error!(event = "metrics_bind_failed", error = %err, addr = %config.metrics_addr, "failed to bind metrics server");
            std::process::exit(1);
        }
    };

    let schedule = if config.run_once {
        ScheduleMode::RunOnce
    } else {
        ScheduleMode::Continuous {
            interval: config.interval,
        }
    };
    info!(
        event = "client_starting",
        target = %target.endpoint(),
        metrics_addr = %metrics_addr,
        page_limit = config.page_limit,
        interval_secs = config.interval.as_secs(),
        "starting feature sync client"
    );

    let engine = ReconciliationEngine::new(
        source,
        target,
        config.scope.clone(),
        EngineConfig {
            page_limit: config.page_limit,
        },
    );
    let scheduler = Scheduler::new(engine, schedule);
    let cycles = scheduler.run(state.shutdown_token.clone()).await;

    info!(event = "client_stopped", cycles, "feature sync client stopped");
    state.shutdown_token.cancel();
    shutdown_handle.abort();
    let _ = server_handle.await;
}
