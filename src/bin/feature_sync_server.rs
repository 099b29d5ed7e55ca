use feature_sync_lib::{
    cli::ServerCli,
    config::ServerConfig,
    db::build_db_pool,
    logging::{format_error_report, init_logging},
    server::{command_router, ops_router, register_server_metrics, serve},
    state::AppState,
    store::{mysql::MysqlStore, TargetStore},
};

use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

const SERVICE: &str = "feature_sync_server";

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

    let args = ServerCli::parse();
    let mut config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };
    args.apply(&mut config);

    let logging_context = init_logging(SERVICE, "serve", config.log_format, &config.log_level);
    let run_span = tracing::info_span!(
        "server_run",
        service = %logging_context.service,
        run_id = %logging_context.run_id,
    );
    let _run_guard = run_span.enter();

    let addr = match config.bind_addr() {
        Ok(addr) => addr,
        Err(err) => {
            error!(event = "invalid_bind_addr", error = %err, "invalid listen address");
            std::process::exit(2);
        }
    };
    let pool = match build_db_pool(&config.db_url, config.db_pool_size) {
        Ok(pool) => pool,
        Err(err) => {
            error!(event = "db_pool_failed", error = %format_error_report(&err), "failed to build db pool");
            std::process::exit(1);
        }
    };
    let store: Arc<dyn TargetStore> = Arc::new(MysqlStore::new(pool, config.retry));

    let state = Arc::new(AppState::new(SERVICE, Default::default()));
    register_server_metrics(&state).await;
    tokio::spawn(handle_shutdown_signals(state.clone()));

    let app = command_router(store).merge(ops_router(state.clone()));
    let (bound, server_handle) = match serve(app, addr, state.shutdown_token.clone()).await {
        Ok(bound) => bound,
        Err(err) => {
            error!(event = "bind_failed", error = %err, addr = %addr, "failed to bind command server");
            std::process::exit(1);
        }
    };
    info!(event = "server_listening", addr = %bound, "feature sync server listening");

    let _ = server_handle.await;
    info!(event = "server_stopped", "feature sync server stopped");
}
