use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Process-wide handles shared by the ops endpoints and the long-running tasks.
pub struct AppState {
    pub service: &'static str,
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
}

impl AppState {
    pub fn new(service: &'static str, shutdown_token: CancellationToken) -> Self {
        Self {
            service,
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
        }
    }
}
