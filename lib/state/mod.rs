use std::sync::Arc;

use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::backfill::NormalizeSettings;
use crate::marketplace::MarketplaceClient;

pub struct AppState {
    pub client: Arc<MarketplaceClient>,
    pub normalize: NormalizeSettings,
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
}

impl AppState {
    pub fn new(
        client: Arc<MarketplaceClient>,
        normalize: NormalizeSettings,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            client,
            normalize,
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
        }
    }
}
