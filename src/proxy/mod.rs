pub mod codec;
pub mod listener;
pub mod queue;
pub mod server;

use std::sync::Arc;

use anyhow::Result;

use crate::cache::CachePool;
use crate::origin::OriginClient;
use crate::settings::Settings;

use queue::NonGetQueue;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: CachePool,
    pub origin: Arc<dyn OriginClient>,
    pub queue: Option<Arc<NonGetQueue>>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        cache: CachePool,
        origin: Arc<dyn OriginClient>,
        queue: Option<Arc<NonGetQueue>>,
    ) -> Self {
        Self {
            settings,
            cache,
            origin,
            queue,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
