pub mod cache;
pub mod cli;
pub mod control;
pub mod logging;
pub mod origin;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::cache::CachePool;
use crate::origin::{HttpOriginClient, OriginClient};
use crate::proxy::queue::NonGetQueue;
use crate::settings::{NonGetMode, Settings};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if settings.target_addr.is_empty() {
        warn!("no target_addr configured; origin fetches will fail until one is set");
    }

    let origin: Arc<dyn OriginClient> = Arc::new(HttpOriginClient::from_settings(&settings)?);
    let cache = CachePool::new(settings.cache_config(), origin.clone());

    if let Some(control_addr) = settings.control_addr {
        let control_cache = cache.clone();
        tokio::spawn(async move {
            if let Err(err) = control::start_control(control_addr, control_cache).await {
                tracing::error!(error = %err, "control socket failed");
            }
        });
    }

    let queue = if settings.non_get_mode == NonGetMode::Queue {
        Some(NonGetQueue::new(
            settings.queue_capacity,
            settings.dequeue_rate,
        ))
    } else {
        None
    };

    let app = proxy::AppContext::new(settings, cache, origin, queue);
    proxy::run(app).await
}
