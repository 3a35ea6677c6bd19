//! Process-wide services shared by every conversation session.
//!
//! One [`Services`] owns the admission queue, the connection pool, the
//! response cache and their background workers (scheduler, idle reaper,
//! TTL sweeper).  Sessions borrow clones of the handles; nothing here is
//! per-turn.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{AudioPlayer, HttpGenerator, HttpRecognizer, HttpSynthesizer};
use crate::cache::ResponseCache;
use crate::config::{AppConfig, BackendConfig};
use crate::pipeline::{Backends, ConversationSession};
use crate::pool::ConnectionPool;
use crate::queue::AdmissionQueue;

pub struct Services {
    pub queue: AdmissionQueue,
    pub pool: ConnectionPool,
    pub cache: Arc<ResponseCache>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Services {
    /// Build every service from `config` and start the background workers.
    /// Must be called inside a tokio runtime.
    pub fn start(config: &AppConfig) -> Self {
        let shutdown = CancellationToken::new();

        let queue = AdmissionQueue::start(config.queue.clone());
        let pool = ConnectionPool::new(config.pool.clone());
        let cache = Arc::new(ResponseCache::new(&config.cache));

        let workers = vec![
            pool.spawn_reaper(shutdown.child_token()),
            cache.spawn_sweeper(config.cache.cleanup_interval(), shutdown.child_token()),
        ];

        log::info!(
            "services: started (pool ceiling {}, cache budget {} bytes)",
            config.pool.global_concurrency,
            config.cache.max_memory_bytes
        );

        Self {
            queue,
            pool,
            cache,
            shutdown,
            workers,
        }
    }

    /// HTTP adapters for the three backends, all sharing this pool.
    pub fn http_backends(&self, config: &BackendConfig, player: Arc<dyn AudioPlayer>) -> Backends {
        Backends {
            recognizer: Arc::new(HttpRecognizer::new(self.pool.clone(), config)),
            generator: Arc::new(HttpGenerator::new(self.pool.clone(), config)),
            synthesizer: Arc::new(HttpSynthesizer::new(self.pool.clone(), config)),
            player,
        }
    }

    /// A new conversation over the HTTP backends.
    pub fn session(&self, config: &AppConfig, player: Arc<dyn AudioPlayer>) -> ConversationSession {
        ConversationSession::new(
            self.queue.clone(),
            Arc::clone(&self.cache),
            self.http_backends(&config.backends, player),
            config.pipeline.clone(),
            config.backends.voice.clone(),
        )
    }

    /// Cancel pending work, close pooled connections and wait for the
    /// background workers to exit.
    pub async fn shutdown(self) {
        self.queue.shutdown();
        self.pool.shutdown();
        self.shutdown.cancel();

        self.queue.join().await;
        for worker in self.workers {
            if let Err(e) = worker.await {
                log::warn!("services: worker ended abnormally: {e}");
            }
        }
        log::info!("services: stopped");
    }
}
