use axum::Router;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    allocator::VirtualAddressAllocator,
    api::{create_router, AppState},
    codec::AesCfbCodec,
    config::{ServerConfig, StorageBackend},
    channel::LocalChannels,
    keys::KeyProvider,
    metrics::HubMetrics,
    rate_limit::RateLimiter,
    relay::Relay,
    sqlite_store::SqliteStore,
    store::{CounterStore, MemoryStore, SecretStore},
};

pub struct HubServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    channels: LocalChannels,
    rate_limiter: RateLimiter,
    metrics: Arc<HubMetrics>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl HubServer {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let (counter, secrets): (Arc<dyn CounterStore>, Arc<dyn SecretStore>) = match config.storage {
            StorageBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                (store.clone() as Arc<dyn CounterStore>, store as Arc<dyn SecretStore>)
            }
            StorageBackend::Sqlite => {
                let store = Arc::new(SqliteStore::new(&config.database_path)?);
                info!("Using SQLite store at {}", config.database_path.display());
                (store.clone() as Arc<dyn CounterStore>, store as Arc<dyn SecretStore>)
            }
        };

        let keys = Arc::new(KeyProvider::new(secrets));
        let channels = LocalChannels::new(config.channel_buffer);
        let metrics = Arc::new(HubMetrics::new()?);
        let relay = Arc::new(Relay::new(
            Arc::new(VirtualAddressAllocator::new(counter)),
            Arc::new(AesCfbCodec::new(keys)),
            Arc::new(channels.clone()),
            Arc::clone(&metrics),
        ));

        let rate_limiter = RateLimiter::new(config.rate_limit.clone());
        for ip in &config.allowlist {
            rate_limiter.add_to_allowlist(ip.parse()?);
        }
        for ip in &config.blocklist {
            rate_limiter.add_to_blocklist(ip.parse()?);
        }

        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        Ok(Self {
            config,
            relay,
            channels,
            rate_limiter,
            metrics,
            shutdown_tx,
        })
    }

    /// The full HTTP surface. Handlers expect `ConnectInfo<SocketAddr>`.
    pub fn router(&self) -> Router {
        let state = AppState {
            relay: Arc::clone(&self.relay),
            channels: self.channels.clone(),
            rate_limiter: self.rate_limiter.clone(),
            metrics: Arc::clone(&self.metrics),
            binding: self.config.identity_binding,
            shutdown: self.shutdown_tx.subscribe(),
        };

        create_router(state, self.config.max_body_size).layer(TraceLayer::new_for_http())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        tokio::spawn(Self::eviction_task(
            self.channels.clone(),
            self.rate_limiter.clone(),
            self.config.clone(),
            Arc::clone(&self.metrics),
            self.shutdown_tx.subscribe(),
        ));

        let app = self.router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("smoke-hub listening on {}", self.config.bind_addr);

        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                Self::shutdown_signal(shutdown_tx.subscribe()).await;
                // Ends open channel streams so the server can drain.
                let _ = shutdown_tx.send(true);
            })
            .await?;

        Ok(())
    }

    async fn eviction_task(
        channels: LocalChannels,
        rate_limiter: RateLimiter,
        config: ServerConfig,
        metrics: Arc<HubMetrics>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(config.eviction_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = channels.evict_idle(config.channel_ttl());
                    rate_limiter.prune();
                    metrics.open_channels.set(channels.len() as f64);

                    if evicted > 0 {
                        info!("Evicted {} idle channels", evicted);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    if let Some(ref mut sigterm) = sigterm {
                        sigterm.recv().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = shutdown.changed() => {
                info!("Shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
