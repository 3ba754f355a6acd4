use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use catalog_core::{CatalogClient, ClientConfig, RateLimiter};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::export::export_csv;
use crate::mirror::{MirrorStore, ProductView, default_db_path, now_unix};
use crate::search::SearchResolver;
use crate::sync::{
    JobResult, StartOutcome, SyncConfig, SyncEngine, SyncMode, SyncStatus, SyncSupervisor,
};

const DEFAULT_MAX_RPM: u64 = 120;
const DEFAULT_PAGE_SIZE: u64 = 25;
const DEFAULT_AUDIT_PAGES: u64 = 5;
const DEFAULT_QUICK_SYNC_SECS: u64 = 300;
const DEFAULT_FULL_SYNC_SECS: u64 = 24 * 60 * 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: u64 = 3;

#[derive(Clone, Debug)]
pub struct MirrorConfig {
    pub base_url: String,
    pub api_key: String,
    pub max_rpm: u32,
    pub db_path: PathBuf,
    pub sync: SyncConfig,
    pub client: ClientConfig,
    pub quick_sync_interval: Duration,
    pub full_sync_interval: Duration,
}

impl MirrorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = match lookup("CATALOG_BASE_URL").filter(|value| !value.trim().is_empty()) {
            Some(url) => url.trim().to_string(),
            None => {
                let subdomain = lookup("CATALOG_SUBDOMAIN")
                    .filter(|value| !value.trim().is_empty())
                    .context("CATALOG_BASE_URL or CATALOG_SUBDOMAIN must be set")?;
                subdomain_base_url(subdomain.trim())
            }
        };
        let api_key = lookup("CATALOG_API_KEY").unwrap_or_default();
        let db_path = match lookup("CATALOG_DB_PATH") {
            Some(value) => match dirs::home_dir() {
                Some(home) => expand_with_home(&value, &home),
                None => PathBuf::from(value),
            },
            None => default_db_path().context("no default location for the mirror database")?,
        };

        let read = |name: &str, default: u64| read_u64_var(&lookup, name, default);
        let sync = SyncConfig {
            page_size: clamp_usize(read("CATALOG_PAGE_SIZE", DEFAULT_PAGE_SIZE)),
            audit_pages: clamp_u32(read("CATALOG_AUDIT_PAGES", DEFAULT_AUDIT_PAGES)),
        };
        let client = ClientConfig {
            connect_timeout: Duration::from_secs(read(
                "CATALOG_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            read_timeout: Duration::from_secs(read(
                "CATALOG_READ_TIMEOUT_SECS",
                DEFAULT_READ_TIMEOUT_SECS,
            )),
            max_attempts: clamp_u32(read("CATALOG_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)),
            ..ClientConfig::default()
        };

        Ok(Self {
            base_url,
            api_key,
            max_rpm: clamp_u32(read("CATALOG_MAX_RPM", DEFAULT_MAX_RPM)),
            db_path,
            sync,
            client,
            quick_sync_interval: Duration::from_secs(read(
                "CATALOG_QUICK_SYNC_SECS",
                DEFAULT_QUICK_SYNC_SECS,
            )),
            full_sync_interval: Duration::from_secs(read(
                "CATALOG_FULL_SYNC_SECS",
                DEFAULT_FULL_SYNC_SECS,
            )),
        })
    }
}

/// Wires the rate limiter, client, store, sync supervisor and search together
/// for one process.
pub struct MirrorRuntime {
    config: MirrorConfig,
    store: MirrorStore,
    supervisor: Arc<SyncSupervisor>,
    resolver: SearchResolver<Arc<CatalogClient>>,
}

impl MirrorRuntime {
    pub async fn bootstrap(config: MirrorConfig) -> anyhow::Result<Self> {
        let limiter = Arc::new(RateLimiter::per_minute(config.max_rpm));
        let client = Arc::new(
            CatalogClient::with_config(
                &config.base_url,
                config.api_key.clone(),
                limiter,
                config.client.clone(),
            )
            .with_context(|| format!("invalid catalog base url {:?}", config.base_url))?,
        );
        let store = MirrorStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open mirror store at {:?}", config.db_path))?;
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&client),
            store.clone(),
            config.sync,
        ));
        let supervisor = Arc::new(SyncSupervisor::new(engine));
        let resolver = SearchResolver::new(store.clone(), client);

        Ok(Self {
            config,
            store,
            supervisor,
            resolver,
        })
    }

    pub fn supervisor(&self) -> &Arc<SyncSupervisor> {
        &self.supervisor
    }

    /// Clears a running flag left by a crashed process. Call only from the
    /// long-lived mirroring process, never from one-shot commands.
    pub async fn reset_stale_sync_flag(&self) -> anyhow::Result<bool> {
        let cleared = self
            .store
            .clear_sync_flag()
            .await
            .context("failed to reset sync flag")?;
        if cleared {
            warn!("cleared sync flag left behind by an interrupted run");
        }
        Ok(cleared)
    }

    pub async fn start_sync(&self, mode: SyncMode) -> anyhow::Result<StartOutcome> {
        Ok(self.supervisor.start(mode).await?)
    }

    pub async fn run_sync(&self, mode: SyncMode) -> anyhow::Result<Option<JobResult>> {
        Ok(self.supervisor.run_to_completion(mode).await?)
    }

    pub async fn status(&self) -> anyhow::Result<SyncStatus> {
        Ok(self.supervisor.status().await?)
    }

    pub async fn search(&self, query: &str, page: u32) -> anyhow::Result<Vec<ProductView>> {
        Ok(self.resolver.search(query, page).await?)
    }

    pub async fn export(&self, path: &Path) -> anyhow::Result<usize> {
        export_csv(&self.store, path)
            .await
            .with_context(|| format!("failed to export catalog to {}", path.display()))
    }

    /// Schedules quick and full syncs until Ctrl-C, then waits for the
    /// running job to finish.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            base_url = %self.config.base_url,
            db = %self.config.db_path.display(),
            max_rpm = self.config.max_rpm,
            "catalog mirror started"
        );

        self.reset_stale_sync_flag().await?;
        let state = self.store.sync_state().await?;
        let full_period = self.config.full_sync_interval;
        let full_due = first_full_sync_delay(state.last_full_sync_at, full_period, now_unix());
        let mut full = tokio::time::interval_at(Instant::now() + full_due, full_period);
        full.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut quick = tokio::time::interval(self.config.quick_sync_interval);
        quick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for ctrl-c")?;
                    info!("shutdown requested");
                    break;
                }
                _ = full.tick() => self.trigger(SyncMode::Full).await,
                _ = quick.tick() => self.trigger(SyncMode::Quick).await,
            }
        }

        self.supervisor.wait_idle().await;
        info!("catalog mirror stopped");
        Ok(())
    }

    async fn trigger(&self, mode: SyncMode) {
        match self.supervisor.start(mode).await {
            Ok(StartOutcome::Started) => debug!(%mode, "scheduled sync started"),
            Ok(StartOutcome::AlreadyRunning) => debug!(%mode, "scheduled sync skipped"),
            Err(err) => error!(%mode, "failed to start scheduled sync: {err}"),
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
