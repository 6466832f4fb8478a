//! Source adapters
//!
//! One adapter per network. Each adapter owns its response structs, walks
//! the network's listing in native order, and hands a normalized
//! [`IngestedItem`] per entry to the reconciler through a [`RunState`].
//!
//! Everything an adapter needs from the outside world (storage, secrets,
//! HTTP, sleeping) comes in through a [`FetchContext`], so adapters hold no
//! global state and can run concurrently for different sources.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialStore, SourceToken};
use crate::db::Database;
use crate::error::{FetchError, Result, TallyError};
use crate::pacing::{send_with_backoff, Sleeper, Throttle, TokioSleeper};
use crate::reconcile;
use crate::stats;
use crate::transport::{HttpRequest, HttpResponse, Transport, Transports};
use crate::types::{IngestedItem, Network, RunReport, Source, StatsSummary};

pub mod deviantart;
pub mod e621;
pub mod furaffinity;
pub mod mastodon;
pub mod reddit;
pub mod search_console;
pub mod threads;
pub mod twitch;
pub mod weasyl;

type FetchResult<T> = std::result::Result<T, FetchError>;

/// Dependencies shared by every adapter run
#[derive(Clone)]
pub struct FetchContext {
    pub db: Database,
    pub credentials: Arc<dyn CredentialStore>,
    pub transports: Transports,
    pub sleeper: Arc<dyn Sleeper>,
    /// Retries of a single throttled request before the run fails
    pub max_retries: u32,
    /// Application name and version used to build network-specific agents
    pub user_agent: String,
}

impl FetchContext {
    pub fn new(db: Database, credentials: Arc<dyn CredentialStore>, transports: Transports) -> Self {
        Self {
            db,
            credentials,
            transports,
            sleeper: Arc::new(TokioSleeper),
            max_retries: Throttle::DEFAULT_MAX_RETRIES,
            user_agent: format!("tallycast/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Decrypted secrets for a source; any failure aborts the run
    pub async fn token(&self, source: &Source) -> FetchResult<SourceToken> {
        self.credentials
            .get_source_token(&source.id)
            .await
            .map_err(|e| FetchError::Credential(format!("{} source {}: {}", source.network, source.id, e)))
    }

    /// Throttle policy carrying the configured retry ceiling
    pub fn throttle(&self, statuses: &[u16], fallback: Duration) -> Throttle {
        Throttle::new(statuses, fallback).with_max_retries(self.max_retries)
    }

    /// Send with backoff; the response may still be any non-throttle status
    pub async fn send(
        &self,
        transport: &dyn Transport,
        request: &HttpRequest,
        throttle: &Throttle,
    ) -> FetchResult<HttpResponse> {
        send_with_backoff(transport, self.sleeper.as_ref(), request, throttle).await
    }

    /// Send with backoff, fail on non-2xx and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        transport: &dyn Transport,
        request: &HttpRequest,
        throttle: &Throttle,
    ) -> FetchResult<T> {
        self.send(transport, request, throttle)
            .await?
            .error_for_status()?
            .json()
    }

    /// Courtesy delay
    pub async fn pause(&self, duration: Duration) {
        self.sleeper.sleep(duration).await;
    }
}

/// Per-run bookkeeping: exclusions, in-run dedup and counters
pub struct RunState<'a> {
    ctx: &'a FetchContext,
    source: &'a Source,
    exclusions: HashSet<String>,
    seen: HashSet<String>,
    report: RunReport,
}

impl<'a> RunState<'a> {
    /// Load the exclusion set and start counting
    pub async fn begin(ctx: &'a FetchContext, source: &'a Source) -> Result<Self> {
        let exclusions = ctx.db.load_exclusion_set(&source.id).await?;
        debug!(
            source_id = %source.id,
            network = %source.network,
            exclusions = exclusions.len(),
            "Starting run"
        );

        Ok(Self {
            ctx,
            source,
            exclusions,
            seen: HashSet::new(),
            report: RunReport::default(),
        })
    }

    /// Whether `network_id` should be processed in this run
    ///
    /// Marks the id as seen before checking exclusions, so an excluded id
    /// still counts toward the run's processed items.
    pub fn admit(&mut self, network_id: &str) -> bool {
        if !self.seen.insert(network_id.to_string()) {
            return false;
        }
        self.report.seen += 1;

        if self.exclusions.contains(network_id) {
            debug!(source_id = %self.source.id, network_id, "Skipping excluded item");
            self.report.excluded += 1;
            return false;
        }
        true
    }

    /// Reconcile one item and record its snapshot; failures are logged and skipped
    pub async fn ingest(&mut self, item: &IngestedItem) -> bool {
        match reconcile::ingest(&self.ctx.db, &self.source.id, self.source.network, item).await {
            Ok(_) => {
                self.report.ingested += 1;
                true
            }
            Err(e) => {
                warn!(
                    source_id = %self.source.id,
                    network_id = %item.network_internal_id,
                    error = %e,
                    "Failed to store item, skipping"
                );
                self.report.failed += 1;
                false
            }
        }
    }

    pub fn page_done(&mut self) {
        self.report.pages += 1;
    }

    pub fn pages(&self) -> usize {
        self.report.pages
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Recompute and store the source's stats, logging instead of failing
    pub async fn refresh_stats(
        &self,
        followers: Option<i64>,
        following: Option<i64>,
    ) -> Option<StatsSummary> {
        match stats::refresh_source_stats(&self.ctx.db, &self.source.id, followers, following).await
        {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(source_id = %self.source.id, error = %e, "Failed to update source stats");
                None
            }
        }
    }

    /// Close the run: no content is an error, otherwise refresh stats
    pub async fn finish(self, followers: Option<i64>, following: Option<i64>) -> Result<RunReport> {
        if self.report.seen == 0 {
            return Err(FetchError::NoContent.into());
        }
        self.refresh_stats(followers, following).await;
        self.conclude()
    }

    /// Close the run without touching stats
    pub fn conclude(self) -> Result<RunReport> {
        if self.report.seen == 0 {
            return Err(FetchError::NoContent.into());
        }

        info!(
            source_id = %self.source.id,
            network = %self.source.network,
            seen = self.report.seen,
            ingested = self.report.ingested,
            excluded = self.report.excluded,
            failed = self.report.failed,
            pages = self.report.pages,
            "Run complete"
        );
        Ok(self.report)
    }
}

/// Fetches and ingests everything one source has published
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn network(&self) -> Network;

    /// Run a full sync for `source`
    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport>;
}

/// Adapter lookup by network
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Network, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an adapter for every supported network
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(reddit::RedditAdapter::default()));
        registry.register(Arc::new(threads::ThreadsAdapter::default()));
        registry.register(Arc::new(twitch::TwitchAdapter::default()));
        registry.register(Arc::new(deviantart::DeviantArtAdapter::default()));
        registry.register(Arc::new(e621::E621Adapter::default()));
        registry.register(Arc::new(furaffinity::FurAffinityAdapter::default()));
        registry.register(Arc::new(weasyl::WeasylAdapter::default()));
        registry.register(Arc::new(mastodon::MastodonAdapter::default()));
        registry.register(Arc::new(search_console::SearchConsoleAdapter::default()));
        registry
    }

    /// Add or replace the adapter for its network
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.network(), adapter);
    }

    pub fn get(&self, network: Network) -> Result<Arc<dyn SourceAdapter>> {
        self.adapters.get(&network).cloned().ok_or_else(|| {
            TallyError::InvalidInput(format!("No adapter registered for {}", network))
        })
    }

    pub fn networks(&self) -> Vec<Network> {
        Network::ALL
            .into_iter()
            .filter(|n| self.adapters.contains_key(n))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Harness;
    use super::*;
    use crate::types::{Metrics, PostType};

    fn item(id: &str) -> IngestedItem {
        IngestedItem {
            network_internal_id: id.to_string(),
            post_type: PostType::Post,
            author: "someone".to_string(),
            content: String::new(),
            posted_at: 0,
            metrics: Metrics::new(Some(1), None, None),
        }
    }

    #[tokio::test]
    async fn test_admit_dedups_and_excludes() {
        let h = Harness::new().await;
        let source = h.source(Network::E621, "artist", ["k", "u", "", ""]).await;
        h.db.add_exclusion(&source.id, "blocked").await.unwrap();

        let mut run = RunState::begin(&h.ctx, &source).await.unwrap();
        assert!(run.admit("a"));
        assert!(!run.admit("a"));
        assert!(!run.admit("blocked"));
        assert!(!run.admit("blocked"));

        assert_eq!(run.report().seen, 2);
        assert_eq!(run.report().excluded, 1);
    }

    #[tokio::test]
    async fn test_finish_without_items_is_no_content() {
        let h = Harness::new().await;
        let source = h.source(Network::E621, "artist", ["k", "u", "", ""]).await;

        let run = RunState::begin(&h.ctx, &source).await.unwrap();
        let err = run.finish(None, None).await.unwrap_err();
        assert!(err.is_no_content());
        assert!(h.db.get_source_stats(&source.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_with_only_excluded_items_succeeds() {
        let h = Harness::new().await;
        let source = h.source(Network::E621, "artist", ["k", "u", "", ""]).await;
        h.db.add_exclusion(&source.id, "x").await.unwrap();

        let mut run = RunState::begin(&h.ctx, &source).await.unwrap();
        assert!(!run.admit("x"));
        let report = run.finish(None, None).await.unwrap();
        assert_eq!(report.ingested, 0);
        assert_eq!(h.db.count_posts(&source.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_finish_stores_stats() {
        let h = Harness::new().await;
        let source = h.source(Network::Weasyl, "artist", ["k", "", "", ""]).await;

        let mut run = RunState::begin(&h.ctx, &source).await.unwrap();
        assert!(run.admit("1"));
        assert!(run.ingest(&item("1")).await);
        run.finish(Some(10), Some(2)).await.unwrap();

        let stats = h.db.get_source_stats(&source.id).await.unwrap().unwrap();
        assert_eq!(stats.summary.avg_likes, Some(1.0));
        assert_eq!(stats.summary.followers, Some(10));
        assert_eq!(stats.summary.following, Some(2));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_credential_error() {
        let h = Harness::new().await;
        let source = Source::new(Network::Weasyl, "nobody");
        h.db.create_source(&source).await.unwrap();

        let err = h.ctx.token(&source).await.unwrap_err();
        assert!(matches!(err, FetchError::Credential(_)));
    }

    #[test]
    fn test_standard_registry_covers_every_network() {
        let registry = AdapterRegistry::standard();
        assert_eq!(registry.networks(), Network::ALL.to_vec());
        for network in Network::ALL {
            assert_eq!(registry.get(network).unwrap().network(), network);
        }
        assert!(AdapterRegistry::new().get(Network::Reddit).is_err());
    }
}
