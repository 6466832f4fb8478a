//! Scheduler/worker: run adapters for sources and record the outcome
//!
//! Every active source gets its own tokio task; a semaphore bounds how many
//! run at once. A task that panics is reported as that source's failure and
//! the others carry on.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::{Result, TallyError};
use crate::sources::{AdapterRegistry, FetchContext};
use crate::types::{Network, RunReport, Source, SyncStatus};

/// What happened to one source during a sync pass
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub source_id: String,
    pub network: Network,
    pub status: SyncStatus,
    pub reason: Option<String>,
    pub report: Option<RunReport>,
}

impl SourceOutcome {
    fn failed(source: &Source, reason: String) -> Self {
        Self {
            source_id: source.id.clone(),
            network: source.network,
            status: SyncStatus::Failed,
            reason: Some(reason),
            report: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Synced
    }
}

pub struct SyncService {
    ctx: Arc<FetchContext>,
    registry: Arc<AdapterRegistry>,
    workers: usize,
}

impl SyncService {
    pub fn new(ctx: FetchContext, registry: AdapterRegistry, workers: usize) -> Self {
        Self {
            ctx: Arc::new(ctx),
            registry: Arc::new(registry),
            workers: workers.max(1),
        }
    }

    /// Sync one source by id; inactive sources are left untouched
    pub async fn sync_source(&self, source_id: &str) -> Result<SourceOutcome> {
        let source = self
            .ctx
            .db
            .get_source(source_id)
            .await?
            .ok_or_else(|| TallyError::InvalidInput(format!("Source not found: {}", source_id)))?;

        if !source.active {
            info!(source_id = %source.id, "Source is inactive, skipping");
            return Ok(SourceOutcome {
                source_id: source.id,
                network: source.network,
                status: SyncStatus::Deactivated,
                reason: source.status_reason,
                report: None,
            });
        }

        Ok(run_source(&self.ctx, &self.registry, source).await)
    }

    /// Sync every active source, at most `workers` at a time
    pub async fn sync_all(&self) -> Result<Vec<SourceOutcome>> {
        let sources = self.ctx.db.list_active_sources().await?;
        info!(sources = sources.len(), workers = self.workers, "Starting sync pass");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(sources.len());

        for source in sources {
            let permit = semaphore.clone().acquire_owned().await.ok();
            let ctx = self.ctx.clone();
            let registry = self.registry.clone();
            let task_source = source.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                run_source(&ctx, &registry, task_source).await
            });
            handles.push((source, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (source, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let reason = join_failure(e);
                    error!(source_id = %source.id, network = %source.network, reason = %reason, "Sync task crashed");
                    record(&self.ctx, &source.id, SyncStatus::Failed, Some(&reason)).await;
                    SourceOutcome::failed(&source, reason)
                }
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(
            synced = outcomes.len() - failed,
            failed,
            "Sync pass complete"
        );
        Ok(outcomes)
    }
}

async fn record(ctx: &FetchContext, source_id: &str, status: SyncStatus, reason: Option<&str>) {
    if let Err(e) = ctx.db.update_sync_status(source_id, status, reason).await {
        warn!(source_id, status = %status, error = %e, "Failed to record sync status");
    }
}

async fn run_source(ctx: &FetchContext, registry: &AdapterRegistry, source: Source) -> SourceOutcome {
    record(ctx, &source.id, SyncStatus::Syncing, None).await;

    let result = match registry.get(source.network) {
        Ok(adapter) => adapter.fetch(ctx, &source).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(report) => {
            record(ctx, &source.id, SyncStatus::Synced, None).await;
            SourceOutcome {
                source_id: source.id,
                network: source.network,
                status: SyncStatus::Synced,
                reason: None,
                report: Some(report),
            }
        }
        Err(e) => {
            let reason = e.to_string();
            warn!(source_id = %source.id, network = %source.network, error = %reason, "Source sync failed");
            record(ctx, &source.id, SyncStatus::Failed, Some(&reason)).await;
            SourceOutcome::failed(&source, reason)
        }
    }
}

fn join_failure(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("sync task cancelled: {}", err);
    }

    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("sync task panicked: {}", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::sources::test_support::Harness;
    use crate::sources::SourceAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Succeed,
        Empty,
        Panic,
    }

    struct FakeAdapter {
        network: Network,
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
    }

    impl FakeAdapter {
        fn new(network: Network, behavior: Behavior) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let adapter = Arc::new(Self {
                network,
                behavior,
                calls: calls.clone(),
            });
            (adapter, calls)
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeAdapter {
        fn network(&self) -> Network {
            self.network
        }

        async fn fetch(&self, _ctx: &FetchContext, _source: &Source) -> Result<RunReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(RunReport {
                    seen: 1,
                    ingested: 1,
                    ..RunReport::default()
                }),
                Behavior::Empty => Err(FetchError::NoContent.into()),
                Behavior::Panic => panic!("adapter blew up"),
            }
        }
    }

    #[tokio::test]
    async fn test_sync_source_success_clears_reason() {
        let h = Harness::new().await;
        let source = h.source(Network::Weasyl, "fox", ["k", "", "", ""]).await;
        h.db.update_sync_status(&source.id, SyncStatus::Failed, Some("old error"))
            .await
            .unwrap();

        let (adapter, calls) = FakeAdapter::new(Network::Weasyl, Behavior::Succeed);
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        let service = SyncService::new(h.ctx.clone(), registry, 2);

        let outcome = service.sync_source(&source.id).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.report.unwrap().ingested, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stored = h.db.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.status_reason, None);
    }

    #[tokio::test]
    async fn test_no_content_marks_source_failed() {
        let h = Harness::new().await;
        let source = h.source(Network::E621, "artist", ["k", "u", "", ""]).await;

        let (adapter, _) = FakeAdapter::new(Network::E621, Behavior::Empty);
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        let service = SyncService::new(h.ctx.clone(), registry, 1);

        let outcome = service.sync_source(&source.id).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Failed);

        let stored = h.db.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert!(stored.status_reason.unwrap().to_lowercase().contains("no content"));
    }

    #[tokio::test]
    async fn test_inactive_source_is_skipped() {
        let h = Harness::new().await;
        let source = h.source(Network::Weasyl, "fox", ["k", "", "", ""]).await;
        h.db.set_source_active(&source.id, false).await.unwrap();

        let (adapter, calls) = FakeAdapter::new(Network::Weasyl, Behavior::Succeed);
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        let service = SyncService::new(h.ctx.clone(), registry, 1);

        let outcome = service.sync_source(&source.id).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Deactivated);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_source_is_invalid_input() {
        let h = Harness::new().await;
        let service = SyncService::new(h.ctx.clone(), AdapterRegistry::new(), 1);

        let err = service.sync_source("missing").await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_sync_all_contains_panics() {
        let h = Harness::new().await;
        let good = h.source(Network::Weasyl, "fox", ["k", "", "", ""]).await;
        let bad = h.source(Network::E621, "artist", ["k", "u", "", ""]).await;
        let unregistered = h.source(Network::Reddit, "someone", ["", "", "", ""]).await;
        let inactive = h.source(Network::Weasyl, "sleepy", ["k", "", "", ""]).await;
        h.db.set_source_active(&inactive.id, false).await.unwrap();

        let (ok_adapter, ok_calls) = FakeAdapter::new(Network::Weasyl, Behavior::Succeed);
        let (panicky, _) = FakeAdapter::new(Network::E621, Behavior::Panic);
        let mut registry = AdapterRegistry::new();
        registry.register(ok_adapter);
        registry.register(panicky);
        let service = SyncService::new(h.ctx.clone(), registry, 2);

        let outcomes = service.sync_all().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(ok_calls.load(Ordering::SeqCst), 1);

        let by_id = |id: &str| outcomes.iter().find(|o| o.source_id == id).unwrap();
        assert_eq!(by_id(&good.id).status, SyncStatus::Synced);
        assert_eq!(by_id(&unregistered.id).status, SyncStatus::Failed);

        let crashed = by_id(&bad.id);
        assert_eq!(crashed.status, SyncStatus::Failed);
        assert!(crashed.reason.as_deref().unwrap().contains("adapter blew up"));

        let stored = h.db.get_source(&bad.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert!(stored.status_reason.unwrap().contains("panicked"));

        let untouched = h.db.get_source(&inactive.id).await.unwrap().unwrap();
        assert_eq!(untouched.sync_status, SyncStatus::Deactivated);
    }
}
