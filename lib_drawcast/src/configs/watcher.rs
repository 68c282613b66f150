//! # Catalogue Hot Reload
//!
//! Polls a [`ConfigSource`] revision and, when it moves, swaps the new
//! catalogue into the [`TargetRegistry`] and hands the difference to the
//! scheduler (when this instance runs one). A reload that yields nothing
//! loadable, or that fails to read, keeps the previous catalogue.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

use crate::configs::catalogue::{Catalogue, ConfigSource};
use crate::core::scheduler::SchedulerHandle;
use crate::core::target::{CatalogueDiff, TargetRegistry};
use crate::error::SchedulerError;

/// Called with every accepted catalogue before the scheduler sees it, so
/// transport routes exist by the time new targets tick.
pub type ReloadHook = Box<dyn Fn(&Catalogue) + Send + Sync>;

/// Installs `catalogue` into `targets` and reconciles the scheduler, if any.
pub async fn apply_catalogue(
    targets: &TargetRegistry,
    scheduler: Option<&SchedulerHandle>,
    catalogue: Catalogue,
) -> Result<CatalogueDiff, SchedulerError> {
    let diff = targets.replace_all(catalogue.targets);
    if let Some(handle) = scheduler.filter(|_| !diff.is_empty()) {
        handle.reconcile(diff.clone()).await?;
    }
    Ok(diff)
}

/// Watches `source` every `interval` until `shutdown` fires.
pub struct CatalogueWatcher {
    source: Arc<dyn ConfigSource>,
    interval: Duration,
    targets: Arc<TargetRegistry>,
    scheduler: Option<Arc<SchedulerHandle>>,
    hook: Option<ReloadHook>,
    last_revision: Option<SystemTime>,
}

impl CatalogueWatcher {
    /// `initial_revision` is the revision of the catalogue already loaded.
    pub fn new(
        source: Arc<dyn ConfigSource>,
        interval: Duration,
        targets: Arc<TargetRegistry>,
        initial_revision: Option<SystemTime>,
    ) -> Self {
        Self {
            source,
            interval,
            targets,
            scheduler: None,
            hook: None,
            last_revision: initial_revision,
        }
    }

    /// Reconciles this scheduler on every accepted reload.
    pub fn with_scheduler(mut self, handle: Arc<SchedulerHandle>) -> Self {
        self.scheduler = Some(handle);
        self
    }

    /// Runs `hook` after every accepted reload.
    pub fn with_hook(mut self, hook: ReloadHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Checks the source once. Returns the applied diff, or `None` when
    /// nothing changed or the new catalogue was refused.
    pub async fn check(&mut self) -> Option<CatalogueDiff> {
        let revision = self.source.revision().await;
        if revision.is_none() || revision == self.last_revision {
            return None;
        }
        self.last_revision = revision;

        let catalogue = match self.source.load().await {
            Ok(catalogue) => catalogue,
            Err(e) => {
                tracing::error!(
                    source = %self.source.describe(),
                    error = %e,
                    "catalogue reload refused, keeping previous catalogue"
                );
                return None;
            }
        };
        if let Some(hook) = &self.hook {
            hook(&catalogue);
        }

        match apply_catalogue(&self.targets, self.scheduler.as_deref(), catalogue).await {
            Ok(diff) => {
                tracing::info!(
                    added = ?diff.added,
                    changed = ?diff.changed,
                    removed = ?diff.removed,
                    "catalogue reloaded"
                );
                Some(diff)
            }
            Err(e) => {
                tracing::warn!(error = %e, "scheduler rejected catalogue reload");
                None
            }
        }
    }

    /// Runs the polling loop.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
        tracing::debug!("catalogue watcher stopped");
    }
}
