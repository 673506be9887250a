//! Render Scheduler.
//!
//! Each iteration picks one unit of work from the store:
//!
//! 1. A domain with queued incremental items (oldest row first).
//! 2. Otherwise the domain whose full rebuild is due with the newest
//!    `updated` watermark.
//! 3. Otherwise nothing; the loop idles.
//!
//! The highest queue row id is captured *before* rendering and only rows up
//! to it are deleted afterwards, so items appended by the watcher while a
//! render runs stay queued. A failed render changes nothing in the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sitesync_core::metrics;
use tokio_util::sync::CancellationToken;

use super::publisher::{Publisher, RenderScope};
use crate::Result;
use crate::clock::Clock;
use crate::store::{DomainRecord, DomainStatus, Store};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep when there is no work, and after a failure.
    pub idle_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(3),
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Rendered queued paths and deleted rows up to `cutoff`.
    Incremental {
        domain: String,
        paths: Vec<String>,
        cutoff: i64,
    },
    /// Rendered the whole site.
    Full { domain: String, rendered: u64 },
    /// The publisher failed; nothing was advanced.
    Failed { domain: String, error: String },
    /// Dropped a queue row whose domain is not deployed.
    OrphanDropped { id: i64, domain: String },
    /// No work.
    Idle,
}

pub struct RenderScheduler {
    store: Arc<Store>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl RenderScheduler {
    pub fn new(
        store: Arc<Store>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
        }
    }

    /// Run one iteration.
    pub async fn run_once(&self) -> Result<Step> {
        if let Some(row) = self.store.any_queued()? {
            let record = self
                .store
                .get_domain(&row.domain)?
                .filter(|r| r.status == DomainStatus::Deployed);
            let Some(record) = record else {
                tracing::info!(domain = %row.domain, id = row.id, "Dropping queue row for inactive domain");
                self.store.delete_queue_row(row.id)?;
                return Ok(Step::OrphanDropped {
                    id: row.id,
                    domain: row.domain,
                });
            };
            return self.render_incremental(record).await;
        }

        let due = self
            .store
            .list_active_domains()?
            .into_iter()
            .filter(DomainRecord::needs_full_rebuild)
            .max_by_key(|r| r.updated);

        match due {
            Some(record) => self.render_full(record).await,
            None => {
                metrics::increment("render_idle_total", 1);
                Ok(Step::Idle)
            }
        }
    }

    async fn render_incremental(&self, record: DomainRecord) -> Result<Step> {
        let domain = record.domain.clone();
        let Some(cutoff) = self.store.last_queued_id(&domain)? else {
            return Ok(Step::Idle);
        };

        let mut paths = vec!["/".to_string()];
        for row in self.store.list_queue(&domain)? {
            if row.id > cutoff {
                break;
            }
            let path = format!("/post/{}", row.reference);
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        let scope = RenderScope::Paths(paths.clone());
        if let Some(failed) = self.publish(&record, &scope).await {
            return Ok(failed);
        }

        let deleted = self.store.delete_queue_up_to(&domain, cutoff)?;
        metrics::increment("queue_deleted_total", deleted as u64);
        tracing::info!(domain = %domain, pages = paths.len(), deleted, "Incremental render done");

        Ok(Step::Incremental {
            domain,
            paths,
            cutoff,
        })
    }

    async fn render_full(&self, record: DomainRecord) -> Result<Step> {
        let domain = record.domain.clone();
        let started = self.clock.now();
        let cutoff = self.store.last_queued_id(&domain)?;

        if let Some(failed) = self.publish(&record, &RenderScope::Full).await {
            return Ok(failed);
        }

        if let Some(cutoff) = cutoff {
            let deleted = self.store.delete_queue_up_to(&domain, cutoff)?;
            metrics::increment("queue_deleted_total", deleted as u64);
        }
        self.store.set_rendered(&domain, started)?;
        tracing::info!(domain = %domain, rendered = started, "Full render done");

        Ok(Step::Full {
            domain,
            rendered: started,
        })
    }

    /// Invoke the publisher; `Some(Step::Failed)` if it failed.
    async fn publish(&self, record: &DomainRecord, scope: &RenderScope) -> Option<Step> {
        let started = Instant::now();
        let result = self
            .publisher
            .render_and_publish(&record.site, scope, &record.domain)
            .await;
        metrics::record_duration("render_duration_seconds", started.elapsed());

        match result {
            Ok(()) => {
                metrics::increment_render(scope.kind(), "ok");
                None
            }
            Err(e) => {
                metrics::increment_render(scope.kind(), "error");
                tracing::warn!(domain = %record.domain, kind = scope.kind(), "Render failed: {}", e);
                Some(Step::Failed {
                    domain: record.domain.clone(),
                    error: e.to_string(),
                })
            }
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("Render scheduler started");
        loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => break,
                step = self.run_once() => step,
            };

            let idle = match step {
                Ok(Step::Idle) | Ok(Step::Failed { .. }) => true,
                Ok(_) => false,
                Err(e) => {
                    tracing::error!("Scheduler iteration failed: {}", e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.clock.sleep(self.config.idle_interval) => {}
                }
            }
        }
        tracing::info!("Render scheduler stopped");
    }
}
