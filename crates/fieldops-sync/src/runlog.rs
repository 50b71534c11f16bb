//! Run-level bookkeeping: one row per engine execution.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use fieldops_core::{RunStatus, RunSummary, SyncRun};
use fieldops_db::SyncStore;
use tracing::info;
use uuid::Uuid;

/// Opens a `running` row at construction, accumulates monotonic counters,
/// and performs exactly one terminal update. `finalize` consumes the
/// tracker, so a second transition cannot be expressed.
pub struct RunTracker {
    store: Arc<dyn SyncStore>,
    run: SyncRun,
    errors: Vec<String>,
}

impl RunTracker {
    pub async fn start(store: Arc<dyn SyncStore>, run_type: &str) -> Result<Self> {
        let run = SyncRun {
            id: Uuid::new_v4(),
            run_type: run_type.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            jobs_processed: 0,
            jobs_created: 0,
            jobs_updated: 0,
            errors: None,
        };
        store.insert_run(&run).await.context("opening sync run")?;
        info!(run_id = %run.id, run_type, "sync run started");
        Ok(Self {
            store,
            run,
            errors: Vec::new(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    pub fn job_processed(&mut self) {
        self.run.jobs_processed += 1;
    }

    pub fn job_created(&mut self) {
        self.run.jobs_created += 1;
    }

    pub fn job_updated(&mut self) {
        self.run.jobs_updated += 1;
    }

    pub fn record_error(&mut self, message: String) {
        self.errors.push(message);
    }

    /// Persist the counters mid-run; values only ever grow.
    pub async fn checkpoint(&self) -> Result<()> {
        self.store
            .update_run_counters(
                self.run.id,
                self.run.jobs_processed,
                self.run.jobs_created,
                self.run.jobs_updated,
            )
            .await
    }

    pub async fn finalize(self, status: RunStatus) -> Result<RunSummary> {
        let joined = (!self.errors.is_empty()).then(|| self.errors.join("\n"));
        self.store
            .finalize_run(
                self.run.id,
                status,
                self.run.jobs_processed,
                self.run.jobs_created,
                self.run.jobs_updated,
                joined,
                Utc::now(),
            )
            .await
            .context("finalizing sync run")?;
        info!(
            run_id = %self.run.id,
            status = status.as_str(),
            processed = self.run.jobs_processed,
            created = self.run.jobs_created,
            updated = self.run.jobs_updated,
            errors = self.errors.len(),
            "sync run finished"
        );
        Ok(RunSummary {
            run_id: self.run.id,
            jobs_processed: self.run.jobs_processed,
            jobs_created: self.run.jobs_created,
            jobs_updated: self.run.jobs_updated,
            errors: self.errors,
        })
    }
}
