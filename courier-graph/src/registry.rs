//! Durable build registry: one state machine per build attempt, one
//! cooperative lock per instance name.
//!
//! The lock map is process-local. It guarantees that within this process
//! at most one build per instance name is in flight; it does not protect
//! against a second process racing on the same name, and a crash
//! mid-build leaves a Building record with no protecting lock. Such an
//! orphan stays visible through the query operations until an operator
//! fails it; `start_build` refuses to stack a new attempt on top of it.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use courier_common::{truncate_message, GraphError, Result};
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::model::{BuildRecord, BuildStatus};
use crate::store::{now_utc, Store};

pub struct BuildRegistry {
    store: Arc<Store>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BuildRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        BuildRegistry { store, locks: Mutex::new(HashMap::new()) }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn lock_for(&self, instance: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(instance.to_string()).or_default().clone()
    }

    /// Run `op` while holding the instance's build slot.
    ///
    /// Contract, and it is not the obvious one: a caller arriving while a
    /// build for the same instance is in flight **waits for that build to
    /// complete** and then runs its own closure. Waiting does not enqueue
    /// a repeat of the earlier build — whether to start a new one is the
    /// waiting closure's decision, made after it observes the registry
    /// state the earlier build left behind. Callers for different
    /// instance names never block each other, and waiting is never
    /// surfaced as an error.
    pub async fn execute_sequentially<T, F, Fut>(&self, instance: &str, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(instance);
        let _guard = lock.lock().await;
        op().await
    }

    /// Create the Pending record for a new attempt.
    ///
    /// Refuses while the instance already has a non-terminal record —
    /// either a live build in another process or an orphan left by a
    /// crash. Stacking a second record would break the one-in-flight
    /// invariant either way.
    pub fn start_build(
        &self,
        instance: &str,
        segment_count: u64,
        source_path: Option<&Path>,
    ) -> Result<BuildRecord> {
        if let Some(current) = self.store.current_for_instance(instance)? {
            return Err(GraphError::State(format!(
                "instance '{instance}' already has build {} in status {}",
                current.id,
                current.status.as_str()
            )));
        }
        let record = BuildRecord {
            id: Uuid::new_v4().to_string(),
            instance_name: instance.to_string(),
            status: BuildStatus::Pending,
            segment_count,
            avg_weight: None,
            source_path: source_path.map(|p| p.display().to_string()),
            output_path: None,
            error_message: None,
            created_at: now_utc(),
            started_at: None,
            completed_at: None,
            deployed_at: None,
        };
        self.store.insert_build(&record)?;
        info!(instance, build_id = %record.id, "build registered");
        Ok(record)
    }

    fn transition(
        &self,
        build_id: &str,
        to: BuildStatus,
        apply: impl FnOnce(&mut BuildRecord),
    ) -> Result<BuildRecord> {
        let mut record = self
            .store
            .get_build(build_id)?
            .ok_or_else(|| GraphError::State(format!("unknown build id '{build_id}'")))?;
        if !record.status.can_transition_to(to) {
            return Err(GraphError::State(format!(
                "build {build_id}: {} → {} is not a valid transition",
                record.status.as_str(),
                to.as_str()
            )));
        }
        record.status = to;
        apply(&mut record);
        self.store.update_build(&record)?;
        Ok(record)
    }

    pub fn mark_building(&self, build_id: &str) -> Result<BuildRecord> {
        self.transition(build_id, BuildStatus::Building, |record| {
            record.started_at = Some(now_utc());
        })
    }

    pub fn mark_ready(
        &self,
        build_id: &str,
        output_path: &Path,
        avg_weight: Option<f64>,
    ) -> Result<BuildRecord> {
        let record = self.transition(build_id, BuildStatus::Ready, |record| {
            record.output_path = Some(output_path.display().to_string());
            record.avg_weight = avg_weight;
            record.completed_at = Some(now_utc());
        })?;
        info!(instance = %record.instance_name, build_id, "build ready");
        Ok(record)
    }

    /// Fail a non-terminal build. The stored message is truncated to the
    /// documented bound first; compiler output is captured elsewhere in
    /// full, the registry only keeps the head.
    pub fn mark_failed(&self, build_id: &str, message: &str) -> Result<BuildRecord> {
        let record = self.transition(build_id, BuildStatus::Failed, |record| {
            record.error_message = Some(truncate_message(message));
            record.completed_at = Some(now_utc());
        })?;
        info!(instance = %record.instance_name, build_id, "build failed");
        Ok(record)
    }

    /// Promote a Ready build into service. The previously Deployed record
    /// for the same instance, if any, is superseded to Deprecated.
    pub fn mark_deployed(&self, build_id: &str) -> Result<BuildRecord> {
        let predecessor = {
            let record = self
                .store
                .get_build(build_id)?
                .ok_or_else(|| GraphError::State(format!("unknown build id '{build_id}'")))?;
            self.store
                .latest_for_status(&record.instance_name, BuildStatus::Deployed)?
        };

        let record = self.transition(build_id, BuildStatus::Deployed, |record| {
            record.deployed_at = Some(now_utc());
        })?;

        if let Some(mut old) = predecessor {
            if old.id != record.id {
                old.status = BuildStatus::Deprecated;
                self.store.update_build(&old)?;
            }
        }
        info!(instance = %record.instance_name, build_id, "build deployed");
        Ok(record)
    }

    /// The instance's non-terminal record, if one exists. Terminal
    /// records — Failed included — are never "current".
    pub fn current_build(&self, instance: &str) -> Result<Option<BuildRecord>> {
        self.store.current_for_instance(instance)
    }

    pub fn latest_ready(&self, instance: &str) -> Result<Option<BuildRecord>> {
        self.store.latest_for_status(instance, BuildStatus::Ready)
    }

    pub fn latest_deployed(&self, instance: &str) -> Result<Option<BuildRecord>> {
        self.store.latest_for_status(instance, BuildStatus::Deployed)
    }

    pub fn history(&self, instance: &str, limit: usize) -> Result<Vec<BuildRecord>> {
        self.store.build_history(instance, limit)
    }

    /// Most-recent record per instance, for the status-all surface.
    pub fn overview(&self) -> Result<Vec<BuildRecord>> {
        self.store.latest_per_instance()
    }
}
