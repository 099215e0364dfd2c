//! In-memory repository implementations backed by `dashmap`.
//!
//! Used by tests and by single-process deployments that do not need
//! durability across restarts. Every mutation of a registry entry happens
//! under the entry's shard lock, so conditional transitions (claims,
//! finishing) are atomic just like the single-statement SQL updates of the
//! SQLite backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use stepwise_types::error::RepositoryError;
use stepwise_types::job::{
    Checkpoint, EligibilityVerdict, RecoverableTask, RecoverableTaskStub, TaskRegistration,
    TaskState,
};
use uuid::Uuid;

use super::artifact::ArtifactRepository;
use super::registry::{eligibility_of, CheckpointStore, TaskRegistry};

// ---------------------------------------------------------------------------
// Task registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RegistryEntry {
    stub: RecoverableTaskStub,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    resolution: Option<String>,
    claimed_by: Option<String>,
    recovery_attempts: u32,
}

/// Task registry and checkpoint store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTaskRegistry {
    entries: DashMap<Uuid, RegistryEntry>,
    by_task: DashMap<String, Uuid>,
    checkpoints: DashMap<String, Vec<Checkpoint>>,
    denied: DashMap<Uuid, String>,
    offline: AtomicBool,
    discovery_broken: AtomicBool,
}

impl InMemoryTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pre-built entry (e.g. one left behind by a crashed process).
    pub fn insert(&self, stub: RecoverableTaskStub, args: Vec<Value>, kwargs: Map<String, Value>) {
        self.by_task.insert(stub.task_id.clone(), stub.registry_id);
        self.entries.insert(
            stub.registry_id,
            RegistryEntry {
                stub,
                args,
                kwargs,
                resolution: None,
                claimed_by: None,
                recovery_attempts: 0,
            },
        );
    }

    /// Simulate an unreachable backend: every `ping` fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make `discover_recoverable` fail.
    pub fn set_discovery_broken(&self, broken: bool) {
        self.discovery_broken.store(broken, Ordering::SeqCst);
    }

    /// Force an ineligible verdict for an entry.
    pub fn deny_recovery(&self, registry_id: Uuid, reason: impl Into<String>) {
        self.denied.insert(registry_id, reason.into());
    }

    pub fn state_of(&self, registry_id: Uuid) -> Option<TaskState> {
        self.entries.get(&registry_id).map(|e| e.stub.current_state)
    }

    pub fn state_of_task(&self, task_id: &str) -> Option<TaskState> {
        let id = *self.by_task.get(task_id)?;
        self.state_of(id)
    }

    pub fn resolution_of(&self, registry_id: Uuid) -> Option<String> {
        self.entries
            .get(&registry_id)
            .and_then(|e| e.resolution.clone())
    }

    pub fn stub_of_task(&self, task_id: &str) -> Option<RecoverableTaskStub> {
        let id = *self.by_task.get(task_id)?;
        self.entries.get(&id).map(|e| e.stub.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TaskRegistry for InMemoryTaskRegistry {
    async fn ping(&self) -> Result<(), RepositoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        Ok(())
    }

    async fn register(&self, registration: &TaskRegistration) -> Result<Uuid, RepositoryError> {
        if self.by_task.contains_key(&registration.task_id) {
            return Err(RepositoryError::Conflict(format!(
                "task '{}' is already registered",
                registration.task_id
            )));
        }
        let stub = RecoverableTaskStub {
            registry_id: Uuid::now_v7(),
            task_id: registration.task_id.clone(),
            task_name: registration.task_name.clone(),
            job_key: registration.job_key.clone(),
            owner_id: registration.owner_id.clone(),
            current_state: TaskState::Running,
            last_heartbeat: Utc::now(),
            recovery_priority: registration.recovery_priority,
            progress_percent: 0,
            current_step: None,
        };
        let id = stub.registry_id;
        self.insert(stub, registration.args.clone(), registration.kwargs.clone());
        Ok(id)
    }

    async fn discover_recoverable(
        &self,
        stale_after: Duration,
    ) -> Result<Vec<RecoverableTaskStub>, RepositoryError> {
        if self.discovery_broken.load(Ordering::SeqCst) {
            return Err(RepositoryError::Query("discovery query failed".to_string()));
        }
        let age = chrono::Duration::from_std(stale_after)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let cutoff = Utc::now() - age;
        let mut found: Vec<RecoverableTaskStub> = self
            .entries
            .iter()
            .filter(|e| e.stub.current_state.is_discoverable() && e.stub.last_heartbeat <= cutoff)
            .map(|e| e.stub.clone())
            .collect();
        found.sort_by_key(|s| s.last_heartbeat);
        Ok(found)
    }

    async fn get_full_task(
        &self,
        registry_id: Uuid,
    ) -> Result<Option<RecoverableTask>, RepositoryError> {
        Ok(self.entries.get(&registry_id).map(|e| RecoverableTask {
            stub: e.stub.clone(),
            args: e.args.clone(),
            kwargs: e.kwargs.clone(),
        }))
    }

    async fn update_state(
        &self,
        registry_id: Uuid,
        state: TaskState,
        resolution: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut entry = self
            .entries
            .get_mut(&registry_id)
            .ok_or(RepositoryError::NotFound)?;
        entry.stub.current_state = state;
        if let Some(resolution) = resolution {
            entry.resolution = Some(resolution.to_string());
        }
        Ok(())
    }

    async fn heartbeat(
        &self,
        task_id: &str,
        progress_percent: u8,
        current_step: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let id = *self.by_task.get(task_id).ok_or(RepositoryError::NotFound)?;
        let mut entry = self.entries.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        entry.stub.last_heartbeat = Utc::now();
        entry.stub.progress_percent = progress_percent.min(100);
        if let Some(step) = current_step {
            entry.stub.current_step = Some(step.to_string());
        }
        Ok(())
    }

    async fn finish(&self, task_id: &str, state: TaskState) -> Result<(), RepositoryError> {
        let id = *self.by_task.get(task_id).ok_or(RepositoryError::NotFound)?;
        let mut entry = self.entries.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if !entry.stub.current_state.is_terminal() {
            entry.stub.current_state = state;
            entry.stub.last_heartbeat = Utc::now();
        }
        Ok(())
    }

    async fn claim_for_recovery(
        &self,
        registry_id: Uuid,
        claimant: &str,
    ) -> Result<bool, RepositoryError> {
        let Some(mut entry) = self.entries.get_mut(&registry_id) else {
            return Ok(false);
        };
        if !entry.stub.current_state.is_discoverable() {
            return Ok(false);
        }
        entry.stub.current_state = TaskState::Recovering;
        entry.claimed_by = Some(claimant.to_string());
        entry.recovery_attempts += 1;
        Ok(true)
    }

    async fn resolve_claim(
        &self,
        registry_id: Uuid,
        claimant: &str,
        state: TaskState,
        resolution: &str,
    ) -> Result<bool, RepositoryError> {
        let Some(mut entry) = self.entries.get_mut(&registry_id) else {
            return Ok(false);
        };
        if entry.stub.current_state != TaskState::Recovering
            || entry.claimed_by.as_deref() != Some(claimant)
        {
            return Ok(false);
        }
        entry.stub.current_state = state;
        entry.resolution = Some(resolution.to_string());
        Ok(true)
    }

    async fn validate_recovery_eligibility(
        &self,
        registry_id: Uuid,
    ) -> Result<EligibilityVerdict, RepositoryError> {
        if let Some(reason) = self.denied.get(&registry_id) {
            return Ok(EligibilityVerdict::ineligible(reason.value().clone()));
        }
        let Some(entry) = self.entries.get(&registry_id) else {
            return Ok(EligibilityVerdict::ineligible("task not found"));
        };
        Ok(eligibility_of(
            entry.stub.current_state,
            &entry.stub.task_name,
            entry.recovery_attempts,
            entry.claimed_by.as_deref(),
        ))
    }
}

impl CheckpointStore for InMemoryTaskRegistry {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.checkpoints
            .entry(checkpoint.job_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn get_latest_checkpoint(
        &self,
        job_id: &str,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.checkpoints.get(job_id).and_then(|list| {
            list.iter()
                .filter(|cp| cp.is_valid())
                .max_by_key(|cp| cp.created_at)
                .cloned()
        }))
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Artifact repository kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryArtifactRepository {
    results: DashMap<String, Value>,
    stages: DashMap<String, Vec<String>>,
    offline: AtomicBool,
}

impl InMemoryArtifactRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make lookups fail with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), RepositoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        Ok(())
    }
}

impl ArtifactRepository for InMemoryArtifactRepository {
    async fn find_terminal_result(&self, job_key: &str) -> Result<Option<Value>, RepositoryError> {
        self.check_online()?;
        Ok(self.results.get(job_key).map(|v| v.value().clone()))
    }

    async fn completed_stages(&self, job_key: &str) -> Result<Vec<String>, RepositoryError> {
        self.check_online()?;
        Ok(self
            .stages
            .get(job_key)
            .map(|s| s.value().clone())
            .unwrap_or_default())
    }

    async fn record_terminal_result(
        &self,
        job_key: &str,
        result: &Value,
    ) -> Result<(), RepositoryError> {
        self.results.insert(job_key.to_string(), result.clone());
        Ok(())
    }

    async fn record_stage(&self, job_key: &str, stage: &str) -> Result<(), RepositoryError> {
        let mut stages = self.stages.entry(job_key.to_string()).or_default();
        if !stages.iter().any(|s| s == stage) {
            stages.push(stage.to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::registry::MAX_RECOVERY_ATTEMPTS;
    use serde_json::json;
    use std::sync::Arc;

    fn registration(task_id: &str) -> TaskRegistration {
        TaskRegistration {
            task_id: task_id.to_string(),
            task_name: "analyze_document".to_string(),
            job_key: Some(format!("key-{task_id}")),
            owner_id: None,
            recovery_priority: 1,
            args: vec![json!("doc")],
            kwargs: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_register_heartbeat_finish() {
        let registry = InMemoryTaskRegistry::new();
        let id = registry.register(&registration("exec-1")).await.unwrap();
        registry.heartbeat("exec-1", 40, Some("ocr")).await.unwrap();

        let task = registry.get_full_task(id).await.unwrap().unwrap();
        assert_eq!(task.stub.progress_percent, 40);
        assert_eq!(task.stub.current_step.as_deref(), Some("ocr"));
        assert_eq!(task.args, vec![json!("doc")]);

        registry.finish("exec-1", TaskState::Completed).await.unwrap();
        assert_eq!(registry.state_of(id), Some(TaskState::Completed));

        // terminal entries are not reopened
        registry.finish("exec-1", TaskState::Failed).await.unwrap();
        assert_eq!(registry.state_of(id), Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let registry = InMemoryTaskRegistry::new();
        registry.register(&registration("exec-1")).await.unwrap();
        assert!(matches!(
            registry.register(&registration("exec-1")).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_respects_staleness_and_state() {
        let registry = InMemoryTaskRegistry::new();
        let fresh = registry.register(&registration("fresh")).await.unwrap();
        let done = registry.register(&registration("done")).await.unwrap();
        registry.finish("done", TaskState::Completed).await.unwrap();

        let found = registry.discover_recoverable(Duration::ZERO).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|s| s.registry_id).collect();
        assert_eq!(ids, vec![fresh]);
        assert!(!ids.contains(&done));

        let found = registry
            .discover_recoverable(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let id = registry.register(&registration("exec-1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .claim_for_recovery(id, &format!("node-{i}"))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.state_of(id), Some(TaskState::Recovering));
    }

    #[tokio::test]
    async fn test_eligibility_rules() {
        let registry = InMemoryTaskRegistry::new();
        let id = registry.register(&registration("exec-1")).await.unwrap();
        assert!(registry.validate_recovery_eligibility(id).await.unwrap().valid);

        registry.claim_for_recovery(id, "node-a").await.unwrap();
        let verdict = registry.validate_recovery_eligibility(id).await.unwrap();
        assert!(!verdict.valid);
        assert!(verdict.reason.unwrap().contains("node-a"));

        let missing = registry
            .validate_recovery_eligibility(Uuid::now_v7())
            .await
            .unwrap();
        assert!(!missing.valid);

        let other = registry.register(&registration("exec-2")).await.unwrap();
        registry.deny_recovery(other, "owner deleted");
        let denied = registry.validate_recovery_eligibility(other).await.unwrap();
        assert_eq!(denied.reason.as_deref(), Some("owner deleted"));
    }

    #[test]
    fn test_attempt_limit() {
        let verdict = eligibility_of(TaskState::Stale, "analyze", MAX_RECOVERY_ATTEMPTS, None);
        assert!(!verdict.valid);
        assert!(eligibility_of(TaskState::Stale, "analyze", 0, None).valid);
        assert!(!eligibility_of(TaskState::Running, "", 0, None).valid);
    }

    #[tokio::test]
    async fn test_resolve_claim_only_for_claimant() {
        let registry = InMemoryTaskRegistry::new();
        let id = registry.register(&registration("exec-1")).await.unwrap();
        assert!(registry.claim_for_recovery(id, "node-a").await.unwrap());

        assert!(!registry
            .resolve_claim(id, "node-b", TaskState::Failed, "recovery_failed: other")
            .await
            .unwrap());
        assert_eq!(registry.state_of(id), Some(TaskState::Recovering));

        assert!(registry
            .resolve_claim(id, "node-a", TaskState::Completed, "validated_result")
            .await
            .unwrap());
        assert_eq!(registry.state_of(id), Some(TaskState::Completed));
        assert_eq!(registry.resolution_of(id).as_deref(), Some("validated_result"));
        assert!(!registry
            .resolve_claim(Uuid::now_v7(), "node-a", TaskState::Failed, "x")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_latest_checkpoint_wins() {
        let registry = InMemoryTaskRegistry::new();
        let base = Utc::now();
        for (i, name) in ["text_extracted", "entities_found"].iter().enumerate() {
            registry
                .save_checkpoint(&Checkpoint {
                    job_id: "exec-1".to_string(),
                    name: name.to_string(),
                    progress_percent: 20 * (i as u8 + 1),
                    recoverable_data: json!({ "step": name }),
                    db_state: Value::Null,
                    file_state: Value::Null,
                    created_at: base + chrono::Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }
        let latest = registry.get_latest_checkpoint("exec-1").await.unwrap().unwrap();
        assert_eq!(latest.name, "entities_found");
        assert!(registry.get_latest_checkpoint("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_checkpoint_skips_invalid() {
        let registry = InMemoryTaskRegistry::new();
        let base = Utc::now();
        let checkpoint = |name: &str, data: Value, offset: i64| Checkpoint {
            job_id: "exec-1".to_string(),
            name: name.to_string(),
            progress_percent: 40,
            recoverable_data: data,
            db_state: Value::Null,
            file_state: Value::Null,
            created_at: base + chrono::Duration::seconds(offset),
        };
        registry.save_checkpoint(&checkpoint("text_extracted", json!({ "text": "t" }), 0)).await.unwrap();
        registry.save_checkpoint(&checkpoint("", json!({ "text": "t" }), 1)).await.unwrap();
        registry.save_checkpoint(&checkpoint("entities_found", Value::Null, 2)).await.unwrap();

        let latest = registry.get_latest_checkpoint("exec-1").await.unwrap().unwrap();
        assert_eq!(latest.name, "text_extracted");

        registry.checkpoints.get_mut("exec-1").unwrap().remove(0);
        assert!(registry.get_latest_checkpoint("exec-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_artifacts() {
        let artifacts = InMemoryArtifactRepository::new();
        assert!(artifacts.find_terminal_result("k").await.unwrap().is_none());

        artifacts.record_stage("k", "ocr").await.unwrap();
        artifacts.record_stage("k", "ocr").await.unwrap();
        artifacts.record_stage("k", "embeddings").await.unwrap();
        assert_eq!(artifacts.completed_stages("k").await.unwrap(), vec!["ocr", "embeddings"]);

        artifacts.record_terminal_result("k", &json!({"score": 7})).await.unwrap();
        assert_eq!(
            artifacts.find_terminal_result("k").await.unwrap(),
            Some(json!({"score": 7}))
        );
    }
}
