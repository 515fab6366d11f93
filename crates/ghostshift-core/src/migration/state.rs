//! Migration run records.
//!
//! Every migration run is recorded with the progress of its steps, so a failed or
//! cancelled run can be inspected and the artifacts it left behind identified.

use super::error::MigrationError;
use super::plan::Plan;
use crate::error::Error;
use crate::util::current_timestamp;
use rkyv::{Archive, Deserialize, Serialize};

/// State of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Run created but not started.
    Pending,
    /// Ghost tables, sequences and foreign keys are being created.
    Expanding,
    /// Plan steps are being executed.
    Backfilling,
    /// Indexes and backward syncs are being installed.
    Synchronizing,
    /// Run completed successfully.
    Complete,
    /// Run failed.
    Failed,
    /// Run was cancelled between batches.
    Cancelled,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Expanding => write!(f, "expanding"),
            MigrationStatus::Backfilling => write!(f, "backfilling"),
            MigrationStatus::Synchronizing => write!(f, "synchronizing"),
            MigrationStatus::Complete => write!(f, "complete"),
            MigrationStatus::Failed => write!(f, "failed"),
            MigrationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum StepStatus {
    /// Step not yet started.
    Pending,
    /// Step in progress.
    InProgress,
    /// Step completed successfully.
    Complete,
    /// Step failed.
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Complete => write!(f, "complete"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of a single plan step.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct StepProgress {
    /// Position of the step in the plan.
    pub step_index: usize,
    /// Rendered operation, e.g. `COPY [table_abc] [id, name]`.
    pub operation: String,
    pub status: StepStatus,
    /// When the step started (microseconds since epoch).
    pub started_at: Option<u64>,
    /// When the step completed (microseconds since epoch).
    pub completed_at: Option<u64>,
    /// Migrator batches executed.
    pub batches: u64,
    /// Cursor of the last completed batch.
    pub last_cursor: Option<String>,
    pub error: Option<String>,
}

impl StepProgress {
    pub fn new(step_index: usize, operation: impl Into<String>) -> Self {
        Self {
            step_index,
            operation: operation.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            batches: 0,
            last_cursor: None,
            error: None,
        }
    }

    /// Mark the step as started.
    pub fn start(&mut self) {
        self.status = StepStatus::InProgress;
        self.started_at = Some(current_timestamp());
    }

    /// Mark the step as completed.
    pub fn complete(&mut self) {
        self.status = StepStatus::Complete;
        self.completed_at = Some(current_timestamp());
    }

    /// Mark the step as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(current_timestamp());
        self.error = Some(error.into());
    }

    /// Record a completed batch.
    pub fn record_batch(&mut self, cursor: impl Into<String>) {
        self.batches += 1;
        self.last_cursor = Some(cursor.into());
    }
}

/// Persistent record of one migration run.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct MigrationRun {
    pub run_id: [u8; 16],
    pub from_version: String,
    pub to_version: String,
    pub status: MigrationStatus,
    /// When the run started (microseconds since epoch).
    pub started_at: Option<u64>,
    /// When the run ended (microseconds since epoch).
    pub completed_at: Option<u64>,
    pub error: Option<String>,
    /// Physical names of the ghost tables created by the run.
    pub ghost_tables: Vec<String>,
    pub steps: Vec<StepProgress>,
}

impl MigrationRun {
    /// Create a pending run with one progress entry per plan step.
    pub fn new(plan: &Plan) -> Self {
        let steps = plan
            .steps()
            .enumerate()
            .map(|(i, (_, step))| StepProgress::new(i, step.operation().to_string()))
            .collect();

        Self {
            run_id: rand::random(),
            from_version: plan.from.to_string(),
            to_version: plan.to.to_string(),
            status: MigrationStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            ghost_tables: plan.ghost_tables().iter().cloned().collect(),
            steps,
        }
    }

    /// Hex form of the run id.
    pub fn id_hex(&self) -> String {
        hex::encode(self.run_id)
    }

    /// Start the run.
    pub fn start(&mut self) {
        self.status = MigrationStatus::Expanding;
        self.started_at = Some(current_timestamp());
    }

    pub fn set_status(&mut self, status: MigrationStatus) {
        self.status = status;
    }

    /// Mark the run as complete.
    pub fn complete(&mut self) {
        self.status = MigrationStatus::Complete;
        self.completed_at = Some(current_timestamp());
    }

    /// Mark the run as failed, or cancelled when `error` says so.
    pub fn fail(&mut self, error: &MigrationError) {
        self.status = if error.is_cancelled() {
            MigrationStatus::Cancelled
        } else {
            MigrationStatus::Failed
        };
        self.completed_at = Some(current_timestamp());
        self.error = Some(error.to_string());
    }

    /// Progress of the step at a 1-based plan position.
    pub fn step_mut(&mut self, position: usize) -> Option<&mut StepProgress> {
        position.checked_sub(1).and_then(|i| self.steps.get_mut(i))
    }

    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            MigrationStatus::Complete | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }

    /// Serialize the run to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a run from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Store for migration run records.
pub struct RunStore {
    tree: sled::Tree,
}

impl RunStore {
    /// Tree name for run records.
    pub const TREE_NAME: &'static str = "migration:runs";

    const KEY_PREFIX: &'static [u8] = b"run:";

    /// Open or create the run store.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME).map_err(Error::from)?;
        Ok(Self { tree })
    }

    /// Save a run record.
    pub fn save(&self, run: &MigrationRun) -> Result<(), MigrationError> {
        self.tree
            .insert(Self::key(&run.run_id), run.to_bytes()?)
            .map_err(Error::from)?;
        self.tree.flush().map_err(Error::from)?;
        Ok(())
    }

    /// Load a run record.
    pub fn load(&self, run_id: &[u8; 16]) -> Result<Option<MigrationRun>, MigrationError> {
        match self.tree.get(Self::key(run_id)).map_err(Error::from)? {
            Some(bytes) => Ok(Some(MigrationRun::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load a run record by its hex id.
    pub fn load_hex(&self, run_id: &str) -> Result<Option<MigrationRun>, MigrationError> {
        let bytes = hex::decode(run_id)
            .map_err(|e| Error::InvalidArgument(format!("invalid run id {}: {}", run_id, e)))?;
        let id: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::InvalidArgument(format!("invalid run id {}: expected 16 bytes", run_id)))?;
        self.load(&id)
    }

    /// Delete a run record.
    pub fn delete(&self, run_id: &[u8; 16]) -> Result<(), MigrationError> {
        self.tree.remove(Self::key(run_id)).map_err(Error::from)?;
        Ok(())
    }

    /// All run records, oldest first.
    pub fn list(&self) -> Result<Vec<MigrationRun>, MigrationError> {
        let mut runs = Vec::new();
        for result in self.tree.scan_prefix(Self::KEY_PREFIX) {
            let (_, value) = result.map_err(Error::from)?;
            runs.push(MigrationRun::from_bytes(&value)?);
        }
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    fn key(id: &[u8; 16]) -> Vec<u8> {
        let mut key = Vec::with_capacity(Self::KEY_PREFIX.len() + 16);
        key.extend_from_slice(Self::KEY_PREFIX);
        key.extend_from_slice(id);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versioning::VersionId;

    fn create_run() -> MigrationRun {
        MigrationRun::new(&Plan::new(VersionId::from("v1"), VersionId::from("v2")))
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = create_run();
        assert_eq!(run.status, MigrationStatus::Pending);
        assert!(!run.is_terminal());

        run.start();
        assert_eq!(run.status, MigrationStatus::Expanding);
        assert!(run.started_at.is_some());

        run.set_status(MigrationStatus::Backfilling);
        run.set_status(MigrationStatus::Synchronizing);
        run.complete();
        assert_eq!(run.status, MigrationStatus::Complete);
        assert!(run.is_terminal());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_run_failure_and_cancellation() {
        let mut run = create_run();
        run.start();
        run.fail(&MigrationError::planning("stuck"));
        assert_eq!(run.status, MigrationStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("planning failed: stuck"));

        let mut run = create_run();
        run.start();
        run.fail(&MigrationError::Cancelled {
            table: "table_abc".to_string(),
            cursor: "(10)".to_string(),
        });
        assert_eq!(run.status, MigrationStatus::Cancelled);
        assert!(run.is_terminal());
    }

    #[test]
    fn test_step_progress() {
        let mut step = StepProgress::new(0, "COPY [table_abc] [id]");
        assert_eq!(step.status, StepStatus::Pending);

        step.start();
        assert_eq!(step.status, StepStatus::InProgress);
        step.record_batch("(100)");
        step.record_batch("(200)");
        assert_eq!(step.batches, 2);
        assert_eq!(step.last_cursor.as_deref(), Some("(200)"));

        step.complete();
        assert_eq!(step.status, StepStatus::Complete);
        assert!(step.completed_at.is_some());

        let mut failed = StepProgress::new(1, "DROP_NULL [table_abc]");
        failed.fail("relation does not exist");
        assert_eq!(failed.status, StepStatus::Failed);
    }

    #[test]
    fn test_run_serialization() {
        let mut run = create_run();
        run.start();
        run.steps.push(StepProgress::new(0, "ADD_NULL [table_abc]"));

        let restored = MigrationRun::from_bytes(&run.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.run_id, run.run_id);
        assert_eq!(restored.from_version, "v1");
        assert_eq!(restored.status, MigrationStatus::Expanding);
        assert_eq!(restored.steps[0].operation, "ADD_NULL [table_abc]");
        assert!(run.step_mut(1).is_some());
        assert!(run.step_mut(0).is_none());
    }

    #[test]
    fn test_run_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = sled::open(temp_dir.path()).unwrap();
        let store = RunStore::open(&db).unwrap();

        let mut run = create_run();
        run.start();
        store.save(&run).unwrap();

        let loaded = store.load(&run.run_id).unwrap().unwrap();
        assert_eq!(loaded.status, MigrationStatus::Expanding);
        let by_hex = store.load_hex(&run.id_hex()).unwrap().unwrap();
        assert_eq!(by_hex.run_id, run.run_id);
        assert!(store.load_hex("zz").is_err());

        assert_eq!(store.list().unwrap().len(), 1);
        store.delete(&run.run_id).unwrap();
        assert!(store.load(&run.run_id).unwrap().is_none());
    }
}
