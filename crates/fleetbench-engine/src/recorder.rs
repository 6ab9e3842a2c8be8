//! Durable, append-only record of task outcomes.
//!
//! The manifest is the source of truth for what happened in a run. Every
//! append is a read-modify-write of `manifest.json` under both an in-process
//! mutex and an exclusive file lock, so concurrent group workers never
//! interleave writes. Entries are kept in submission order regardless of
//! completion order.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, dispatcher, warn, Span};

use fleetbench_core::TaskOutcome;

use crate::run_dir::MANIFEST_FILE;
use crate::RecorderError;

/// Contents of `manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Run start, RFC 3339.
    pub timestamp: String,
    pub code_hash: String,
    /// Recipe names included in the run.
    pub recipes: Vec<String>,
    pub tasks: Vec<TaskOutcome>,
}

/// Receives every outcome after it has been durably recorded.
///
/// Implementations log their own failures; mirroring never fails a run.
#[async_trait]
pub trait OutcomeMirror: Send + Sync {
    async fn mirror(&self, outcome: &TaskOutcome);
}

/// Appends [`TaskOutcome`]s to a run's manifest.
pub struct ManifestRecorder {
    path: PathBuf,
    write_guard: Arc<Mutex<()>>,
    mirror: Option<Arc<dyn OutcomeMirror>>,
}

impl ManifestRecorder {
    /// Write the manifest header for a new run and return a recorder for it.
    pub fn create(run_dir: &Path, header: Manifest) -> Result<Self, RecorderError> {
        let recorder = Self::open(run_dir);
        recorder.update(|manifest| {
            manifest.timestamp = header.timestamp;
            manifest.code_hash = header.code_hash;
            manifest.recipes = header.recipes;
            for outcome in header.tasks {
                insert_ordered(&mut manifest.tasks, outcome);
            }
            true
        })?;
        Ok(recorder)
    }

    /// Recorder for an existing run directory.
    pub fn open(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join(MANIFEST_FILE),
            write_guard: Arc::new(Mutex::new(())),
            mirror: None,
        }
    }

    /// Forward each newly recorded outcome to `mirror`.
    pub fn with_mirror(mut self, mirror: Arc<dyn OutcomeMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current manifest; empty if nothing has been written yet.
    pub fn load(&self) -> Result<Manifest, RecorderError> {
        if !self.path.exists() {
            return Ok(Manifest::default());
        }
        let file = File::open(&self.path).map_err(|e| RecorderError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| RecorderError::Lock(self.path.clone(), e))?;
        let parsed = read_manifest(&file, &self.path);
        file.unlock()
            .map_err(|e| RecorderError::Lock(self.path.clone(), e))?;
        parsed
    }

    /// Append an outcome.
    ///
    /// Recording the same task twice is a no-op: the first entry wins and
    /// `Ok(false)` is returned. The mirror only sees new entries.
    pub async fn record(&self, outcome: &TaskOutcome) -> Result<bool, RecorderError> {
        let added = self.append(outcome).await?;
        if added {
            debug!(task = %outcome.task_id, status = %outcome.status, "Outcome recorded");
            if let Some(mirror) = &self.mirror {
                mirror.mirror(outcome).await;
            }
        }
        Ok(added)
    }

    /// Runs the locked read-modify-write on the blocking pool, carrying the
    /// caller's span and subscriber along.
    async fn append(&self, outcome: &TaskOutcome) -> Result<bool, RecorderError> {
        let path = self.path.clone();
        let guard = Arc::clone(&self.write_guard);
        let outcome = outcome.clone();
        let span = Span::current();
        let dispatch = dispatcher::get_default(|d| d.clone());

        tokio::task::spawn_blocking(move || {
            dispatcher::with_default(&dispatch, || {
                let _entered = span.enter();
                update_manifest(&path, &guard, |manifest| add_outcome(manifest, outcome))
            })
        })
        .await
        .map_err(|e| RecorderError::Worker(e.to_string()))?
    }

    fn update<F>(&self, f: F) -> Result<bool, RecorderError>
    where
        F: FnOnce(&mut Manifest) -> bool,
    {
        update_manifest(&self.path, &self.write_guard, f)
    }
}

impl std::fmt::Debug for ManifestRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestRecorder")
            .field("path", &self.path)
            .field("mirror", &self.mirror.is_some())
            .finish()
    }
}

/// Insert unless the task is already present; the first entry wins.
fn add_outcome(manifest: &mut Manifest, outcome: TaskOutcome) -> bool {
    if let Some(existing) = manifest
        .tasks
        .iter()
        .find(|t| t.task_id == outcome.task_id)
    {
        if existing.status != outcome.status {
            warn!(
                task = %outcome.task_id,
                recorded = %existing.status,
                ignored = %outcome.status,
                "Task already recorded; keeping first outcome"
            );
        }
        return false;
    }
    insert_ordered(&mut manifest.tasks, outcome);
    true
}

/// Read-modify-write while holding the process mutex and the file lock.
///
/// `f` returns whether anything changed; unchanged manifests are not
/// rewritten. Blocks on the file lock.
fn update_manifest<F>(path: &Path, guard: &Mutex<()>, f: F) -> Result<bool, RecorderError>
where
    F: FnOnce(&mut Manifest) -> bool,
{
    let _guard = guard.lock().map_err(|_| RecorderError::Poisoned)?;
    let io_err = |e| RecorderError::Io(path.to_path_buf(), e);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io_err)?;
    file.lock_exclusive()
        .map_err(|e| RecorderError::Lock(path.to_path_buf(), e))?;

    let result = (|| -> Result<bool, RecorderError> {
        let mut manifest = read_manifest(&file, path)?;
        if !f(&mut manifest) {
            return Ok(false);
        }
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| RecorderError::Parse(path.to_path_buf(), e.to_string()))?;
        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(true)
    })();

    file.unlock()
        .map_err(|e| RecorderError::Lock(path.to_path_buf(), e))?;
    result
}

/// Keep entries sorted by submission index.
fn insert_ordered(tasks: &mut Vec<TaskOutcome>, outcome: TaskOutcome) {
    let pos = tasks.partition_point(|t| t.index <= outcome.index);
    tasks.insert(pos, outcome);
}

fn read_manifest(file: &File, path: &Path) -> Result<Manifest, RecorderError> {
    let len = file
        .metadata()
        .map(|m| m.len())
        .map_err(|e| RecorderError::Io(path.to_path_buf(), e))?;
    if len == 0 {
        return Ok(Manifest::default());
    }
    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|e| RecorderError::Io(path.to_path_buf(), e))?;
    serde_json::from_reader(reader).map_err(|e| RecorderError::Parse(path.to_path_buf(), e.to_string()))
}
