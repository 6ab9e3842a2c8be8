//! Run directory creation and code identity.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};

use fleetbench_core::RunId;

use crate::EngineError;

/// Outcome log inside a run directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Run log inside a run directory.
pub const RUN_LOG_FILE: &str = "benchmark.log";

/// Give up on suffixes after this many collisions.
const MAX_SUFFIX: u32 = 1000;

/// A created run directory and the identity it was derived from.
#[derive(Debug, Clone)]
pub struct RunDir {
    pub path: PathBuf,
    pub run_id: RunId,
    pub started_at: DateTime<Local>,
    /// Full SHA-256 hex digest of the running binary.
    pub code_hash: String,
}

impl RunDir {
    /// Create `{base}/{timestamp}_{hash8}`, hashing the running executable.
    pub fn create(base: &Path) -> Result<Self, EngineError> {
        let code_hash = current_code_hash().map_err(|source| EngineError::RunDir {
            path: base.to_path_buf(),
            source,
        })?;
        Self::create_with(base, Local::now(), code_hash)
    }

    /// Create a run directory with an explicit start time and code hash.
    ///
    /// The leaf is created with a non-recursive `create_dir`; if it already
    /// exists, `-1`, `-2`, ... is appended until creation succeeds, so two
    /// runs never share a directory.
    pub fn create_with(
        base: &Path,
        started_at: DateTime<Local>,
        code_hash: String,
    ) -> Result<Self, EngineError> {
        let err = |source| EngineError::RunDir {
            path: base.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(base).map_err(err)?;

        let base_id = RunId::from_parts(started_at, &code_hash);
        let mut suffix = 0u32;
        loop {
            let run_id = if suffix == 0 {
                base_id.clone()
            } else {
                RunId::new(format!("{}-{}", base_id, suffix))
            };
            let path = base.join(run_id.as_str());
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    return Ok(Self {
                        path,
                        run_id,
                        started_at,
                        code_hash,
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && suffix < MAX_SUFFIX => {
                    suffix += 1;
                }
                Err(e) => return Err(err(e)),
            }
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(RUN_LOG_FILE)
    }
}

/// SHA-256 of the running executable.
pub fn current_code_hash() -> std::io::Result<String> {
    let exe = std::env::current_exe()?;
    file_hash(&exe)
}

/// Hex SHA-256 digest of a file's contents.
pub fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
