//! Persisted registry of VMs created during a run.
//!
//! Every VM is recorded right after the provider accepts the create call and
//! removed once it is deleted, so the `teardown` command can find anything a
//! killed or `--no-teardown` run left behind.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::types::{InstanceHandle, VmConnectionInfo};
use crate::ProvisionError;

/// Registry file name inside a run directory.
pub const INSTANCES_FILE: &str = "instances.json";

/// One live (or possibly leaked) VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub handle: InstanceHandle,
    /// Execution group label.
    pub label: String,
    pub gpu_name: String,
    pub gpu_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
}

impl InstanceRecord {
    pub fn new(
        handle: InstanceHandle,
        label: impl Into<String>,
        gpu_name: impl Into<String>,
        gpu_count: u32,
    ) -> Self {
        Self {
            handle,
            label: label.into(),
            gpu_name: gpu_name.into(),
            gpu_count,
            host: None,
            username: None,
            ssh_port: None,
        }
    }

    /// Connection info, if the VM got far enough to have an address.
    pub fn connection(&self) -> Option<VmConnectionInfo> {
        let host = self.host.clone().filter(|h| !h.is_empty())?;
        Some(VmConnectionInfo {
            host,
            username: self.username.clone().unwrap_or_default(),
            ssh_port: self.ssh_port.unwrap_or(22),
            port_mappings: Vec::new(),
            handle: self.handle.clone(),
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    instances: Vec<InstanceRecord>,
}

/// `{run_dir}/instances.json`, updated under an exclusive file lock.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    path: PathBuf,
}

impl InstanceRegistry {
    /// Registry for a run directory.
    pub fn for_run_dir(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join(INSTANCES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn err(&self, reason: impl std::fmt::Display) -> ProvisionError {
        ProvisionError::Registry {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    /// All recorded instances; empty if the file does not exist.
    pub fn load(&self) -> Result<Vec<InstanceRecord>, ProvisionError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| self.err(e))?;
        file.lock_shared().map_err(|e| self.err(e))?;
        let parsed = read_registry(&file).map_err(|e| self.err(e));
        file.unlock().map_err(|e| self.err(e))?;
        Ok(parsed?.instances)
    }

    /// Record a newly created instance.
    pub fn register(&self, record: InstanceRecord) -> Result<(), ProvisionError> {
        self.update(|reg| {
            reg.instances.retain(|r| r.handle != record.handle);
            reg.instances.push(record);
        })
    }

    /// Attach connection details to an existing record.
    pub fn record_connection(&self, conn: &VmConnectionInfo) -> Result<(), ProvisionError> {
        self.update(|reg| {
            if let Some(rec) = reg.instances.iter_mut().find(|r| r.handle == conn.handle) {
                rec.host = Some(conn.host.clone());
                rec.username = Some(conn.username.clone());
                rec.ssh_port = Some(conn.ssh_port);
            }
        })
    }

    /// Drop a deleted instance. The file is removed once empty.
    pub fn remove(&self, handle: &InstanceHandle) -> Result<(), ProvisionError> {
        if !self.path.exists() {
            return Ok(());
        }
        self.update(|reg| reg.instances.retain(|r| &r.handle != handle))
    }

    /// Read-modify-write while holding an exclusive lock.
    fn update<F>(&self, f: F) -> Result<(), ProvisionError>
    where
        F: FnOnce(&mut RegistryFile),
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.err(e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.err(e))?;
        file.lock_exclusive().map_err(|e| self.err(e))?;

        let result = (|| -> Result<(), ProvisionError> {
            let mut reg = read_registry(&file).map_err(|e| self.err(e))?;
            f(&mut reg);

            if reg.instances.is_empty() {
                std::fs::remove_file(&self.path).map_err(|e| self.err(e))?;
                return Ok(());
            }

            let json = serde_json::to_string_pretty(&reg).map_err(|e| self.err(e))?;
            file.set_len(0).map_err(|e| self.err(e))?;
            file.seek(SeekFrom::Start(0)).map_err(|e| self.err(e))?;
            file.write_all(json.as_bytes()).map_err(|e| self.err(e))?;
            file.write_all(b"\n").map_err(|e| self.err(e))?;
            file.sync_all().map_err(|e| self.err(e))
        })();

        file.unlock().map_err(|e| self.err(e))?;
        result
    }
}

fn read_registry(file: &File) -> Result<RegistryFile, String> {
    let len = file.metadata().map(|m| m.len()).map_err(|e| e.to_string())?;
    if len == 0 {
        return Ok(RegistryFile::default());
    }
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(0)).map_err(|e| e.to_string())?;
    serde_json::from_reader(reader).map_err(|e| e.to_string())
}
