//! JSON records of submitted dispatches for offline inspection.
//!
//! Enabled by `debug.dump_dispatch_dir`. One file per walker, named
//! `q<queue>-<sequence>-<kernel>.json`; the cross-thread payload is stored
//! as a SHA-256 digest so records stay small and diffable across runs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xe_common::ContextId;
use xe_csr::CompletionStamp;

use crate::dispatch_info::{DispatchInfo, DispatchKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub queue_id: u64,
    pub sequence: u64,
    pub kind: String,
    pub kernel: String,
    pub simd_size: u32,
    pub group_size: [u32; 3],
    pub group_count: [u32; 3],
    pub global_offset: [u32; 3],
    pub threads_per_group: u32,
    pub slm_size: u32,
    pub task_count: u32,
    pub task_level: u32,
    pub context_id: ContextId,
    pub cross_thread_sha256: String,
}

impl DispatchRecord {
    #[must_use]
    pub fn new(
        queue_id: u64,
        sequence: u64,
        dispatch: &DispatchInfo,
        stamp: CompletionStamp,
        context_id: ContextId,
    ) -> Self {
        let state = &dispatch.state;
        let kind = match dispatch.kind {
            DispatchKind::Kernel => "kernel",
            DispatchKind::AuxToNonAux => "aux_to_non_aux",
            DispatchKind::NonAuxToAux => "non_aux_to_aux",
        };
        Self {
            queue_id,
            sequence,
            kind: kind.to_string(),
            kernel: state.kernel_name.clone(),
            simd_size: state.simd_size,
            group_size: state.group_size,
            group_count: state.group_count,
            global_offset: state.global_offset,
            threads_per_group: state.threads_per_group,
            slm_size: state.slm_size,
            task_count: stamp.task_count,
            task_level: stamp.task_level,
            context_id,
            cross_thread_sha256: hex_digest(&state.cross_thread_data),
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Replace path separators so kernel names cannot escape the dump directory.
fn sanitize_filename(name: &str) -> String {
    name.replace(['/', '\\', ':'], "_")
}

#[derive(Debug, Clone)]
pub struct DispatchTracer {
    dir: PathBuf,
}

impl DispatchTracer {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `record`; failures are logged once per directory and never
    /// reach the caller.
    pub fn record(&self, record: &DispatchRecord) {
        if let Err(err) = self.write(record) {
            xe_common::warn_once!(
                &format!("dispatch-trace:{}", self.dir.display()),
                "dispatch trace write to {} failed: {err}",
                self.dir.display()
            );
        }
    }

    fn write(&self, record: &DispatchRecord) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let file = self.dir.join(format!(
            "q{}-{:06}-{}.json",
            record.queue_id,
            record.sequence,
            sanitize_filename(&record.kernel)
        ));
        let json = serde_json::to_string_pretty(record).map_err(std::io::Error::other)?;
        fs::write(&file, json)?;
        Ok(file)
    }
}
