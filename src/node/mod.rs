use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mockall::automock;
use thiserror::Error;

pub mod forest;

#[derive(Error, Debug)]
pub enum NodeError {
    /// Transient: the node RPC endpoint could not be reached or answered
    /// with garbage. Callers retry with backoff.
    #[error("Node unavailable: {0}")]
    Unavailable(String),

    /// The node reported an error mid-export. The partial output file must
    /// be discarded before retry.
    #[error("Export failed: {0}")]
    ExportFailed(String),

    /// The archive toolchain could not inspect a produced file.
    #[error("Archive inspection failed: {0}")]
    InspectionFailed(String),
}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        NodeError::Unavailable(e.to_string())
    }
}

/// What the archive toolchain reports about a produced snapshot file,
/// independently of the builder that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// Epoch the snapshot is anchored at
    pub epoch: u64,
    /// State root at that epoch, when the tool reports one
    pub state_root: Option<String>,
    /// Remaining `key: value` fields, kept verbatim for the metadata sidecar
    pub fields: HashMap<String, String>,
}

/// The archive node as the pipeline sees it: an opaque process exposing
/// height, sync status, a data directory, and export/inspection commands.
#[automock]
#[async_trait]
pub trait ArchiveNode: Send + Sync {
    /// Current chain head height.
    async fn current_height(&self) -> Result<u64, NodeError>;

    /// Whether the node considers itself caught up with the chain.
    async fn is_synced(&self) -> Result<bool, NodeError>;

    /// Timestamp of the genesis block, used to derive dates from epochs.
    async fn genesis_timestamp(&self) -> Result<i64, NodeError>;

    /// The node's view of the state root at `height`. `None` when the node
    /// cannot serve that height (still syncing, pruned, or unreachable at
    /// that depth) — validation then falls back to artifact-only checks.
    async fn state_root_at(&self, height: u64) -> Result<Option<String>, NodeError>;

    /// Materialize chain state for `n_epochs` starting at `start_epoch`.
    async fn compute_state(&self, start_epoch: u64, n_epochs: u64) -> Result<(), NodeError>;

    /// Export a snapshot covering `[start_epoch, end_epoch]` to `out_path`.
    async fn export_snapshot(
        &self,
        start_epoch: u64,
        end_epoch: u64,
        format: &str,
        out_path: &Path,
    ) -> Result<(), NodeError>;

    /// Inspect a snapshot file on disk without consulting the chain.
    async fn inspect_archive(&self, path: &Path) -> Result<ArchiveInfo, NodeError>;

    /// The node's data directory on the snapshot volume.
    fn data_dir(&self) -> PathBuf;
}
