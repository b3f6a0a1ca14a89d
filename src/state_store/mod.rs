use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::eyre::Context;
use color_eyre::Result;
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::jobs::types::JobKind;
use crate::utils::settings::Settings;

/// The only state the pipeline persists: watermarks and per-kind last-run
/// timestamps, so scheduling decisions survive a restart without scanning
/// artifacts. Jobs, samples and events are rebuilt from the node and the
/// broker.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    /// Highest epoch for which a historic snapshot has been durably
    /// completed (validated + uploaded)
    pub historic_watermark: u64,
    /// Highest epoch for which chain state has been computed
    pub compute_watermark: u64,
    /// Last successful completion per job kind
    pub last_run: HashMap<JobKind, DateTime<Utc>>,
}

#[automock]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<PersistedState>;
    async fn save(&self, state: &PersistedState) -> Result<()>;
}

/// JSON document on the snapshot volume, written atomically
/// (write-tmp-then-rename) so a crash mid-save never truncates the state.
pub struct JsonFileStore {
    path: PathBuf,
    // serializes concurrent saves so renames cannot interleave
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, write_lock: Mutex::new(()) }
    }

    pub fn new_with_settings(settings: &impl Settings) -> Self {
        Self::new(PathBuf::from(settings.get_settings_or_panic("SCHEDULER_STATE_PATH")))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<PersistedState> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .wrap_err_with(|| format!("corrupt scheduler state at {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(e).wrap_err_with(|| format!("failed to read {}", self.path.display())),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
