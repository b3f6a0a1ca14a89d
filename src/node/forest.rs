use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use url::Url;

use crate::node::{ArchiveInfo, ArchiveNode, NodeError};
use crate::utils::settings::Settings;

/// Sync stage the node reports once it has caught up with the chain head.
const SYNC_STAGE_COMPLETE: &str = "complete";

/// Archive node client for a Forest-style chain daemon: chain queries over
/// JSON-RPC, exports and archive inspection through the node toolchain
/// binaries. The toolchain does the heavy lifting; this client only
/// supervises it.
pub struct ForestNode {
    rpc_url: Url,
    http: reqwest::Client,
    cli_path: PathBuf,
    tool_path: PathBuf,
    data_dir: PathBuf,
    /// `token:/ip4/<host>/tcp/<port>/http` connection string handed to the
    /// toolchain binaries
    api_info: String,
}

impl ForestNode {
    pub fn new_with_settings(settings: &impl Settings) -> color_eyre::Result<Self> {
        let rpc_url = Url::parse(&settings.get_settings_or_panic("NODE_RPC_URL"))?;
        Ok(Self {
            rpc_url,
            http: reqwest::Client::new(),
            cli_path: PathBuf::from(settings.get_settings_or_default("NODE_CLI_PATH", "/usr/local/bin/forest-cli")),
            tool_path: PathBuf::from(settings.get_settings_or_default("NODE_TOOL_PATH", "/usr/local/bin/forest-tool")),
            data_dir: PathBuf::from(settings.get_settings_or_panic("NODE_DATA_DIR")),
            api_info: settings.get_settings_or_default("NODE_API_INFO", ""),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
        let response: Value = self.http.post(self.rpc_url.clone()).json(&body).send().await?.json().await?;
        if let Some(error) = response.get("error") {
            return Err(NodeError::Unavailable(format!("{} returned error: {}", method, error)));
        }
        response.get("result").cloned().ok_or_else(|| NodeError::Unavailable(format!("{}: empty result", method)))
    }

    async fn run_tool(&self, binary: &Path, args: &[String]) -> Result<String, NodeError> {
        let output = Command::new(binary)
            .args(args)
            .env("FULLNODE_API_INFO", &self.api_info)
            .env("RUST_LOG", "info")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NodeError::Unavailable(format!("failed to spawn {}: {}", binary.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NodeError::ExportFailed(format!(
                "{} exited with {}: {}",
                binary.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Folds `key: value` toolchain output into a map. Continuation lines
/// (no colon) append to the previous key, matching the multiline values the
/// archive inspector prints.
fn parse_key_value_output(raw: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut current_key: Option<String> = None;
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            fields.insert(key.clone(), value.trim().to_string());
            current_key = Some(key);
        } else if let Some(key) = &current_key {
            let entry: &mut String = fields.entry(key.clone()).or_default();
            if !entry.is_empty() {
                entry.push('\n');
            }
            entry.push_str(line.trim());
        }
    }
    fields
}

#[async_trait]
impl ArchiveNode for ForestNode {
    async fn current_height(&self) -> Result<u64, NodeError> {
        let head = self.rpc("Filecoin.ChainHead", json!([])).await?;
        head.get("Height")
            .and_then(Value::as_u64)
            .ok_or_else(|| NodeError::Unavailable("ChainHead response missing Height".to_string()))
    }

    async fn is_synced(&self) -> Result<bool, NodeError> {
        let state = self.rpc("Filecoin.SyncState", json!([])).await?;
        let Some(active) = state.get("ActiveSyncs").and_then(Value::as_array) else {
            return Ok(false);
        };
        Ok(active.iter().any(|sync| {
            sync.get("Stage").and_then(Value::as_str).map(|s| s.eq_ignore_ascii_case(SYNC_STAGE_COMPLETE))
                == Some(true)
        }))
    }

    async fn genesis_timestamp(&self) -> Result<i64, NodeError> {
        let genesis = self.rpc("Filecoin.ChainGetGenesis", json!([])).await?;
        genesis
            .pointer("/Blocks/0/Timestamp")
            .and_then(Value::as_i64)
            .ok_or_else(|| NodeError::Unavailable("genesis response missing timestamp".to_string()))
    }

    async fn state_root_at(&self, height: u64) -> Result<Option<String>, NodeError> {
        // A node that cannot serve the height is not a hard failure here;
        // the validator degrades to artifact-only checks.
        match self.rpc("Filecoin.ChainGetTipSetByHeight", json!([height, null])).await {
            Ok(tipset) => {
                // CID fields serialize as {"/": "bafy..."}; "~1" is the
                // JSON-pointer escape for "/".
                Ok(tipset.pointer("/Blocks/0/ParentStateRoot/~1").and_then(Value::as_str).map(str::to_string))
            }
            Err(NodeError::Unavailable(reason)) => {
                tracing::debug!(height, %reason, "Node has no view of requested height");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn compute_state(&self, start_epoch: u64, n_epochs: u64) -> Result<(), NodeError> {
        let args = vec![
            "state".to_string(),
            "compute".to_string(),
            "--epoch".to_string(),
            start_epoch.to_string(),
            "--n-epochs".to_string(),
            n_epochs.to_string(),
        ];
        self.run_tool(&self.cli_path, &args).await.map(drop)
    }

    async fn export_snapshot(
        &self,
        start_epoch: u64,
        end_epoch: u64,
        format: &str,
        out_path: &Path,
    ) -> Result<(), NodeError> {
        let depth = end_epoch.saturating_sub(start_epoch).max(1);
        let args = vec![
            "snapshot".to_string(),
            "export".to_string(),
            "--tipset".to_string(),
            end_epoch.to_string(),
            "--depth".to_string(),
            depth.to_string(),
            "--format".to_string(),
            format.to_string(),
            "--output-path".to_string(),
            out_path.display().to_string(),
        ];
        self.run_tool(&self.cli_path, &args).await.map(drop)
    }

    async fn inspect_archive(&self, path: &Path) -> Result<ArchiveInfo, NodeError> {
        // A toolchain that rejects the file means the artifact is bad; a
        // toolchain that cannot be spawned stays Unavailable and is retried.
        let reject = |e: NodeError| match e {
            NodeError::ExportFailed(msg) => NodeError::InspectionFailed(msg),
            other => other,
        };
        let info = self
            .run_tool(&self.tool_path, &["archive".to_string(), "info".to_string(), path.display().to_string()])
            .await
            .map_err(reject)?;
        let metadata = self
            .run_tool(&self.tool_path, &["archive".to_string(), "metadata".to_string(), path.display().to_string()])
            .await
            .map_err(reject)?;

        let mut fields = parse_key_value_output(&info);
        fields.extend(parse_key_value_output(&metadata));

        let epoch = fields
            .get("Epoch")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| NodeError::InspectionFailed(format!("no epoch reported for {}", path.display())))?;
        let state_root = fields.get("State root").or_else(|| fields.get("Head Tipset")).cloned();

        Ok(ArchiveInfo { epoch, state_root, fields })
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }
}
