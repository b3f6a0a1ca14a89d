use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aws_config::meta::region::RegionProviderChain;
use aws_config::{Region, SdkConfig};
use aws_credential_types::Credentials;
use dotenvy::dotenv;

use crate::alerts::aws_sns::AWSSNS;
use crate::alerts::Alerts;
use crate::data_storage::aws_s3::AWSS3;
use crate::data_storage::DataStorage;
use crate::disk::{DiskGuard, MountedDiskGuard};
use crate::node::forest::ForestNode;
use crate::node::ArchiveNode;
use crate::queue::sqs::SqsQueue;
use crate::queue::QueueProvider;
use crate::state_store::{JsonFileStore, StateStore};
use crate::utils::backoff::BackoffPolicy;
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::env_utils::get_env_var_or_panic;
use crate::utils::settings::{EnvSettingsProvider, Settings};

/// Tunables for the pipeline, read once at startup. A missing or
/// unparseable value is fatal: the process exits rather than running with
/// an undefined configuration.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    /// Chain name baked into filenames and object keys
    pub chain: String,
    /// Root of the snapshot volume; per-kind subdirectories live below it
    pub snapshot_dir: PathBuf,
    /// Format tag passed through to the node export
    pub snapshot_format: String,
    /// Epoch cadence of the chain
    pub seconds_per_epoch: u64,
    /// Epochs materialized per compute-state job
    pub compute_batch_size: u64,
    /// Width of a historic export window
    pub historic_window_epochs: u64,
    /// Distance kept behind the chain head for latest exports
    pub latest_safety_margin: u64,
    /// Depth of a latest export window
    pub latest_export_depth: u64,
    /// Minimum spacing between successful latest builds
    pub latest_build_delay: Duration,
    /// Admission floor: free bytes required on the snapshot volume
    pub disk_floor_bytes: u64,
    /// Retry policy shared by all stages
    pub backoff: BackoffPolicy,
    /// Per-stage maximum durations; exceeding one is a failure, not a crash
    pub build_timeout: Duration,
    pub validation_timeout: Duration,
    pub upload_timeout: Duration,
    /// Cadence of node height polls and scheduler ticks
    pub poll_interval: Duration,
}

impl PipelineParams {
    pub fn new_with_settings(settings: &impl Settings) -> Self {
        let parse_u64 = |name: &'static str, default: &str| -> u64 {
            settings
                .get_settings_or_default(name, default)
                .parse::<u64>()
                .unwrap_or_else(|e| panic!("Invalid value for {}: {}", name, e))
        };

        let max_attempts = parse_u64("MAX_ATTEMPTS", "3");
        assert!(max_attempts > 0, "MAX_ATTEMPTS must be at least 1");

        Self {
            chain: settings.get_settings_or_default("CHAIN", "calibnet"),
            snapshot_dir: PathBuf::from(settings.get_settings_or_default("SNAPSHOT_DIR", "/data/snapshots")),
            snapshot_format: settings.get_settings_or_default("SNAPSHOT_FORMAT", "v1"),
            seconds_per_epoch: parse_u64("SECONDS_PER_EPOCH", "30"),
            compute_batch_size: parse_u64("COMPUTE_BATCH_SIZE", "100"),
            historic_window_epochs: parse_u64("HISTORIC_WINDOW_EPOCHS", "30000"),
            latest_safety_margin: parse_u64("LATEST_SAFETY_MARGIN", "900"),
            latest_export_depth: parse_u64("LATEST_EXPORT_DEPTH", "2000"),
            latest_build_delay: Duration::from_secs(parse_u64("LATEST_BUILD_DELAY_SECS", "21600")),
            disk_floor_bytes: parse_u64("DISK_FLOOR_BYTES", "107374182400"),
            backoff: BackoffPolicy::new(
                Duration::from_secs(parse_u64("BACKOFF_BASE_SECS", "60")),
                Duration::from_secs(parse_u64("BACKOFF_MAX_SECS", "3600")),
                max_attempts,
            ),
            build_timeout: Duration::from_secs(parse_u64("BUILD_TIMEOUT_SECS", "21600")),
            validation_timeout: Duration::from_secs(parse_u64("VALIDATION_TIMEOUT_SECS", "2400")),
            upload_timeout: Duration::from_secs(parse_u64("UPLOAD_TIMEOUT_SECS", "2400")),
            poll_interval: Duration::from_secs(parse_u64("POLL_INTERVAL_SECS", "30")),
        }
    }
}

/// The app config. Owns every collaborator behind its interface so stages
/// depend on traits, never on concrete clients.
pub struct Config {
    archive_node: Box<dyn ArchiveNode>,
    disk_guard: Box<dyn DiskGuard>,
    queue: Box<dyn QueueProvider>,
    storage: Box<dyn DataStorage>,
    alerts: Box<dyn Alerts>,
    state_store: Box<dyn StateStore>,
    clock: Box<dyn Clock>,
    params: PipelineParams,
}

/// `ProviderConfig` is an enum used to represent the global config built
/// using the settings provider. More providers can be added eg : GCP, AZURE etc.
#[derive(Clone)]
pub enum ProviderConfig {
    AWS(Box<SdkConfig>),
}

impl ProviderConfig {
    pub fn get_aws_client_or_panic(&self) -> &SdkConfig {
        match self {
            ProviderConfig::AWS(config) => config.as_ref(),
        }
    }
}

/// To build a `SdkConfig` for the AWS provider.
pub async fn get_aws_config(settings_provider: &impl Settings) -> SdkConfig {
    let region = settings_provider.get_settings_or_panic("AWS_REGION");
    let region_provider = RegionProviderChain::first_try(Region::new(region)).or_default_provider();
    let credentials = Credentials::from_keys(
        settings_provider.get_settings_or_panic("AWS_ACCESS_KEY_ID"),
        settings_provider.get_settings_or_panic("AWS_SECRET_ACCESS_KEY"),
        None,
    );
    aws_config::from_env().credentials_provider(credentials).region(region_provider).load().await
}

/// Initializes the app config from the environment.
pub async fn init_config() -> color_eyre::Result<Arc<Config>> {
    dotenv().ok();

    let settings_provider = EnvSettingsProvider {};
    let provider_config = Arc::new(ProviderConfig::AWS(Box::new(get_aws_config(&settings_provider).await)));

    let params = PipelineParams::new_with_settings(&settings_provider);
    let archive_node = Box::new(ForestNode::new_with_settings(&settings_provider)?);
    let storage = build_storage_client(&settings_provider, provider_config.clone()).await;
    let alerts = build_alert_client(&settings_provider, provider_config.clone()).await;
    let queue = build_queue_client();
    let state_store = Box::new(JsonFileStore::new_with_settings(&settings_provider));

    Ok(Arc::new(Config::new(
        archive_node,
        Box::new(MountedDiskGuard),
        queue,
        storage,
        alerts,
        state_store,
        Box::new(SystemClock),
        params,
    )))
}

impl Config {
    /// Create a new config
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        archive_node: Box<dyn ArchiveNode>,
        disk_guard: Box<dyn DiskGuard>,
        queue: Box<dyn QueueProvider>,
        storage: Box<dyn DataStorage>,
        alerts: Box<dyn Alerts>,
        state_store: Box<dyn StateStore>,
        clock: Box<dyn Clock>,
        params: PipelineParams,
    ) -> Self {
        Self { archive_node, disk_guard, queue, storage, alerts, state_store, clock, params }
    }

    /// Returns the archive node adapter
    pub fn archive_node(&self) -> &dyn ArchiveNode {
        self.archive_node.as_ref()
    }

    /// Returns the disk guard
    pub fn disk_guard(&self) -> &dyn DiskGuard {
        self.disk_guard.as_ref()
    }

    /// Returns the queue provider
    pub fn queue(&self) -> &dyn QueueProvider {
        self.queue.as_ref()
    }

    /// Returns the storage provider
    pub fn storage(&self) -> &dyn DataStorage {
        self.storage.as_ref()
    }

    /// Returns the alerts client
    pub fn alerts(&self) -> &dyn Alerts {
        self.alerts.as_ref()
    }

    /// Returns the durable scheduling-state store
    pub fn state_store(&self) -> &dyn StateStore {
        self.state_store.as_ref()
    }

    /// Returns the time source
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Returns the pipeline tunables
    pub fn params(&self) -> &PipelineParams {
        &self.params
    }
}

pub async fn build_storage_client(
    settings_provider: &impl Settings,
    provider_config: Arc<ProviderConfig>,
) -> Box<dyn DataStorage + Send + Sync> {
    match get_env_var_or_panic("DATA_STORAGE").as_str() {
        "s3" => Box::new(AWSS3::new_with_settings(settings_provider, provider_config).await),
        _ => panic!("Unsupported Storage Client"),
    }
}

pub async fn build_alert_client(
    settings_provider: &impl Settings,
    provider_config: Arc<ProviderConfig>,
) -> Box<dyn Alerts + Send + Sync> {
    match get_env_var_or_panic("ALERTS").as_str() {
        "sns" => Box::new(AWSSNS::new_with_settings(settings_provider, provider_config).await),
        _ => panic!("Unsupported Alert Client"),
    }
}

pub fn build_queue_client() -> Box<dyn QueueProvider + Send + Sync> {
    match get_env_var_or_panic("QUEUE_PROVIDER").as_str() {
        "sqs" => Box::new(SqsQueue {}),
        _ => panic!("Unsupported Queue Client"),
    }
}
