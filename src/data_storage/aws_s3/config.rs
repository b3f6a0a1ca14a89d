use serde::{Deserialize, Serialize};

use crate::data_storage::DataStorageConfig;
use crate::utils::settings::Settings;

/// Represents AWS S3 config struct with all the necessary variables.
#[derive(Clone, Serialize, Deserialize)]
pub struct AWSS3Config {
    /// Bucket validated artifacts are uploaded to
    pub bucket_name: String,
}

impl DataStorageConfig for AWSS3Config {
    /// To return the config struct by creating it from the environment variables.
    fn new_from_settings(settings: &impl Settings) -> Self {
        Self { bucket_name: settings.get_settings_or_panic("AWS_S3_BUCKET_NAME") }
    }
}
