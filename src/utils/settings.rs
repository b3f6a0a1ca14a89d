use crate::utils::env_utils::{get_env_var_or_default, get_env_var_or_panic};

/// Source of configuration values. The production provider reads the
/// environment; tests substitute fixed maps.
pub trait Settings {
    fn get_settings_or_panic(&self, name: &'static str) -> String;

    fn get_settings_or_default(&self, name: &'static str, default: &str) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct EnvSettingsProvider {}

impl Settings for EnvSettingsProvider {
    fn get_settings_or_panic(&self, name: &'static str) -> String {
        get_env_var_or_panic(name)
    }

    fn get_settings_or_default(&self, name: &'static str, default: &str) -> String {
        get_env_var_or_default(name, default)
    }
}
