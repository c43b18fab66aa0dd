//! Loads [`Settings`] from the process environment.

use figment::Figment;
use figment::providers::Env;
use tracing::info;

use super::error::ConfigResult;
use super::schema::Settings;

/// Environment-variable prefix for every `Settings` field
/// (e.g. `AGENT_PING_INTERVAL_SECS`).
pub const ENV_PREFIX: &str = "AGENT_";

/// Loads settings from the environment, falling back to [`Settings::default`]
/// for anything not set. On-disk configuration loading is out of scope.
pub fn load() -> ConfigResult<Settings> {
    let settings: Settings = Figment::from(figment::providers::Serialized::defaults(Settings::default()))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()?;
    info!(ping_interval_secs = settings.ping_interval_secs, "configuration loaded");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_when_the_environment_is_empty() {
        let settings = load().unwrap();
        assert_eq!(settings.ping_interval_secs, Settings::default().ping_interval_secs);
    }

    #[test]
    fn an_env_var_overrides_its_matching_default() {
        // SAFETY: single-threaded test, no other test reads this variable.
        unsafe { std::env::set_var("AGENT_MRTAP_PIPELINE_CAP", "16") };
        let settings = load().unwrap();
        assert_eq!(settings.mrtap_pipeline_cap, 16);
        unsafe { std::env::remove_var("AGENT_MRTAP_PIPELINE_CAP") };
    }
}
