//! Configuration from environment variables.

use beacon_types::{BeaconError, Result, config::ClientConfig};

pub const API_KEY: &str = "BEACON_API_KEY";
pub const PROJECT_ID: &str = "BEACON_PROJECT_ID";
pub const SERVER: &str = "BEACON_SERVER";
pub const STREAM_SERVER: &str = "BEACON_STREAM_SERVER";
pub const DEBUG: &str = "BEACON_DEBUG";
pub const DEVICE_ID: &str = "BEACON_DEVICE_ID";

pub fn load(dry_run: bool) -> Result<ClientConfig> {
    from_lookup(|key| std::env::var(key).ok(), dry_run)
}

pub fn device_id() -> Option<String> {
    non_empty(std::env::var(DEVICE_ID).ok())
}

/// Credentials are optional in a dry run, where nothing is sent.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, dry_run: bool) -> Result<ClientConfig> {
    let required = |key: &str| -> Result<String> {
        match non_empty(lookup(key)) {
            Some(value) => Ok(value),
            None if dry_run => Ok("dry-run".to_string()),
            None => Err(BeaconError::Config(format!("{} is not set", key))),
        }
    };

    let mut config = ClientConfig::new(required(API_KEY)?, required(PROJECT_ID)?);
    config.server_endpoint = non_empty(lookup(SERVER));
    config.stream_endpoint = non_empty(lookup(STREAM_SERVER));
    config.debug = lookup(DEBUG).map(|v| is_truthy(&v)).unwrap_or(false);
    config.validate()?;
    Ok(config)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
