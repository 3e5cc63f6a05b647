use crate::services::{
    firmware::{DEFAULT_FIRMWARE_EXTENSION, DEFAULT_MAX_FIRMWARE_BYTES, FirmwarePolicy},
    reconnect::ReconnectPolicy,
};
use anyhow::{Context, Result, ensure};
use std::{env, str::FromStr, time::Duration};

pub const DEFAULT_DEVICE_URL: &str = "http://192.168.4.1";

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    /// Device connection configuration
    pub device: DeviceConfig,

    /// Which firmware files may be uploaded
    pub firmware: FirmwarePolicy,

    /// Reconnect polling after a device restart
    pub reconnect: ReconnectPolicy,

    /// Seconds announced before polling starts
    pub restart_countdown_secs: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub url: String,
    pub connect_timeout: Duration,
}

impl AppConfig {
    /// Load all configuration from environment variables
    pub fn load() -> Result<Self> {
        Self::load_from(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, missing keys fall back to defaults
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let device = DeviceConfig::load(&lookup)?;
        let firmware = load_firmware_policy(&lookup)?;
        let reconnect = load_reconnect_policy(&lookup)?;
        let restart_countdown_secs = parse_or(&lookup, "OTA_RESTART_COUNTDOWN_SECS", 5)?;

        Ok(Self {
            device,
            firmware,
            reconnect,
            restart_countdown_secs,
        })
    }
}

impl DeviceConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("OTA_DEVICE_URL").unwrap_or_else(|| DEFAULT_DEVICE_URL.to_string());
        check_device_url(&url).context("failed to parse OTA_DEVICE_URL")?;

        let connect_timeout =
            Duration::from_millis(parse_or(lookup, "OTA_CONNECT_TIMEOUT_MS", 5000)?);

        Ok(Self {
            url,
            connect_timeout,
        })
    }
}

impl DeviceConfig {
    /// Replace the device URL, e.g. from the command line
    pub fn set_url(&mut self, url: String) -> Result<()> {
        check_device_url(&url)?;
        self.url = url;
        Ok(())
    }
}

fn check_device_url(url: &str) -> Result<()> {
    ensure!(
        url.starts_with("http://") || url.starts_with("https://"),
        "expected http:// or https:// url but got {url}"
    );
    Ok(())
}

fn load_firmware_policy(lookup: &impl Fn(&str) -> Option<String>) -> Result<FirmwarePolicy> {
    let extension = lookup("OTA_FIRMWARE_EXTENSION")
        .unwrap_or_else(|| DEFAULT_FIRMWARE_EXTENSION.to_string());
    let max_size_bytes = parse_or(lookup, "OTA_MAX_FIRMWARE_BYTES", DEFAULT_MAX_FIRMWARE_BYTES)?;

    Ok(FirmwarePolicy {
        extension,
        max_size_bytes,
    })
}

fn load_reconnect_policy(lookup: &impl Fn(&str) -> Option<String>) -> Result<ReconnectPolicy> {
    let defaults = ReconnectPolicy::default();

    let interval = parse_or(
        lookup,
        "OTA_POLL_INTERVAL_MS",
        defaults.interval.as_millis() as u64,
    )?;
    ensure!(interval > 0, "failed to parse OTA_POLL_INTERVAL_MS: must not be 0");

    Ok(ReconnectPolicy {
        interval: Duration::from_millis(interval),
        max_attempts: parse_or(lookup, "OTA_POLL_MAX_ATTEMPTS", defaults.max_attempts)?,
        per_attempt_timeout: Duration::from_millis(parse_or(
            lookup,
            "OTA_PROBE_TIMEOUT_MS",
            defaults.per_attempt_timeout.as_millis() as u64,
        )?),
    })
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}: invalid format")),
        None => Ok(default),
    }
}
