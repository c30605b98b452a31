use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::catalog::{AvailabilityStrategy, ProxySettings, ResolverSettings, SourceProfile};
use crate::error::ConfigError;
use crate::fetch::FetchMode;
use crate::playlist::TimestampStrategy;
use crate::schedule::{ScheduleExtractor, SelectorTable};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,
    #[serde(default = "default_request_timeout")]
    pub timeout: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub mode: FetchMode,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_delay: default_retry_delay(),
            timeout: default_request_timeout(),
            user_agent: default_user_agent(),
            mode: FetchMode::default(),
        }
    }
}

fn default_retries() -> u32 {
    3
}
fn default_retry_delay() -> String {
    "2s".to_string()
}
fn default_request_timeout() -> String {
    "30s".to_string()
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0.0.0 Safari/537.36".to_string()
}

impl FetchConfig {
    pub fn retry_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration("fetch.retry_delay", &self.retry_delay)
    }

    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("fetch.timeout", &self.timeout)
    }
}

/// FlareSolverr-compatible challenge solver endpoint.
#[derive(Debug, Deserialize)]
pub struct ChallengeConfig {
    pub url: Option<String>,
    #[serde(default = "default_max_timeout")]
    pub max_timeout: String,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_timeout: default_max_timeout(),
        }
    }
}

fn default_max_timeout() -> String {
    "60s".to_string()
}

impl ChallengeConfig {
    pub fn max_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("challenge.max_timeout", &self.max_timeout)
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_schedule_url")]
    pub url: String,
    #[serde(default = "default_schedule_output")]
    pub output: String,
    #[serde(default = "default_schedule_min_size")]
    pub min_size: usize,
    /// 24/7 channel listing page, saved verbatim. Empty string disables it.
    #[serde(default = "default_channels_url")]
    pub channels_url: Option<String>,
    #[serde(default = "default_channels_output")]
    pub channels_output: String,
    #[serde(default = "default_channels_min_size")]
    pub channels_min_size: usize,
    #[serde(default)]
    pub selectors: SelectorTable,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            url: default_schedule_url(),
            output: default_schedule_output(),
            min_size: default_schedule_min_size(),
            channels_url: default_channels_url(),
            channels_output: default_channels_output(),
            channels_min_size: default_channels_min_size(),
            selectors: SelectorTable::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}
fn default_schedule_url() -> String {
    "https://dlhd.dad/".to_string()
}
fn default_schedule_output() -> String {
    "daddyliveSchedule.json".to_string()
}
fn default_schedule_min_size() -> usize {
    1000
}
fn default_channels_url() -> Option<String> {
    Some("https://dlhd.dad/24-7-channels.php".to_string())
}
fn default_channels_output() -> String {
    "247.html".to_string()
}
fn default_channels_min_size() -> usize {
    500
}

#[derive(Debug, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,
    #[serde(default = "default_catalog_output")]
    pub output: String,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_throttle")]
    pub throttle: String,
    #[serde(default = "default_enabled")]
    pub resolve_embeds: bool,
    #[serde(default)]
    pub availability: AvailabilityConfig,
    /// Signed offset added to upstream start timestamps, e.g. "1h" or "-30m".
    #[serde(default = "default_clock_skew")]
    pub clock_skew: String,
    #[serde(default)]
    pub timestamp: TimestampStrategy,
    pub proxy: Option<ProxyConfig>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            catalog_url: default_catalog_url(),
            stream_base_url: default_stream_base_url(),
            output: default_catalog_output(),
            categories: default_categories(),
            throttle: default_throttle(),
            resolve_embeds: default_enabled(),
            availability: AvailabilityConfig::default(),
            clock_skew: default_clock_skew(),
            timestamp: TimestampStrategy::default(),
            proxy: None,
        }
    }
}

fn default_catalog_url() -> String {
    "https://addon3.gstream.stream/catalog/StreamsPPV/ppv-SPK.json".to_string()
}
fn default_stream_base_url() -> String {
    "https://addon3.gstream.stream/stream/StreamsPPV".to_string()
}
fn default_catalog_output() -> String {
    "ppv_proxy.m3u".to_string()
}
fn default_categories() -> Vec<String> {
    [
        "American Football",
        "Australian Football",
        "Baseball",
        "Basketball",
        "Combat Sports",
        "Cricket",
        "Darts",
        "Football",
        "Hockey",
        "Motorsports",
        "Rugby",
        "Tennis",
        "Miscellaneous",
        "Channels",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_throttle() -> String {
    "150ms".to_string()
}
fn default_clock_skew() -> String {
    "0s".to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AvailabilityConfig {
    #[default]
    ReleaseInfo,
    StartWindow {
        #[serde(default = "default_upcoming_threshold")]
        upcoming_threshold: String,
    },
}

fn default_upcoming_threshold() -> String {
    "30m".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub base: String,
    pub referer: String,
}

impl CatalogConfig {
    pub fn profile(&self) -> Result<SourceProfile, ConfigError> {
        let availability = match &self.availability {
            AvailabilityConfig::ReleaseInfo => AvailabilityStrategy::ReleaseInfo,
            AvailabilityConfig::StartWindow { upcoming_threshold } => {
                let threshold = parse_duration("catalog.availability.upcoming_threshold", upcoming_threshold)?;
                AvailabilityStrategy::StartWindow {
                    upcoming_threshold: to_chrono("catalog.availability.upcoming_threshold", threshold)?,
                }
            }
        };
        Ok(SourceProfile {
            availability,
            clock_skew: parse_signed_duration("catalog.clock_skew", &self.clock_skew)?,
        })
    }

    pub fn resolver_settings(&self) -> Result<ResolverSettings, ConfigError> {
        Ok(ResolverSettings {
            stream_base_url: self.stream_base_url.trim_end_matches('/').to_string(),
            categories: self.categories.clone(),
            throttle: parse_duration("catalog.throttle", &self.throttle)?,
            resolve_embeds: self.resolve_embeds,
            proxy: self.proxy.as_ref().map(|p| ProxySettings {
                base: p.base.clone(),
                referer: p.referer.clone(),
            }),
        })
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Validation(format!("{field} '{value}': {e}")))
}

fn to_chrono(field: &str, value: Duration) -> Result<chrono::Duration, ConfigError> {
    chrono::Duration::from_std(value).map_err(|_| ConfigError::Validation(format!("{field}: duration out of range")))
}

/// Like `parse_duration`, but accepts a leading '-' for negative offsets.
fn parse_signed_duration(field: &str, value: &str) -> Result<chrono::Duration, ConfigError> {
    let trimmed = value.trim();
    let (negative, magnitude) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let duration = to_chrono(field, parse_duration(field, magnitude)?)?;
    Ok(if negative { -duration } else { duration })
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

/// Apply `DLHD_RETRIES`, `DLHD_UA` and `FLARESOLVERR_URL` on top of the file config.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(retries) = lookup("DLHD_RETRIES") {
        config.fetch.retries = retries
            .trim()
            .parse()
            .map_err(|_| ConfigError::Validation(format!("DLHD_RETRIES '{retries}' is not a number")))?;
        info!(retries = config.fetch.retries, "retries overridden from environment");
    }
    if let Some(ua) = lookup("DLHD_UA").filter(|ua| !ua.trim().is_empty()) {
        config.fetch.user_agent = ua;
    }
    if let Some(url) = lookup("FLARESOLVERR_URL").filter(|url| !url.trim().is_empty()) {
        info!(url = %url, "challenge solver configured from environment");
        config.challenge.url = Some(url);
    }
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.fetch.retries == 0 {
        return Err(ConfigError::Validation("fetch.retries must be at least 1".to_string()).into());
    }

    config.fetch.retry_delay()?;
    config.fetch.timeout()?;
    config.challenge.max_timeout()?;

    if config.fetch.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation("fetch.user_agent must not be empty".to_string()).into());
    }

    if config.fetch.mode == FetchMode::Challenge && config.challenge.url.is_none() {
        return Err(ConfigError::Validation(
            "fetch.mode = \"challenge\" requires [challenge].url (or FLARESOLVERR_URL)".to_string(),
        )
        .into());
    }

    if let Some(url) = &config.challenge.url {
        validate_url("challenge.url", url)?;
    }

    if config.schedule.enabled {
        validate_url("schedule.url", &config.schedule.url)?;
        if let Some(url) = config.schedule.channels_url.as_deref().filter(|u| !u.is_empty()) {
            validate_url("schedule.channels_url", url)?;
        }
        ScheduleExtractor::new(&config.schedule.selectors)
            .map_err(|e| ConfigError::Validation(format!("schedule.selectors: {e}")))?;
    }

    let catalog = &config.catalog;
    if catalog.enabled {
        validate_url("catalog.catalog_url", &catalog.catalog_url)?;
        validate_url("catalog.stream_base_url", &catalog.stream_base_url)?;

        if catalog.categories.is_empty() {
            return Err(ConfigError::Validation("catalog.categories must list at least one category".to_string()).into());
        }
        let mut seen = HashSet::new();
        for category in &catalog.categories {
            if !seen.insert(category) {
                return Err(ConfigError::Validation(format!("duplicate catalog category: '{category}'")).into());
            }
        }

        if let Some(proxy) = &catalog.proxy {
            validate_url("catalog.proxy.base", &proxy.base)?;
            if proxy.base.contains('?') {
                return Err(ConfigError::Validation(format!(
                    "catalog.proxy.base '{}' must not carry a query string",
                    proxy.base
                ))
                .into());
            }
        }

        catalog.profile()?;
        catalog.resolver_settings()?;
    }

    if !config.schedule.enabled && !catalog.enabled {
        return Err(ConfigError::Validation("both [schedule] and [catalog] are disabled".to_string()).into());
    }

    Ok(())
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value).map_err(|e| ConfigError::Validation(format!("{field} '{value}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Validation(format!(
            "{field} '{value}': unsupported scheme '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("");
        assert_eq!(config.fetch.retries, 3);
        assert_eq!(config.fetch.mode, FetchMode::Auto);
        assert_eq!(config.schedule.min_size, 1000);
        assert_eq!(config.schedule.channels_min_size, 500);
        assert_eq!(config.catalog.categories.len(), 14);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[fetch]
retries = 5
retry_delay = "500ms"
mode = "direct"

[catalog]
categories = ["Football", "Tennis"]
clock_skew = "1h"
timestamp = "start_time"

[catalog.availability]
strategy = "start_window"
upcoming_threshold = "45m"

[catalog.proxy]
base = "https://proxy.example/stream"
referer = "https://embed.example/"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.fetch.retries, 5);
        assert_eq!(config.fetch.retry_delay().unwrap(), Duration::from_millis(500));
        assert_eq!(config.catalog.timestamp, TimestampStrategy::StartTime);

        let profile = config.catalog.profile().unwrap();
        assert_eq!(profile.clock_skew, chrono::Duration::hours(1));
        assert_eq!(
            profile.availability,
            AvailabilityStrategy::StartWindow {
                upcoming_threshold: chrono::Duration::minutes(45)
            }
        );
        let settings = config.catalog.resolver_settings().unwrap();
        assert_eq!(settings.proxy.unwrap().referer, "https://embed.example/");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn negative_clock_skew() {
        assert_eq!(
            parse_signed_duration("skew", "-30m").unwrap(),
            chrono::Duration::minutes(-30)
        );
        assert_eq!(parse_signed_duration("skew", "+1h").unwrap(), chrono::Duration::hours(1));
        assert!(parse_signed_duration("skew", "soon").is_err());
    }

    #[test]
    fn rejects_zero_retries() {
        let config = parse("[fetch]\nretries = 0\n");
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn challenge_mode_requires_solver_url() {
        let config = parse("[fetch]\nmode = \"challenge\"\n");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("challenge"));
    }

    #[test]
    fn rejects_bad_selector() {
        let config = parse("[schedule.selectors]\nday = \"div[[\"\n");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("schedule.selectors"));
        assert!(err.to_string().contains("day"));
    }

    #[test]
    fn rejects_proxy_with_query() {
        let config = parse("[catalog.proxy]\nbase = \"https://p.example/?x=1\"\nreferer = \"r\"\n");
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_overrides(&mut config, |key| match key {
            "DLHD_RETRIES" => Some("7".to_string()),
            "FLARESOLVERR_URL" => Some("http://localhost:8191/v1".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.fetch.retries, 7);
        assert_eq!(config.challenge.url.as_deref(), Some("http://localhost:8191/v1"));
        assert!(config.fetch.user_agent.contains("Mozilla"));
    }

    #[test]
    fn env_override_rejects_garbage_retries() {
        let mut config = Config::default();
        let result = apply_overrides(&mut config, |key| (key == "DLHD_RETRIES").then(|| "many".to_string()));
        assert!(result.is_err());
    }
}
