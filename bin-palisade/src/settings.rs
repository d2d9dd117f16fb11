//! The settings file: a TOML document loaded through the `config` crate,
//! with every section optional.  CLI flags override the basics; everything
//! else is configuration-file-only.

use std::net::IpAddr;
use std::time::Duration;

use config::{Config, ConfigError, File};
use serde::Deserialize;

use dns_resolver::cache::CacheConfig;
use dns_resolver::recursive::ResolverConfig;
use dns_resolver::rrl::RrlConfig;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub zones: ZoneSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub rrl: RrlSettings,
    #[serde(default)]
    pub cookies: CookieSettings,
    #[serde(default)]
    pub resolver: ResolverSettings,
    #[serde(default)]
    pub threat_intel: ThreatSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub interface: Option<IpAddr>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Only answer from local zones; never recurse.
    #[serde(default)]
    pub authoritative_only: bool,
    /// Worker tasks per CPU.
    #[serde(default = "default_workers_per_cpu")]
    pub workers_per_cpu: usize,
    /// Admission queue depth per worker.
    #[serde(default = "default_queue_per_worker")]
    pub queue_per_worker: usize,
    /// Per-query deadline, seconds.
    #[serde(default = "default_query_deadline")]
    pub query_deadline_seconds: u64,
}

fn default_workers_per_cpu() -> usize {
    4
}

fn default_queue_per_worker() -> usize {
    100
}

fn default_query_deadline() -> u64 {
    5
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            interface: None,
            port: None,
            authoritative_only: false,
            workers_per_cpu: default_workers_per_cpu(),
            queue_per_worker: default_queue_per_worker(),
            query_deadline_seconds: default_query_deadline(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ZoneSettings {
    /// Zone files: `.toml` documents or master files.
    #[serde(default)]
    pub files: Vec<String>,
    /// Directories scanned for zone files.
    #[serde(default)]
    pub directories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_shard_capacity")]
    pub shard_capacity: usize,
    #[serde(default)]
    pub serve_stale: bool,
    #[serde(default = "default_max_stale")]
    pub max_stale_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default)]
    pub emit_hit_miss_events: bool,
}

fn default_shards() -> usize {
    256
}

fn default_shard_capacity() -> usize {
    512
}

fn default_max_stale() -> u64 {
    1800
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            shard_capacity: default_shard_capacity(),
            serve_stale: false,
            max_stale_seconds: default_max_stale(),
            cleanup_interval_seconds: default_cleanup_interval(),
            emit_hit_miss_events: false,
        }
    }
}

impl CacheSettings {
    pub fn to_config(&self) -> CacheConfig {
        CacheConfig {
            shard_count: self.shards,
            shard_capacity: self.shard_capacity,
            serve_stale: self.serve_stale,
            max_stale: Duration::from_secs(self.max_stale_seconds),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_seconds),
            emit_hit_miss: self.emit_hit_miss_events,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RrlSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_window")]
    pub window_seconds: u64,
    #[serde(default)]
    pub responses_per_second: u32,
    #[serde(default)]
    pub referrals_per_second: u32,
    #[serde(default)]
    pub nodata_per_second: u32,
    #[serde(default)]
    pub nxdomains_per_second: u32,
    #[serde(default)]
    pub errors_per_second: u32,
    #[serde(default)]
    pub all_per_second: u32,
    #[serde(default = "default_slip")]
    pub slip: u32,
    #[serde(default = "default_v4_prefix")]
    pub ipv4_prefix_len: u8,
    #[serde(default = "default_v6_prefix")]
    pub ipv6_prefix_len: u8,
    /// Exempt prefixes, as `address/len` strings.
    #[serde(default)]
    pub exempt: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_window() -> u64 {
    15
}

fn default_slip() -> u32 {
    2
}

fn default_v4_prefix() -> u8 {
    24
}

fn default_v6_prefix() -> u8 {
    56
}

impl Default for RrlSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: default_window(),
            responses_per_second: 0,
            referrals_per_second: 0,
            nodata_per_second: 0,
            nxdomains_per_second: 0,
            errors_per_second: 0,
            all_per_second: 0,
            slip: default_slip(),
            ipv4_prefix_len: default_v4_prefix(),
            ipv6_prefix_len: default_v6_prefix(),
            exempt: Vec::new(),
        }
    }
}

impl RrlSettings {
    pub fn to_config(&self) -> Result<RrlConfig, SettingsError> {
        let mut exempt = Vec::with_capacity(self.exempt.len());
        for entry in &self.exempt {
            exempt.push(parse_prefix(entry)?);
        }

        Ok(RrlConfig {
            enabled: self.enabled,
            window: Duration::from_secs(self.window_seconds),
            responses_per_second: self.responses_per_second,
            referrals_per_second: self.referrals_per_second,
            nodata_per_second: self.nodata_per_second,
            nxdomains_per_second: self.nxdomains_per_second,
            errors_per_second: self.errors_per_second,
            all_per_second: self.all_per_second,
            slip: self.slip,
            ipv4_prefix_len: self.ipv4_prefix_len,
            ipv6_prefix_len: self.ipv6_prefix_len,
            exempt,
            ..RrlConfig::default()
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CookieSettings {
    #[serde(default)]
    pub require_valid: bool,
    /// 32 hex characters.  Setting this puts the node in cluster-shared
    /// mode: rotation is disabled and every node configured with the same
    /// secret validates each other's cookies.
    #[serde(default)]
    pub cluster_secret: Option<String>,
}

impl CookieSettings {
    pub fn cluster_secret_bytes(&self) -> Result<Option<[u8; 16]>, SettingsError> {
        let Some(secret) = &self.cluster_secret else {
            return Ok(None);
        };

        let decoded = hex::decode(secret).map_err(|_| SettingsError::BadClusterSecret)?;
        let bytes: [u8; 16] = decoded
            .try_into()
            .map_err(|_| SettingsError::BadClusterSecret)?;
        Ok(Some(bytes))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverSettings {
    /// Root nameserver addresses; the IANA roots when empty.
    #[serde(default)]
    pub root_hints: Vec<IpAddr>,
    #[serde(default = "default_budget")]
    pub iteration_budget: usize,
    #[serde(default = "default_true")]
    pub use_0x20_encoding: bool,
    #[serde(default = "default_true")]
    pub qname_minimisation: bool,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_seconds: u64,
}

fn default_budget() -> usize {
    20
}

fn default_upstream_timeout() -> u64 {
    3
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            root_hints: Vec::new(),
            iteration_budget: default_budget(),
            use_0x20_encoding: true,
            qname_minimisation: true,
            upstream_timeout_seconds: default_upstream_timeout(),
        }
    }
}

impl ResolverSettings {
    pub fn to_config(&self) -> ResolverConfig {
        let defaults = ResolverConfig::default();
        ResolverConfig {
            root_hints: if self.root_hints.is_empty() {
                defaults.root_hints
            } else {
                self.root_hints.clone()
            },
            iteration_budget: self.iteration_budget,
            use_0x20_encoding: self.use_0x20_encoding,
            qname_minimisation: self.qname_minimisation,
            upstream_timeout: Duration::from_secs(self.upstream_timeout_seconds),
            upstream_port: defaults.upstream_port,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ThreatSettings {
    #[serde(default)]
    pub providers: Vec<ThreatProviderSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreatProviderSettings {
    pub name: String,
    pub endpoint: String,
}

impl Settings {
    pub fn load(filename: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(filename))
            .build()?
            .try_deserialize()
    }
}

fn parse_prefix(entry: &str) -> Result<(IpAddr, u8), SettingsError> {
    let bad = || SettingsError::BadPrefix {
        prefix: entry.to_string(),
    };

    match entry.split_once('/') {
        Some((address, len)) => {
            let address: IpAddr = address.parse().map_err(|_| bad())?;
            let len: u8 = len.parse().map_err(|_| bad())?;
            let max = if address.is_ipv4() { 32 } else { 128 };
            if len > max {
                return Err(bad());
            }
            Ok((address, len))
        }
        None => {
            let address: IpAddr = entry.parse().map_err(|_| bad())?;
            let len = if address.is_ipv4() { 32 } else { 128 };
            Ok((address, len))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("'{prefix}' is not an address or address/len prefix")]
    BadPrefix { prefix: String },

    #[error("cluster_secret must be 32 hex characters")]
    BadClusterSecret,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_parse() {
        assert_eq!(
            ("203.0.113.0".parse::<IpAddr>().unwrap(), 24),
            parse_prefix("203.0.113.0/24").unwrap()
        );
        assert_eq!(
            ("2001:db8::".parse::<IpAddr>().unwrap(), 56),
            parse_prefix("2001:db8::/56").unwrap()
        );
        assert_eq!(
            ("203.0.113.9".parse::<IpAddr>().unwrap(), 32),
            parse_prefix("203.0.113.9").unwrap()
        );
        assert!(parse_prefix("not-an-address/24").is_err());
        assert!(parse_prefix("203.0.113.0/33").is_err());
    }

    #[test]
    fn cluster_secret_decodes() {
        let mut settings = CookieSettings::default();
        assert_eq!(None, settings.cluster_secret_bytes().unwrap());

        settings.cluster_secret = Some("000102030405060708090a0b0c0d0e0f".to_string());
        assert_eq!(
            Some([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]),
            settings.cluster_secret_bytes().unwrap()
        );

        settings.cluster_secret = Some("too-short".to_string());
        assert!(settings.cluster_secret_bytes().is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(4, settings.server.workers_per_cpu);
        assert_eq!(256, settings.cache.shards);
        assert!(settings.rrl.enabled);
        assert_eq!(2, settings.rrl.slip);
        assert_eq!(20, settings.resolver.iteration_budget);
        assert!(!settings.cookies.require_valid);
    }
}
