//! Rate engine configuration.

use ratebridge_common::{BidAsk, CurrencyPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::adapters::{bitstamp, coingecko, kraken};
use crate::error::{FxError, FxResult};
use crate::quote::SourceId;

/// How a source is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Every call goes to the network.
    None,
    /// Reuse a snapshot for the TTL; concurrent misses share one fetch.
    CacheAside,
    /// Serve the last snapshot and refresh it behind the caller.
    Background,
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(CacheMode::None),
            "cache-aside" => Ok(CacheMode::CacheAside),
            "background" => Ok(CacheMode::Background),
            other => Err(format!("Unknown cache mode '{other}'")),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheMode::None => "none",
            CacheMode::CacheAside => "cache-aside",
            CacheMode::Background => "background",
        })
    }
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default strategy for sources that don't pick one.
    pub mode: CacheMode,
    /// Cache-aside snapshot lifetime.
    pub ttl_secs: u64,
    /// Background refresh interval.
    pub refresh_interval_secs: u64,
    /// Background snapshots older than this are not served.
    pub validity_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Background,
            ttl_secs: 30,
            refresh_interval_secs: 60,
            validity_secs: Some(15 * 60),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn validity(&self) -> Option<Duration> {
        self.validity_secs.map(Duration::from_secs)
    }
}

/// A fixed quote for the static adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticQuote {
    pub pair: CurrencyPair,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl StaticQuote {
    pub fn bid_ask(&self) -> BidAsk {
        BidAsk::new(self.bid, self.ask)
    }
}

/// One member of a source's fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterConfig {
    Kraken {
        #[serde(default = "default_kraken_url")]
        base_url: String,
    },
    Bitstamp {
        #[serde(default = "default_bitstamp_url")]
        base_url: String,
    },
    Coingecko {
        #[serde(default = "default_coingecko_url")]
        base_url: String,
    },
    Static {
        #[serde(default)]
        quotes: Vec<StaticQuote>,
    },
}

fn default_kraken_url() -> String {
    kraken::DEFAULT_BASE_URL.to_string()
}

fn default_bitstamp_url() -> String {
    bitstamp::DEFAULT_BASE_URL.to_string()
}

fn default_coingecko_url() -> String {
    coingecko::DEFAULT_BASE_URL.to_string()
}

impl AdapterConfig {
    /// Built-in adapter for a well-known source name.
    pub fn for_name(name: &str) -> Option<Self> {
        match name {
            "kraken" => Some(AdapterConfig::Kraken {
                base_url: default_kraken_url(),
            }),
            "bitstamp" => Some(AdapterConfig::Bitstamp {
                base_url: default_bitstamp_url(),
            }),
            "coingecko" => Some(AdapterConfig::Coingecko {
                base_url: default_coingecko_url(),
            }),
            _ => None,
        }
    }

    /// Name the member reports under inside a chain.
    pub fn name(&self) -> &'static str {
        match self {
            AdapterConfig::Kraken { .. } => "kraken",
            AdapterConfig::Bitstamp { .. } => "bitstamp",
            AdapterConfig::Coingecko { .. } => "coingecko",
            AdapterConfig::Static { .. } => "static",
        }
    }
}

/// A registered source: an id, its fallback chain, and an optional cache
/// strategy override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    pub members: Vec<AdapterConfig>,
    #[serde(default)]
    pub cache: Option<CacheMode>,
}

impl SourceConfig {
    /// Single-member source using the built-in adapter of the same name.
    pub fn builtin(name: &str) -> Option<Self> {
        Some(Self {
            id: SourceId::new(name),
            members: vec![AdapterConfig::for_name(name)?],
            cache: None,
        })
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub sources: Vec<SourceConfig>,
    /// Per-request HTTP timeout.
    pub http_timeout_ms: u64,
    /// Crypto codes to register in the currency table.
    pub extra_cryptos: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            sources: ["kraken", "bitstamp", "coingecko"]
                .into_iter()
                .filter_map(SourceConfig::builtin)
                .collect(),
            http_timeout_ms: 5_000,
            extra_cryptos: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(mode) = lookup("RATEBRIDGE_CACHE_MODE") {
            if let Ok(mode) = mode.parse() {
                config.cache.mode = mode;
            }
        }

        if let Some(ttl) = lookup("RATEBRIDGE_CACHE_TTL_SECS") {
            if let Ok(ttl) = ttl.parse() {
                config.cache.ttl_secs = ttl;
            }
        }

        if let Some(interval) = lookup("RATEBRIDGE_REFRESH_INTERVAL_SECS") {
            if let Ok(interval) = interval.parse() {
                config.cache.refresh_interval_secs = interval;
            }
        }

        if let Some(validity) = lookup("RATEBRIDGE_VALIDITY_SECS") {
            if let Ok(validity) = validity.parse::<u64>() {
                config.cache.validity_secs = (validity > 0).then_some(validity);
            }
        }

        if let Some(timeout) = lookup("RATEBRIDGE_HTTP_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse() {
                config.http_timeout_ms = timeout;
            }
        }

        if let Some(sources) = lookup("RATEBRIDGE_SOURCES") {
            config.sources = split_list(&sources)
                .map(|name| {
                    SourceConfig::builtin(&name).unwrap_or(SourceConfig {
                        id: SourceId::new(&name),
                        members: Vec::new(),
                        cache: None,
                    })
                })
                .collect();
        }

        if let Some(cryptos) = lookup("RATEBRIDGE_EXTRA_CRYPTOS") {
            config.extra_cryptos = split_list(&cryptos)
                .map(|code| code.to_ascii_uppercase())
                .collect();
        }

        config
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> FxResult<Self> {
        serde_json::from_str(json).map_err(|e| FxError::Config(e.to_string()))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.http_timeout_ms == 0 {
            return Err("HTTP timeout cannot be 0".to_string());
        }

        if self.cache.ttl_secs == 0 {
            return Err("Cache TTL cannot be 0".to_string());
        }

        if self.cache.refresh_interval_secs == 0 {
            return Err("Refresh interval cannot be 0".to_string());
        }

        if let Some(validity) = self.cache.validity_secs {
            if validity < self.cache.refresh_interval_secs {
                return Err("Validity window cannot be shorter than the refresh interval".to_string());
            }
        }

        if self.sources.is_empty() {
            return Err("At least one source must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.as_str().is_empty() {
                return Err("Source id cannot be empty".to_string());
            }
            if !seen.insert(&source.id) {
                return Err(format!("Duplicate source '{}'", source.id));
            }
            if source.members.is_empty() {
                return Err(format!("Source '{}' has no adapters", source.id));
            }
        }

        Ok(())
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sources.len(), 3);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = EngineConfig::default();
        config.cache.ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sources.push(SourceConfig::builtin("kraken").unwrap());
        assert_eq!(config.validate(), Err("Duplicate source 'kraken'".to_string()));

        let mut config = EngineConfig::default();
        config.cache.validity_secs = Some(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("RATEBRIDGE_CACHE_MODE", "cache-aside"),
            ("RATEBRIDGE_CACHE_TTL_SECS", "5"),
            ("RATEBRIDGE_VALIDITY_SECS", "0"),
            ("RATEBRIDGE_SOURCES", "Kraken, coingecko"),
            ("RATEBRIDGE_EXTRA_CRYPTOS", "xyz,abc"),
            ("RATEBRIDGE_HTTP_TIMEOUT_MS", "not-a-number"),
        ]));

        assert_eq!(config.cache.mode, CacheMode::CacheAside);
        assert_eq!(config.cache.ttl(), Duration::from_secs(5));
        assert_eq!(config.cache.validity(), None);
        assert_eq!(config.http_timeout_ms, 5_000);
        assert_eq!(
            config.sources.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["kraken", "coingecko"]
        );
        assert_eq!(config.extra_cryptos, vec!["XYZ", "ABC"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_env_source_fails_validation() {
        let config = EngineConfig::from_lookup(lookup(&[("RATEBRIDGE_SOURCES", "kraken,nope")]));
        assert_eq!(
            config.validate(),
            Err("Source 'nope' has no adapters".to_string())
        );
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "cache": {"mode": "cache-aside", "ttl_secs": 10},
            "sources": [
                {"id": "kraken", "members": [{"type": "kraken"}, {"type": "bitstamp", "base_url": "http://mirror"}]},
                {"id": "peg", "cache": "none", "members": [
                    {"type": "static", "quotes": [{"pair": "USDT_USD", "bid": "1", "ask": "1"}]}
                ]}
            ]
        }"#;
        let config = EngineConfig::from_json(json).unwrap();

        assert_eq!(config.cache.mode, CacheMode::CacheAside);
        assert_eq!(config.cache.refresh_interval_secs, 60);
        assert_eq!(config.sources[0].members.len(), 2);
        assert_eq!(
            config.sources[0].members[1],
            AdapterConfig::Bitstamp {
                base_url: "http://mirror".into()
            }
        );
        assert_eq!(config.sources[1].cache, Some(CacheMode::None));
        assert!(config.validate().is_ok());

        assert!(matches!(
            EngineConfig::from_json("{\"cache\": 3}"),
            Err(FxError::Config(_))
        ));
    }
}
