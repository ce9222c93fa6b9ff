//! Worker configuration, loaded once from TOML and shared by `Arc`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bitcoin::{Amount, FeeRate, Network};
use serde::{Deserialize, Serialize};

use crate::fee_oracle::FeeTier;
use crate::utils::constants::{DEFAULT_PADDING, DUST_LIMIT};
use crate::wallet::{FeeDestination, FeeDestinationRecord};
use crate::{OrdError, OrdResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub network: Network,
    pub chain: ChainConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub fees: FeesConfig,
    pub keys: KeysConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Esplora-compatible REST API
    Indexer,
    /// Electrum server, `host:port`
    Electrum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub backend: BackendKind,
    pub url: String,
    #[serde(default = "default_call_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Concurrent chain lookups
    pub pool_size: usize,
    /// Requests examined per run
    pub batch_size: usize,
    pub interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub expire_after_secs: u64,
    pub stale_funded_after_secs: u64,
    /// Re-publications of a funded request whose genesis never happened
    pub max_republish: u32,
    pub accept_unconfirmed: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            batch_size: 100,
            interval_secs: 30,
            backoff_base_secs: 30,
            backoff_max_secs: 30 * 60,
            expire_after_secs: 24 * 60 * 60,
            stale_funded_after_secs: 10 * 60,
            max_republish: 3,
            accept_unconfirmed: false,
        }
    }
}

impl PollerConfig {
    /// Delay before the next check of a request already checked `times_checked` times.
    pub fn backoff(&self, times_checked: u32) -> Duration {
        let factor = 1u64.checked_shl(times_checked).unwrap_or(u64::MAX);
        Duration::from_secs(
            self.backoff_base_secs
                .saturating_mul(factor)
                .min(self.backoff_max_secs),
        )
    }

    pub fn expire_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expire_after_secs as i64)
    }

    pub fn stale_funded_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_funded_after_secs as i64)
    }

    /// Wait after the `times`-th re-publication of a stale funded request: the staleness
    /// window, doubled each time.
    pub fn republish_backoff(&self, times: u32) -> chrono::Duration {
        self.stale_funded_after() * (1i32 << times.min(16))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deliveries of one message before it is dead-lettered
    pub max_receives: u32,
    pub retry_delay_secs: u64,
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_receives: 20,
            retry_delay_secs: 60,
            visibility_timeout_secs: 60,
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeesConfig {
    pub cache_ttl_secs: u64,
    pub tier: FeeTier,
    /// Reveal miner fee rate above which the surplus goes to the fee destinations
    pub max_reveal_rate_sat_vb: Option<u64>,
    /// Fee API, when the chain backend is not an indexer
    pub source_url: Option<String>,
    pub padding_sat: u64,
    pub tip_sat: u64,
    pub fee_destinations: Vec<FeeDestinationRecord>,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 10,
            tier: FeeTier::default(),
            max_reveal_rate_sat_vb: None,
            source_url: None,
            padding_sat: DEFAULT_PADDING,
            tip_sat: 0,
            fee_destinations: Vec::new(),
        }
    }
}

impl FeesConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn max_reveal_rate(&self) -> Option<FeeRate> {
        self.max_reveal_rate_sat_vb
            .and_then(FeeRate::from_sat_per_vb)
    }

    pub fn padding(&self) -> Amount {
        Amount::from_sat(self.padding_sat)
    }

    pub fn tip(&self) -> Amount {
        Amount::from_sat(self.tip_sat)
    }

    pub fn fee_destinations(&self, network: Network) -> OrdResult<Vec<FeeDestination>> {
        self.fee_destinations
            .iter()
            .map(|record| FeeDestination::from_record(record, network))
            .collect()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Hex of the 32-byte master key wrapping document keys
    pub master_key: String,
}

impl std::fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysConfig")
            .field("master_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the document store; kept in memory when unset
    pub documents_dir: Option<PathBuf>,
    /// redb database holding funding records, collections and queues; kept in memory when
    /// unset
    pub state_path: Option<PathBuf>,
}

fn default_call_timeout() -> u64 {
    10
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> OrdResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            OrdError::Config(format!("cannot read {}: {e}", path.display()))
        })?;

        Self::from_toml(&text)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(text: &str) -> OrdResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| OrdError::Config(format!("invalid config: {e}")))?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> OrdResult<()> {
        let invalid = |msg: &str| Err(OrdError::Config(msg.to_string()));

        if self.chain.url.trim().is_empty() {
            return invalid("chain.url is empty");
        }
        if self.chain.timeout_secs == 0 {
            return invalid("chain.timeout_secs must be positive");
        }
        if self.poller.pool_size == 0 || self.poller.batch_size == 0 {
            return invalid("poller.pool_size and poller.batch_size must be positive");
        }
        if self.poller.backoff_base_secs == 0
            || self.poller.backoff_base_secs > self.poller.backoff_max_secs
        {
            return invalid("poller backoff must satisfy 0 < base <= max");
        }
        if self.queue.max_receives == 0 {
            return invalid("queue.max_receives must be positive");
        }
        if self.fees.padding_sat < DUST_LIMIT {
            return invalid("fees.padding_sat is below the dust limit");
        }
        if self.fees.tip_sat > 0 && self.fees.fee_destinations.is_empty() {
            return invalid("fees.tip_sat needs at least one fee destination");
        }
        if self.fees.max_reveal_rate_sat_vb.is_some() && self.fees.max_reveal_rate().is_none() {
            return invalid("fees.max_reveal_rate_sat_vb overflows");
        }
        if self.chain.backend == BackendKind::Electrum && self.fees.source_url.is_none() {
            return invalid("fees.source_url is required with an electrum backend");
        }
        self.fees.fee_destinations(self.network)?;

        let master_key = hex::decode(&self.keys.master_key)
            .map_err(|e| OrdError::Config(format!("keys.master_key: {e}")))?;
        if master_key.len() != 32 {
            return invalid("keys.master_key must be 32 bytes");
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.timeout_secs)
    }

    /// Fee API base url: the configured source, else the indexer itself.
    pub fn fee_source_url(&self) -> &str {
        self.fees.source_url.as_deref().unwrap_or(&self.chain.url)
    }
}

impl std::str::FromStr for Config {
    type Err = OrdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_toml(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn minimal() -> String {
        format!(
            r#"
            network = "regtest"

            [chain]
            backend = "indexer"
            url = "http://localhost:3002"

            [keys]
            master_key = "{MASTER_KEY}"
            "#
        )
    }

    #[test]
    fn should_load_with_defaults() {
        let config = Config::from_toml(&minimal()).unwrap();

        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.chain.backend, BackendKind::Indexer);
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
        assert_eq!(config.poller, PollerConfig::default());
        assert_eq!(config.fees.cache_ttl(), Duration::from_secs(10));
        assert_eq!(config.fees.padding(), Amount::from_sat(546));
        assert_eq!(config.fee_source_url(), "http://localhost:3002");
        assert_eq!(config.storage.documents_dir, None);
        assert!(!format!("{:?}", config.keys).contains(MASTER_KEY));
    }

    #[test]
    fn should_load_full_config() {
        let text = format!(
            r#"
            network = "testnet"

            [chain]
            backend = "electrum"
            url = "electrum.example.org:50001"
            timeout_secs = 5

            [poller]
            pool_size = 4
            backoff_base_secs = 10
            backoff_max_secs = 60

            [queue]
            max_receives = 3

            [fees]
            tier = "fastest"
            max_reveal_rate_sat_vb = 50
            source_url = "https://mempool.space/testnet/api"
            tip_sat = 1000
            fee_destinations = [
                {{ address = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx", weight = 100 }},
            ]

            [keys]
            master_key = "{MASTER_KEY}"

            [storage]
            documents_dir = "/var/lib/ord-funder"
            state_path = "/var/lib/ord-funder/state.redb"
            "#
        );
        let config: Config = text.parse().unwrap();

        assert_eq!(config.chain.backend, BackendKind::Electrum);
        assert_eq!(config.poller.pool_size, 4);
        assert_eq!(config.poller.batch_size, 100);
        assert_eq!(config.queue.max_receives, 3);
        assert_eq!(config.fees.tier, FeeTier::Fastest);
        assert_eq!(
            config.fees.max_reveal_rate(),
            FeeRate::from_sat_per_vb(50)
        );
        assert_eq!(config.fee_source_url(), "https://mempool.space/testnet/api");
        assert_eq!(config.fees.fee_destinations(config.network).unwrap().len(), 1);
        assert_eq!(
            config.storage.state_path,
            Some(PathBuf::from("/var/lib/ord-funder/state.redb"))
        );
        assert_eq!(config.poller.max_republish, 3);
    }

    #[test]
    fn should_back_off_exponentially_up_to_max() {
        let poller = PollerConfig {
            backoff_base_secs: 30,
            backoff_max_secs: 600,
            ..Default::default()
        };

        assert_eq!(poller.backoff(0), Duration::from_secs(30));
        assert_eq!(poller.backoff(1), Duration::from_secs(60));
        assert_eq!(poller.backoff(3), Duration::from_secs(240));
        assert_eq!(poller.backoff(5), Duration::from_secs(600));
        assert_eq!(poller.backoff(80), Duration::from_secs(600));
    }

    #[test]
    fn should_double_republish_backoff() {
        let poller = PollerConfig::default();

        assert_eq!(poller.republish_backoff(0), chrono::Duration::minutes(10));
        assert_eq!(poller.republish_backoff(2), chrono::Duration::minutes(40));
        assert_eq!(poller.republish_backoff(40), poller.republish_backoff(16));
    }

    #[test]
    fn should_reject_invalid_config() {
        let mut config = Config::from_toml(&minimal()).unwrap();
        config.keys.master_key = "0011".to_string();
        assert!(matches!(config.validate(), Err(OrdError::Config(_))));

        let mut config = Config::from_toml(&minimal()).unwrap();
        config.poller.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(&minimal()).unwrap();
        config.fees.tip_sat = 500;
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(&minimal()).unwrap();
        config.chain.backend = BackendKind::Electrum;
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(&minimal()).unwrap();
        config.fees.padding_sat = 100;
        assert!(config.validate().is_err());

        assert!(Config::from_toml("network = \"regtest\"").is_err());
    }
}
