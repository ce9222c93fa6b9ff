//! Recommended fee tiers, cached per network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{FeeRate, Network};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{OrdError, OrdResult};

/// Default lifetime of cached fee tiers.
pub const FEE_CACHE_TTL: Duration = Duration::from_secs(10);

/// Fee tiers in sat/vB, as served by `GET /v1/fees/recommended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedFees {
    pub fastest_fee: u64,
    pub half_hour_fee: u64,
    pub hour_fee: u64,
    pub economy_fee: u64,
    pub minimum_fee: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeTier {
    Fastest,
    #[default]
    HalfHour,
    Hour,
    Economy,
    Minimum,
}

impl RecommendedFees {
    pub fn rate(&self, tier: FeeTier) -> FeeRate {
        let sat_vb = match tier {
            FeeTier::Fastest => self.fastest_fee,
            FeeTier::HalfHour => self.half_hour_fee,
            FeeTier::Hour => self.hour_fee,
            FeeTier::Economy => self.economy_fee,
            FeeTier::Minimum => self.minimum_fee,
        };

        FeeRate::from_sat_per_vb(sat_vb).unwrap_or(FeeRate::MAX)
    }
}

/// Service publishing recommended fees for one network.
#[async_trait::async_trait]
pub trait FeeSource: Send + Sync {
    async fn recommended_fees(&self) -> OrdResult<RecommendedFees>;
}

/// Process-local fee cache in front of one [`FeeSource`] per network.
pub struct FeeOracle {
    sources: HashMap<Network, Arc<dyn FeeSource>>,
    ttl: Duration,
    cache: Mutex<HashMap<Network, (Instant, RecommendedFees)>>,
}

impl FeeOracle {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sources: HashMap::new(),
            ttl,
            cache: Mutex::default(),
        }
    }

    pub fn with_source(mut self, network: Network, source: Arc<dyn FeeSource>) -> Self {
        self.sources.insert(network, source);
        self
    }

    /// Recommended fees for `network`, fetched at most once per TTL.
    pub async fn recommended_fees(&self, network: Network) -> OrdResult<RecommendedFees> {
        if let Some((fetched_at, fees)) = self.cache.lock().get(&network) {
            if fetched_at.elapsed() < self.ttl {
                return Ok(*fees);
            }
        }

        let source = self
            .sources
            .get(&network)
            .ok_or_else(|| OrdError::Config(format!("no fee source for {network}")))?;
        let fees = source.recommended_fees().await?;
        debug!("recommended fees for {network}: {fees:?}");

        self.cache.lock().insert(network, (Instant::now(), fees));

        Ok(fees)
    }

    pub async fn fee_rate(&self, network: Network, tier: FeeTier) -> OrdResult<FeeRate> {
        Ok(self.recommended_fees(network).await?.rate(tier))
    }
}
