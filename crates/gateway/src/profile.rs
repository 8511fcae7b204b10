//! Volume-at-price market profile built from one-minute bars.
//!
//! Each bar's volume is spread evenly over the price buckets between its low
//! and high, counted as buy volume on an up bar (`close >= open`) and sell
//! volume otherwise. Bars carry a sequence number that is only meaningful
//! within one upstream connection: a lower sequence than the last one seen
//! means the epoch changed and the profile starts over.

use crate::types::{M1Bar, Source, SubscriptionKey};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Bars spanning more buckets than this are treated as malformed and skipped.
pub const MAX_LEVELS_PER_BAR: u64 = 512;

/// Largest decimal scale a price can carry.
pub const MAX_PRICE_DIGITS: u32 = 28;

/// Volume traded at one price bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketProfileLevel {
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

impl MarketProfileLevel {
    pub fn total_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }
}

/// Levels touched by one bar.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDelta {
    /// The profile was cleared before this bar was applied.
    pub reset: bool,
    pub levels: Vec<MarketProfileLevel>,
}

#[derive(Debug)]
struct SymbolProfile {
    digits: u32,
    bucket_size: Decimal,
    levels: BTreeMap<Decimal, MarketProfileLevel>,
    last_sequence: Option<u64>,
}

impl SymbolProfile {
    fn bucket_of(&self, price: f64) -> Option<Decimal> {
        let price = Decimal::from_f64(price)?.round_dp(self.digits);
        price
            .checked_div(self.bucket_size)?
            .floor()
            .checked_mul(self.bucket_size)
    }

    /// Spread the bar over its buckets; returns touched bucket prices.
    fn apply(&mut self, bar: &M1Bar) -> Vec<Decimal> {
        let (Some(low), Some(high)) = (self.bucket_of(bar.low), self.bucket_of(bar.high)) else {
            debug!("Skipping {} bar with unrepresentable prices", bar.symbol);
            return Vec::new();
        };
        if high < low {
            debug!("Skipping {} bar with high below low", bar.symbol);
            return Vec::new();
        }

        let count = (high - low)
            .checked_div(self.bucket_size)
            .and_then(|n| n.to_u64())
            .unwrap_or(u64::MAX)
            .saturating_add(1);
        if count > MAX_LEVELS_PER_BAR {
            debug!("Skipping {} bar spanning {} buckets", bar.symbol, count);
            return Vec::new();
        }

        // Unknown volume counts as one unit of time at price.
        let volume = if bar.volume > 0.0 { bar.volume } else { 1.0 };
        let share = volume / count as f64;
        let is_buy = bar.close >= bar.open;

        let mut touched = Vec::with_capacity(count as usize);
        let mut price = low;
        while price <= high {
            let level = self.levels.entry(price).or_insert_with(|| MarketProfileLevel {
                price,
                buy_volume: 0.0,
                sell_volume: 0.0,
            });
            if is_buy {
                level.buy_volume += share;
            } else {
                level.sell_volume += share;
            }
            touched.push(price);
            price += self.bucket_size;
        }
        touched
    }

    fn snapshot(&self) -> Vec<MarketProfileLevel> {
        self.levels.values().cloned().collect()
    }

    fn levels_at(&self, prices: &BTreeSet<Decimal>) -> Vec<MarketProfileLevel> {
        prices
            .iter()
            .filter_map(|p| self.levels.get(p).cloned())
            .collect()
    }
}

/// Market profiles per symbol and source.
#[derive(Debug, Default)]
pub struct MarketProfileService {
    profiles: HashMap<SubscriptionKey, SymbolProfile>,
}

impl MarketProfileService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket width of `points` price points at `digits` decimals, or None
    /// when `digits` is beyond what a price can carry.
    pub fn bucket_size(points: u32, digits: u32) -> Option<Decimal> {
        Decimal::try_new(i64::from(points.max(1)), digits).ok()
    }

    /// Build (or rebuild) a symbol's profile from historical bars.
    /// Returns the full profile sorted by price.
    pub fn seed(
        &mut self,
        key: &SubscriptionKey,
        digits: u32,
        bucket_size: Decimal,
        bars: &[M1Bar],
    ) -> Vec<MarketProfileLevel> {
        let mut profile = SymbolProfile {
            digits,
            bucket_size,
            levels: BTreeMap::new(),
            last_sequence: None,
        };
        for bar in bars {
            profile.apply(bar);
        }
        let snapshot = profile.snapshot();
        debug!("Seeded {} profile with {} bars, {} levels", key, bars.len(), snapshot.len());
        self.profiles.insert(key.clone(), profile);
        snapshot
    }

    /// Apply a live bar. Returns the changed levels, or None when the symbol has
    /// no profile or the bar repeats the last sequence number.
    pub fn on_bar(&mut self, key: &SubscriptionKey, bar: &M1Bar) -> Option<ProfileDelta> {
        let profile = self.profiles.get_mut(key)?;

        let mut reset = false;
        match profile.last_sequence {
            Some(last) if bar.sequence == last => return None,
            Some(last) if bar.sequence < last => {
                info!(
                    "{} bar sequence went back from {} to {}, resetting profile",
                    key, last, bar.sequence
                );
                profile.levels.clear();
                reset = true;
            }
            _ => {}
        }
        profile.last_sequence = Some(bar.sequence);

        let touched: BTreeSet<Decimal> = profile.apply(bar).into_iter().collect();
        Some(ProfileDelta {
            reset,
            levels: profile.levels_at(&touched),
        })
    }

    /// Clear a symbol's accumulated state at the start of a new connection epoch.
    pub fn reset_sequence(&mut self, key: &SubscriptionKey) {
        if let Some(profile) = self.profiles.get_mut(key) {
            profile.levels.clear();
            profile.last_sequence = None;
            debug!("Reset {} profile for new connection epoch", key);
        }
    }

    pub fn remove(&mut self, key: &SubscriptionKey) -> bool {
        self.profiles.remove(key).is_some()
    }

    /// Full profile sorted by price.
    #[cfg(test)]
    pub fn levels(&self, key: &SubscriptionKey) -> Vec<MarketProfileLevel> {
        self.profiles
            .get(key)
            .map(SymbolProfile::snapshot)
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.profiles.contains_key(key)
    }

    /// Profiled keys on `source`.
    pub fn keys_for_source(&self, source: Source) -> Vec<SubscriptionKey> {
        self.profiles
            .keys()
            .filter(|k| k.source == source)
            .cloned()
            .collect()
    }
}
