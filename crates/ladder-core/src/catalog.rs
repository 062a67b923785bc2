//! In-process [`TierCatalog`] built from a configured price list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AmountError, CatalogError};
use crate::traits::TierCatalog;
use crate::types::{Amount, TierNo, TrackId};

/// Prices for one track, tier 1 first, as decimal strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPrices {
    pub track: u32,
    pub prices: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaticCatalog {
    prices: BTreeMap<(TrackId, TierNo), Amount>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, track: TrackId, tier: TierNo, price: Amount) -> Self {
        self.prices.insert((track, tier), price);
        self
    }

    /// Consecutive tiers starting at 1.
    pub fn with_track(mut self, track: TrackId, prices: &[Amount]) -> Self {
        for (tier, price) in (1..).zip(prices) {
            self.prices.insert((track, tier), *price);
        }
        self
    }

    pub fn from_config(tracks: &[TrackPrices]) -> Result<Self, AmountError> {
        let mut catalog = Self::new();
        for entry in tracks {
            let prices = entry
                .prices
                .iter()
                .map(|p| Amount::from_decimal(p))
                .collect::<Result<Vec<_>, _>>()?;
            catalog = catalog.with_track(TrackId(entry.track), &prices);
        }
        Ok(catalog)
    }

    /// Highest offered tier of a track.
    pub fn max_tier(&self, track: TrackId) -> Option<TierNo> {
        self.prices.keys().filter(|(t, _)| *t == track).map(|(_, tier)| *tier).max()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl TierCatalog for StaticCatalog {
    fn price(&self, track: TrackId, tier: TierNo) -> Result<Option<Amount>, CatalogError> {
        Ok(self.prices.get(&(track, tier)).copied())
    }
}
