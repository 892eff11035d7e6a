use crate::settings::MarketSettings;
use factstore::GeoResolver;
use std::collections::HashMap;

/// Geography manifest as seen by one source: the source's own keys, FIPS codes and
/// canonical geo ids all resolve to the canonical id. Lookups ignore case and surrounding whitespace.
#[derive(Debug, Clone, Default)]
pub struct ManifestResolver {
    by_key: HashMap<String, String>,
}

impl ManifestResolver {
    pub fn for_source(markets: &[MarketSettings], source_id: &str) -> Self {
        let mut by_key = HashMap::new();
        for market in markets {
            by_key.insert(normalize(&market.geo_id), market.geo_id.clone());
            if let Some(fips) = &market.fips {
                by_key.insert(normalize(fips), market.geo_id.clone());
            }
        }
        // source keys go last so they win over an identical geo id or FIPS of another market
        for market in markets {
            if let Some(key) = market.keys.get(source_id) {
                by_key.insert(normalize(key), market.geo_id.clone());
            }
        }
        Self { by_key }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

fn normalize(key: &str) -> String {
    key.trim().to_lowercase()
}

impl GeoResolver for ManifestResolver {
    fn resolve(&self, geo_key: &str) -> Option<String> {
        self.by_key.get(&normalize(geo_key)).cloned()
    }
}
