//! Business-unit name and trade resolution.

use std::collections::HashMap;

use fieldops_core::{BusinessUnit, ExternalJob, Trade};
use fieldops_client::FieldServiceApi;
use tracing::warn;

/// Resolves business-unit ids to display names and a trade classification,
/// seeded from the active-unit list plus the configurable override table.
pub struct TradeResolver {
    overrides: HashMap<String, Trade>,
    names: HashMap<i64, String>,
    trades: HashMap<i64, Trade>,
}

impl TradeResolver {
    pub fn new(units: &[BusinessUnit], overrides: HashMap<String, Trade>) -> Self {
        let mut resolver = Self {
            overrides,
            names: HashMap::new(),
            trades: HashMap::new(),
        };
        for unit in units {
            resolver.insert_unit(unit);
        }
        resolver
    }

    fn insert_unit(&mut self, unit: &BusinessUnit) {
        let trade = self.classify(&unit.name);
        self.names.insert(unit.id, unit.name.clone());
        self.trades.insert(unit.id, trade);
    }

    /// Override table first, then the substring heuristic, then hvac.
    pub fn classify(&self, name: &str) -> Trade {
        if let Some(trade) = self.overrides.get(name) {
            return *trade;
        }
        if name.to_lowercase().contains("plumb") {
            Trade::Plumbing
        } else {
            Trade::Hvac
        }
    }

    pub fn knows(&self, id: i64) -> bool {
        self.trades.contains_key(&id)
    }

    /// Point-lookup exactly the ids that jobs reference but the active-unit
    /// list did not contain (deactivated or deleted units). A failed lookup
    /// is a soft miss; that job falls back to its own carried name.
    pub async fn resolve_missing(&mut self, api: &dyn FieldServiceApi, ids: &[i64]) {
        for &id in ids {
            if self.knows(id) {
                continue;
            }
            match api.business_unit(id).await {
                Ok(unit) => self.insert_unit(&unit),
                Err(err) => warn!(
                    business_unit_id = id,
                    error = %err,
                    "business unit lookup failed; using the name carried on the job"
                ),
            }
        }
    }

    pub fn trade_for(&self, job: &ExternalJob) -> Trade {
        if let Some(id) = job.business_unit_id {
            if let Some(trade) = self.trades.get(&id) {
                return *trade;
            }
        }
        match &job.business_unit_name {
            Some(name) => self.classify(name),
            None => Trade::Hvac,
        }
    }

    pub fn unit_name_for(&self, job: &ExternalJob) -> Option<String> {
        job.business_unit_id
            .and_then(|id| self.names.get(&id).cloned())
            .or_else(|| job.business_unit_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{job, FakeApi};

    fn unit(id: i64, name: &str) -> BusinessUnit {
        BusinessUnit {
            id,
            name: name.to_string(),
            active: true,
        }
    }

    #[test]
    fn override_beats_substring_heuristic() {
        let overrides = HashMap::from([("Drain Rescue".to_string(), Trade::Hvac)]);
        let resolver = TradeResolver::new(&[unit(1, "Drain Rescue")], overrides);

        let mut j = job(1);
        j.business_unit_id = Some(1);
        assert_eq!(resolver.trade_for(&j), Trade::Hvac);
    }

    #[test]
    fn substring_heuristic_is_case_insensitive() {
        let resolver = TradeResolver::new(
            &[unit(1, "Residential PLUMBING"), unit(2, "Air Comfort")],
            HashMap::new(),
        );

        let mut plumbing = job(1);
        plumbing.business_unit_id = Some(1);
        let mut hvac = job(2);
        hvac.business_unit_id = Some(2);

        assert_eq!(resolver.trade_for(&plumbing), Trade::Plumbing);
        assert_eq!(resolver.trade_for(&hvac), Trade::Hvac);
    }

    #[test]
    fn unknown_unit_falls_back_to_job_carried_name_then_hvac() {
        let resolver = TradeResolver::new(&[], HashMap::new());

        let mut named = job(1);
        named.business_unit_id = Some(99);
        named.business_unit_name = Some("Plumbing South".to_string());
        assert_eq!(resolver.trade_for(&named), Trade::Plumbing);
        assert_eq!(resolver.unit_name_for(&named).as_deref(), Some("Plumbing South"));

        let mut bare = job(2);
        bare.business_unit_id = Some(99);
        assert_eq!(resolver.trade_for(&bare), Trade::Hvac);
        assert_eq!(resolver.unit_name_for(&bare), None);
    }

    #[tokio::test]
    async fn point_lookup_fills_missing_units() {
        let mut api = FakeApi::default();
        api.unit_lookups.insert(99, unit(99, "Metro Plumbing Crew"));

        let mut resolver = TradeResolver::new(&[], HashMap::new());
        resolver.resolve_missing(&api, &[99, 100]).await;

        let mut j = job(1);
        j.business_unit_id = Some(99);
        assert_eq!(resolver.trade_for(&j), Trade::Plumbing);
        assert_eq!(resolver.unit_name_for(&j).as_deref(), Some("Metro Plumbing Crew"));

        // id 100 had no upstream record; jobs referencing it keep falling back
        assert!(!resolver.knows(100));
    }
}
