use std::collections::{HashMap, HashSet};

pub const UNKNOWN_PLAN: &str = "unknown";

/// Static price→plan mapping plus the set of metered price ids, both from
/// config (`PLAN_PRICE_MAP="price_123=starter,price_456=pro"`).
#[derive(Clone, Debug, Default)]
pub struct PlanMap {
    plans: HashMap<String, String>,
    metered: HashSet<String>,
}

impl PlanMap {
    pub fn parse(plan_price_map: &str, metered_price_ids: &str) -> Self {
        let mut plans = HashMap::new();
        for pair in plan_price_map.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((price, plan)) if !price.trim().is_empty() && !plan.trim().is_empty() => {
                    plans.insert(price.trim().to_string(), plan.trim().to_string());
                }
                _ => {
                    tracing::warn!(entry = pair, "ignoring malformed PLAN_PRICE_MAP entry");
                }
            }
        }

        let metered = metered_price_ids
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        Self { plans, metered }
    }

    /// Unmapped ids resolve to the `"unknown"` sentinel, never an error.
    pub fn plan_for_price(&self, price_id: Option<&str>) -> &str {
        price_id
            .and_then(|id| self.plans.get(id))
            .map(|s| s.as_str())
            .unwrap_or(UNKNOWN_PLAN)
    }

    pub fn is_metered(&self, price_id: &str) -> bool {
        self.metered.contains(price_id)
    }
}
