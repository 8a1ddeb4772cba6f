use std::collections::HashMap;

use fleet_domain::{AllocationStrategy, PurchasingOption};

/// Missing price data sorts a type to the back of a `lowest-price` /
/// `price-capacity-optimized` ranking.
const MISSING_PRICE: f64 = f64::MAX;

/// Missing interruption data is treated as the worst rank (AWS's own
/// advisor tool tops out at 4; 10 is deliberately worse than any real
/// value so unknown types never beat observed ones).
const MISSING_INTERRUPTION_RANK: u8 = 10;

/// Orders a nodegroup's instance-type list per its allocation strategy.
///
/// `purchasing_option = on-demand` always forces `rank` regardless of the
/// nodegroup's configured strategy — spot pricing and interruption data
/// are meaningless for on-demand capacity.
pub fn rank_instance_types(
    instances: &[String],
    strategy: AllocationStrategy,
    purchasing_option: PurchasingOption,
    prices: &HashMap<String, f64>,
    interruption_rates: &HashMap<String, u8>,
) -> Vec<String> {
    let effective_strategy = if matches!(purchasing_option, PurchasingOption::OnDemand) {
        AllocationStrategy::Rank
    } else {
        strategy
    };

    let mut ranked: Vec<String> = instances.to_vec();
    match effective_strategy {
        AllocationStrategy::Rank => {}
        AllocationStrategy::LowestPrice => {
            ranked.sort_by(|a, b| {
                price_of(a, prices)
                    .partial_cmp(&price_of(b, prices))
                    .expect("prices are never NaN")
            });
        }
        AllocationStrategy::CapacityOptimized => {
            ranked.sort_by_key(|t| interruption_rank(t, interruption_rates));
        }
        AllocationStrategy::PriceCapacityOptimized => {
            ranked.sort_by(|a, b| {
                let score_a = combined_score(a, prices, interruption_rates);
                let score_b = combined_score(b, prices, interruption_rates);
                score_a.partial_cmp(&score_b).expect("scores are never NaN")
            });
        }
    }
    ranked
}

fn price_of(instance_type: &str, prices: &HashMap<String, f64>) -> f64 {
    prices.get(instance_type).copied().unwrap_or(MISSING_PRICE)
}

fn interruption_rank(instance_type: &str, rates: &HashMap<String, u8>) -> u8 {
    rates
        .get(instance_type)
        .copied()
        .unwrap_or(MISSING_INTERRUPTION_RANK)
}

fn combined_score(
    instance_type: &str,
    prices: &HashMap<String, f64>,
    interruption_rates: &HashMap<String, u8>,
) -> f64 {
    (interruption_rank(instance_type, interruption_rates) as f64 + 3.0)
        * price_of(instance_type, prices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rank_preserves_user_order() {
        let instances = types(&["m5.xlarge", "m5.large"]);
        let out = rank_instance_types(
            &instances,
            AllocationStrategy::Rank,
            PurchasingOption::Spot,
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(out, instances);
    }

    #[test]
    fn on_demand_forces_rank_regardless_of_strategy() {
        let instances = types(&["m5.xlarge", "m5.large"]);
        let mut prices = HashMap::new();
        prices.insert("m5.large".to_string(), 0.01);
        prices.insert("m5.xlarge".to_string(), 0.20);
        let out = rank_instance_types(
            &instances,
            AllocationStrategy::LowestPrice,
            PurchasingOption::OnDemand,
            &prices,
            &HashMap::new(),
        );
        assert_eq!(out, instances);
    }

    #[test]
    fn lowest_price_sorts_ascending_and_pushes_unknown_last() {
        let instances = types(&["m5.large", "m5.xlarge", "c5.large"]);
        let mut prices = HashMap::new();
        prices.insert("m5.large".to_string(), 0.05);
        prices.insert("m5.xlarge".to_string(), 0.02);
        // c5.large has no price entry.
        let out = rank_instance_types(
            &instances,
            AllocationStrategy::LowestPrice,
            PurchasingOption::Spot,
            &prices,
            &HashMap::new(),
        );
        assert_eq!(out, types(&["m5.xlarge", "m5.large", "c5.large"]));
    }

    #[test]
    fn capacity_optimized_sorts_by_interruption_rank() {
        let instances = types(&["m5.large", "m5.xlarge"]);
        let mut rates = HashMap::new();
        rates.insert("m5.large".to_string(), 3u8);
        rates.insert("m5.xlarge".to_string(), 1u8);
        let out = rank_instance_types(
            &instances,
            AllocationStrategy::CapacityOptimized,
            PurchasingOption::Spot,
            &HashMap::new(),
            &rates,
        );
        assert_eq!(out, types(&["m5.xlarge", "m5.large"]));
    }

    #[test]
    fn price_capacity_optimized_combines_both_signals() {
        let instances = types(&["a", "b"]);
        let mut prices = HashMap::new();
        prices.insert("a".to_string(), 1.0);
        prices.insert("b".to_string(), 1.0);
        let mut rates = HashMap::new();
        rates.insert("a".to_string(), 5u8);
        rates.insert("b".to_string(), 1u8);
        // score(a) = (5+3)*1 = 8, score(b) = (1+3)*1 = 4
        let out = rank_instance_types(
            &instances,
            AllocationStrategy::PriceCapacityOptimized,
            PurchasingOption::Spot,
            &prices,
            &rates,
        );
        assert_eq!(out, types(&["b", "a"]));
    }
}
