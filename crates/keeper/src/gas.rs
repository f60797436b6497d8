//! Gas pricing for bid submissions: a geometric escalation schedule over the
//! node's baseline, overridden verbatim whenever the model names a price.

use {alloy_primitives::U256, std::time::Duration};

#[derive(Debug, Clone)]
pub struct GasConfig {
    /// Factor applied to the node baseline on the first attempt.
    pub initial_multiplier: f64,
    /// Growth factor applied every [`Self::update_interval`].
    pub reactive_multiplier: f64,
    pub update_interval: Duration,
    /// Hard cap on the scheduled price. Model overrides are not capped.
    pub maximum: Option<U256>,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            initial_multiplier: 1.0,
            reactive_multiplier: 1.125,
            update_interval: Duration::from_secs(30),
            maximum: None,
        }
    }
}

impl GasConfig {
    /// The price to attach to an attempt `elapsed` after the first submit.
    ///
    /// Returns `None` when neither a model override nor a node baseline is
    /// available; the submission is deferred until one is.
    pub fn price(
        &self,
        elapsed: Duration,
        node_price: Option<U256>,
        model_override: Option<U256>,
    ) -> Option<U256> {
        if let Some(fixed) = model_override {
            return Some(fixed);
        }
        let base = node_price?;
        let steps = i32::try_from(elapsed.as_secs() / self.update_interval.as_secs().max(1))
            .unwrap_or(i32::MAX);
        let multiplier = self.initial_multiplier * self.reactive_multiplier.powi(steps);
        let scheduled = mul_ceil(base, multiplier);
        Some(match self.maximum {
            Some(maximum) => scheduled.min(maximum),
            None => scheduled,
        })
    }
}

/// The lowest gas price the mempool accepts as a replacement for a pending
/// transaction priced at `previous`: `ceil(previous · 1.125)`.
pub fn minimum_replacement(previous: U256) -> U256 {
    (previous * U256::from(1125) + U256::from(999)) / U256::from(1000)
}

fn mul_ceil(value: U256, factor: f64) -> U256 {
    let value = u128::try_from(value).unwrap_or(u128::MAX);
    // Gas prices fit comfortably in the f64 mantissa's exact integer range;
    // the ceil keeps the result on the accepting side of node thresholds.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = (value as f64 * factor).ceil() as u128;
    U256::from(scaled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000u64)
    }

    #[test]
    fn follows_the_geometric_schedule() {
        let config = GasConfig::default();
        let base = Some(gwei(100));
        assert_eq!(config.price(Duration::ZERO, base, None), Some(gwei(100)));
        assert_eq!(
            config.price(Duration::from_secs(29), base, None),
            Some(gwei(100))
        );
        // One step: 100 gwei * 1.125.
        assert_eq!(
            config.price(Duration::from_secs(30), base, None),
            Some(U256::from(112_500_000_000u64))
        );
        // Four steps: 100 * 1.125^4 ≈ 160.18 gwei.
        assert_eq!(
            config.price(Duration::from_secs(125), base, None),
            Some(U256::from(160_180_664_063u64))
        );
    }

    #[test]
    fn model_override_is_verbatim() {
        let config = GasConfig {
            maximum: Some(gwei(10)),
            ..Default::default()
        };
        // Neither schedule nor cap applies to an explicit model price.
        assert_eq!(
            config.price(Duration::from_secs(300), Some(gwei(100)), Some(gwei(50))),
            Some(gwei(50))
        );
    }

    #[test]
    fn schedule_respects_the_cap() {
        let config = GasConfig {
            maximum: Some(gwei(120)),
            ..Default::default()
        };
        assert_eq!(
            config.price(Duration::from_secs(3600), Some(gwei(100)), None),
            Some(gwei(120))
        );
    }

    #[test]
    fn defers_without_any_source() {
        let config = GasConfig::default();
        assert_eq!(config.price(Duration::ZERO, None, None), None);
    }

    #[test]
    fn replacement_floor_is_a_ceiled_bump() {
        assert_eq!(minimum_replacement(U256::from(1000)), U256::from(1125));
        assert_eq!(minimum_replacement(U256::from(1001)), U256::from(1127));
        assert!(minimum_replacement(gwei(1)) > gwei(1));
    }
}
