//! Token-throughput budget model (§4.2 step 7): turns an expected duration
//! into an expected USD budget. Every constant is environment-tunable with
//! a documented clamp so operators can correct for pricing changes without
//! a rebuild.

fn env_f64(key: &str, default: f64, min: f64, max: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub cached_input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetConstants {
    pub share_gpt: f64,
    pub share_opus: f64,
    pub gpt: ModelPricing,
    pub opus: ModelPricing,
    pub input_share: f64,
    pub cached_share: f64,
    pub tokens_per_hour: f64,
    pub contingency: f64,
    pub rounding_step_usd: f64,
}

impl BudgetConstants {
    /// Reads every `ORGX_BUDGET_*` override once; unset values take the
    /// documented defaults. Clamps keep a typo'd env var from producing a
    /// nonsensical budget rather than failing startup.
    pub fn from_env() -> Self {
        Self {
            share_gpt: env_f64("ORGX_BUDGET_SHARE_GPT", 0.5, 0.0, 1.0),
            share_opus: env_f64("ORGX_BUDGET_SHARE_OPUS", 0.5, 0.0, 1.0),
            gpt: ModelPricing {
                input: env_f64("ORGX_BUDGET_GPT_INPUT", 2.5, 0.0, 1000.0),
                cached_input: env_f64("ORGX_BUDGET_GPT_CACHED_INPUT", 1.25, 0.0, 1000.0),
                output: env_f64("ORGX_BUDGET_GPT_OUTPUT", 10.0, 0.0, 1000.0),
            },
            opus: ModelPricing {
                input: env_f64("ORGX_BUDGET_OPUS_INPUT", 15.0, 0.0, 1000.0),
                cached_input: env_f64("ORGX_BUDGET_OPUS_CACHED_INPUT", 1.5, 0.0, 1000.0),
                output: env_f64("ORGX_BUDGET_OPUS_OUTPUT", 75.0, 0.0, 1000.0),
            },
            input_share: env_f64("ORGX_BUDGET_INPUT_SHARE", 0.7, 0.0, 1.0),
            cached_share: env_f64("ORGX_BUDGET_CACHED_SHARE", 0.5, 0.0, 1.0),
            tokens_per_hour: env_f64("ORGX_BUDGET_TOKENS_PER_HOUR", 400_000.0, 1.0, 1.0e9),
            contingency: env_f64("ORGX_BUDGET_CONTINGENCY", 1.2, 1.0, 10.0),
            rounding_step_usd: env_f64("ORGX_BUDGET_ROUNDING_STEP_USD", 5.0, 0.01, 1000.0),
        }
    }

    pub fn test_default() -> Self {
        Self {
            share_gpt: 0.5,
            share_opus: 0.5,
            gpt: ModelPricing {
                input: 2.5,
                cached_input: 1.25,
                output: 10.0,
            },
            opus: ModelPricing {
                input: 15.0,
                cached_input: 1.5,
                output: 75.0,
            },
            input_share: 0.7,
            cached_share: 0.5,
            tokens_per_hour: 400_000.0,
            contingency: 1.2,
            rounding_step_usd: 5.0,
        }
    }

    fn cost_per_million(&self, pricing: &ModelPricing) -> f64 {
        self.input_share
            * ((1.0 - self.cached_share) * pricing.input + self.cached_share * pricing.cached_input)
            + (1.0 - self.input_share) * pricing.output
    }

    pub fn blended_cost_per_million(&self) -> f64 {
        self.share_gpt * self.cost_per_million(&self.gpt)
            + self.share_opus * self.cost_per_million(&self.opus)
    }

    fn round_to_step(&self, value: f64) -> f64 {
        if self.rounding_step_usd <= 0.0 {
            return value;
        }
        (value / self.rounding_step_usd).round() * self.rounding_step_usd
    }

    /// `tokens = duration_h * tokens_per_hour * contingency`, converted to
    /// dollars via the blended per-million rate and rounded to the
    /// configured step.
    pub fn derive_budget_usd(&self, duration_hours: f64) -> f64 {
        let tokens = duration_hours.max(0.0) * self.tokens_per_hour * self.contingency;
        let dollars = (tokens / 1_000_000.0) * self.blended_cost_per_million();
        self.round_to_step(dollars).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_budget_scales_with_duration() {
        let constants = BudgetConstants::test_default();
        let short = constants.derive_budget_usd(1.0);
        let long = constants.derive_budget_usd(10.0);
        assert!(long > short);
    }

    #[test]
    fn derive_budget_is_rounded_to_step() {
        let constants = BudgetConstants::test_default();
        let budget = constants.derive_budget_usd(3.0);
        let remainder = budget % constants.rounding_step_usd;
        assert!(remainder.abs() < 1e-6 || (constants.rounding_step_usd - remainder).abs() < 1e-6);
    }

    #[test]
    fn zero_duration_yields_zero_budget() {
        let constants = BudgetConstants::test_default();
        assert_eq!(constants.derive_budget_usd(0.0), 0.0);
    }
}
