//! Cost calculation and the balance ledger (spec.md §4.10, C10).

use std::sync::Arc;

use crate::db::{BillingRepository, PricingRepository, UserRepository};
use crate::error::Result;
use crate::types::{BillingType, PricingType, PricingUnit, TokenUsage, User};

pub struct PricingEngine {
    pricing: Arc<PricingRepository>,
}

impl PricingEngine {
    pub fn new(pricing: Arc<PricingRepository>) -> Self {
        PricingEngine { pricing }
    }

    /// Sum of `input_tokens * input_price + output_tokens * output_price`,
    /// using whichever pricing row is effective `as_of` (spec.md §4.10:
    /// `effective_from <= now < effective_until` or no `effective_until`;
    /// ties broken by the greatest `effective_from`).
    pub async fn calculate_cost(
        &self,
        model_id: i64,
        usage: &TokenUsage,
        as_of: chrono::DateTime<chrono::Utc>,
    ) -> Result<f64> {
        let rows = self.pricing.find_effective(model_id, as_of).await?;

        let input_price = effective_rate(&rows, PricingType::Input);
        let output_price = effective_rate(&rows, PricingType::Output);
        let request_price = effective_rate(&rows, PricingType::Request);

        let cost = usage.prompt_tokens as f64 * per_token(input_price)
            + usage.completion_tokens as f64 * per_token(output_price)
            + request_price.map(|(amount, _)| amount).unwrap_or(0.0);

        Ok(cost)
    }
}

fn effective_rate(rows: &[crate::types::ModelPricing], kind: PricingType) -> Option<(f64, PricingUnit)> {
    rows.iter()
        .filter(|r| r.pricing_type == kind)
        .max_by(|a, b| a.effective_from.cmp(&b.effective_from))
        .map(|r| (r.price_per_unit, r.unit))
}

fn per_token(rate: Option<(f64, PricingUnit)>) -> f64 {
    match rate {
        Some((amount, PricingUnit::Token)) => amount,
        _ => 0.0,
    }
}

/// Records and applies a debit against a user's balance. On a
/// non-transactional store the write order is: create the billing row as
/// `pending`, apply the balance delta, then mark the row `processed` (or
/// `failed` if the balance update errors) — so a crash mid-sequence leaves
/// an auditable pending record rather than a silently lost debit.
pub struct Ledger {
    users: Arc<UserRepository>,
    billing: Arc<BillingRepository>,
}

impl Ledger {
    pub fn new(users: Arc<UserRepository>, billing: Arc<BillingRepository>) -> Self {
        Ledger { users, billing }
    }

    pub async fn debit(&self, user_id: i64, usage_log_id: i64, amount: f64) -> Result<User> {
        let record = self
            .billing
            .create_pending(
                user_id,
                Some(usage_log_id),
                amount,
                BillingType::Usage,
                Some("usage-based debit"),
            )
            .await?;

        match self.users.adjust_balance(user_id, -amount).await {
            Ok(user) => {
                self.billing.mark_processed(record.id).await?;
                Ok(user)
            }
            Err(e) => {
                let _ = self.billing.mark_failed(record.id).await;
                Err(e.into())
            }
        }
    }

    pub async fn recharge(&self, user_id: i64, amount: f64, description: Option<&str>) -> Result<User> {
        let record = self
            .billing
            .create_pending(user_id, None, -amount, BillingType::Recharge, description)
            .await?;
        match self.users.adjust_balance(user_id, amount).await {
            Ok(user) => {
                self.billing.mark_processed(record.id).await?;
                Ok(user)
            }
            Err(e) => {
                let _ = self.billing.mark_failed(record.id).await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelPricing;
    use chrono::TimeZone;

    fn pricing_row(kind: PricingType, price: f64, from: i64) -> ModelPricing {
        ModelPricing {
            model_id: 1,
            pricing_type: kind,
            price_per_unit: price,
            unit: PricingUnit::Token,
            currency: "USD".to_string(),
            effective_from: chrono::Utc.timestamp_opt(from, 0).unwrap(),
            effective_until: None,
        }
    }

    #[test]
    fn test_effective_rate_picks_latest_effective_from() {
        let rows = vec![pricing_row(PricingType::Input, 0.001, 100), pricing_row(PricingType::Input, 0.002, 200)];
        let rate = effective_rate(&rows, PricingType::Input);
        assert_eq!(rate.unwrap().0, 0.002);
    }

    #[test]
    fn test_per_token_only_applies_to_token_unit() {
        assert_eq!(per_token(Some((0.5, PricingUnit::Request))), 0.0);
        assert_eq!(per_token(Some((0.5, PricingUnit::Token))), 0.5);
    }
}
