//! Referral revenue share
//!
//! Credits a referrer with a percentage of an amount attributed to the
//! account they referred. Zero commission is a silent no-op.

use crate::round_money;
use cardledger_core::{
    models::ReferralStatus,
    traits::ReferralRepository,
    AppError, AppResult,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct RevShareService {
    referrals: Arc<dyn ReferralRepository>,
    percent: Decimal,
}

impl RevShareService {
    pub fn new(referrals: Arc<dyn ReferralRepository>, percent: Decimal) -> Self {
        Self { referrals, percent }
    }

    pub fn percent(&self) -> Decimal {
        self.percent
    }

    /// `amount × percent / 100`, rounded to the minor unit
    pub fn commission_for(&self, source_amount: Decimal) -> Decimal {
        round_money(source_amount * self.percent / Decimal::ONE_HUNDRED)
    }

    /// Credit the referrer of `referral_id`
    ///
    /// Returns the credited commission, or `None` when there was nothing to
    /// credit (non-positive commission or an inactive referral).
    #[instrument(skip(self))]
    pub async fn credit(
        &self,
        referral_id: i64,
        source_amount: Decimal,
    ) -> AppResult<Option<Decimal>> {
        let commission = self.commission_for(source_amount);
        if commission <= Decimal::ZERO {
            debug!(
                "No commission for referral {} on amount {}",
                referral_id, source_amount
            );
            return Ok(None);
        }

        let referral = self
            .referrals
            .find_referral(referral_id)
            .await?
            .ok_or_else(|| AppError::ReferralNotFound(referral_id.to_string()))?;

        if referral.status != ReferralStatus::Active {
            debug!("Referral {} is {}, skipping credit", referral_id, referral.status);
            return Ok(None);
        }

        let detail = format!(
            "Referral revenue {}% from account {} on {}",
            self.percent, referral.referred_id, source_amount
        );
        let new_balance = self
            .referrals
            .credit_referral(referral_id, commission, &detail)
            .await?;

        info!(
            "Credited {} to referrer {} (referral {}), new balance {}",
            commission, referral.referrer_id, referral_id, new_balance
        );

        Ok(Some(commission))
    }

    /// Credit whoever referred `referred_id`; no active referral is a no-op
    #[instrument(skip(self))]
    pub async fn credit_for_referred(
        &self,
        referred_id: i64,
        source_amount: Decimal,
    ) -> AppResult<Option<Decimal>> {
        match self.referrals.find_active_referral_for(referred_id).await? {
            Some(referral) => self.credit(referral.id, source_amount).await,
            None => {
                debug!("Account {} has no active referrer", referred_id);
                Ok(None)
            }
        }
    }

    /// Commission after an approved charge. Failures are logged, never surfaced.
    pub async fn reward_referrer(&self, referred_id: i64, source_amount: Decimal) {
        if let Err(e) = self.credit_for_referred(referred_id, source_amount).await {
            warn!(
                "Failed to credit referrer of account {} for {}: {}",
                referred_id, source_amount, e
            );
        }
    }
}
