//! Authorization engine
//!
//! Decides whether a card charge is approved. Checks run in a fixed order
//! and short-circuit on the first failure:
//!
//! 1. card and account resolve
//! 2. failure counter below the fraud threshold (else block the card)
//! 3. card is ACTIVE
//! 4. account balance covers the amount (else count a failure)
//! 5. amount within the card's spend limit
//!
//! Only then is the fee resolved and the capture applied atomically. The
//! capture re-checks steps 2 and 3 under the account lock, so a card blocked
//! in the meantime is still refused. Every decline carries the flat decline
//! fee and leaves balances untouched.

use crate::anti_fraud::AntiFraudGuard;
use crate::fee_tier::{compute_fee, GradeService};
use crate::notifier::notify_account;
use crate::revshare::RevShareService;
use cardledger_core::{
    models::{
        Account, AuthorizationDecision, AuthorizationRequest, Card, DeclineReason, LedgerMutation,
    },
    traits::{LedgerStore, Notifier},
    AppError, AppResult,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub struct AuthorizationService {
    ledger: Arc<dyn LedgerStore>,
    grades: Arc<GradeService>,
    fraud: AntiFraudGuard,
    notifier: Arc<dyn Notifier>,
    revshare: Option<Arc<RevShareService>>,
    decline_fee: Decimal,
}

impl AuthorizationService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        grades: Arc<GradeService>,
        fraud: AntiFraudGuard,
        notifier: Arc<dyn Notifier>,
        decline_fee: Decimal,
    ) -> Self {
        Self {
            ledger,
            grades,
            fraud,
            notifier,
            revshare: None,
            decline_fee,
        }
    }

    /// Credit referrers on approved charges
    pub fn with_revshare(mut self, revshare: Arc<RevShareService>) -> Self {
        self.revshare = Some(revshare);
        self
    }

    fn decline(&self, reason: DeclineReason) -> AuthorizationDecision {
        AuthorizationDecision::declined(reason, self.decline_fee)
    }

    /// Approve or decline a card charge
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for a non-positive amount and storage
    /// faults from card/account lookups. Business refusals are never errors.
    #[instrument(skip(self, request), fields(card_id = request.card_id, amount = %request.amount))]
    pub async fn authorize(
        &self,
        request: &AuthorizationRequest,
    ) -> AppResult<AuthorizationDecision> {
        if request.amount <= Decimal::ZERO {
            return Err(AppError::Validation(format!(
                "Amount must be positive, got {}",
                request.amount
            )));
        }

        let Some(card) = self.ledger.find_card(request.card_id).await? else {
            warn!("DECLINED: card {} not found", request.card_id);
            return Ok(self.decline(DeclineReason::CardNotFound));
        };

        let Some(account) = self.ledger.find_account(card.account_id).await? else {
            warn!(
                "DECLINED: account {} of card {} not found",
                card.account_id, card.id
            );
            return Ok(self.decline(DeclineReason::AccountNotFound));
        };

        if self.fraud.is_tripped(&card) {
            warn!(
                "ANTI-FRAUD: card {} has {} failed attempts",
                card.id, card.failed_auth_count
            );
            return Ok(self.block_tripped(&card, &account).await);
        }

        if !card.is_active() {
            info!("DECLINED: card {} is not active ({})", card.id, card.status);
            return Ok(self.decline_inactive(&card, &account).await);
        }

        if !account.can_cover(request.amount) {
            info!(
                "DECLINED: account {} balance {} is insufficient for {}",
                account.id, account.balance, request.amount
            );
            self.notify(
                &account,
                &format!(
                    "Decline: insufficient funds. Balance: {}. Attempted charge: {}.",
                    account.balance, request.amount
                ),
            )
            .await;
            if let Err(e) = self.fraud.record_failure(card.id).await {
                error!("Failed to count failed attempt on card {}: {}", card.id, e);
            }
            return Ok(self.decline(DeclineReason::InsufficientBalance));
        }

        if card.exceeds_limit(request.amount) {
            info!(
                "DECLINED: card {} limit {:?} exceeded by {}",
                card.id, card.daily_spend_limit, request.amount
            );
            self.notify(
                &account,
                &format!(
                    "Decline: daily limit of card ...{} exceeded (limit: {}).",
                    card.last4(),
                    card.daily_spend_limit.unwrap_or_default()
                ),
            )
            .await;
            return Ok(self.decline(DeclineReason::DailyLimitExceeded));
        }

        self.capture(request, &card, &account).await
    }

    async fn capture(
        &self,
        request: &AuthorizationRequest,
        card: &Card,
        account: &Account,
    ) -> AppResult<AuthorizationDecision> {
        let fee_percent = match self.grades.current_fee_percent(account.id).await {
            Ok(percent) => percent,
            Err(e) => {
                warn!("Failed to get grade of account {}: {}", account.id, e);
                self.grades.default_fee_percent()
            }
        };
        let fee = compute_fee(request.amount, fee_percent);

        let mutation = LedgerMutation::capture(
            account.id,
            card.id,
            request.amount,
            fee,
            format!(
                "Card ...{} payment, merchant: {}",
                card.last4(),
                request.merchant_name
            ),
        )
        .with_fraud_threshold(self.fraud.threshold());

        match self.ledger.apply(mutation).await {
            Ok(new_balance) => {
                info!(
                    "APPROVED: {} on card {} (fee {}, balance {})",
                    request.amount, card.id, fee, new_balance
                );
                self.notify(
                    account,
                    &format!(
                        "Approved: {} from card ...{} (Merchant: {}, Fee: {}).",
                        request.amount,
                        card.last4(),
                        request.merchant_name,
                        fee
                    ),
                )
                .await;
                self.grades.spawn_refresh(account.id);
                if let Some(revshare) = &self.revshare {
                    revshare.reward_referrer(account.id, request.amount).await;
                }
                Ok(AuthorizationDecision::approved(fee))
            }
            Err(AppError::CardNotActive(_)) => {
                info!("DECLINED: card {} left ACTIVE before capture", card.id);
                Ok(self.decline_inactive(card, account).await)
            }
            Err(AppError::FraudThresholdReached(_)) => {
                warn!("ANTI-FRAUD: card {} tripped before capture", card.id);
                Ok(self.block_tripped(card, account).await)
            }
            Err(AppError::InsufficientBalance {
                required,
                available,
            }) => {
                // Balance moved between the pre-check and the lock, or the fee tipped it over
                info!(
                    "DECLINED: capture on card {} needs {}, account {} has {}",
                    card.id, required, account.id, available
                );
                Ok(self.decline(DeclineReason::InsufficientBalance))
            }
            Err(e) => {
                error!(
                    "Capture failed for account {} card {}: {}",
                    account.id, card.id, e
                );
                Ok(self.decline(DeclineReason::CaptureFailed))
            }
        }
    }

    async fn block_tripped(&self, card: &Card, account: &Account) -> AuthorizationDecision {
        if let Err(e) = self.fraud.block(card.id).await {
            error!("Failed to block card {}: {}", card.id, e);
        }
        self.notify(
            account,
            &format!(
                "Card Blocked: card ...{} was blocked after multiple failed authorization attempts.",
                card.last4()
            ),
        )
        .await;
        self.decline(DeclineReason::FraudBlocked)
    }

    async fn decline_inactive(&self, card: &Card, account: &Account) -> AuthorizationDecision {
        self.notify(
            account,
            &format!("Decline: card ...{} is not active.", card.last4()),
        )
        .await;
        self.decline(DeclineReason::CardInactive)
    }

    async fn notify(&self, account: &Account, message: &str) {
        notify_account(self.notifier.as_ref(), account, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_DECLINE_FEE, DEFAULT_FEE_PERCENT};
    use crate::notifier::LogNotifier;
    use cardledger_core::models::{CardStatus, DecisionStatus, EntryType, Referral, ReferralStatus};
    use cardledger_db::MemoryLedgerStore;
    use rust_decimal_macros::dec;

    fn setup(balance: Decimal, card: Card) -> (Arc<MemoryLedgerStore>, AuthorizationService) {
        let store = Arc::new(MemoryLedgerStore::new());
        store.insert_account(Account {
            id: 1,
            balance,
            notification_endpoint: Some("chat-1".to_string()),
            ..Default::default()
        });
        store.insert_card(card).unwrap();

        let grades = Arc::new(GradeService::new(
            store.clone(),
            store.clone(),
            DEFAULT_FEE_PERCENT,
        ));
        let service = AuthorizationService::new(
            store.clone(),
            grades,
            AntiFraudGuard::new(store.clone(), 3),
            Arc::new(LogNotifier::new()),
            DEFAULT_DECLINE_FEE,
        );
        (store, service)
    }

    fn card() -> Card {
        Card {
            id: 10,
            account_id: 1,
            ..Default::default()
        }
    }

    fn request(amount: Decimal) -> AuthorizationRequest {
        AuthorizationRequest {
            card_id: 10,
            amount,
            merchant_name: "Coffee Shop".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insufficient_balance_counts_failure() {
        let (store, service) = setup(dec!(100.00), card());

        let decision = service.authorize(&request(dec!(150.00))).await.unwrap();

        assert_eq!(decision.status, DecisionStatus::Declined);
        assert_eq!(decision.reason, Some(DeclineReason::InsufficientBalance));
        assert_eq!(decision.fee, dec!(0.50));
        assert_eq!(store.card_snapshot(10).unwrap().failed_auth_count, 1);
        assert_eq!(store.account_balance(1), Some(dec!(100.00)));
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_approval_with_standard_fee() {
        let (store, service) = setup(
            dec!(100.00),
            Card {
                failed_auth_count: 2,
                ..card()
            },
        );

        let decision = service.authorize(&request(dec!(50.00))).await.unwrap();

        assert!(decision.is_approved());
        assert_eq!(decision.message, "Transaction approved.");
        assert_eq!(decision.fee, dec!(3.35));
        assert_eq!(store.account_balance(1), Some(dec!(46.65)));
        assert_eq!(store.card_snapshot(10).unwrap().failed_auth_count, 0);

        let entries = store.entries_for_account(1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::Capture);
    }

    #[tokio::test]
    async fn test_threshold_blocks_regardless_of_balance() {
        let (store, service) = setup(
            dec!(1000000.00),
            Card {
                failed_auth_count: 3,
                ..card()
            },
        );

        let decision = service.authorize(&request(dec!(0.01))).await.unwrap();

        assert_eq!(decision.reason, Some(DeclineReason::FraudBlocked));
        assert_eq!(decision.message, "Card blocked due to multiple failed attempts.");
        assert_eq!(store.card_snapshot(10).unwrap().status, CardStatus::Blocked);
        assert_eq!(store.account_balance(1), Some(dec!(1000000.00)));
    }

    #[tokio::test]
    async fn test_inactive_card_does_not_count_failure() {
        let (store, service) = setup(
            dec!(100.00),
            Card {
                status: CardStatus::Frozen,
                ..card()
            },
        );

        let decision = service.authorize(&request(dec!(10.00))).await.unwrap();

        assert_eq!(decision.reason, Some(DeclineReason::CardInactive));
        assert_eq!(store.card_snapshot(10).unwrap().failed_auth_count, 0);
    }

    #[tokio::test]
    async fn test_daily_limit_does_not_count_failure() {
        let (store, service) = setup(
            dec!(500.00),
            Card {
                daily_spend_limit: Some(dec!(100.00)),
                ..card()
            },
        );

        let decision = service.authorize(&request(dec!(100.01))).await.unwrap();

        assert_eq!(decision.reason, Some(DeclineReason::DailyLimitExceeded));
        assert_eq!(decision.message, "Daily spend limit exceeded.");
        assert_eq!(store.card_snapshot(10).unwrap().failed_auth_count, 0);
        assert_eq!(store.account_balance(1), Some(dec!(500.00)));
    }

    #[tokio::test]
    async fn test_unknown_card_declines() {
        let (_, service) = setup(dec!(100.00), card());

        let decision = service
            .authorize(&AuthorizationRequest {
                card_id: 999,
                ..request(dec!(1.00))
            })
            .await
            .unwrap();

        assert_eq!(decision.reason, Some(DeclineReason::CardNotFound));
        assert_eq!(decision.message, "Card not found.");
    }

    #[tokio::test]
    async fn test_fee_overdraft_declines_without_partial_effect() {
        // Balance covers the amount but not amount + fee
        let (store, service) = setup(dec!(50.00), card());

        let decision = service.authorize(&request(dec!(50.00))).await.unwrap();

        assert_eq!(decision.reason, Some(DeclineReason::InsufficientBalance));
        assert_eq!(store.account_balance(1), Some(dec!(50.00)));
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_non_positive_amount_is_validation_fault() {
        let (_, service) = setup(dec!(100.00), card());

        let result = service.authorize(&request(dec!(0))).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_approval_credits_referrer() {
        let (store, service) = setup(dec!(100.00), card());
        store.insert_account(Account {
            id: 2,
            ..Default::default()
        });
        store
            .insert_referral(Referral {
                id: 7,
                referrer_id: 2,
                referred_id: 1,
                status: ReferralStatus::Active,
                ..Default::default()
            })
            .unwrap();
        let service = service.with_revshare(Arc::new(RevShareService::new(store.clone(), dec!(5))));

        let approved = service.authorize(&request(dec!(50.00))).await.unwrap();
        let declined = service.authorize(&request(dec!(500.00))).await.unwrap();

        assert!(approved.is_approved());
        assert!(!declined.is_approved());
        assert_eq!(store.account_balance(2), Some(dec!(2.50)));
        assert_eq!(store.referral_snapshot(7).unwrap().commission_earned, dec!(2.50));
    }
}
