//! Ledger invariant checks
//!
//! Used by tests after transfers and by `bank-ledger --audit` to reconcile
//! every stored balance against its entries.

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::transfer::TransferTxResult;
use crate::context::OpContext;
use crate::error::TxResult;
use crate::store::models::ListAccountsParams;
use crate::store::{Querier, Store, StoreResult, TxBackend};

const AUDIT_PAGE_SIZE: i64 = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InvariantViolation {
    #[error("account {account_id}: balance {balance} != sum of entries {entries_sum}")]
    BalanceMismatch {
        account_id: i64,
        balance: i64,
        entries_sum: i64,
    },

    #[error("transfer {transfer_id}: amount {amount} is not positive")]
    NonPositiveTransfer { transfer_id: i64, amount: i64 },

    #[error("transfer {transfer_id}: source and destination are both account {account_id}")]
    SelfTransfer { transfer_id: i64, account_id: i64 },

    #[error("transfer {transfer_id}: entry {entry_id} does not match its side of the transfer")]
    UnpairedEntry { transfer_id: i64, entry_id: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub accounts_checked: usize,
    pub violations: Vec<InvariantViolation>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check the shape of a committed transfer: positive amount, distinct
/// accounts, and a debit/credit pair that matches it
pub fn check_transfer_result(result: &TransferTxResult) -> Result<(), InvariantViolation> {
    let t = &result.transfer;
    if t.amount <= 0 {
        return Err(InvariantViolation::NonPositiveTransfer {
            transfer_id: t.id,
            amount: t.amount,
        });
    }
    if t.from_account_id == t.to_account_id {
        return Err(InvariantViolation::SelfTransfer {
            transfer_id: t.id,
            account_id: t.from_account_id,
        });
    }

    let debit = &result.from_entry;
    if debit.account_id != t.from_account_id || debit.amount != -t.amount {
        return Err(InvariantViolation::UnpairedEntry {
            transfer_id: t.id,
            entry_id: debit.id,
        });
    }
    let credit = &result.to_entry;
    if credit.account_id != t.to_account_id || credit.amount != t.amount {
        return Err(InvariantViolation::UnpairedEntry {
            transfer_id: t.id,
            entry_id: credit.id,
        });
    }
    Ok(())
}

/// Compare one account's balance with the sum of its entries
///
/// The account row is locked first, so inside a transaction no transfer can
/// land between the two reads.
pub async fn reconcile_account<Q>(q: &mut Q, account_id: i64) -> StoreResult<Option<InvariantViolation>>
where
    Q: Querier + ?Sized,
{
    let account = q.get_account_for_update(account_id).await?;
    let entries_sum = q.sum_entries(account_id).await?;
    if account.balance == entries_sum {
        Ok(None)
    } else {
        Ok(Some(InvariantViolation::BalanceMismatch {
            account_id,
            balance: account.balance,
            entries_sum,
        }))
    }
}

impl<B: TxBackend> Store<B> {
    /// Reconcile every account, one short transaction per page
    pub async fn reconcile_all(&self, ctx: &OpContext) -> TxResult<AuditReport> {
        let mut report = AuditReport::default();
        let mut offset = 0;

        loop {
            let (checked, violations) = self
                .run_tx(ctx, "reconcile_page", move |q| {
                    async move {
                        let accounts = q
                            .list_accounts(ListAccountsParams {
                                owner: None,
                                limit: AUDIT_PAGE_SIZE,
                                offset,
                            })
                            .await?;
                        let mut violations = Vec::new();
                        for account in &accounts {
                            if let Some(v) = reconcile_account(q, account.id).await? {
                                violations.push(v);
                            }
                        }
                        Ok((accounts.len(), violations))
                    }
                    .boxed()
                })
                .await?;

            for v in &violations {
                warn!(violation = %v, "Ledger invariant violated");
            }
            report.accounts_checked += checked;
            report.violations.extend(violations);

            if (checked as i64) < AUDIT_PAGE_SIZE {
                break;
            }
            offset += AUDIT_PAGE_SIZE;
        }

        info!(
            accounts_checked = report.accounts_checked,
            violations = report.violations.len(),
            "Ledger audit finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testutil::{CURRENCIES, create_user, memory_store, open_account, random_money};
    use crate::ledger::transfer::TransferTxParams;
    use crate::store::models::{CreateAccountParams, UpdateAccountBalanceParams};

    fn sample_result() -> TransferTxResult {
        let now = chrono::Utc::now();
        let account = |id| crate::store::models::Account {
            id,
            owner: "owner".to_string(),
            balance: 0,
            currency: "USD".to_string(),
            created_at: now,
        };
        TransferTxResult {
            transfer: crate::store::models::Transfer {
                id: 1,
                from_account_id: 1,
                to_account_id: 2,
                amount: 10,
                created_at: now,
            },
            from_account: account(1),
            to_account: account(2),
            from_entry: crate::store::models::Entry {
                id: 1,
                account_id: 1,
                amount: -10,
                created_at: now,
            },
            to_entry: crate::store::models::Entry {
                id: 2,
                account_id: 2,
                amount: 10,
                created_at: now,
            },
        }
    }

    #[test]
    fn test_check_transfer_result() {
        assert!(check_transfer_result(&sample_result()).is_ok());

        let mut swapped = sample_result();
        swapped.to_entry.amount = -10;
        assert_eq!(
            check_transfer_result(&swapped),
            Err(InvariantViolation::UnpairedEntry {
                transfer_id: 1,
                entry_id: 2
            })
        );

        let mut wrong_account = sample_result();
        wrong_account.from_entry.account_id = 3;
        assert!(matches!(
            check_transfer_result(&wrong_account),
            Err(InvariantViolation::UnpairedEntry { entry_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_reconcile_clean_ledger() {
        let store = memory_store();
        let mut accounts = Vec::new();
        for currency in CURRENCIES {
            let owner = create_user(&store).await;
            let other = create_user(&store).await;
            let a = open_account(&store, &owner.username, currency, random_money() + 1).await;
            let b = open_account(&store, &other.username, currency, random_money()).await;
            accounts.push((a.account.id, b.account.id));
        }
        for (a, b) in accounts {
            store
                .transfer_tx(
                    &OpContext::background(),
                    TransferTxParams {
                        from_account_id: a,
                        to_account_id: b,
                        amount: 1,
                    },
                )
                .await
                .unwrap();
        }

        let report = store.reconcile_all(&OpContext::background()).await.unwrap();
        assert_eq!(report.accounts_checked, 6);
        assert!(report.is_clean(), "{:?}", report.violations);
    }

    #[tokio::test]
    async fn test_reconcile_detects_unbacked_balance() {
        let store = memory_store();
        let owner = create_user(&store).await;
        let mut q = store.queries();
        // balance written without any entry
        let account = q
            .create_account(CreateAccountParams {
                owner: owner.username.clone(),
                balance: 0,
                currency: "USD".to_string(),
            })
            .await
            .unwrap();
        q.update_account_balance(UpdateAccountBalanceParams {
            id: account.id,
            amount: 42,
        })
        .await
        .unwrap();

        let report = store.reconcile_all(&OpContext::background()).await.unwrap();
        assert_eq!(
            report.violations,
            vec![InvariantViolation::BalanceMismatch {
                account_id: account.id,
                balance: 42,
                entries_sum: 0
            }]
        );
    }

    #[tokio::test]
    async fn test_reconcile_pages_through_accounts() {
        let store = memory_store();
        let total = AUDIT_PAGE_SIZE as usize + 5;
        for _ in 0..total {
            let owner = create_user(&store).await;
            open_account(&store, &owner.username, "USD", 7).await;
        }

        let report = store.reconcile_all(&OpContext::background()).await.unwrap();
        assert_eq!(report.accounts_checked, total);
        assert!(report.is_clean());
    }
}
