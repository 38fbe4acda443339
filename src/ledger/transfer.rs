//! Funds transfer orchestration
//!
//! A transfer is four writes that commit together: the transfer record, a
//! debit entry, a credit entry and the two balance updates. Both account rows
//! are locked up front in lower-ID-first order, which also proves they exist
//! inside the same transaction that writes to them.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::lock_order::{lock_order, ordered_deltas, validate_transfer};
use crate::context::OpContext;
use crate::error::{TxResult, ValidationError};
use crate::store::models::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry, Transfer,
    UpdateAccountBalanceParams,
};
use crate::store::{Querier, Store, TxBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Everything a committed transfer wrote, with balances as of commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAccountResult {
    pub account: Account,
    /// Absent when the account opens at zero
    pub opening_entry: Option<Entry>,
}

impl<B: TxBackend> Store<B> {
    /// Move `amount` from one account to another atomically
    ///
    /// Argument errors are returned before any transaction opens. A missing
    /// account or a currency mismatch aborts the transaction before anything
    /// is written.
    pub async fn transfer_tx(
        &self,
        ctx: &OpContext,
        arg: TransferTxParams,
    ) -> TxResult<TransferTxResult> {
        validate_transfer(arg.from_account_id, arg.to_account_id, arg.amount)?;

        let result = self
            .run_tx(ctx, "transfer_tx", move |q| {
                async move { execute_transfer(q, arg).await }.boxed()
            })
            .await?;

        info!(
            transfer_id = result.transfer.id,
            from_account_id = arg.from_account_id,
            to_account_id = arg.to_account_id,
            amount = arg.amount,
            "Transfer committed"
        );
        Ok(result)
    }

    /// Create an account whose balance is backed by an opening entry
    ///
    /// The row is inserted at zero and credited through the ledger, so
    /// `balance == sum(entries)` holds from the first commit.
    pub async fn open_account(
        &self,
        ctx: &OpContext,
        arg: CreateAccountParams,
    ) -> TxResult<OpenAccountResult> {
        let result = self
            .run_tx(ctx, "open_account", move |q| {
                async move {
                    let opening = arg.balance;
                    let account = q
                        .create_account(CreateAccountParams { balance: 0, ..arg })
                        .await?;
                    if opening == 0 {
                        return Ok(OpenAccountResult {
                            account,
                            opening_entry: None,
                        });
                    }

                    let entry = q
                        .create_entry(CreateEntryParams {
                            account_id: account.id,
                            amount: opening,
                        })
                        .await?;
                    let account = q
                        .update_account_balance(UpdateAccountBalanceParams {
                            id: account.id,
                            amount: opening,
                        })
                        .await?;
                    Ok(OpenAccountResult {
                        account,
                        opening_entry: Some(entry),
                    })
                }
                .boxed()
            })
            .await?;

        info!(
            account_id = result.account.id,
            owner = %result.account.owner,
            currency = %result.account.currency,
            balance = result.account.balance,
            "Account opened"
        );
        Ok(result)
    }
}

async fn execute_transfer<Q>(q: &mut Q, arg: TransferTxParams) -> TxResult<TransferTxResult>
where
    Q: Querier + ?Sized,
{
    let (lower, higher) = lock_order(arg.from_account_id, arg.to_account_id);
    let first = q.get_account_for_update(lower).await?;
    let second = q.get_account_for_update(higher).await?;
    let (from, to) = if first.id == arg.from_account_id {
        (first, second)
    } else {
        (second, first)
    };

    if from.currency != to.currency {
        return Err(ValidationError::CurrencyMismatch {
            from_account_id: from.id,
            from: from.currency,
            to_account_id: to.id,
            to: to.currency,
        }
        .into());
    }

    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;
    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.from_account_id,
            amount: -arg.amount,
        })
        .await?;
    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;

    let [first_delta, second_delta] =
        ordered_deltas(arg.from_account_id, arg.to_account_id, arg.amount);
    let first = q
        .update_account_balance(UpdateAccountBalanceParams {
            id: first_delta.account_id,
            amount: first_delta.amount,
        })
        .await?;
    let second = q
        .update_account_balance(UpdateAccountBalanceParams {
            id: second_delta.account_id,
            amount: second_delta.amount,
        })
        .await?;
    let (from_account, to_account) = if first.id == arg.from_account_id {
        (first, second)
    } else {
        (second, first)
    };

    Ok(TransferTxResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::error::{ErrorKind, TxError};
    use crate::ledger::audit::check_transfer_result;
    use crate::ledger::testutil::{create_user, memory_store, open_account};
    use crate::store::error::StoreResult;
    use crate::store::models::{
        CreateSessionParams, CreateUserParams, CreateVerifyEmailParams, ListAccountsParams,
        ListEntriesParams, ListTransfersParams, Session, UpdateUserParams,
        UpdateVerifyEmailParams, User, VerifyEmail,
    };
    use crate::store::{MemoryBackend, TxBackend};

    async fn two_accounts(
        store: &Store<MemoryBackend>,
        balance: i64,
    ) -> (Account, Account) {
        let alice = create_user(store).await;
        let bob = create_user(store).await;
        let a = open_account(store, &alice.username, "USD", balance).await.account;
        let b = open_account(store, &bob.username, "USD", balance).await.account;
        (a, b)
    }

    /// Transfers sent by `from` or received by `to`
    async fn transfers_sent_or_received(
        store: &Store<MemoryBackend>,
        from: i64,
        to: i64,
    ) -> usize {
        store
            .queries()
            .list_transfers(ListTransfersParams {
                from_account_id: from,
                to_account_id: to,
                limit: 1000,
                offset: 0,
            })
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_transfer_moves_balance_and_writes_ledger() {
        let store = memory_store();
        let (a, b) = two_accounts(&store, 100).await;

        let result = store
            .transfer_tx(
                &OpContext::background(),
                TransferTxParams {
                    from_account_id: a.id,
                    to_account_id: b.id,
                    amount: 30,
                },
            )
            .await
            .unwrap();

        check_transfer_result(&result).unwrap();
        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.balance, 130);
        assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);

        let mut q = store.queries();
        assert_eq!(q.get_transfer(result.transfer.id).await.unwrap(), result.transfer);
        assert_eq!(q.get_entry(result.from_entry.id).await.unwrap(), result.from_entry);
        assert_eq!(q.get_entry(result.to_entry.id).await.unwrap(), result.to_entry);
        assert_eq!(q.get_account(a.id).await.unwrap().balance, 70);
        assert_eq!(q.get_account(b.id).await.unwrap().balance, 130);
        assert_eq!(transfers_sent_or_received(&store, a.id, b.id).await, 1);
    }

    #[tokio::test]
    async fn test_transfer_from_higher_to_lower_id() {
        let store = memory_store();
        let (a, b) = two_accounts(&store, 50).await;
        assert!(a.id < b.id);

        let result = store
            .transfer_tx(
                &OpContext::background(),
                TransferTxParams {
                    from_account_id: b.id,
                    to_account_id: a.id,
                    amount: 20,
                },
            )
            .await
            .unwrap();

        assert_eq!(result.from_account.id, b.id);
        assert_eq!(result.from_account.balance, 30);
        assert_eq!(result.to_account.id, a.id);
        assert_eq!(result.to_account.balance, 70);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transfers_are_serialized() {
        let store = memory_store();
        let (a, b) = two_accounts(&store, 500).await;
        let n = 5;
        let amount = 10;

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .transfer_tx(
                            &OpContext::background(),
                            TransferTxParams {
                                from_account_id: a.id,
                                to_account_id: b.id,
                                amount,
                            },
                        )
                        .await
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            check_transfer_result(&result).unwrap();

            let debited = a.balance - result.from_account.balance;
            let credited = result.to_account.balance - b.balance;
            assert_eq!(debited, credited);
            assert!(debited > 0);
            assert_eq!(debited % amount, 0);

            let k = debited / amount;
            assert!((1..=n).contains(&k));
            assert!(seen.insert(k), "multiple {k} observed twice");
        }

        let mut q = store.queries();
        assert_eq!(q.get_account(a.id).await.unwrap().balance, a.balance - n * amount);
        assert_eq!(q.get_account(b.id).await.unwrap().balance, b.balance + n * amount);
        assert_eq!(q.sum_entries(a.id).await.unwrap(), a.balance - n * amount);
        assert_eq!(q.sum_entries(b.id).await.unwrap(), b.balance + n * amount);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposing_transfers_do_not_deadlock() {
        let store = memory_store();
        let (a, b) = two_accounts(&store, 500).await;

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
                tokio::spawn(async move {
                    store
                        .transfer_tx(
                            &OpContext::background(),
                            TransferTxParams {
                                from_account_id: from,
                                to_account_id: to,
                                amount: 10,
                            },
                        )
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut q = store.queries();
        assert_eq!(q.get_account(a.id).await.unwrap().balance, a.balance);
        assert_eq!(q.get_account(b.id).await.unwrap().balance, b.balance);
    }

    #[tokio::test]
    async fn test_missing_account_rolls_back_everything() {
        let store = memory_store();
        let (a, _b) = two_accounts(&store, 100).await;

        let err = store
            .transfer_tx(
                &OpContext::background(),
                TransferTxParams {
                    from_account_id: a.id,
                    to_account_id: 9999,
                    amount: 10,
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        let mut q = store.queries();
        assert_eq!(q.get_account(a.id).await.unwrap().balance, 100);
        assert_eq!(transfers_sent_or_received(&store, a.id, 9999).await, 0);
        let entries = q
            .list_entries(ListEntriesParams {
                account_id: a.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        // only the opening entry
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected_before_tx() {
        let store = memory_store();
        let (a, b) = two_accounts(&store, 100).await;
        // a begin failure would surface if a transaction were opened
        store.backend().faults().fail_next_begin();

        let same = store
            .transfer_tx(
                &OpContext::background(),
                TransferTxParams {
                    from_account_id: a.id,
                    to_account_id: a.id,
                    amount: 10,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(same, TxError::Validation(ValidationError::SameAccount(_))));

        let zero = store
            .transfer_tx(
                &OpContext::background(),
                TransferTxParams {
                    from_account_id: a.id,
                    to_account_id: b.id,
                    amount: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(zero.code(), "INVALID_AMOUNT");
    }

    #[tokio::test]
    async fn test_currency_mismatch_rolls_back() {
        let store = memory_store();
        let alice = create_user(&store).await;
        let bob = create_user(&store).await;
        let usd = open_account(&store, &alice.username, "USD", 100).await.account;
        let eur = open_account(&store, &bob.username, "EUR", 100).await.account;

        let err = store
            .transfer_tx(
                &OpContext::background(),
                TransferTxParams {
                    from_account_id: usd.id,
                    to_account_id: eur.id,
                    amount: 10,
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "CURRENCY_MISMATCH");
        assert_eq!(transfers_sent_or_received(&store, usd.id, eur.id).await, 0);
        assert_eq!(store.queries().get_account(usd.id).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_balance_may_go_negative() {
        let store = memory_store();
        let (a, b) = two_accounts(&store, 5).await;

        let result = store
            .transfer_tx(
                &OpContext::background(),
                TransferTxParams {
                    from_account_id: a.id,
                    to_account_id: b.id,
                    amount: 15,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.from_account.balance, -10);
    }

    #[tokio::test]
    async fn test_open_account_records_opening_entry() {
        let store = memory_store();
        let owner = create_user(&store).await;

        let funded = open_account(&store, &owner.username, "CAD", 250).await;
        assert_eq!(funded.account.balance, 250);
        assert_eq!(funded.opening_entry.as_ref().map(|e| e.amount), Some(250));

        let empty = open_account(&store, &owner.username, "EUR", 0).await;
        assert_eq!(empty.account.balance, 0);
        assert!(empty.opening_entry.is_none());
    }

    #[tokio::test]
    async fn test_open_account_duplicate_currency_is_conflict() {
        let store = memory_store();
        let owner = create_user(&store).await;
        open_account(&store, &owner.username, "USD", 10).await;

        let err = store
            .open_account(
                &OpContext::background(),
                CreateAccountParams {
                    owner: owner.username.clone(),
                    balance: 10,
                    currency: "USD".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    /// Passes every call through and records row locks and balance updates
    struct RecordingQuerier<'a, Q: Querier> {
        inner: &'a mut Q,
        calls: Vec<(&'static str, i64)>,
    }

    impl<'a, Q: Querier> RecordingQuerier<'a, Q> {
        fn new(inner: &'a mut Q) -> Self {
            Self {
                inner,
                calls: Vec::new(),
            }
        }

        fn ids(&self, call: &str) -> Vec<i64> {
            self.calls
                .iter()
                .filter(|(name, _)| *name == call)
                .map(|(_, id)| *id)
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl<'a, Q: Querier> Querier for RecordingQuerier<'a, Q> {
        async fn create_account(&mut self, arg: CreateAccountParams) -> StoreResult<Account> {
            self.inner.create_account(arg).await
        }

        async fn get_account(&mut self, id: i64) -> StoreResult<Account> {
            self.inner.get_account(id).await
        }

        async fn get_account_for_update(&mut self, id: i64) -> StoreResult<Account> {
            self.calls.push(("lock", id));
            self.inner.get_account_for_update(id).await
        }

        async fn list_accounts(&mut self, arg: ListAccountsParams) -> StoreResult<Vec<Account>> {
            self.inner.list_accounts(arg).await
        }

        async fn update_account_balance(
            &mut self,
            arg: UpdateAccountBalanceParams,
        ) -> StoreResult<Account> {
            self.calls.push(("update", arg.id));
            self.inner.update_account_balance(arg).await
        }

        async fn create_entry(&mut self, arg: CreateEntryParams) -> StoreResult<Entry> {
            self.inner.create_entry(arg).await
        }

        async fn get_entry(&mut self, id: i64) -> StoreResult<Entry> {
            self.inner.get_entry(id).await
        }

        async fn list_entries(&mut self, arg: ListEntriesParams) -> StoreResult<Vec<Entry>> {
            self.inner.list_entries(arg).await
        }

        async fn sum_entries(&mut self, account_id: i64) -> StoreResult<i64> {
            self.inner.sum_entries(account_id).await
        }

        async fn create_transfer(&mut self, arg: CreateTransferParams) -> StoreResult<Transfer> {
            self.inner.create_transfer(arg).await
        }

        async fn get_transfer(&mut self, id: i64) -> StoreResult<Transfer> {
            self.inner.get_transfer(id).await
        }

        async fn list_transfers(&mut self, arg: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
            self.inner.list_transfers(arg).await
        }

        async fn create_user(&mut self, arg: CreateUserParams) -> StoreResult<User> {
            self.inner.create_user(arg).await
        }

        async fn get_user(&mut self, username: &str) -> StoreResult<User> {
            self.inner.get_user(username).await
        }

        async fn update_user(&mut self, arg: UpdateUserParams) -> StoreResult<User> {
            self.inner.update_user(arg).await
        }

        async fn create_session(&mut self, arg: CreateSessionParams) -> StoreResult<Session> {
            self.inner.create_session(arg).await
        }

        async fn get_session(&mut self, id: uuid::Uuid) -> StoreResult<Session> {
            self.inner.get_session(id).await
        }

        async fn create_verify_email(
            &mut self,
            arg: CreateVerifyEmailParams,
        ) -> StoreResult<VerifyEmail> {
            self.inner.create_verify_email(arg).await
        }

        async fn get_verify_email_for_update(&mut self, id: i64) -> StoreResult<VerifyEmail> {
            self.inner.get_verify_email_for_update(id).await
        }

        async fn update_verify_email(
            &mut self,
            arg: UpdateVerifyEmailParams,
        ) -> StoreResult<VerifyEmail> {
            self.inner.update_verify_email(arg).await
        }
    }

    async fn recorded_transfer(
        store: &Store<MemoryBackend>,
        from_account_id: i64,
        to_account_id: i64,
    ) -> (Vec<i64>, Vec<i64>) {
        let mut handle = store.backend().begin().await.unwrap();
        let mut recorder = RecordingQuerier::new(&mut handle);
        execute_transfer(
            &mut recorder,
            TransferTxParams {
                from_account_id,
                to_account_id,
                amount: 5,
            },
        )
        .await
        .unwrap();
        let locks = recorder.ids("lock");
        let updates = recorder.ids("update");
        store.backend().commit(handle).await.unwrap();
        (locks, updates)
    }

    #[tokio::test]
    async fn test_lower_id_locked_and_updated_first() {
        let store = memory_store();
        let (a, b) = two_accounts(&store, 100).await;
        assert!(a.id < b.id);

        // sender is the lower id
        let (locks, updates) = recorded_transfer(&store, a.id, b.id).await;
        assert_eq!(locks, vec![a.id, b.id]);
        assert_eq!(updates, vec![a.id, b.id]);

        // receiver is the lower id
        let (locks, updates) = recorded_transfer(&store, b.id, a.id).await;
        assert_eq!(locks, vec![a.id, b.id]);
        assert_eq!(updates, vec![a.id, b.id]);

        let mut q = store.queries();
        assert_eq!(q.get_account(a.id).await.unwrap().balance, 100);
        assert_eq!(q.get_account(b.id).await.unwrap().balance, 100);
    }
}
