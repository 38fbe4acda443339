//! Query layer
//!
//! Every method is a single atomic statement. Handles are either autocommit
//! (pass-through) or scoped to one transaction opened by the coordinator.

use async_trait::async_trait;

use super::error::StoreResult;
use super::models::*;

#[async_trait]
pub trait Querier: Send {
    // === Accounts ===
    async fn create_account(&mut self, arg: CreateAccountParams) -> StoreResult<Account>;

    async fn get_account(&mut self, id: i64) -> StoreResult<Account>;

    /// Read an account and hold its row lock until the transaction ends.
    ///
    /// Outside a transaction the lock is released as soon as the statement completes.
    async fn get_account_for_update(&mut self, id: i64) -> StoreResult<Account>;

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> StoreResult<Vec<Account>>;

    /// Add `arg.amount` to the balance and return the updated row
    async fn update_account_balance(
        &mut self,
        arg: UpdateAccountBalanceParams,
    ) -> StoreResult<Account>;

    // === Entries ===
    async fn create_entry(&mut self, arg: CreateEntryParams) -> StoreResult<Entry>;

    async fn get_entry(&mut self, id: i64) -> StoreResult<Entry>;

    async fn list_entries(&mut self, arg: ListEntriesParams) -> StoreResult<Vec<Entry>>;

    /// Sum of every entry recorded against the account (0 when none)
    async fn sum_entries(&mut self, account_id: i64) -> StoreResult<i64>;

    // === Transfers ===
    async fn create_transfer(&mut self, arg: CreateTransferParams) -> StoreResult<Transfer>;

    async fn get_transfer(&mut self, id: i64) -> StoreResult<Transfer>;

    async fn list_transfers(&mut self, arg: ListTransfersParams) -> StoreResult<Vec<Transfer>>;

    // === Users ===
    async fn create_user(&mut self, arg: CreateUserParams) -> StoreResult<User>;

    async fn get_user(&mut self, username: &str) -> StoreResult<User>;

    async fn update_user(&mut self, arg: UpdateUserParams) -> StoreResult<User>;

    // === Sessions ===
    async fn create_session(&mut self, arg: CreateSessionParams) -> StoreResult<Session>;

    async fn get_session(&mut self, id: uuid::Uuid) -> StoreResult<Session>;

    // === Verify emails ===
    async fn create_verify_email(&mut self, arg: CreateVerifyEmailParams)
    -> StoreResult<VerifyEmail>;

    async fn get_verify_email_for_update(&mut self, id: i64) -> StoreResult<VerifyEmail>;

    /// Mark the record used if it is unused, unexpired and the secret matches.
    /// Any other state yields `NotFound` and changes nothing.
    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail>;
}
