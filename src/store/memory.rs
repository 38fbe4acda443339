//! In-process backend
//!
//! Serializable by construction: a transaction holds the table lock from
//! `begin` until `commit`/`rollback` and works on a private copy, which
//! replaces the shared tables only on commit. Autocommit calls take the lock
//! for one statement. Constraints mirror `migrations/` so the orchestrations
//! behave identically on both backends.
//!
//! A unit of work must only use the handle it is given; calling the
//! autocommit handle from inside a transaction waits on the same lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::coordinator::TxBackend;
use super::error::{StoreError, StoreResult};
use super::models::*;
use super::querier::Querier;

#[derive(Debug, Clone, Default)]
struct Sequences {
    account: i64,
    entry: i64,
    transfer: i64,
    verify_email: i64,
}

fn next_id(seq: &mut i64) -> i64 {
    *seq += 1;
    *seq
}

fn page<T: Clone>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    rows.skip(offset).take(limit).collect()
}

fn fk_violation(constraint: &str) -> StoreError {
    StoreError::Other(format!("foreign key violation: {constraint}"))
}

#[derive(Debug, Clone, Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    users: BTreeMap<String, User>,
    sessions: HashMap<Uuid, Session>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    seq: Sequences,
}

impl Tables {
    fn account(&self, id: i64) -> StoreResult<&Account> {
        self.accounts
            .get(&id)
            .ok_or(StoreError::NotFound { entity: "account" })
    }

    fn create_account(&mut self, arg: CreateAccountParams) -> StoreResult<Account> {
        if !self.users.contains_key(&arg.owner) {
            return Err(fk_violation("accounts_owner_fkey"));
        }
        let duplicate = self
            .accounts
            .values()
            .any(|a| a.owner == arg.owner && a.currency == arg.currency);
        if duplicate {
            return Err(StoreError::UniqueViolation {
                entity: "account",
                constraint: "owner_currency_key".to_string(),
            });
        }

        let account = Account {
            id: next_id(&mut self.seq.account),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn list_accounts(&self, arg: &ListAccountsParams) -> Vec<Account> {
        let rows = self
            .accounts
            .values()
            .filter(|a| arg.owner.as_ref().is_none_or(|owner| &a.owner == owner))
            .cloned();
        page(rows, arg.limit, arg.offset)
    }

    fn update_account_balance(&mut self, arg: UpdateAccountBalanceParams) -> StoreResult<Account> {
        let account = self
            .accounts
            .get_mut(&arg.id)
            .ok_or(StoreError::NotFound { entity: "account" })?;
        account.balance = account
            .balance
            .checked_add(arg.amount)
            .ok_or_else(|| StoreError::Other("bigint out of range".to_string()))?;
        Ok(account.clone())
    }

    fn create_entry(&mut self, arg: CreateEntryParams) -> StoreResult<Entry> {
        if !self.accounts.contains_key(&arg.account_id) {
            return Err(fk_violation("entries_account_id_fkey"));
        }
        let entry = Entry {
            id: next_id(&mut self.seq.entry),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn sum_entries(&self, account_id: i64) -> StoreResult<i64> {
        self.entries
            .values()
            .filter(|e| e.account_id == account_id)
            .try_fold(0i64, |acc, e| acc.checked_add(e.amount))
            .ok_or_else(|| StoreError::Other("bigint out of range".to_string()))
    }

    fn create_transfer(&mut self, arg: CreateTransferParams) -> StoreResult<Transfer> {
        if !self.accounts.contains_key(&arg.from_account_id) {
            return Err(fk_violation("transfers_from_account_id_fkey"));
        }
        if !self.accounts.contains_key(&arg.to_account_id) {
            return Err(fk_violation("transfers_to_account_id_fkey"));
        }
        if arg.amount <= 0 {
            return Err(StoreError::Other(
                "check constraint violation: transfers_amount_check".to_string(),
            ));
        }
        let transfer = Transfer {
            id: next_id(&mut self.seq.transfer),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    fn email_taken(&self, email: &str, except: Option<&str>) -> bool {
        self.users
            .values()
            .any(|u| u.email == email && Some(u.username.as_str()) != except)
    }

    fn create_user(&mut self, arg: CreateUserParams) -> StoreResult<User> {
        if self.users.contains_key(&arg.username) {
            return Err(StoreError::UniqueViolation {
                entity: "user",
                constraint: "users_pkey".to_string(),
            });
        }
        if self.email_taken(&arg.email, None) {
            return Err(StoreError::UniqueViolation {
                entity: "user",
                constraint: "users_email_key".to_string(),
            });
        }
        let now = Utc::now();
        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            is_email_verified: false,
            password_changed_at: now,
            created_at: now,
        };
        self.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    fn update_user(&mut self, arg: UpdateUserParams) -> StoreResult<User> {
        if let Some(email) = &arg.email {
            if self.email_taken(email, Some(&arg.username)) {
                return Err(StoreError::UniqueViolation {
                    entity: "user",
                    constraint: "users_email_key".to_string(),
                });
            }
        }
        let user = self
            .users
            .get_mut(&arg.username)
            .ok_or(StoreError::NotFound { entity: "user" })?;

        if let Some(hashed_password) = arg.hashed_password {
            user.hashed_password = hashed_password;
            user.password_changed_at = Utc::now();
        }
        if let Some(full_name) = arg.full_name {
            user.full_name = full_name;
        }
        if let Some(email) = arg.email {
            user.email = email;
        }
        if let Some(verified) = arg.is_email_verified {
            user.is_email_verified = verified;
        }
        Ok(user.clone())
    }

    fn create_session(&mut self, arg: CreateSessionParams) -> StoreResult<Session> {
        if !self.users.contains_key(&arg.username) {
            return Err(fk_violation("sessions_username_fkey"));
        }
        if self.sessions.contains_key(&arg.id) {
            return Err(StoreError::UniqueViolation {
                entity: "session",
                constraint: "sessions_pkey".to_string(),
            });
        }
        let session = Session {
            id: arg.id,
            username: arg.username,
            refresh_token: arg.refresh_token,
            user_agent: arg.user_agent,
            client_ip: arg.client_ip,
            is_blocked: arg.is_blocked,
            expires_at: arg.expires_at,
            created_at: Utc::now(),
        };
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    fn create_verify_email(&mut self, arg: CreateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        if !self.users.contains_key(&arg.username) {
            return Err(fk_violation("verify_emails_username_fkey"));
        }
        let record = VerifyEmail {
            id: next_id(&mut self.seq.verify_email),
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: Utc::now(),
            expired_at: arg.expired_at,
        };
        self.verify_emails.insert(record.id, record.clone());
        Ok(record)
    }

    fn update_verify_email(&mut self, arg: UpdateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        let now = Utc::now();
        match self.verify_emails.get_mut(&arg.id) {
            Some(record)
                if !record.is_used
                    && record.secret_code == arg.secret_code
                    && !record.is_expired_at(now) =>
            {
                record.is_used = true;
                Ok(record.clone())
            }
            _ => Err(StoreError::NotFound {
                entity: "verify email",
            }),
        }
    }
}

/// One-shot failure switches for exercising the coordinator's error paths
#[derive(Debug, Default)]
pub struct Faults {
    begin: AtomicBool,
    commit: AtomicBool,
    rollback: AtomicBool,
}

impl Faults {
    pub fn fail_next_begin(&self) {
        self.begin.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self) {
        self.commit.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_rollback(&self) {
        self.rollback.store(true, Ordering::SeqCst);
    }

    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

enum HandleState {
    Autocommit(Arc<Mutex<Tables>>),
    InTx {
        guard: OwnedMutexGuard<Tables>,
        working: Tables,
    },
}

/// Query handle for [`MemoryBackend`]
pub struct MemoryHandle {
    state: HandleState,
}

impl MemoryHandle {
    async fn with<R>(&mut self, f: impl FnOnce(&mut Tables) -> R + Send) -> R {
        match &mut self.state {
            HandleState::Autocommit(shared) => {
                let mut tables = shared.lock().await;
                f(&mut tables)
            }
            HandleState::InTx { working, .. } => f(working),
        }
    }

    fn into_tx(self) -> StoreResult<(OwnedMutexGuard<Tables>, Tables)> {
        match self.state {
            HandleState::InTx { guard, working } => Ok((guard, working)),
            HandleState::Autocommit(_) => {
                Err(StoreError::Other("no transaction in progress".to_string()))
            }
        }
    }
}

#[async_trait]
impl TxBackend for MemoryBackend {
    type Handle = MemoryHandle;

    fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            state: HandleState::Autocommit(Arc::clone(&self.tables)),
        }
    }

    async fn begin(&self) -> StoreResult<MemoryHandle> {
        if Faults::take(&self.faults.begin) {
            return Err(StoreError::Other("injected begin failure".to_string()));
        }
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = (*guard).clone();
        Ok(MemoryHandle {
            state: HandleState::InTx { guard, working },
        })
    }

    async fn commit(&self, tx: MemoryHandle) -> StoreResult<()> {
        let (mut guard, working) = tx.into_tx()?;
        if Faults::take(&self.faults.commit) {
            return Err(StoreError::Other("injected commit failure".to_string()));
        }
        *guard = working;
        debug!("memory transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx: MemoryHandle) -> StoreResult<()> {
        let _discarded = tx.into_tx()?;
        if Faults::take(&self.faults.rollback) {
            return Err(StoreError::Other("injected rollback failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Querier for MemoryHandle {
    async fn create_account(&mut self, arg: CreateAccountParams) -> StoreResult<Account> {
        self.with(|t| t.create_account(arg)).await
    }

    async fn get_account(&mut self, id: i64) -> StoreResult<Account> {
        self.with(|t| t.account(id).cloned()).await
    }

    async fn get_account_for_update(&mut self, id: i64) -> StoreResult<Account> {
        // the transaction already holds the table lock
        self.get_account(id).await
    }

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> StoreResult<Vec<Account>> {
        Ok(self.with(|t| t.list_accounts(&arg)).await)
    }

    async fn update_account_balance(
        &mut self,
        arg: UpdateAccountBalanceParams,
    ) -> StoreResult<Account> {
        self.with(|t| t.update_account_balance(arg)).await
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> StoreResult<Entry> {
        self.with(|t| t.create_entry(arg)).await
    }

    async fn get_entry(&mut self, id: i64) -> StoreResult<Entry> {
        self.with(|t| t.entries.get(&id).cloned())
            .await
            .ok_or(StoreError::NotFound { entity: "entry" })
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        Ok(self
            .with(|t| {
                let rows = t
                    .entries
                    .values()
                    .filter(|e| e.account_id == arg.account_id)
                    .cloned();
                page(rows, arg.limit, arg.offset)
            })
            .await)
    }

    async fn sum_entries(&mut self, account_id: i64) -> StoreResult<i64> {
        self.with(|t| t.sum_entries(account_id)).await
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> StoreResult<Transfer> {
        self.with(|t| t.create_transfer(arg)).await
    }

    async fn get_transfer(&mut self, id: i64) -> StoreResult<Transfer> {
        self.with(|t| t.transfers.get(&id).cloned())
            .await
            .ok_or(StoreError::NotFound { entity: "transfer" })
    }

    async fn list_transfers(&mut self, arg: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        Ok(self
            .with(|t| {
                let rows = t
                    .transfers
                    .values()
                    .filter(|tr| {
                        tr.from_account_id == arg.from_account_id
                            || tr.to_account_id == arg.to_account_id
                    })
                    .cloned();
                page(rows, arg.limit, arg.offset)
            })
            .await)
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> StoreResult<User> {
        self.with(|t| t.create_user(arg)).await
    }

    async fn get_user(&mut self, username: &str) -> StoreResult<User> {
        self.with(|t| t.users.get(username).cloned())
            .await
            .ok_or(StoreError::NotFound { entity: "user" })
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> StoreResult<User> {
        self.with(|t| t.update_user(arg)).await
    }

    async fn create_session(&mut self, arg: CreateSessionParams) -> StoreResult<Session> {
        self.with(|t| t.create_session(arg)).await
    }

    async fn get_session(&mut self, id: Uuid) -> StoreResult<Session> {
        self.with(|t| t.sessions.get(&id).cloned())
            .await
            .ok_or(StoreError::NotFound { entity: "session" })
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail> {
        self.with(|t| t.create_verify_email(arg)).await
    }

    async fn get_verify_email_for_update(&mut self, id: i64) -> StoreResult<VerifyEmail> {
        self.with(|t| t.verify_emails.get(&id).cloned())
            .await
            .ok_or(StoreError::NotFound {
                entity: "verify email",
            })
    }

    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail> {
        self.with(|t| t.update_verify_email(arg)).await
    }
}
