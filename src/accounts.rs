//! Player accounts and balance mutation
//!
//! The balance in `users/{id}` is the single source of truth for funds and
//! is always read from the store. Every mutation holds the player's own
//! async lock across its read and write, so concurrent bets and settlement
//! credits for one player never lose an update. Locks exist only while
//! someone holds or waits for them.

use crate::{
    clock::Clock,
    errors::{CrashResult, GameError, StoreError},
    records::{self, user_key},
    store::StateStore,
    types::PlayerId,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerAccount {
    pub id: PlayerId,
    pub username: String,
    pub balance: f64,
    pub created_at: u64,
    pub last_login: u64,
}

pub struct AccountBook {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    starting_balance: f64,
    locks: DashMap<PlayerId, Arc<Mutex<()>>>,
}

/// Exclusive access to one player's balance; the lock entry is dropped
/// from the map on release when nobody else is waiting for it
struct PlayerGuard<'a> {
    book: &'a AccountBook,
    player_id: PlayerId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PlayerGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.book
            .locks
            .remove_if(&self.player_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl AccountBook {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, starting_balance: f64) -> Self {
        Self {
            store,
            clock,
            starting_balance,
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, player_id: &PlayerId) -> PlayerGuard<'_> {
        let lock = self
            .locks
            .entry(player_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        PlayerGuard {
            book: self,
            player_id: player_id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Players with a balance mutation in flight
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    async fn load(&self, player_id: &PlayerId) -> CrashResult<Option<PlayerAccount>> {
        records::load(self.store.as_ref(), &user_key(player_id)).await
    }

    async fn commit(&self, account: PlayerAccount, extras: Vec<(String, Value)>) -> CrashResult<PlayerAccount> {
        let mut entries = Vec::with_capacity(extras.len() + 1);
        entries.push((user_key(&account.id), records::to_value(&account)?));
        entries.extend(extras);

        self.store.set_batch(entries).await?;
        Ok(account)
    }

    pub async fn get(&self, player_id: &PlayerId) -> CrashResult<Option<PlayerAccount>> {
        self.load(player_id).await
    }

    /// Existing account with a refreshed `last_login`, or a new one holding
    /// the starting balance
    pub async fn get_or_create(&self, player_id: &PlayerId, username: &str) -> CrashResult<PlayerAccount> {
        let _guard = self.lock(player_id).await;
        let now = self.clock.now_ms();

        let account = match self.load(player_id).await? {
            Some(mut account) => {
                account.last_login = now;
                if !username.is_empty() {
                    account.username = username.to_string();
                }
                account
            }
            None => {
                tracing::info!(player_id = %player_id, balance = self.starting_balance, "Creating player account");
                PlayerAccount {
                    id: player_id.clone(),
                    username: username.to_string(),
                    balance: self.starting_balance,
                    created_at: now,
                    last_login: now,
                }
            }
        };

        self.commit(account, Vec::new()).await
    }

    /// Take `amount` from the balance. Fails with `InsufficientFunds` without
    /// touching anything when the balance is too low.
    ///
    /// `extras` are written in the same atomic batch as the new balance.
    pub async fn debit(
        &self,
        player_id: &PlayerId,
        amount: f64,
        extras: Vec<(String, Value)>,
    ) -> CrashResult<PlayerAccount> {
        let _guard = self.lock(player_id).await;

        let Some(mut account) = self.load(player_id).await? else {
            return Err(GameError::InsufficientFunds {
                balance: 0.0,
                requested: amount,
            }
            .into());
        };

        if amount > account.balance {
            tracing::debug!(player_id = %player_id, balance = account.balance, amount, "Insufficient funds");
            return Err(GameError::InsufficientFunds {
                balance: account.balance,
                requested: amount,
            }
            .into());
        }

        account.balance -= amount;
        self.commit(account, extras).await
    }

    /// Add `amount` to the balance, writing `extras` in the same batch
    pub async fn credit(
        &self,
        player_id: &PlayerId,
        amount: f64,
        extras: Vec<(String, Value)>,
    ) -> CrashResult<PlayerAccount> {
        let _guard = self.lock(player_id).await;

        let Some(mut account) = self.load(player_id).await? else {
            return Err(StoreError::Corrupted {
                key: user_key(player_id),
                reason: "credit for unknown account".to_string(),
            }
            .into());
        };

        account.balance += amount;
        self.commit(account, extras).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::CrashError;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn book() -> (Arc<MemoryStore>, Arc<ManualClock>, AccountBook) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let book = AccountBook::new(store.clone(), clock.clone(), 1_000.0);
        (store, clock, book)
    }

    #[tokio::test]
    async fn test_get_or_create() {
        let (_, clock, book) = book();
        let alice = PlayerId::from("alice");

        let created = book.get_or_create(&alice, "Alice").await.unwrap();
        assert_eq!(created.balance, 1_000.0);
        assert_eq!(created.created_at, 1_000);

        clock.advance(500);
        let again = book.get_or_create(&alice, "Alice").await.unwrap();
        assert_eq!(again.created_at, 1_000);
        assert_eq!(again.last_login, 1_500);
    }

    #[tokio::test]
    async fn test_debit_then_credit() {
        let (store, _, book) = book();
        let alice = PlayerId::from("alice");
        book.get_or_create(&alice, "Alice").await.unwrap();

        let after_bet = book.debit(&alice, 100.0, Vec::new()).await.unwrap();
        assert_eq!(after_bet.balance, 900.0);

        let after_win = book
            .credit(&alice, 250.0, vec![("settlements/r".into(), json!({"credited": ["alice"]}))])
            .await
            .unwrap();
        assert_eq!(after_win.balance, 1_150.0);

        let stored: PlayerAccount = records::load(store.as_ref(), "users/alice").await.unwrap().unwrap();
        assert_eq!(stored.balance, 1_150.0);
        assert!(store.get("settlements/r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_insufficient_funds_does_not_mutate() {
        let (_, _, book) = book();
        let bob = PlayerId::from("bob");
        book.get_or_create(&bob, "Bob").await.unwrap();

        let err = book.debit(&bob, 1_000.01, Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            CrashError::Game(GameError::InsufficientFunds { balance, requested })
                if balance == 1_000.0 && requested == 1_000.01
        ));
        assert_eq!(book.get(&bob).await.unwrap().unwrap().balance, 1_000.0);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_balance() {
        let (store, _, book) = book();
        let carol = PlayerId::from("carol");
        book.get_or_create(&carol, "Carol").await.unwrap();

        store.fail_next_writes(1);
        assert!(book.debit(&carol, 10.0, Vec::new()).await.unwrap_err().is_store_unavailable());
        assert_eq!(book.get(&carol).await.unwrap().unwrap().balance, 1_000.0);
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let (_, _, book) = book();
        let book = Arc::new(book);
        let dave = PlayerId::from("dave");
        book.get_or_create(&dave, "Dave").await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let book = book.clone();
            let dave = dave.clone();
            tasks.push(tokio::spawn(async move { book.debit(&dave, 100.0, Vec::new()).await.is_ok() }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(book.get(&dave).await.unwrap().unwrap().balance, 0.0);
    }

    #[tokio::test]
    async fn test_idle_locks_are_released() {
        let (_, _, book) = book();
        let book = Arc::new(book);

        let mut tasks = Vec::new();
        for i in 0..50 {
            let book = book.clone();
            tasks.push(tokio::spawn(async move {
                let player = PlayerId::from(format!("p{}", i % 5));
                book.get_or_create(&player, "p").await.unwrap();
                book.debit(&player, 1.0, Vec::new()).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(book.active_locks(), 0);
        let p0 = book.get(&PlayerId::from("p0")).await.unwrap().unwrap();
        assert_eq!(p0.balance, 990.0);
    }

    #[tokio::test]
    async fn test_reads_through_to_store() {
        let (store, clock, book) = book();
        let erin = PlayerId::from("erin");
        book.get_or_create(&erin, "Erin").await.unwrap();
        book.debit(&erin, 40.0, Vec::new()).await.unwrap();

        let fresh = AccountBook::new(store, clock, 1_000.0);
        assert_eq!(fresh.get(&erin).await.unwrap().unwrap().balance, 960.0);
    }
}
