//! Ledger Store
//!
//! Path-addressed document store with per-node optimistic compare-and-swap.
//! Business logic never touches a backend directly; every component receives
//! an `Arc<dyn LedgerStore>`.
//!
//! `mutate` is the only operation allowed to change a balance or a status that
//! participates in a race. The update function may run several times (once
//! per conflicting attempt) and must therefore be pure.

pub mod memory;
pub mod paths;
pub mod sqlite;

pub use memory::MemoryStore;
pub use paths::StorePath;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Attempts before a contended `mutate` gives up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("gave up on {path} after {attempts} conflicting attempts")]
    Contention { path: String, attempts: usize },
    #[error("corrupt node at {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("invalid path segment {0:?}")]
    InvalidPath(String),
}

/// Result of an update function.
#[derive(Debug, Clone)]
pub enum Mutation {
    Set(Value),
    Delete,
    Abort,
}

#[derive(Debug, Clone)]
pub enum MutateOutcome {
    Committed {
        before: Option<Value>,
        after: Option<Value>,
    },
    Aborted {
        current: Option<Value>,
    },
}

pub type MutateFn<'a> = dyn Fn(Option<&Value>) -> Mutation + Send + Sync + 'a;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError>;

    /// Unconditional, last writer wins.
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;

    async fn remove(&self, path: &StorePath) -> Result<(), StoreError>;

    /// Every live node strictly below `prefix`, ordered by path.
    async fn list(&self, prefix: &StorePath) -> Result<Vec<(StorePath, Value)>, StoreError>;

    async fn mutate(
        &self,
        path: &StorePath,
        f: &MutateFn<'_>,
    ) -> Result<MutateOutcome, StoreError>;
}

// ===== Typed helpers =====

/// Typed counterpart of [`Mutation`].
pub enum Decision<T> {
    Set(T),
    Delete,
    Abort,
}

#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Committed { before: Option<T>, after: Option<T> },
    Aborted(Option<T>),
}

impl<T> Outcome<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed { .. })
    }
}

fn decode<T: DeserializeOwned>(path: &StorePath, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(path: &StorePath, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

pub async fn read_as<T: DeserializeOwned>(
    store: &dyn LedgerStore,
    path: &StorePath,
) -> Result<Option<T>, StoreError> {
    store
        .read(path)
        .await?
        .map(|v| decode(path, v))
        .transpose()
}

pub async fn write_as<T: Serialize>(
    store: &dyn LedgerStore,
    path: &StorePath,
    value: &T,
) -> Result<(), StoreError> {
    store.write(path, encode(path, value)?).await
}

/// Decodes every child under `prefix`; undecodable nodes are reported, not skipped.
pub async fn list_as<T: DeserializeOwned>(
    store: &dyn LedgerStore,
    prefix: &StorePath,
) -> Result<Vec<(StorePath, T)>, StoreError> {
    store
        .list(prefix)
        .await?
        .into_iter()
        .map(|(p, v)| decode(&p, v).map(|t| (p, t)))
        .collect()
}

/// Typed compare-and-swap. A node that fails to decode aborts the mutation
/// with [`StoreError::Corrupt`] instead of being overwritten.
pub async fn mutate_as<T, F>(
    store: &dyn LedgerStore,
    path: &StorePath,
    f: F,
) -> Result<Outcome<T>, StoreError>
where
    T: Serialize + DeserializeOwned,
    F: Fn(Option<T>) -> Decision<T> + Send + Sync,
{
    let failure: Mutex<Option<StoreError>> = Mutex::new(None);

    let raw = |current: Option<&Value>| -> Mutation {
        let decoded = match current.map(|v| decode::<T>(path, v.clone())).transpose() {
            Ok(v) => v,
            Err(e) => {
                *failure.lock() = Some(e);
                return Mutation::Abort;
            }
        };
        match f(decoded) {
            Decision::Set(next) => match encode(path, &next) {
                Ok(v) => Mutation::Set(v),
                Err(e) => {
                    *failure.lock() = Some(e);
                    Mutation::Abort
                }
            },
            Decision::Delete => Mutation::Delete,
            Decision::Abort => Mutation::Abort,
        }
    };

    let outcome = store.mutate(path, &raw).await?;
    if let Some(err) = failure.lock().take() {
        return Err(err);
    }

    Ok(match outcome {
        MutateOutcome::Committed { before, after } => Outcome::Committed {
            before: before.map(|v| decode(path, v)).transpose()?,
            after: after.map(|v| decode(path, v)).transpose()?,
        },
        MutateOutcome::Aborted { current } => {
            Outcome::Aborted(current.map(|v| decode(path, v)).transpose()?)
        }
    })
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every backend must share; run from each backend's tests.

    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn p(raw: &str) -> StorePath {
        StorePath::parse(raw).unwrap()
    }

    pub async fn read_write_remove(store: &dyn LedgerStore) {
        let path = p("users/u1/wallet");
        assert!(store.read(&path).await.unwrap().is_none());

        store.write(&path, json!({"deposited": 5})).await.unwrap();
        assert_eq!(
            store.read(&path).await.unwrap(),
            Some(json!({"deposited": 5}))
        );

        store.remove(&path).await.unwrap();
        assert!(store.read(&path).await.unwrap().is_none());
    }

    pub async fn list_is_scoped_to_prefix(store: &dyn LedgerStore) {
        store.write(&p("users/u1/transactions/a"), json!(1)).await.unwrap();
        store.write(&p("users/u1/transactions/b"), json!(2)).await.unwrap();
        store.write(&p("users/u10/transactions/c"), json!(3)).await.unwrap();
        store.write(&p("users/u1/wallet"), json!(4)).await.unwrap();
        store.remove(&p("users/u1/transactions/b")).await.unwrap();

        let listed = store.list(&p("users/u1/transactions")).await.unwrap();
        let paths: Vec<_> = listed.iter().map(|(k, _)| k.as_str().to_string()).collect();
        assert_eq!(paths, vec!["users/u1/transactions/a"]);

        let all_u1 = store.list(&p("users/u1")).await.unwrap();
        assert_eq!(all_u1.len(), 2);
    }

    pub async fn mutate_commits_and_aborts(store: &dyn LedgerStore) {
        let path = p("leaderboards/today");

        let first = mutate_as::<bool, _>(store, &path, |current| match current {
            Some(true) => Decision::Abort,
            _ => Decision::Set(true),
        })
        .await
        .unwrap();
        assert!(matches!(
            first,
            Outcome::Committed {
                before: None,
                after: Some(true)
            }
        ));

        let second = mutate_as::<bool, _>(store, &path, |current| match current {
            Some(true) => Decision::Abort,
            _ => Decision::Set(true),
        })
        .await
        .unwrap();
        assert!(matches!(second, Outcome::Aborted(Some(true))));

        let deleted = mutate_as::<bool, _>(store, &path, |_| Decision::Delete)
            .await
            .unwrap();
        assert!(deleted.is_committed());
        assert!(store.read(&path).await.unwrap().is_none());
    }

    pub async fn corrupt_node_is_not_overwritten(store: &dyn LedgerStore) {
        let path = p("orders/ORD_1");
        store.write(&path, json!("not a number")).await.unwrap();

        let result = mutate_as::<u64, _>(store, &path, |v| Decision::Set(v.unwrap_or(0) + 1)).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
        assert_eq!(store.read(&path).await.unwrap(), Some(json!("not a number")));
    }

    pub async fn concurrent_increments_are_serialized(store: Arc<dyn LedgerStore>) {
        let path = p("counters/c1");
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                mutate_as::<u64, _>(store.as_ref(), &path, |v| {
                    Decision::Set(v.unwrap_or(0) + 1)
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_committed());
        }
        assert_eq!(store.read(&path).await.unwrap(), Some(json!(32)));
    }
}
