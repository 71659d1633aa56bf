//! In-process ledger store
//!
//! Versioned nodes in a `BTreeMap`. Deletes leave a tombstone so a node's
//! version only ever grows and a compare-and-swap cannot be fooled by a
//! delete-then-recreate.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{LedgerStore, MutateFn, MutateOutcome, Mutation, StoreError, StorePath};

struct Node {
    value: Option<Value>,
    version: u64,
}

pub struct MemoryStore {
    nodes: RwLock<BTreeMap<String, Node>>,
    max_attempts: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            max_attempts: super::DEFAULT_MAX_ATTEMPTS,
        }
    }

    fn snapshot(&self, key: &str) -> (Option<Value>, u64) {
        let nodes = self.nodes.read();
        match nodes.get(key) {
            Some(node) => (node.value.clone(), node.version),
            None => (None, 0),
        }
    }

    fn put(&self, key: &str, value: Option<Value>) {
        let mut nodes = self.nodes.write();
        let version = nodes.get(key).map(|n| n.version).unwrap_or(0) + 1;
        nodes.insert(key.to_string(), Node { value, version });
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        Ok(self.snapshot(path.as_str()).0)
    }

    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        self.put(path.as_str(), Some(value));
        Ok(())
    }

    async fn remove(&self, path: &StorePath) -> Result<(), StoreError> {
        self.put(path.as_str(), None);
        Ok(())
    }

    async fn list(&self, prefix: &StorePath) -> Result<Vec<(StorePath, Value)>, StoreError> {
        let (lo, hi) = prefix.descendant_range();
        let nodes = self.nodes.read();
        nodes
            .range(lo..hi)
            .filter_map(|(k, n)| n.value.clone().map(|v| (k, v)))
            .map(|(k, v)| StorePath::parse(k).map(|p| (p, v)))
            .collect()
    }

    async fn mutate(
        &self,
        path: &StorePath,
        f: &MutateFn<'_>,
    ) -> Result<MutateOutcome, StoreError> {
        let key = path.as_str();

        for _ in 0..self.max_attempts {
            let (current, version) = self.snapshot(key);

            let next = match f(current.as_ref()) {
                Mutation::Abort => return Ok(MutateOutcome::Aborted { current }),
                Mutation::Set(v) => Some(v),
                Mutation::Delete => None,
            };

            {
                let mut nodes = self.nodes.write();
                let live = nodes.get(key).map(|n| n.version).unwrap_or(0);
                if live == version {
                    nodes.insert(
                        key.to_string(),
                        Node {
                            value: next.clone(),
                            version: version + 1,
                        },
                    );
                    return Ok(MutateOutcome::Committed {
                        before: current,
                        after: next,
                    });
                }
            }

            tokio::task::yield_now().await;
        }

        Err(StoreError::Contention {
            path: key.to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_read_write_remove() {
        conformance::read_write_remove(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_prefix() {
        conformance::list_is_scoped_to_prefix(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_mutate_commits_and_aborts() {
        conformance::mutate_commits_and_aborts(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_corrupt_node_is_not_overwritten() {
        conformance::corrupt_node_is_not_overwritten(&MemoryStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_serialized() {
        conformance::concurrent_increments_are_serialized(Arc::new(MemoryStore::new())).await;
    }
}
