//! In-memory queues shared by the pipeline stages

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::WithdrawalRequest;

/// Withdrawals awaiting broadcast, in arrival order
#[derive(Debug, Default)]
pub struct PendingSendSet {
    entries: Vec<WithdrawalRequest>,
}

impl PendingSendSet {
    pub fn push(&mut self, request: WithdrawalRequest) {
        self.entries.push(request);
    }

    pub fn iter(&self) -> impl Iterator<Item = &WithdrawalRequest> {
        self.entries.iter()
    }

    /// Remove the entry matching (asset, id), keeping the order of the rest
    pub fn remove(&mut self, asset: &str, id: i64) -> Option<WithdrawalRequest> {
        let index = self
            .entries
            .iter()
            .position(|r| r.id == id && r.asset == asset)?;
        Some(self.entries.remove(index))
    }

    pub fn ids(&self) -> Vec<i64> {
        self.entries.iter().map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Broadcast transaction hashes awaiting inclusion, with their poll counts.
///
/// Poll counts are atomics so the confirmation pass can bump them while it
/// only holds the read lock.
#[derive(Debug, Default)]
pub struct WatchSet {
    entries: HashMap<String, AtomicU64>,
}

impl WatchSet {
    /// Start watching `tx_hash`; an existing entry keeps its count
    pub fn insert(&mut self, tx_hash: String) {
        self.entries
            .entry(tx_hash)
            .or_insert_with(|| AtomicU64::new(0));
    }

    pub fn remove(&mut self, tx_hash: &str) -> bool {
        self.entries.remove(tx_hash).is_some()
    }

    /// Increment the poll count of `tx_hash`, returning the previous value
    pub fn bump(&self, tx_hash: &str) -> Option<u64> {
        self.entries
            .get(tx_hash)
            .map(|count| count.fetch_add(1, Ordering::Relaxed))
    }

    pub fn hashes(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.entries
            .iter()
            .map(|(hash, count)| (hash.clone(), count.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;

    fn request(id: i64) -> WithdrawalRequest {
        WithdrawalRequest {
            id,
            asset: "BTC".to_string(),
            amount: BigDecimal::from(1),
            address: format!("addr-{}", id),
        }
    }

    #[test]
    fn test_pending_preserves_order_on_remove() {
        let mut pending = PendingSendSet::default();
        for id in 1..=4 {
            pending.push(request(id));
        }
        assert!(pending.remove("BTC", 2).is_some());
        assert_eq!(pending.ids(), vec![1, 3, 4]);
    }

    #[test]
    fn test_pending_remove_requires_asset_match() {
        let mut pending = PendingSendSet::default();
        pending.push(request(1));
        assert!(pending.remove("ETH", 1).is_none());
        assert_eq!(pending.ids(), vec![1]);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_watch_bump_and_reinsert() {
        let mut watch = WatchSet::default();
        watch.insert("abc".to_string());
        assert_eq!(watch.bump("abc"), Some(0));
        assert_eq!(watch.bump("abc"), Some(1));
        watch.insert("abc".to_string());
        assert_eq!(watch.snapshot().get("abc"), Some(&2));
        assert_eq!(watch.bump("missing"), None);
    }

    #[test]
    fn test_watch_snapshot() {
        let mut watch = WatchSet::default();
        watch.insert("h1".to_string());
        watch.insert("h2".to_string());
        watch.bump("h1");
        let snapshot = watch.snapshot();
        assert_eq!(snapshot.get("h1"), Some(&1));
        assert_eq!(snapshot.get("h2"), Some(&0));
        assert!(watch.remove("h1"));
        assert!(!watch.remove("h1"));
        assert_eq!(watch.len(), 1);
    }
}
