//! In-memory store.
//!
//! Backs tests and the default `memory://` configuration. Packets live in a
//! per-call BTreeMap keyed by sequence, which gives both the uniqueness
//! check and the ordered scan for free.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{CallStore, InsertOutcome, StoreError};
use crate::call::{CallRecord, PacketRecord};

#[derive(Default)]
pub struct MemoryStore {
    calls: RwLock<HashMap<String, CallRecord>>,
    packets: RwLock<HashMap<String, BTreeMap<u64, PacketRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn create_if_absent(&self, call_id: &str) -> Result<CallRecord, StoreError> {
        let mut calls = self.calls.write();
        Ok(calls
            .entry(call_id.to_string())
            .or_insert_with(|| CallRecord::new(call_id))
            .clone())
    }

    async fn load(&self, call_id: &str) -> Result<Option<CallRecord>, StoreError> {
        Ok(self.calls.read().get(call_id).cloned())
    }

    async fn save(&self, call: &CallRecord) -> Result<(), StoreError> {
        let mut calls = self.calls.write();
        match calls.get_mut(&call.call_id) {
            Some(slot) => {
                *slot = call.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(call.call_id.clone())),
        }
    }

    async fn insert_packet(&self, packet: &PacketRecord) -> Result<InsertOutcome, StoreError> {
        let mut packets = self.packets.write();
        let per_call = packets.entry(packet.call_id.clone()).or_default();
        if per_call.contains_key(&packet.sequence) {
            return Ok(InsertOutcome::Duplicate);
        }
        per_call.insert(packet.sequence, packet.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn list_packets_ordered(&self, call_id: &str) -> Result<Vec<PacketRecord>, StoreError> {
        Ok(self
            .packets
            .read()
            .get(call_id)
            .map(|per_call| per_call.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(call_id: &str, sequence: u64) -> PacketRecord {
        PacketRecord::new(call_id, sequence, format!("chunk-{sequence}"), 1.0)
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.create_if_absent("c1").await.unwrap();
        let second = store.create_if_absent("c1").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.load("c1").await.unwrap().unwrap().call_id, "c1");
    }

    #[tokio::test]
    async fn save_requires_existing_row() {
        let store = MemoryStore::new();
        let ghost = CallRecord::new("ghost");
        assert!(matches!(
            store.save(&ghost).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_insert_is_signaled() {
        let store = MemoryStore::new();
        assert_eq!(
            store.insert_packet(&packet("c1", 0)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_packet(&packet("c1", 0)).await.unwrap(),
            InsertOutcome::Duplicate
        );
        // Same sequence on another call is a different key.
        assert_eq!(
            store.insert_packet(&packet("c2", 0)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(store.list_packets_ordered("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn packets_scan_in_sequence_order() {
        let store = MemoryStore::new();
        for sequence in [5u64, 0, 3, 1] {
            store.insert_packet(&packet("c1", sequence)).await.unwrap();
        }
        let sequences: Vec<u64> = store
            .list_packets_ordered("c1")
            .await
            .unwrap()
            .iter()
            .map(|p| p.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 3, 5]);
    }
}
