// ── Persistence collaborator ──
//
// The engine treats storage as a synchronous flat record store. Calls
// are made from `spawn_blocking` so a slow disk never stalls a worker.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::error::CoreError;
use crate::model::{NodeRecord, SubnetRecord};

pub trait NodeStore: Send + Sync {
    fn load_subnets(&self) -> Result<Vec<SubnetRecord>, CoreError>;

    fn load_nodes(&self) -> Result<Vec<NodeRecord>, CoreError>;

    /// Fails with `NotFound` when no record exists.
    fn load_node(&self, id: u32) -> Result<NodeRecord, CoreError>;

    fn save_node(&self, record: &NodeRecord) -> Result<(), CoreError>;

    fn save_subnet(&self, record: &SubnetRecord) -> Result<(), CoreError>;

    fn delete_node(&self, id: u32) -> Result<(), CoreError>;

    fn delete_subnet(&self, id: u32) -> Result<(), CoreError>;
}

/// Volatile store for tests and for running without a state file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: Mutex<BTreeMap<u32, NodeRecord>>,
    subnets: Mutex<BTreeMap<u32, SubnetRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(nodes: Vec<NodeRecord>, subnets: Vec<SubnetRecord>) -> Self {
        Self {
            nodes: Mutex::new(nodes.into_iter().map(|r| (r.id, r)).collect()),
            subnets: Mutex::new(subnets.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn subnet_count(&self) -> usize {
        self.subnets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl NodeStore for MemoryStore {
    fn load_subnets(&self) -> Result<Vec<SubnetRecord>, CoreError> {
        Ok(self
            .subnets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn load_nodes(&self) -> Result<Vec<NodeRecord>, CoreError> {
        Ok(self
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn load_node(&self, id: u32) -> Result<NodeRecord, CoreError> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound { entity: "node", id })
    }

    fn save_node(&self, record: &NodeRecord) -> Result<(), CoreError> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record.clone());
        Ok(())
    }

    fn save_subnet(&self, record: &SubnetRecord) -> Result<(), CoreError> {
        self.subnets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record.clone());
        Ok(())
    }

    fn delete_node(&self, id: u32) -> Result<(), CoreError> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }

    fn delete_subnet(&self, id: u32) -> Result<(), CoreError> {
        self.subnets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_node_is_not_found() {
        let store = MemoryStore::new();
        let err = store.load_node(9).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "node", id: 9 }));
    }

    #[test]
    fn save_then_load() {
        let store = MemoryStore::new();
        let record = NodeRecord::new(3, "edge", "192.0.2.1".parse().unwrap());
        store.save_node(&record).unwrap();
        assert_eq!(store.load_node(3).unwrap(), record);
        store.delete_node(3).unwrap();
        assert_eq!(store.node_count(), 0);
    }
}
