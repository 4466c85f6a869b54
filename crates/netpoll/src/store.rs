// ── JSON state file ──
//
// The whole inventory lives in one JSON document that is rewritten on
// every change. Writes go to a sibling temp file that is renamed over
// the original, so a crash leaves either the old or the new state.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use netpoll_core::{CoreError, NodeRecord, NodeStore, SubnetRecord};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(default)]
    subnets: Vec<SubnetRecord>,
    /// Kept raw so one unreadable record does not take the rest down.
    #[serde(default)]
    nodes: Vec<Value>,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<u32, NodeRecord>,
    subnets: BTreeMap<u32, SubnetRecord>,
    /// Records that failed to parse; written back untouched.
    unreadable: Vec<Value>,
}

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => parse(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file yet");
                State::default()
            }
            Err(e) => return Err(persistence(&path, &e)),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of node records that could not be parsed.
    pub fn unreadable(&self) -> usize {
        self.lock().unreadable.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate(&self, change: impl FnOnce(&mut State)) -> Result<(), CoreError> {
        let mut state = self.lock();
        change(&mut state);
        self.flush(&state)
    }

    fn flush(&self, state: &State) -> Result<(), CoreError> {
        let mut nodes = state
            .nodes
            .values()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        nodes.extend(state.unreadable.iter().cloned());
        let document = StateDocument {
            version: FORMAT_VERSION,
            subnets: state.subnets.values().cloned().collect(),
            nodes,
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| persistence(parent, &e))?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, bytes).map_err(|e| persistence(&staging, &e))?;
        fs::rename(&staging, &self.path).map_err(|e| persistence(&self.path, &e))
    }
}

fn persistence(path: &Path, err: &io::Error) -> CoreError {
    CoreError::Persistence {
        message: format!("{}: {err}", path.display()),
    }
}

fn parse(bytes: &[u8]) -> Result<State, CoreError> {
    let document: StateDocument = serde_json::from_slice(bytes)?;
    if document.version > FORMAT_VERSION {
        return Err(CoreError::Persistence {
            message: format!("state format {} is newer than {FORMAT_VERSION}", document.version),
        });
    }

    let mut state = State {
        subnets: document.subnets.into_iter().map(|s| (s.id, s)).collect(),
        ..State::default()
    };
    for raw in document.nodes {
        match serde_json::from_value::<NodeRecord>(raw.clone()) {
            Ok(record) => {
                state.nodes.insert(record.id, record);
            }
            Err(e) => {
                let id = raw.get("id").and_then(Value::as_u64);
                warn!(node_id = ?id, error = %e, "skipping unreadable node record");
                state.unreadable.push(raw);
            }
        }
    }
    Ok(state)
}

impl NodeStore for JsonFileStore {
    fn load_subnets(&self) -> Result<Vec<SubnetRecord>, CoreError> {
        Ok(self.lock().subnets.values().cloned().collect())
    }

    fn load_nodes(&self) -> Result<Vec<NodeRecord>, CoreError> {
        Ok(self.lock().nodes.values().cloned().collect())
    }

    fn load_node(&self, id: u32) -> Result<NodeRecord, CoreError> {
        self.lock()
            .nodes
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound { entity: "node", id })
    }

    fn save_node(&self, record: &NodeRecord) -> Result<(), CoreError> {
        self.mutate(|s| {
            s.nodes.insert(record.id, record.clone());
        })
    }

    fn save_subnet(&self, record: &SubnetRecord) -> Result<(), CoreError> {
        self.mutate(|s| {
            s.subnets.insert(record.id, record.clone());
        })
    }

    fn delete_node(&self, id: u32) -> Result<(), CoreError> {
        self.mutate(|s| {
            s.nodes.remove(&id);
        })
    }

    fn delete_subnet(&self, id: u32) -> Result<(), CoreError> {
        self.mutate(|s| {
            s.subnets.remove(&id);
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(id: u32, address: &str) -> NodeRecord {
        NodeRecord::new(id, format!("node-{id}"), address.parse().unwrap())
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state.json")).unwrap();
        assert!(store.load_nodes().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn records_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("state.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.save_node(&record(1, "10.0.0.1")).unwrap();
        store.save_node(&record(2, "10.0.0.2")).unwrap();
        store
            .save_subnet(&SubnetRecord {
                id: 3,
                zone_id: 0,
                network: "10.0.0.0/24".parse().unwrap(),
                synthetic_mask: false,
            })
            .unwrap();
        store.delete_node(2).unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.load_nodes().unwrap(), vec![record(1, "10.0.0.1")]);
        assert_eq!(reopened.load_subnets().unwrap().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn unreadable_records_are_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let good = serde_json::to_value(record(1, "10.0.0.1")).unwrap();
        let document = serde_json::json!({
            "version": 1,
            "nodes": [good, { "id": 2, "name": "broken", "primary_ip": "not-an-ip" }],
        });
        fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.load_nodes().unwrap().len(), 1);
        assert_eq!(store.unreadable(), 1);

        // Rewriting the file keeps the broken record for later repair.
        store.save_node(&record(3, "10.0.0.3")).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("not-an-ip"));
    }

    #[test]
    fn garbage_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ nope").unwrap();
        let err = JsonFileStore::open(&path).unwrap_err();
        assert!(matches!(err, CoreError::Persistence { .. }));
    }

    #[test]
    fn newer_format_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, br#"{ "version": 99 }"#).unwrap();
        assert!(JsonFileStore::open(&path).is_err());
    }
}
