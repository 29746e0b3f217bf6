//! Global workload name index.
//!
//! Containers and wasm instances share the CRI id namespace, so all name
//! reservations go through one registry; each entry records which pipeline
//! owns it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{YardError, YardResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Container,
    WasmInstance,
}

#[derive(Debug, Clone)]
struct Reservation {
    key: String,
    kind: WorkloadKind,
}

pub struct NameIndex {
    names: Mutex<HashMap<String, Reservation>>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self {
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves `name` for the workload identified by `key`.
    pub fn reserve(&self, name: &str, key: &str, kind: WorkloadKind) -> YardResult<()> {
        let mut names = self.names.lock().unwrap();
        if names.contains_key(name) {
            return Err(YardError::already_exists(format!("name {name:?}")));
        }
        names.insert(
            name.to_string(),
            Reservation {
                key: key.to_string(),
                kind,
            },
        );
        Ok(())
    }

    pub fn release_by_name(&self, name: &str) {
        self.names.lock().unwrap().remove(name);
    }

    /// Releases whatever name the workload key holds.
    pub fn release_by_key(&self, key: &str) {
        let mut names = self.names.lock().unwrap();
        names.retain(|_, reservation| reservation.key != key);
    }

    /// Returns the workload key and kind reserved under `name`.
    pub fn get(&self, name: &str) -> Option<(String, WorkloadKind)> {
        self.names
            .lock()
            .unwrap()
            .get(name)
            .map(|r| (r.key.clone(), r.kind))
    }
}

impl Default for NameIndex {
    fn default() -> Self {
        Self::new()
    }
}
