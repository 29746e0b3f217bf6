//! Minimal pod-sandbox registry.
//!
//! Sandbox lifecycle (networking, pause container) belongs to the embedding
//! service; this store keeps just enough state for instance creation to find
//! its parent and for start to check readiness.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{YardError, YardResult};
use crate::grpc::cri_proto::PodSandboxConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Ready,
    NotReady,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub config: PodSandboxConfig,
    pub runtime_handler: String,
    pub state: SandboxState,
    pub created_at: i64,
}

pub struct SandboxStore {
    sandboxes: RwLock<HashMap<String, Sandbox>>,
}

impl SandboxStore {
    pub fn new() -> Self {
        Self {
            sandboxes: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, sandbox: Sandbox) -> YardResult<()> {
        let mut sandboxes = self.sandboxes.write().unwrap();
        if sandboxes.contains_key(&sandbox.id) {
            return Err(YardError::already_exists(format!(
                "sandbox {:?}",
                sandbox.id
            )));
        }
        sandboxes.insert(sandbox.id.clone(), sandbox);
        Ok(())
    }

    pub fn get(&self, id: &str) -> YardResult<Sandbox> {
        self.sandboxes
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| YardError::not_found(format!("sandbox {id:?}")))
    }

    pub fn set_state(&self, id: &str, state: SandboxState) -> YardResult<()> {
        let mut sandboxes = self.sandboxes.write().unwrap();
        match sandboxes.get_mut(id) {
            Some(sandbox) => {
                sandbox.state = state;
                Ok(())
            }
            None => Err(YardError::not_found(format!("sandbox {id:?}"))),
        }
    }

    pub fn delete(&self, id: &str) {
        self.sandboxes.write().unwrap().remove(id);
    }

    pub fn list(&self) -> Vec<Sandbox> {
        self.sandboxes.read().unwrap().values().cloned().collect()
    }
}

impl Default for SandboxStore {
    fn default() -> Self {
        Self::new()
    }
}
