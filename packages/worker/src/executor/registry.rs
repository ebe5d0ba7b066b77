//! Process-local registry of class instance metadata.
//!
//! The objects themselves live inside the interpreter; the worker owns only
//! their metadata. Entries persist for the lifetime of the worker process
//! and are never evicted. When the interpreter is respawned (generation
//! bump), every entry is stale and the registry resets.

use std::{collections::HashMap, sync::Mutex};

use clients::flash::v1::InstanceInfo;

struct State {
    generation: u64,
    entries: HashMap<String, InstanceInfo>,
}

/// Registry of live instance metadata, keyed by instance id.
pub struct InstanceRegistry {
    state: Mutex<State>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                generation: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// Drop all entries if the interpreter generation has moved since they
    /// were recorded.
    pub fn sync_generation(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            state.generation = generation;
            state.entries.clear();
        }
    }

    /// Whether the id refers to a live instance of the given generation.
    pub fn contains(&self, generation: u64, instance_id: &str) -> bool {
        let state = self.lock();
        state.generation == generation && state.entries.contains_key(instance_id)
    }

    /// Record a successful method call, creating the entry on first use.
    /// Returns a snapshot of the updated metadata.
    pub fn record_success(
        &self,
        generation: u64,
        instance_id: &str,
        class_name: &str,
    ) -> InstanceInfo {
        let now = jiff::Timestamp::now().to_string();
        let mut state = self.lock();
        if state.generation != generation {
            state.generation = generation;
            state.entries.clear();
        }
        let entry = state
            .entries
            .entry(instance_id.to_string())
            .or_insert_with(|| InstanceInfo {
                class_name: class_name.to_string(),
                instance_id: instance_id.to_string(),
                created_at: now.clone(),
                method_calls: 0,
                last_used: now.clone(),
            });
        entry.method_calls += 1;
        entry.last_used = now;
        entry.clone()
    }

    /// Snapshot the metadata for an instance, if present.
    pub fn info(&self, instance_id: &str) -> Option<InstanceInfo> {
        self.lock().entries.get(instance_id).cloned()
    }

    /// Generate a fresh id of the form `<class_name>_<8-hex>`.
    pub fn generate_id(class_name: &str) -> String {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("{class_name}_{}", &hex[..8])
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
