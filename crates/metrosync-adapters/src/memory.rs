use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use metrosync_core::CrmPayload;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;

use crate::{CreatedRecord, CrmClient, RemoteError};

#[derive(Debug, Clone)]
struct StoredRecord {
    object_type: String,
    payload: CrmPayload,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<String, StoredRecord>,
    next_id: u64,
    failing_finds: HashSet<String>,
    failing_writes: HashSet<String>,
    writes: usize,
}

/// CRM double backed by a map. Clones share state.
///
/// Name lookups ignore case, the same way Salesforce compares `Name` in SOQL.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCrm {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryCrm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, bypassing failure injection. Returns its id.
    pub async fn seed(&self, object_type: &str, payload: CrmPayload) -> String {
        let mut state = self.state.lock().await;
        insert(&mut state, object_type, payload)
    }

    pub async fn fail_find_for(&self, name: &str) {
        self.state.lock().await.failing_finds.insert(name.to_string());
    }

    pub async fn fail_writes_for(&self, name: &str) {
        self.state.lock().await.failing_writes.insert(name.to_string());
    }

    /// `(id, payload)` pairs for one object type, in id order.
    pub async fn records(&self, object_type: &str) -> Vec<(String, CrmPayload)> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|(_, record)| record.object_type == object_type)
            .map(|(id, record)| (id.clone(), record.payload.clone()))
            .collect()
    }

    /// Number of successful create + update calls.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }
}

fn insert(state: &mut MemoryState, object_type: &str, payload: CrmPayload) -> String {
    state.next_id += 1;
    let id = format!("mem{:015}", state.next_id);
    state.records.insert(
        id.clone(),
        StoredRecord {
            object_type: object_type.to_string(),
            payload,
        },
    );
    id
}

fn rejected(name: &str) -> RemoteError {
    RemoteError::Rejected {
        status: 400,
        message: format!("FIELD_CUSTOM_VALIDATION_EXCEPTION: write rejected for {name}"),
    }
}

#[async_trait]
impl CrmClient for InMemoryCrm {
    async fn find(&self, object_type: &str, name: &str) -> Result<Option<String>, RemoteError> {
        let state = self.state.lock().await;
        if state.failing_finds.contains(name) {
            return Err(RemoteError::Transport(format!(
                "connection reset while querying {name}"
            )));
        }
        let wanted = name.to_lowercase();
        Ok(state
            .records
            .iter()
            .find(|(_, record)| {
                record.object_type == object_type && record.payload.name.to_lowercase() == wanted
            })
            .map(|(id, _)| id.clone()))
    }

    async fn create(
        &self,
        object_type: &str,
        payload: &CrmPayload,
    ) -> Result<CreatedRecord, RemoteError> {
        let mut state = self.state.lock().await;
        if state.failing_writes.contains(&payload.name) {
            return Err(rejected(&payload.name));
        }
        let id = insert(&mut state, object_type, payload.clone());
        state.writes += 1;
        Ok(CreatedRecord {
            response: json!({ "id": id, "success": true, "errors": [] }),
            id,
        })
    }

    async fn update(
        &self,
        object_type: &str,
        id: &str,
        payload: &CrmPayload,
    ) -> Result<JsonValue, RemoteError> {
        let mut state = self.state.lock().await;
        if state.failing_writes.contains(&payload.name) {
            return Err(rejected(&payload.name));
        }
        match state.records.get_mut(id) {
            Some(record) if record.object_type == object_type => {
                record.payload = payload.clone();
            }
            _ => {
                return Err(RemoteError::Rejected {
                    status: 404,
                    message: format!("NOT_FOUND: {object_type} {id}"),
                });
            }
        }
        state.writes += 1;
        Ok(json!({ "status": 204 }))
    }
}
