//! Current-state reporter.
//!
//! Holds the volatile device report fields (`currentVolatile`). Writers
//! merge partial updates via [`Reporter::report_current_state`]; readers
//! get the last-published snapshot; every publication emits on the
//! `change` channel for the external cloud reporter to pick up.

use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use crate::events::EngineEvents;

#[derive(Clone)]
pub struct Reporter {
    fields: Arc<RwLock<Map<String, Value>>>,
    events: EngineEvents,
}

impl Reporter {
    pub fn new(events: EngineEvents) -> Self {
        Self {
            fields: Arc::new(RwLock::new(Map::new())),
            events,
        }
    }

    /// Merge partial report fields and publish the change.
    pub fn report_current_state(&self, fields: Map<String, Value>) {
        if fields.is_empty() {
            return;
        }
        {
            let mut current = self.fields.write().expect("report fields poisoned");
            for (key, value) in fields.clone() {
                current.insert(key, value);
            }
        }
        let _ = self.events.change.send(Value::Object(fields));
    }

    /// Last-published snapshot.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.fields.read().expect("report fields poisoned").clone()
    }

    /// One field from the snapshot.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.fields
            .read()
            .expect("report fields poisoned")
            .get(key)
            .cloned()
    }
}
