// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type that receives every emitted event.
pub const WILDCARD: &str = "*";

/// A published event: `{ type, ...payload, timestamp }` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            payload,
            ..Self::new(event_type)
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Dot-separated family prefix, e.g. `contract` for `contract.created`.
    pub fn family(&self) -> &str {
        self.event_type
            .split_once('.')
            .map(|(family, _)| family)
            .unwrap_or(&self.event_type)
    }
}

/// Fluent constructor for [`EventRecord`]s.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    record: EventRecord,
}

impl EventBuilder {
    pub fn create(event_type: impl Into<String>) -> Self {
        Self {
            record: EventRecord::new(event_type),
        }
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.record.payload.insert(key.into(), value.into());
        self
    }

    /// Merge every key of `object` into the payload. Non-object values are
    /// stored under `data`.
    pub fn merge(mut self, object: Value) -> Self {
        match object {
            Value::Object(map) => self.record.payload.extend(map),
            other => {
                self.record.payload.insert("data".to_string(), other);
            }
        }
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.record.timestamp = timestamp;
        self
    }

    pub fn build(self) -> EventRecord {
        self.record
    }
}

/// Events published by the generic service base.
pub mod entity_events {
    pub const CREATED: &str = "entity.created";
    pub const UPDATED: &str = "entity.updated";
    pub const DELETED: &str = "entity.deleted";
    pub const RETRIEVED: &str = "entity.retrieved";
    pub const LIST_RETRIEVED: &str = "entities.listRetrieved";
    pub const LIST_RETRIEVED_PAGINATED: &str = "entities.listRetrievedPaginated";
}

pub mod transaction_events {
    pub const COMMITTED: &str = "transaction.committed";
    pub const ROLLED_BACK: &str = "transaction.rolledback";
}

pub mod contract_events {
    pub const CREATED: &str = "contract.created";
    pub const UPDATED: &str = "contract.updated";
    pub const DELETED: &str = "contract.deleted";
    pub const STATUS_CHANGED: &str = "contract.status_changed";
    pub const EXPIRING: &str = "contract.expiring";
    pub const EXPIRED: &str = "contract.expired";
    pub const SIGNED: &str = "contract.signed";
    pub const APPROVED: &str = "contract.approved";
    pub const REJECTED: &str = "contract.rejected";
    pub const EXTRACTED: &str = "contract.extracted";
}

pub mod user_events {
    pub const LOGGED_IN: &str = "user.logged_in";
    pub const LOGGED_OUT: &str = "user.logged_out";
    pub const PROFILE_UPDATED: &str = "user.profile_updated";
    pub const PERMISSION_CHANGED: &str = "user.permission_changed";
}

pub mod system_events {
    pub const ERROR: &str = "system.error";
    pub const WARNING: &str = "system.warning";
    pub const MAINTENANCE: &str = "system.maintenance";
    pub const BACKUP_COMPLETED: &str = "system.backup_completed";
    pub const CACHE_CLEARED: &str = "system.cache_cleared";
}
