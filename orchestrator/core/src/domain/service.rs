// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::domain::errors::FieldError;

/// Request-scoped identifiers shared by the services of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContext {
    pub request_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self {
            request_id: new_request_id(),
            correlation_id: new_correlation_id(),
            user_id: None,
            metadata: Map::new(),
        }
    }
}

impl ServiceContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Same user and metadata, fresh request and correlation ids.
    pub fn child(&self) -> Self {
        Self {
            request_id: new_request_id(),
            correlation_id: new_correlation_id(),
            user_id: self.user_id.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

fn new_correlation_id() -> String {
    format!("corr_{}", Uuid::new_v4().simple())
}

/// Operations wrapped by the generic service base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    FindById,
    FindMany,
    FindManyPaginated,
    Exists,
    Count,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::FindById => "findById",
            Operation::FindMany => "findMany",
            Operation::FindManyPaginated => "findManyPaginated",
            Operation::Exists => "exists",
            Operation::Count => "count",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetricRecord {
    pub operation_name: String,
    pub duration_ms: u64,
    pub timestamp_ms: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a create/update validation hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<FieldError>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self::default()
    }

    pub fn invalid(errors: Vec<FieldError>) -> Self {
        Self {
            errors,
            warnings: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.errors.push(FieldError::new(field, message));
        self
    }

    pub fn warn(&mut self, message: impl Into<String>) -> &mut Self {
        self.warnings.push(message.into());
        self
    }
}
