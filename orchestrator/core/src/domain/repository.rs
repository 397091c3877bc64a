// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Repository domain types: the abstract tabular store, its query model and
//! the bulk/transaction contracts implemented by
//! [`BaseRepository`](crate::infrastructure::repositories::BaseRepository).

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::StoreError;

/// One stored row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Equality filters. Null values are ignored when building conditions.
pub type Filters = Row;

/// Bounds every persisted entity satisfies.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Entity for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    In,
    NotIn,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "<>",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Like => "LIKE",
            Operator::Ilike => "ILIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn new(column: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Eq, value)
    }

    pub fn neq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Neq, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Gt, value)
    }

    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Gte, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Lt, value)
    }

    pub fn lte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Lte, value)
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(column, Operator::Like, Value::String(pattern.into()))
    }

    pub fn ilike(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(column, Operator::Ilike, Value::String(pattern.into()))
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, Operator::In, Value::Array(values))
    }

    pub fn not_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, Operator::NotIn, Value::Array(values))
    }

    /// Human-readable form used in query logs.
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.column, self.operator.as_sql(), self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// Select request passed to a [`TabularStore`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub conditions: Vec<Condition>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_filters(filters: Option<&Filters>) -> Self {
        Self {
            conditions: filters.map(filter_conditions).unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn order(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn describe(&self, table: &str) -> String {
        let mut sql = format!("SELECT * FROM {table}");
        if !self.conditions.is_empty() {
            let clauses: Vec<String> = self.conditions.iter().map(Condition::describe).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if let Some(order) = &self.order_by {
            let direction = if order.ascending { "ASC" } else { "DESC" };
            sql.push_str(&format!(" ORDER BY {} {direction}", order.column));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }
}

/// Turn equality filters into conditions, skipping null values.
pub fn filter_conditions(filters: &Filters) -> Vec<Condition> {
    filters
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(column, value)| Condition::eq(column.clone(), value.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub total_pages: u64,
}

/// Tabular backend the repository layer talks to.
///
/// `insert` receives a batch and must be all-or-nothing: either every row is
/// written and returned, or none is and an error is reported.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError>;

    async fn count(&self, table: &str, conditions: &[Condition]) -> Result<u64, StoreError>;

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError>;

    /// Apply `changes` to the row with `id`. `Ok(None)` when no row matched.
    async fn update(&self, table: &str, id: &str, changes: Row) -> Result<Option<Row>, StoreError>;

    /// Delete the row with `id`, returning the number of rows removed.
    async fn delete(&self, table: &str, id: &str) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkUpdate<U> {
    pub id: String,
    pub data: U,
}

/// A bulk request. Each variant carries only the payload its operation needs.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation<C, U> {
    Create(Vec<C>),
    Update(Vec<BulkUpdate<U>>),
    Delete(Vec<String>),
}

impl<C, U> BulkOperation<C, U> {
    pub fn kind(&self) -> &'static str {
        match self {
            BulkOperation::Create(_) => "create",
            BulkOperation::Update(_) => "update",
            BulkOperation::Delete(_) => "delete",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BulkOperation::Create(items) => items.len(),
            BulkOperation::Update(items) => items.len(),
            BulkOperation::Delete(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BulkSuccess<T> {
    Created(T),
    Updated(T),
    Deleted { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub data: Value,
    pub error: String,
}

/// Partial outcome of a bulk request. Successes and failures are both kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkOperationResult<T> {
    pub success: Vec<T>,
    pub failed: Vec<BulkFailure>,
}

impl<T> Default for BulkOperationResult<T> {
    fn default() -> Self {
        Self {
            success: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BulkOperationResult<T> {
    pub fn total(&self) -> usize {
        self.success.len() + self.failed.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub(crate) fn fail(&mut self, data: Value, error: impl Into<String>) {
        let error = error.into();
        let error = if error.trim().is_empty() {
            "unknown error".to_string()
        } else {
            error
        };
        self.failed.push(BulkFailure { data, error });
    }

    pub fn map<V>(self, f: impl FnMut(T) -> V) -> BulkOperationResult<V> {
        BulkOperationResult {
            success: self.success.into_iter().map(f).collect(),
            failed: self.failed,
        }
    }
}

/// One queued step of a sequential repository transaction.
pub type TransactionStep<'a, R> =
    Box<dyn FnOnce() -> BoxFuture<'a, anyhow::Result<R>> + Send + 'a>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_conditions_skip_nulls() {
        let filters = json!({ "status": "active", "owner_id": null })
            .as_object()
            .cloned()
            .unwrap();
        let conditions = filter_conditions(&filters);
        assert_eq!(conditions, vec![Condition::eq("status", "active")]);
    }

    #[test]
    fn test_query_describe_renders_clauses() {
        let query = Query::new()
            .filter(Condition::gte("value", 10))
            .filter(Condition::ilike("title", "%lease%"))
            .order(OrderBy::desc("created_at"))
            .limit(5)
            .offset(10);
        assert_eq!(
            query.describe("contracts"),
            "SELECT * FROM contracts WHERE value >= 10 AND title ILIKE \"%lease%\" ORDER BY created_at DESC LIMIT 5 OFFSET 10"
        );
    }

    #[test]
    fn test_bulk_failure_never_has_empty_error() {
        let mut result: BulkOperationResult<()> = BulkOperationResult::default();
        result.fail(json!({"id": "x"}), "   ");
        assert_eq!(result.failed[0].error, "unknown error");
        assert_eq!(result.total(), 1);
    }

    #[test]
    fn test_bulk_operation_reports_kind_and_len() {
        let op: BulkOperation<(), ()> = BulkOperation::Delete(vec!["a".into(), "b".into()]);
        assert_eq!(op.kind(), "delete");
        assert_eq!(op.len(), 2);
        assert!(!op.is_empty());
    }
}
