// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::StoreError;
use crate::domain::repository::{Condition, Operator, Query, Row, TabularStore};

#[derive(Debug, Clone)]
struct ForeignKey {
    column: String,
    references: String,
}

/// In-memory [`TabularStore`] for tests and local development.
///
/// Rows keep insertion order. Missing `id`, `created_at` and `updated_at`
/// columns are generated on insert. Declared unique columns and foreign keys
/// are enforced with the same codes a Postgres-backed store reports.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    unique: HashMap<String, Vec<String>>,
    foreign_keys: HashMap<String, Vec<ForeignKey>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unique(mut self, table: &str, column: &str) -> Self {
        self.unique
            .entry(table.to_string())
            .or_default()
            .push(column.to_string());
        self
    }

    /// `table.column` must hold the `id` of an existing row in `references`.
    pub fn with_foreign_key(mut self, table: &str, column: &str, references: &str) -> Self {
        self.foreign_keys
            .entry(table.to_string())
            .or_default()
            .push(ForeignKey {
                column: column.to_string(),
                references: references.to_string(),
            });
        self
    }

    /// Insert rows as-is, bypassing constraints.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    fn check_unique(
        &self,
        table: &str,
        row: &Row,
        existing: &[Row],
        skip_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let Some(columns) = self.unique.get(table) else {
            return Ok(());
        };
        for column in columns {
            let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = existing.iter().any(|other| {
                let same_row = skip_id.is_some() && other.get("id").and_then(Value::as_str) == skip_id;
                !same_row && other.get(column) == Some(value)
            });
            if clash {
                return Err(StoreError::unique_violation(format!(
                    "duplicate key value violates unique constraint \"{table}_{column}_key\": Key ({column})=({value}) already exists."
                )));
            }
        }
        Ok(())
    }

    fn check_foreign_keys(
        &self,
        table: &str,
        row: &Row,
        tables: &HashMap<String, Vec<Row>>,
    ) -> Result<(), StoreError> {
        let Some(keys) = self.foreign_keys.get(table) else {
            return Ok(());
        };
        for key in keys {
            let Some(value) = row.get(&key.column).filter(|v| !v.is_null()) else {
                continue;
            };
            let found = tables
                .get(&key.references)
                .is_some_and(|rows| rows.iter().any(|r| r.get("id") == Some(value)));
            if !found {
                return Err(StoreError::foreign_key_violation(format!(
                    "insert or update on table \"{table}\" violates foreign key constraint \"{table}_{}_fkey\": Key ({})=({value}) is not present in table \"{}\".",
                    key.column, key.column, key.references
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TabularStore for InMemoryStore {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.read();
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.conditions.iter().all(|c| matches_condition(row, c)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        if let Some(order) = &query.order_by {
            rows.sort_by(|a, b| {
                let ordering = compare_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                )
                .unwrap_or(Ordering::Equal);
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, table: &str, conditions: &[Condition]) -> Result<u64, StoreError> {
        let tables = self.tables.read();
        let count = tables.get(table).map_or(0, |rows| {
            rows.iter()
                .filter(|row| conditions.iter().all(|c| matches_condition(row, c)))
                .count()
        });
        Ok(count as u64)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        let mut tables = self.tables.write();
        // Existing rows plus the rows staged so far in this batch.
        let mut seen = tables.get(table).cloned().unwrap_or_default();
        let now = Value::String(Utc::now().to_rfc3339());

        // Validate the whole batch against existing rows and itself before
        // writing anything.
        let mut staged: Vec<Row> = Vec::with_capacity(rows.len());
        for mut row in rows {
            if !row.contains_key("id") {
                row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
            }
            row.entry("created_at").or_insert_with(|| now.clone());
            row.entry("updated_at").or_insert_with(|| now.clone());

            let id = row.get("id").cloned();
            if seen.iter().any(|r| r.get("id") == id.as_ref()) {
                return Err(StoreError::unique_violation(format!(
                    "duplicate key value violates unique constraint \"{table}_pkey\""
                )));
            }

            self.check_unique(table, &row, &seen, None)?;
            self.check_foreign_keys(table, &row, &tables)?;
            seen.push(row.clone());
            staged.push(row);
        }

        tables
            .entry(table.to_string())
            .or_default()
            .extend(staged.iter().cloned());
        Ok(staged)
    }

    async fn update(&self, table: &str, id: &str, changes: Row) -> Result<Option<Row>, StoreError> {
        let mut tables = self.tables.write();
        let Some(rows) = tables.get(table) else {
            return Ok(None);
        };
        let Some(index) = rows
            .iter()
            .position(|r| r.get("id").and_then(Value::as_str) == Some(id))
        else {
            return Ok(None);
        };

        let mut updated = rows[index].clone();
        for (column, value) in changes {
            if column != "id" {
                updated.insert(column, value);
            }
        }
        updated.insert(
            "updated_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        self.check_unique(table, &updated, rows, Some(id))?;
        self.check_foreign_keys(table, &updated, &tables)?;

        let rows = tables.entry(table.to_string()).or_default();
        rows[index] = updated.clone();
        Ok(Some(updated))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| r.get("id").and_then(Value::as_str) != Some(id));
        Ok((before - rows.len()) as u64)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match compare_values(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn like(value: &Value, pattern: &Value, case_insensitive: bool) -> bool {
    let (Some(text), Some(pattern)) = (value.as_str(), pattern.as_str()) else {
        return false;
    };

    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');

    RegexBuilder::new(&expr)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .is_ok_and(|re| re.is_match(text))
}

fn matches_condition(row: &Row, condition: &Condition) -> bool {
    let actual = row.get(&condition.column).unwrap_or(&Value::Null);
    let expected = &condition.value;
    match condition.operator {
        Operator::Eq => values_equal(actual, expected),
        Operator::Neq => !values_equal(actual, expected),
        Operator::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => compare_values(actual, expected) == Some(Ordering::Less),
        Operator::Lte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Like => like(actual, expected, false),
        Operator::Ilike => like(actual, expected, true),
        Operator::In => expected
            .as_array()
            .is_some_and(|values| values.iter().any(|v| values_equal(actual, v))),
        Operator::NotIn => !expected
            .as_array()
            .is_some_and(|values| values.iter().any(|v| values_equal(actual, v))),
    }
}
