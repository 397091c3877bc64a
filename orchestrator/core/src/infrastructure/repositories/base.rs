// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Generic repository over a [`TabularStore`].
//!
//! Every public call runs through a [`QueryTimer`], and every store failure
//! is normalized into a [`RepositoryError`] before it leaves this module.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use super::query_log::{QueryLog, QueryTimer};
use crate::domain::errors::{FieldError, RepositoryError, StoreError, ROW_NOT_FOUND_CODE};
use crate::domain::repository::{
    BulkOperation, BulkOperationResult, BulkSuccess, BulkUpdate, Condition, Entity, Filters,
    OrderBy, Page, Query, Row, TabularStore, TransactionStep,
};

/// Columns never written by `update`.
const IMMUTABLE_COLUMNS: [&str; 2] = ["id", "created_at"];

/// Type-erased view of a repository, used by the factory for health probes.
#[async_trait]
pub trait ManagedRepository: Send + Sync {
    fn entity_name(&self) -> &str;

    fn table_name(&self) -> &str;

    fn user_id(&self) -> Option<&str>;

    /// Cheap round-trip to the store.
    async fn probe(&self) -> Result<u64, RepositoryError>;
}

pub struct BaseRepository<T> {
    store: Arc<dyn TabularStore>,
    table_name: String,
    entity_name: String,
    user_id: Option<String>,
    query_log: Arc<QueryLog>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for BaseRepository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseRepository")
            .field("table_name", &self.table_name)
            .field("entity_name", &self.entity_name)
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl<T: Entity> BaseRepository<T> {
    pub fn new(
        store: Arc<dyn TabularStore>,
        table_name: impl Into<String>,
        entity_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            table_name: table_name.into(),
            entity_name: entity_name.into(),
            user_id: None,
            query_log: Arc::new(QueryLog::default()),
            _entity: PhantomData,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_query_log(mut self, query_log: Arc<QueryLog>) -> Self {
        self.query_log = query_log;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn query_log(&self) -> &Arc<QueryLog> {
        &self.query_log
    }

    fn timer(&self, operation: &'static str, query: String) -> QueryTimer {
        QueryTimer::start(
            self.query_log.clone(),
            &self.entity_name,
            operation,
            query,
            self.user_id.clone(),
        )
    }

    fn normalize(&self, err: StoreError, operation: &str) -> RepositoryError {
        RepositoryError::from_store(err, &self.entity_name, operation)
    }

    fn decode(&self, row: Row, operation: &str) -> Result<T, RepositoryError> {
        serde_json::from_value(Value::Object(row)).map_err(|e| {
            RepositoryError::unknown(format!(
                "Failed to decode {} row: {e}",
                self.entity_name
            ))
            .with_context(&self.entity_name, operation)
        })
    }

    /// Serialize a payload into a row, dropping null columns.
    fn encode<D: Serialize + ?Sized>(&self, data: &D, operation: &str) -> Result<Row, RepositoryError> {
        match serde_json::to_value(data) {
            Ok(Value::Object(mut row)) => {
                row.retain(|_, value| !value.is_null());
                Ok(row)
            }
            Ok(_) => Err(RepositoryError::validation(
                format!("{} payload must be an object", self.entity_name),
                Vec::new(),
                Some(&self.entity_name),
            )
            .with_operation(operation)),
            Err(e) => Err(RepositoryError::validation(
                format!("Invalid {} payload: {e}", self.entity_name),
                Vec::new(),
                Some(&self.entity_name),
            )
            .with_operation(operation)),
        }
    }

    /// Encode an update payload, removing immutable columns.
    fn encode_changes<D: Serialize + ?Sized>(
        &self,
        data: &D,
        operation: &str,
    ) -> Result<Row, RepositoryError> {
        let mut changes = self.encode(data, operation)?;
        for column in IMMUTABLE_COLUMNS {
            changes.remove(column);
        }
        if changes.is_empty() {
            return Err(RepositoryError::validation(
                "No valid fields to update",
                vec![FieldError::new("data", "at least one mutable field is required")],
                Some(&self.entity_name),
            )
            .with_operation(operation));
        }
        Ok(changes)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<T>, RepositoryError> {
        let query = Query::new().filter(Condition::eq("id", id)).limit(1);
        let timer = self.timer("findById", query.describe(&self.table_name));

        let result = match self.store.select(&self.table_name, &query).await {
            Ok(rows) => rows
                .into_iter()
                .next()
                .map(|row| self.decode(row, "findById"))
                .transpose(),
            Err(err) if err.code.as_deref() == Some(ROW_NOT_FOUND_CODE) => Ok(None),
            Err(err) => Err(self.normalize(err, "findById")),
        };
        timer.finish(result)
    }

    pub async fn find_many(&self, filters: Option<&Filters>) -> Result<Vec<T>, RepositoryError> {
        let query = Query::from_filters(filters);
        self.select("findMany", query).await
    }

    pub async fn find_with_conditions(
        &self,
        conditions: Vec<Condition>,
        order_by: Option<OrderBy>,
        limit: Option<usize>,
    ) -> Result<Vec<T>, RepositoryError> {
        let query = Query {
            conditions,
            order_by,
            limit,
            offset: None,
        };
        self.select("findWithConditions", query).await
    }

    async fn select(&self, operation: &'static str, query: Query) -> Result<Vec<T>, RepositoryError> {
        let timer = self.timer(operation, query.describe(&self.table_name));
        let result = match self.store.select(&self.table_name, &query).await {
            Ok(rows) => rows
                .into_iter()
                .map(|row| self.decode(row, operation))
                .collect(),
            Err(err) => Err(self.normalize(err, operation)),
        };
        timer.finish(result)
    }

    /// One page of results. `page` is 1-based; `limit` must be positive.
    pub async fn find_many_paginated(
        &self,
        filters: Option<&Filters>,
        page: u64,
        limit: u64,
    ) -> Result<Page<T>, RepositoryError> {
        let base = Query::from_filters(filters);
        let timer = self.timer("findManyPaginated", base.describe(&self.table_name));

        let mut field_errors = Vec::new();
        if page == 0 {
            field_errors.push(FieldError::new("page", "must be at least 1"));
        }
        if limit == 0 {
            field_errors.push(FieldError::new("limit", "must be at least 1"));
        }
        let window = page
            .checked_sub(1)
            .and_then(|skipped| skipped.checked_mul(limit))
            .and_then(|offset| usize::try_from(offset).ok())
            .zip(usize::try_from(limit).ok());
        let (offset, page_size) = match window {
            Some(window) if field_errors.is_empty() => window,
            _ => {
                if field_errors.is_empty() {
                    field_errors.push(FieldError::new("page", "offset out of range"));
                }
                return timer.finish(Err(RepositoryError::validation(
                    "Invalid pagination parameters",
                    field_errors,
                    Some(&self.entity_name),
                )
                .with_operation("findManyPaginated")));
            }
        };

        let total = match self.store.count(&self.table_name, &base.conditions).await {
            Ok(total) => total,
            Err(err) => return timer.finish(Err(self.normalize(err, "findManyPaginated"))),
        };

        let query = base.offset(offset).limit(page_size);
        let result = match self.store.select(&self.table_name, &query).await {
            Ok(rows) => rows
                .into_iter()
                .map(|row| self.decode(row, "findManyPaginated"))
                .collect::<Result<Vec<T>, _>>()
                .map(|data| Page {
                    data,
                    total,
                    page,
                    total_pages: total.div_ceil(limit),
                }),
            Err(err) => Err(self.normalize(err, "findManyPaginated")),
        };
        timer.finish(result)
    }

    pub async fn create<D: Serialize + Sync + ?Sized>(&self, data: &D) -> Result<T, RepositoryError> {
        let timer = self.timer("create", format!("INSERT INTO {}", self.table_name));
        let row = match self.encode(data, "create") {
            Ok(row) => row,
            Err(e) => return timer.finish(Err(e)),
        };

        let result = match self.store.insert(&self.table_name, vec![row]).await {
            Ok(rows) => match rows.into_iter().next() {
                Some(row) => self.decode(row, "create"),
                None => Err(RepositoryError::unknown("Store returned no row for insert")
                    .with_context(&self.entity_name, "create")),
            },
            Err(err) => Err(self.normalize(err, "create")),
        };
        timer.finish(result)
    }

    /// Update an existing row. Missing rows fail with `NotFound` before any
    /// write; `id`, `created_at` and null fields are never written.
    pub async fn update<D: Serialize + Sync + ?Sized>(
        &self,
        id: &str,
        data: &D,
    ) -> Result<T, RepositoryError> {
        if !self.exists(id).await? {
            return Err(RepositoryError::not_found(&self.entity_name, id).with_operation("update"));
        }

        let timer = self.timer(
            "update",
            format!("UPDATE {} SET ... WHERE id = '{id}'", self.table_name),
        );
        let changes = match self.encode_changes(data, "update") {
            Ok(changes) => changes,
            Err(e) => return timer.finish(Err(e)),
        };

        let result = match self.store.update(&self.table_name, id, changes).await {
            Ok(Some(row)) => self.decode(row, "update"),
            Ok(None) => Err(RepositoryError::not_found(&self.entity_name, id).with_operation("update")),
            Err(err) => Err(self.normalize(err, "update")),
        };
        timer.finish(result)
    }

    pub async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        if !self.exists(id).await? {
            return Err(RepositoryError::not_found(&self.entity_name, id).with_operation("delete"));
        }

        let timer = self.timer(
            "delete",
            format!("DELETE FROM {} WHERE id = '{id}'", self.table_name),
        );
        let result = match self.store.delete(&self.table_name, id).await {
            Ok(0) => Err(RepositoryError::not_found(&self.entity_name, id).with_operation("delete")),
            Ok(_) => Ok(()),
            Err(err) => Err(self.normalize(err, "delete")),
        };
        timer.finish(result)
    }

    pub async fn count(&self, filters: Option<&Filters>) -> Result<u64, RepositoryError> {
        let query = Query::from_filters(filters);
        let timer = self.timer(
            "count",
            query.describe(&self.table_name).replacen("SELECT *", "SELECT COUNT(*)", 1),
        );
        let result = self
            .store
            .count(&self.table_name, &query.conditions)
            .await
            .map_err(|err| self.normalize(err, "count"));
        timer.finish(result)
    }

    pub async fn exists(&self, id: &str) -> Result<bool, RepositoryError> {
        let condition = [Condition::eq("id", id)];
        let timer = self.timer(
            "exists",
            format!("SELECT COUNT(*) FROM {} WHERE id = '{id}'", self.table_name),
        );
        let result = self
            .store
            .count(&self.table_name, &condition)
            .await
            .map(|count| count > 0)
            .map_err(|err| self.normalize(err, "exists"));
        timer.finish(result)
    }

    /// Dispatch a bulk request to the matching typed bulk operation.
    pub async fn bulk_operation<C, U>(
        &self,
        operation: BulkOperation<C, U>,
    ) -> Result<BulkOperationResult<BulkSuccess<T>>, RepositoryError>
    where
        C: Serialize + Send + Sync,
        U: Serialize + Send + Sync,
    {
        debug!(
            entity = %self.entity_name,
            kind = operation.kind(),
            items = operation.len(),
            "Running bulk operation"
        );
        match operation {
            BulkOperation::Create(items) => Ok(self.bulk_create(items).await?.map(BulkSuccess::Created)),
            BulkOperation::Update(items) => Ok(self.bulk_update(items).await?.map(BulkSuccess::Updated)),
            BulkOperation::Delete(ids) => Ok(self
                .bulk_delete(ids)
                .await?
                .map(|id| BulkSuccess::Deleted { id })),
        }
    }

    /// Insert every item in one batch; if the batch is rejected, retry item
    /// by item and keep whatever succeeds.
    pub async fn bulk_create<C>(&self, items: Vec<C>) -> Result<BulkOperationResult<T>, RepositoryError>
    where
        C: Serialize + Send + Sync,
    {
        let timer = self.timer(
            "bulkCreate",
            format!("INSERT INTO {} ({} rows)", self.table_name, items.len()),
        );
        let mut result = BulkOperationResult::default();
        if items.is_empty() {
            return timer.finish(Ok(result));
        }

        let mut pending: Vec<(Value, Row)> = Vec::with_capacity(items.len());
        for item in &items {
            let data = serde_json::to_value(item).unwrap_or(Value::Null);
            match self.encode(item, "bulkCreate") {
                Ok(row) => pending.push((data, row)),
                Err(e) => result.fail(data, e.to_string()),
            }
        }

        if pending.is_empty() {
            return timer.finish(Ok(result));
        }

        let batch: Vec<Row> = pending.iter().map(|(_, row)| row.clone()).collect();
        match self.store.insert(&self.table_name, batch).await {
            Ok(rows) => {
                // Rows come back in batch order; a row that fails to decode is
                // reported against its own input.
                let mut inputs = pending.into_iter().map(|(data, _)| data);
                for row in rows {
                    let data = inputs.next().unwrap_or(Value::Null);
                    match self.decode(row, "bulkCreate") {
                        Ok(entity) => result.success.push(entity),
                        Err(e) => result.fail(data, e.to_string()),
                    }
                }
            }
            Err(batch_error) => {
                warn!(
                    entity = %self.entity_name,
                    error = %batch_error,
                    items = pending.len(),
                    "Batch insert failed, retrying items individually"
                );
                for (data, row) in pending {
                    match self.store.insert(&self.table_name, vec![row]).await {
                        Ok(rows) => match rows.into_iter().next().map(|r| self.decode(r, "bulkCreate")) {
                            Some(Ok(entity)) => result.success.push(entity),
                            Some(Err(e)) => result.fail(data, e.to_string()),
                            None => result.fail(data, "Store returned no row for insert"),
                        },
                        Err(err) => {
                            let err = self.normalize(err, "bulkCreate");
                            result.fail(data, err.to_string());
                        }
                    }
                }
            }
        }

        timer.finish(Ok(result))
    }

    /// Apply updates one at a time, in input order.
    pub async fn bulk_update<U>(
        &self,
        items: Vec<BulkUpdate<U>>,
    ) -> Result<BulkOperationResult<T>, RepositoryError>
    where
        U: Serialize + Send + Sync,
    {
        let timer = self.timer(
            "bulkUpdate",
            format!("UPDATE {} ({} rows)", self.table_name, items.len()),
        );
        let mut result = BulkOperationResult::default();

        for item in items {
            let data = serde_json::to_value(&item).unwrap_or(Value::Null);
            let changes = match self.encode_changes(&item.data, "bulkUpdate") {
                Ok(changes) => changes,
                Err(e) => {
                    result.fail(data, e.to_string());
                    continue;
                }
            };
            match self.store.update(&self.table_name, &item.id, changes).await {
                Ok(Some(row)) => match self.decode(row, "bulkUpdate") {
                    Ok(entity) => result.success.push(entity),
                    Err(e) => result.fail(data, e.to_string()),
                },
                Ok(None) => result.fail(
                    data,
                    RepositoryError::not_found(&self.entity_name, &item.id).to_string(),
                ),
                Err(err) => result.fail(data, self.normalize(err, "bulkUpdate").to_string()),
            }
        }

        timer.finish(Ok(result))
    }

    /// Delete ids one at a time, in input order. Ids that match no row are
    /// reported as failures.
    pub async fn bulk_delete(
        &self,
        ids: Vec<String>,
    ) -> Result<BulkOperationResult<String>, RepositoryError> {
        let timer = self.timer(
            "bulkDelete",
            format!("DELETE FROM {} ({} rows)", self.table_name, ids.len()),
        );
        let mut result = BulkOperationResult::default();

        for id in ids {
            let data = serde_json::json!({ "id": id });
            match self.store.delete(&self.table_name, &id).await {
                Ok(0) => result.fail(
                    data,
                    RepositoryError::not_found(&self.entity_name, &id).to_string(),
                ),
                Ok(_) => result.success.push(id),
                Err(err) => result.fail(data, self.normalize(err, "bulkDelete").to_string()),
            }
        }

        timer.finish(Ok(result))
    }

    /// Run `steps` strictly in order, stopping at the first failure.
    ///
    /// Steps that already ran are not undone.
    pub async fn transaction<'a, R>(
        &self,
        steps: Vec<TransactionStep<'a, R>>,
    ) -> Result<Vec<R>, RepositoryError> {
        let total = steps.len();
        let timer = self.timer(
            "transaction",
            format!("TRANSACTION WITH {total} OPERATIONS"),
        );
        let mut results = Vec::with_capacity(total);

        for (index, step) in steps.into_iter().enumerate() {
            match step().await {
                Ok(value) => results.push(value),
                Err(cause) => {
                    warn!(
                        entity = %self.entity_name,
                        step = index + 1,
                        total,
                        error = %cause,
                        "Transaction step failed"
                    );
                    return timer.finish(Err(RepositoryError::transaction_step_failed(
                        index + 1,
                        total,
                        cause,
                        &self.entity_name,
                    )));
                }
            }
        }

        timer.finish(Ok(results))
    }
}

#[async_trait]
impl<T: Entity> ManagedRepository for BaseRepository<T> {
    fn entity_name(&self) -> &str {
        &self.entity_name
    }

    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    async fn probe(&self) -> Result<u64, RepositoryError> {
        self.count(None).await
    }
}
