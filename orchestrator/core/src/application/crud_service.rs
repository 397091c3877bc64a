// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Generic CRUD Service - Application Layer
//!
//! [`BaseService`] wraps a [`CrudBackend`] and runs every operation through
//! the same pipeline:
//!
//! ```text
//! start → validate (create/update) → exists-check (update/delete)
//!       → execute → publish event → success | error → complete
//! ```
//!
//! Each operation runs on its own task and the caller waits at most
//! `ServiceConfig::timeout`. A timed-out caller gets [`ServiceError::Timeout`]
//! while the task keeps running to completion in the background; its outcome
//! is not reported to anyone.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Validation, timeouts, metrics, events and transaction
//!   scoping shared by every entity service

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::domain::config::ServiceConfig;
use crate::domain::errors::{FieldError, RepositoryError, RepositoryErrorKind};
use crate::domain::events::{entity_events, transaction_events, EventRecord};
use crate::domain::repository::{Entity, Filters, Page};
use crate::domain::service::{Operation, ServiceContext, ServiceMetricRecord, ValidationResult};
use crate::infrastructure::event_bus::{EventBus, EventBusError, EventHandler, Subscription};
use crate::infrastructure::repositories::BaseRepository;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Validation failed with {} error(s)", .errors.len())]
    Validation { errors: Vec<FieldError> },

    #[error("Operation {operation} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        operation: Operation,
        timeout: Duration,
    },

    #[error("Operation {operation} aborted: {message}")]
    Aborted { operation: Operation, message: String },

    #[error("Transaction already active")]
    TransactionAlreadyActive,

    #[error("No active transaction")]
    NoActiveTransaction,
}

impl ServiceError {
    /// Taxonomy kind, for repository and validation failures.
    pub fn kind(&self) -> Option<RepositoryErrorKind> {
        match self {
            ServiceError::Repository(e) => Some(e.kind()),
            ServiceError::Validation { .. } => Some(RepositoryErrorKind::Validation),
            _ => None,
        }
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ServiceError::Repository(e) => e.field_errors(),
            ServiceError::Validation { errors } => errors,
            _ => &[],
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ServiceError::Timeout { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            ServiceError::Repository(e) => e.kind().as_str(),
            ServiceError::Validation { .. } => "validation",
            ServiceError::Timeout { .. } => "timeout",
            ServiceError::Aborted { .. } => "aborted",
            ServiceError::TransactionAlreadyActive | ServiceError::NoActiveTransaction => {
                "transaction_state"
            }
        }
    }
}

/// Storage primitives a concrete service supplies.
///
/// Validation hooks default to "valid"; override them to enforce domain
/// rules.
#[async_trait]
pub trait CrudBackend: Send + Sync + 'static {
    type Entity: Serialize + Send + Sync + 'static;
    type Create: Send + Sync + 'static;
    type Update: Send + Sync + 'static;

    fn entity_name(&self) -> &str;

    async fn do_create(&self, data: Self::Create) -> Result<Self::Entity, RepositoryError>;

    async fn do_update(&self, id: &str, data: Self::Update)
        -> Result<Self::Entity, RepositoryError>;

    async fn do_delete(&self, id: &str) -> Result<(), RepositoryError>;

    async fn do_find_by_id(&self, id: &str) -> Result<Option<Self::Entity>, RepositoryError>;

    async fn do_find_many(&self, filters: Option<Filters>)
        -> Result<Vec<Self::Entity>, RepositoryError>;

    async fn do_find_many_paginated(
        &self,
        filters: Option<Filters>,
        page: u64,
        limit: u64,
    ) -> Result<Page<Self::Entity>, RepositoryError>;

    async fn do_exists(&self, id: &str) -> Result<bool, RepositoryError>;

    async fn do_count(&self, filters: Option<Filters>) -> Result<u64, RepositoryError>;

    async fn validate_create(&self, _data: &Self::Create) -> ValidationResult {
        ValidationResult::valid()
    }

    async fn validate_update(&self, _id: &str, _data: &Self::Update) -> ValidationResult {
        ValidationResult::valid()
    }

    /// True when `do_update` and `do_delete` already fail with NotFound for a
    /// missing id before writing. The service then skips its own check.
    fn enforces_existence(&self) -> bool {
        false
    }

    /// Identifier carried in events and transaction entries.
    fn entity_id(&self, entity: &Self::Entity) -> Option<String> {
        match serde_json::to_value(entity).ok()?.get("id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// [`CrudBackend`] that delegates straight to a [`BaseRepository`].
pub struct RepositoryCrud<T, C, U> {
    repository: Arc<BaseRepository<T>>,
    _payloads: PhantomData<fn(C, U)>,
}

impl<T: Entity, C, U> RepositoryCrud<T, C, U> {
    pub fn new(repository: Arc<BaseRepository<T>>) -> Self {
        Self {
            repository,
            _payloads: PhantomData,
        }
    }

    pub fn repository(&self) -> &Arc<BaseRepository<T>> {
        &self.repository
    }
}

#[async_trait]
impl<T, C, U> CrudBackend for RepositoryCrud<T, C, U>
where
    T: Entity,
    C: Serialize + Send + Sync + 'static,
    U: Serialize + Send + Sync + 'static,
{
    type Entity = T;
    type Create = C;
    type Update = U;

    fn entity_name(&self) -> &str {
        self.repository.entity_name()
    }

    fn enforces_existence(&self) -> bool {
        true
    }

    async fn do_create(&self, data: C) -> Result<T, RepositoryError> {
        self.repository.create(&data).await
    }

    async fn do_update(&self, id: &str, data: U) -> Result<T, RepositoryError> {
        self.repository.update(id, &data).await
    }

    async fn do_delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.repository.delete(id).await
    }

    async fn do_find_by_id(&self, id: &str) -> Result<Option<T>, RepositoryError> {
        self.repository.find_by_id(id).await
    }

    async fn do_find_many(&self, filters: Option<Filters>) -> Result<Vec<T>, RepositoryError> {
        self.repository.find_many(filters.as_ref()).await
    }

    async fn do_find_many_paginated(
        &self,
        filters: Option<Filters>,
        page: u64,
        limit: u64,
    ) -> Result<Page<T>, RepositoryError> {
        self.repository
            .find_many_paginated(filters.as_ref(), page, limit)
            .await
    }

    async fn do_exists(&self, id: &str) -> Result<bool, RepositoryError> {
        self.repository.exists(id).await
    }

    async fn do_count(&self, filters: Option<Filters>) -> Result<u64, RepositoryError> {
        self.repository.count(filters.as_ref()).await
    }
}

type StartCallback = Box<dyn FnOnce(Operation) + Send>;
type SuccessCallback<T> = Box<dyn FnOnce(Operation, Option<&T>) + Send>;
type ErrorCallback = Box<dyn FnOnce(Operation, &ServiceError) + Send>;

/// Caller hooks for a single write operation. Each runs at most once;
/// `on_complete` always runs.
pub struct OperationCallbacks<T> {
    on_start: Option<StartCallback>,
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
    on_complete: Option<StartCallback>,
}

impl<T> Default for OperationCallbacks<T> {
    fn default() -> Self {
        Self {
            on_start: None,
            on_success: None,
            on_error: None,
            on_complete: None,
        }
    }
}

impl<T: 'static> OperationCallbacks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl FnOnce(Operation) + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Receives the resulting entity for create/update, `None` for delete.
    pub fn on_success(mut self, f: impl FnOnce(Operation, Option<&T>) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(Operation, &ServiceError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(Operation) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    fn started(&mut self, operation: Operation) {
        if let Some(f) = self.on_start.take() {
            f(operation);
        }
    }

    fn finish(mut self, operation: Operation, outcome: Result<Option<&T>, &ServiceError>) {
        match outcome {
            Ok(value) => {
                if let Some(f) = self.on_success.take() {
                    f(operation, value);
                }
            }
            Err(e) => {
                if let Some(f) = self.on_error.take() {
                    f(operation, e);
                }
            }
        }
        if let Some(f) = self.on_complete.take() {
            f(operation);
        }
    }
}

/// Advisory record of a write performed inside a transaction scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionEntry {
    pub operation: Operation,
    pub entity_id: Option<String>,
}

#[derive(Debug, Default)]
struct TransactionState {
    active: bool,
    entries: Vec<TransactionEntry>,
}

/// Event side of an operation, moved into the spawned task.
#[derive(Clone)]
struct Publisher {
    bus: EventBus,
    service: String,
    entity: String,
    logging: bool,
    transaction: Arc<Mutex<TransactionState>>,
}

impl Publisher {
    /// Record a write when a transaction is active. Returns whether it was
    /// recorded (and the entity event must be skipped).
    fn record_in_transaction(&self, operation: Operation, entity_id: Option<String>) -> bool {
        let mut state = self.transaction.lock();
        if state.active {
            state.entries.push(TransactionEntry {
                operation,
                entity_id,
            });
        }
        state.active
    }

    fn in_transaction(&self) -> bool {
        self.transaction.lock().active
    }

    async fn entity_event(&self, event: EventRecord) {
        if self.in_transaction() {
            return;
        }
        self.publish(event.with("entity", self.entity.clone())).await;
    }

    async fn publish(&self, event: EventRecord) {
        let event = event.with("service", self.service.clone());
        if self.logging {
            debug!(service = %self.service, event_type = %event.event_type, "Publishing event");
        }
        let report = self.bus.emit(event).await;
        if !report.is_clean() {
            debug!(
                service = %self.service,
                event_type = %report.event_type,
                failed = report.failed.len(),
                timed_out = report.timed_out.len(),
                "Event delivered with handler failures"
            );
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

pub struct BaseService<B: CrudBackend> {
    backend: Arc<B>,
    config: ServiceConfig,
    context: ServiceContext,
    bus: EventBus,
    metrics: Arc<Mutex<VecDeque<ServiceMetricRecord>>>,
    transaction: Arc<Mutex<TransactionState>>,
}

impl<B: CrudBackend> std::fmt::Debug for BaseService<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseService")
            .field("name", &self.config.name)
            .field("entity", &self.backend.entity_name())
            .finish_non_exhaustive()
    }
}

impl<B: CrudBackend> BaseService<B> {
    pub fn new(backend: Arc<B>, bus: EventBus, config: ServiceConfig) -> Self {
        if config.enable_logging {
            info!(
                service = %config.name,
                version = %config.version,
                entity = %backend.entity_name(),
                "Service initialized"
            );
        }
        Self {
            backend,
            config,
            context: ServiceContext::default(),
            bus,
            metrics: Arc::new(Mutex::new(VecDeque::new())),
            transaction: Arc::new(Mutex::new(TransactionState::default())),
        }
    }

    pub fn with_context(mut self, context: ServiceContext) -> Self {
        self.context = context;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    fn publisher(&self) -> Publisher {
        Publisher {
            bus: self.bus.clone(),
            service: self.config.name.clone(),
            entity: self.backend.entity_name().to_string(),
            logging: self.config.enable_logging,
            transaction: self.transaction.clone(),
        }
    }

    /// Run `work` on its own task, racing it against the configured timeout,
    /// and record the outcome.
    async fn execute<R, Fut>(&self, operation: Operation, work: Fut) -> Result<R, ServiceError>
    where
        R: Send + 'static,
        Fut: Future<Output = Result<R, ServiceError>> + Send + 'static,
    {
        let started = Instant::now();
        let timestamp_ms = Utc::now().timestamp_millis();
        let timeout = self.config.timeout;

        let outcome = match tokio::time::timeout(timeout, tokio::spawn(work)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ServiceError::Aborted {
                operation,
                message: join_error.to_string(),
            }),
            Err(_) => {
                warn!(
                    service = %self.config.name,
                    operation = %operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "Operation timed out; the underlying call keeps running"
                );
                Err(ServiceError::Timeout { operation, timeout })
            }
        };

        self.record_metric(operation, started.elapsed(), timestamp_ms, &outcome);

        if let Err(e) = &outcome {
            if self.config.enable_logging {
                error!(
                    service = %self.config.name,
                    operation = %operation,
                    error = %e,
                    "Operation failed"
                );
            }
        }
        outcome
    }

    fn record_metric<R>(
        &self,
        operation: Operation,
        elapsed: Duration,
        timestamp_ms: i64,
        outcome: &Result<R, ServiceError>,
    ) {
        if !self.config.enable_metrics {
            return;
        }

        metrics::histogram!(
            "docforge_service_operation_duration_seconds",
            "service" => self.config.name.clone(),
            "operation" => operation.as_str()
        )
        .record(elapsed.as_secs_f64());

        if let Err(e) = outcome {
            metrics::counter!(
                "docforge_service_operation_failures_total",
                "service" => self.config.name.clone(),
                "operation" => operation.as_str(),
                "kind" => e.label()
            )
            .increment(1);
        }

        let record = ServiceMetricRecord {
            operation_name: operation.as_str().to_string(),
            duration_ms: elapsed.as_millis() as u64,
            timestamp_ms,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
        };

        let mut metrics = self.metrics.lock();
        metrics.push_back(record);
        while metrics.len() > self.config.max_metrics {
            metrics.pop_front();
        }
    }

    pub async fn create(
        &self,
        data: B::Create,
        callbacks: Option<OperationCallbacks<B::Entity>>,
    ) -> Result<B::Entity, ServiceError> {
        let mut callbacks = callbacks.unwrap_or_default();
        callbacks.started(Operation::Create);

        let backend = self.backend.clone();
        let validate = self.config.enable_validation;
        let publisher = self.publisher();
        let work = async move {
            if validate {
                let validation = backend.validate_create(&data).await;
                if !validation.is_valid() {
                    return Err(ServiceError::Validation {
                        errors: validation.errors,
                    });
                }
            }

            let created = backend.do_create(data).await?;
            let id = backend.entity_id(&created);
            if !publisher.record_in_transaction(Operation::Create, id.clone()) {
                publisher
                    .entity_event(
                        EventRecord::new(entity_events::CREATED)
                            .with("id", id)
                            .with("data", to_payload(&created)),
                    )
                    .await;
            }
            Ok(created)
        };

        let result = self.execute(Operation::Create, work).await;
        callbacks.finish(Operation::Create, result.as_ref().map(Some));
        result
    }

    pub async fn update(
        &self,
        id: &str,
        data: B::Update,
        callbacks: Option<OperationCallbacks<B::Entity>>,
    ) -> Result<B::Entity, ServiceError> {
        let mut callbacks = callbacks.unwrap_or_default();
        callbacks.started(Operation::Update);

        let backend = self.backend.clone();
        let validate = self.config.enable_validation;
        let publisher = self.publisher();
        let id = id.to_string();
        let work = async move {
            if validate {
                let validation = backend.validate_update(&id, &data).await;
                if !validation.is_valid() {
                    return Err(ServiceError::Validation {
                        errors: validation.errors,
                    });
                }
            }

            if !backend.enforces_existence() && !backend.do_exists(&id).await? {
                return Err(RepositoryError::not_found(backend.entity_name(), &id)
                    .with_operation("update")
                    .into());
            }

            let updated = backend.do_update(&id, data).await?;
            if !publisher.record_in_transaction(Operation::Update, Some(id.clone())) {
                publisher
                    .entity_event(
                        EventRecord::new(entity_events::UPDATED)
                            .with("id", id)
                            .with("data", to_payload(&updated)),
                    )
                    .await;
            }
            Ok(updated)
        };

        let result = self.execute(Operation::Update, work).await;
        callbacks.finish(Operation::Update, result.as_ref().map(Some));
        result
    }

    pub async fn delete(
        &self,
        id: &str,
        callbacks: Option<OperationCallbacks<B::Entity>>,
    ) -> Result<(), ServiceError> {
        let mut callbacks = callbacks.unwrap_or_default();
        callbacks.started(Operation::Delete);

        let backend = self.backend.clone();
        let publisher = self.publisher();
        let id = id.to_string();
        let work = async move {
            if !backend.enforces_existence() && !backend.do_exists(&id).await? {
                return Err(RepositoryError::not_found(backend.entity_name(), &id)
                    .with_operation("delete")
                    .into());
            }

            backend.do_delete(&id).await?;
            if !publisher.record_in_transaction(Operation::Delete, Some(id.clone())) {
                publisher
                    .entity_event(EventRecord::new(entity_events::DELETED).with("id", id))
                    .await;
            }
            Ok(())
        };

        let result = self.execute(Operation::Delete, work).await;
        callbacks.finish(Operation::Delete, result.as_ref().map(|_| None));
        result
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<B::Entity>, ServiceError> {
        let backend = self.backend.clone();
        let publisher = self.publisher();
        let id = id.to_string();
        let work = async move {
            let found = backend.do_find_by_id(&id).await?;
            if let Some(entity) = &found {
                publisher
                    .entity_event(
                        EventRecord::new(entity_events::RETRIEVED)
                            .with("id", id)
                            .with("data", to_payload(entity)),
                    )
                    .await;
            }
            Ok(found)
        };
        self.execute(Operation::FindById, work).await
    }

    pub async fn find_many(&self, filters: Option<Filters>) -> Result<Vec<B::Entity>, ServiceError> {
        let backend = self.backend.clone();
        let publisher = self.publisher();
        let work = async move {
            let entities = backend.do_find_many(filters).await?;
            publisher
                .entity_event(
                    EventRecord::new(entity_events::LIST_RETRIEVED)
                        .with("count", entities.len())
                        .with("data", to_payload(&entities)),
                )
                .await;
            Ok(entities)
        };
        self.execute(Operation::FindMany, work).await
    }

    pub async fn find_many_paginated(
        &self,
        filters: Option<Filters>,
        page: u64,
        limit: u64,
    ) -> Result<Page<B::Entity>, ServiceError> {
        let backend = self.backend.clone();
        let publisher = self.publisher();
        let work = async move {
            let result = backend.do_find_many_paginated(filters, page, limit).await?;
            publisher
                .entity_event(
                    EventRecord::new(entity_events::LIST_RETRIEVED_PAGINATED)
                        .with("count", result.data.len())
                        .with("page", result.page)
                        .with("total", result.total)
                        .with("totalPages", result.total_pages),
                )
                .await;
            Ok(result)
        };
        self.execute(Operation::FindManyPaginated, work).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool, ServiceError> {
        let backend = self.backend.clone();
        let id = id.to_string();
        self.execute(Operation::Exists, async move { Ok(backend.do_exists(&id).await?) })
            .await
    }

    pub async fn count(&self, filters: Option<Filters>) -> Result<u64, ServiceError> {
        let backend = self.backend.clone();
        self.execute(Operation::Count, async move { Ok(backend.do_count(filters).await?) })
            .await
    }

    /// Run `operation` inside a transaction scope.
    ///
    /// Writes inside the scope skip their entity events and are recorded as
    /// advisory entries. On success the scope commits and publishes
    /// `transaction.committed`; on failure it rolls back, publishes
    /// `transaction.rolledback` and returns the original error. Nothing
    /// already written is undone.
    pub async fn execute_in_transaction<R, F, Fut>(&self, operation: F) -> Result<R, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, ServiceError>>,
    {
        self.begin_transaction()?;
        match operation().await {
            Ok(value) => {
                self.commit_transaction().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = self.rollback_transaction().await {
                    warn!(
                        service = %self.config.name,
                        error = %rollback_error,
                        "Rollback failed"
                    );
                }
                Err(error)
            }
        }
    }

    fn begin_transaction(&self) -> Result<(), ServiceError> {
        let mut state = self.transaction.lock();
        if state.active {
            return Err(ServiceError::TransactionAlreadyActive);
        }
        state.active = true;
        state.entries.clear();
        debug!(service = %self.config.name, "Transaction started");
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<usize, ServiceError> {
        let entries = {
            let mut state = self.transaction.lock();
            if !state.active {
                return Err(ServiceError::NoActiveTransaction);
            }
            state.active = false;
            std::mem::take(&mut state.entries)
        };

        for (step, entry) in entries.iter().enumerate() {
            debug!(
                service = %self.config.name,
                step = step + 1,
                operation = %entry.operation,
                entity_id = ?entry.entity_id,
                "Committing transaction operation"
            );
        }

        self.publisher()
            .publish(
                EventRecord::new(transaction_events::COMMITTED).with("operations", entries.len()),
            )
            .await;
        Ok(entries.len())
    }

    async fn rollback_transaction(&self) -> Result<usize, ServiceError> {
        let discarded = {
            let mut state = self.transaction.lock();
            if !state.active {
                return Err(ServiceError::NoActiveTransaction);
            }
            state.active = false;
            std::mem::take(&mut state.entries).len()
        };

        warn!(
            service = %self.config.name,
            discarded,
            "Transaction rolled back; completed writes are not undone"
        );
        self.publisher()
            .publish(
                EventRecord::new(transaction_events::ROLLED_BACK).with("operations", discarded),
            )
            .await;
        Ok(discarded)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.transaction.lock().active
    }

    pub fn pending_transaction_entries(&self) -> Vec<TransactionEntry> {
        self.transaction.lock().entries.clone()
    }

    pub fn get_metrics(&self) -> Vec<ServiceMetricRecord> {
        self.metrics.lock().iter().cloned().collect()
    }

    pub fn clear_metrics(&self) {
        self.metrics.lock().clear();
    }

    pub fn subscribe_to_event(
        &self,
        event_type: impl Into<String>,
        handler: EventHandler,
    ) -> Result<Subscription, EventBusError> {
        self.bus.on(event_type, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::EventBusConfig;
    use crate::infrastructure::event_bus::handler;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Note {
        id: String,
        text: String,
    }

    #[derive(Default)]
    struct Notes {
        rows: Mutex<HashMap<String, Note>>,
        writes: AtomicUsize,
        next_id: AtomicUsize,
        delay: Option<Duration>,
        finished: Arc<AtomicBool>,
    }

    impl Notes {
        fn slow(delay: Duration, finished: Arc<AtomicBool>) -> Self {
            Self {
                delay: Some(delay),
                finished,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl CrudBackend for Notes {
        type Entity = Note;
        type Create = String;
        type Update = String;

        fn entity_name(&self) -> &str {
            "Note"
        }

        async fn do_create(&self, text: String) -> Result<Note, RepositoryError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let id = format!("n{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            let note = Note {
                id: id.clone(),
                text,
            };
            self.rows.lock().insert(id, note.clone());
            self.finished.store(true, Ordering::SeqCst);
            Ok(note)
        }

        async fn do_update(&self, id: &str, text: String) -> Result<Note, RepositoryError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut rows = self.rows.lock();
            let note = rows
                .get_mut(id)
                .ok_or_else(|| RepositoryError::not_found("Note", id))?;
            note.text = text;
            Ok(note.clone())
        }

        async fn do_delete(&self, id: &str) -> Result<(), RepositoryError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.rows.lock().remove(id);
            Ok(())
        }

        async fn do_find_by_id(&self, id: &str) -> Result<Option<Note>, RepositoryError> {
            Ok(self.rows.lock().get(id).cloned())
        }

        async fn do_find_many(&self, _filters: Option<Filters>) -> Result<Vec<Note>, RepositoryError> {
            let mut notes: Vec<Note> = self.rows.lock().values().cloned().collect();
            notes.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(notes)
        }

        async fn do_find_many_paginated(
            &self,
            filters: Option<Filters>,
            page: u64,
            limit: u64,
        ) -> Result<Page<Note>, RepositoryError> {
            let all = self.do_find_many(filters).await?;
            let total = all.len() as u64;
            let data = all
                .into_iter()
                .skip(((page - 1) * limit) as usize)
                .take(limit as usize)
                .collect();
            Ok(Page {
                data,
                total,
                page,
                total_pages: total.div_ceil(limit),
            })
        }

        async fn do_exists(&self, id: &str) -> Result<bool, RepositoryError> {
            Ok(self.rows.lock().contains_key(id))
        }

        async fn do_count(&self, _filters: Option<Filters>) -> Result<u64, RepositoryError> {
            Ok(self.rows.lock().len() as u64)
        }

        async fn validate_create(&self, text: &String) -> ValidationResult {
            let mut result = ValidationResult::valid();
            if text.trim().is_empty() {
                result.error("text", "required");
            }
            if text.len() > 20 {
                result.error("text", "too long");
            }
            result
        }
    }

    fn service(backend: Notes) -> BaseService<Notes> {
        BaseService::new(
            Arc::new(backend),
            EventBus::new(EventBusConfig::default()),
            ServiceConfig::named("notes"),
        )
    }

    fn trace() -> (Arc<Mutex<Vec<String>>>, OperationCallbacks<Note>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
        let callbacks = OperationCallbacks::new()
            .on_start(move |op| a.lock().push(format!("start:{op}")))
            .on_success(move |op, note: Option<&Note>| {
                b.lock()
                    .push(format!("success:{op}:{}", note.map_or("-", |n| n.id.as_str())))
            })
            .on_error(move |op, e| c.lock().push(format!("error:{op}:{}", e.label())))
            .on_complete(move |op| d.lock().push(format!("complete:{op}")));
        (log, callbacks)
    }

    #[tokio::test]
    async fn test_create_runs_callbacks_and_publishes() {
        let notes = service(Notes::default());
        let (log, callbacks) = trace();

        let note = notes.create("hello".into(), Some(callbacks)).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["start:create", "success:create:n1", "complete:create"]
        );
        let events = notes.event_bus().history(Some(entity_events::CREATED), None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("entity"), Some(&serde_json::json!("Note")));
        assert_eq!(events[0].get("id"), Some(&serde_json::json!(note.id)));
        assert_eq!(events[0].get("service"), Some(&serde_json::json!("notes")));
    }

    #[tokio::test]
    async fn test_validation_failure_carries_every_field_error() {
        let notes = service(Notes::default());
        let (log, callbacks) = trace();

        let err = notes.create("   ".into(), Some(callbacks)).await.unwrap_err();
        assert_eq!(err.kind(), Some(RepositoryErrorKind::Validation));
        assert_eq!(err.field_errors().len(), 1);
        assert_eq!(notes.backend().writes.load(Ordering::SeqCst), 0);
        assert_eq!(
            *log.lock(),
            vec!["start:create", "error:create:validation", "complete:create"]
        );

        let metrics = notes.get_metrics();
        assert_eq!(metrics.len(), 1);
        assert!(!metrics[0].success);
        assert!(metrics[0].error.is_some());
    }

    #[tokio::test]
    async fn test_validation_can_be_disabled() {
        let notes = BaseService::new(
            Arc::new(Notes::default()),
            EventBus::default(),
            ServiceConfig {
                enable_validation: false,
                ..ServiceConfig::named("notes")
            },
        );
        assert!(notes.create(String::new(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_missing_entity_is_not_found_without_writes() {
        let notes = service(Notes::default());
        let (log, callbacks) = trace();

        let err = notes
            .update("ghost", "text".into(), Some(callbacks))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(RepositoryErrorKind::NotFound));
        assert_eq!(notes.backend().writes.load(Ordering::SeqCst), 0);
        assert!(log.lock().contains(&"error:update:not_found".to_string()));
        assert!(notes.event_bus().history(Some(entity_events::UPDATED), None).is_empty());
    }

    #[tokio::test]
    async fn test_repository_backed_writes_check_existence_once() {
        use crate::infrastructure::repositories::{InMemoryStore, QueryLogFilter};
        use serde::Deserialize;
        use serde_json::json;

        #[derive(Debug, Serialize, Deserialize)]
        struct Clause {
            id: String,
            body: String,
        }

        let repository = Arc::new(BaseRepository::<Clause>::new(
            Arc::new(InMemoryStore::new()),
            "clauses",
            "Clause",
        ));
        let service = BaseService::new(
            Arc::new(RepositoryCrud::<Clause, Value, Value>::new(repository.clone())),
            EventBus::new(EventBusConfig::default()),
            ServiceConfig::named("clauses"),
        );
        let exists_calls = || {
            repository
                .query_log()
                .entries(&QueryLogFilter {
                    operation: Some("exists".into()),
                    ..QueryLogFilter::default()
                })
                .len()
        };

        let created = service.create(json!({"body": "a"}), None).await.unwrap();
        service.update(&created.id, json!({"body": "b"}), None).await.unwrap();
        assert_eq!(exists_calls(), 1);
        service.delete(&created.id, None).await.unwrap();
        assert_eq!(exists_calls(), 2);

        let err = service.update("ghost", json!({"body": "c"}), None).await.unwrap_err();
        assert_eq!(err.kind(), Some(RepositoryErrorKind::NotFound));
        assert_eq!(exists_calls(), 3);
    }

    #[tokio::test]
    async fn test_update_delete_and_reads_publish_events() {
        let notes = service(Notes::default());
        let created = notes.create("a".into(), None).await.unwrap();

        let updated = notes.update(&created.id, "b".into(), None).await.unwrap();
        assert_eq!(updated.text, "b");
        assert!(notes.find_by_id(&created.id).await.unwrap().is_some());
        assert!(notes.find_by_id("ghost").await.unwrap().is_none());
        assert_eq!(notes.find_many(None).await.unwrap().len(), 1);
        let page = notes.find_many_paginated(None, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(notes.exists(&created.id).await.unwrap());
        assert_eq!(notes.count(None).await.unwrap(), 1);

        let (log, callbacks) = trace();
        notes.delete(&created.id, Some(callbacks)).await.unwrap();
        assert!(log.lock().contains(&"success:delete:-".to_string()));

        let bus = notes.event_bus();
        for event_type in [
            entity_events::CREATED,
            entity_events::UPDATED,
            entity_events::RETRIEVED,
            entity_events::LIST_RETRIEVED,
            entity_events::LIST_RETRIEVED_PAGINATED,
            entity_events::DELETED,
        ] {
            assert_eq!(bus.history(Some(event_type), None).len(), 1, "{event_type}");
        }
        assert_eq!(notes.get_metrics().len(), 9);
    }

    #[tokio::test]
    async fn test_timeout_abandons_but_does_not_cancel() {
        let finished = Arc::new(AtomicBool::new(false));
        let notes = BaseService::new(
            Arc::new(Notes::slow(Duration::from_millis(100), finished.clone())),
            EventBus::default(),
            ServiceConfig::named("notes").with_timeout(Duration::from_millis(10)),
        );

        let started = Instant::now();
        let err = notes.create("late".into(), None).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(90));
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(notes.backend().rows.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_transaction_commit_suppresses_entity_events() {
        let notes = service(Notes::default());

        let ids = notes
            .execute_in_transaction(|| async {
                let a = notes.create("a".into(), None).await?;
                let b = notes.create("b".into(), None).await?;
                assert_eq!(notes.pending_transaction_entries().len(), 2);
                Ok(vec![a.id, b.id])
            })
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert!(!notes.is_in_transaction());
        let bus = notes.event_bus();
        assert!(bus.history(Some(entity_events::CREATED), None).is_empty());
        let committed = bus.history(Some(transaction_events::COMMITTED), None);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].get("operations"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_transaction_failure_rolls_back_and_reraises() {
        let notes = service(Notes::default());

        let err = notes
            .execute_in_transaction(|| async {
                notes.create("kept".into(), None).await?;
                notes.create("".into(), None).await
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(RepositoryErrorKind::Validation));
        assert!(!notes.is_in_transaction());
        assert!(notes.pending_transaction_entries().is_empty());
        // Best-effort: the first write stays.
        assert_eq!(notes.count(None).await.unwrap(), 1);
        let bus = notes.event_bus();
        assert_eq!(bus.history(Some(transaction_events::ROLLED_BACK), None).len(), 1);
        assert!(bus.history(Some(transaction_events::COMMITTED), None).is_empty());
    }

    #[tokio::test]
    async fn test_nested_transaction_is_rejected() {
        let notes = service(Notes::default());

        let err = notes
            .execute_in_transaction(|| async {
                notes
                    .execute_in_transaction(|| async { Ok::<_, ServiceError>(()) })
                    .await
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::TransactionAlreadyActive));
        assert!(!notes.is_in_transaction());
    }

    #[tokio::test]
    async fn test_metrics_buffer_is_bounded() {
        let notes = BaseService::new(
            Arc::new(Notes::default()),
            EventBus::default(),
            ServiceConfig {
                max_metrics: 2,
                ..ServiceConfig::named("notes")
            },
        );
        for _ in 0..3 {
            notes.count(None).await.unwrap();
        }
        notes.exists("x").await.unwrap();

        let metrics = notes.get_metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[1].operation_name, "exists");

        notes.clear_metrics();
        assert!(notes.get_metrics().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_to_event_receives_service_events() {
        let notes = service(Notes::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        notes
            .subscribe_to_event(
                entity_events::CREATED,
                handler(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        notes.create("x".into(), None).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
