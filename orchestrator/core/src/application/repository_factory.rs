// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Builds [`BaseRepository`] instances for registered repository kinds and
//! keeps one instance per `(kind, user)` pair. All repositories share the
//! factory's [`TabularStore`] and [`QueryLog`].
//!
//! - Domain layer: defines the store trait and entity shapes
//! - Application layer: decides which repository a caller gets
//! - Infrastructure layer: provides the store and the repository itself
//!
//! With `cache_enabled`, cached instances older than `cache_timeout` are
//! rebuilt on the next lookup. Otherwise instances live until
//! [`RepositoryFactory::clear_cache`] or
//! [`RepositoryFactory::remove_from_cache`].
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Repository construction, per-user caching and health checks

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::any::type_name;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::domain::config::RepositoryFactoryConfig;
use crate::domain::errors::{FieldError, RepositoryError};
use crate::domain::repository::{Entity, TabularStore};
use crate::infrastructure::container::{
    ContainerError, Instance, RegistrationOptions, ServiceContainer, ServiceFactory,
};
use crate::infrastructure::repositories::{BaseRepository, ManagedRepository, QueryLog, QueryStats};

/// Container token of the factory itself.
pub const REPOSITORY_FACTORY_TOKEN: &str = "RepositoryFactory";

type Builder = Arc<dyn Fn(Option<String>) -> (Instance, Arc<dyn ManagedRepository>) + Send + Sync>;

struct RepositoryKind {
    table: String,
    entity: String,
    build: Builder,
}

#[derive(Clone)]
struct CachedRepository {
    instance: Instance,
    managed: Arc<dyn ManagedRepository>,
    created_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryHealth {
    pub kind: String,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub repositories: Vec<RepositoryHealth>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryStats {
    pub supported_kinds: Vec<String>,
    pub cached_instances: usize,
    pub cache_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub cache_timeout: Duration,
    pub queries: QueryStats,
}

/// Container token for a repository kind: `contract_template` becomes
/// `ContractTemplateRepository`.
pub fn repository_token(kind: &str) -> String {
    let mut token: String = kind
        .split(['_', '-', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect();
    token.push_str("Repository");
    token
}

type CacheKey = (String, String);

fn cache_key(kind: &str, user_id: Option<&str>) -> CacheKey {
    (kind.to_string(), user_id.unwrap_or("anonymous").to_string())
}

pub struct RepositoryFactory {
    store: Arc<dyn TabularStore>,
    config: RwLock<RepositoryFactoryConfig>,
    query_log: Arc<QueryLog>,
    kinds: RwLock<BTreeMap<String, RepositoryKind>>,
    instances: DashMap<CacheKey, CachedRepository>,
}

impl std::fmt::Debug for RepositoryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryFactory")
            .field("kinds", &self.supported_kinds())
            .field("cached_instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl RepositoryFactory {
    pub fn new(store: Arc<dyn TabularStore>, config: RepositoryFactoryConfig) -> Self {
        let query_log = Arc::new(QueryLog::new(config.query_log_capacity));
        query_log.set_enabled(config.enable_performance_monitoring);
        Self {
            store,
            config: RwLock::new(config),
            query_log,
            kinds: RwLock::new(BTreeMap::new()),
            instances: DashMap::new(),
        }
    }

    /// Share an existing query log instead of the factory's own.
    pub fn with_query_log(mut self, query_log: Arc<QueryLog>) -> Self {
        query_log.set_enabled(self.config.read().enable_performance_monitoring);
        self.query_log = query_log;
        self
    }

    pub fn config(&self) -> RepositoryFactoryConfig {
        self.config.read().clone()
    }

    /// Adjust the configuration in place. Cached instances are kept.
    pub fn configure(&self, update: impl FnOnce(&mut RepositoryFactoryConfig)) {
        let mut config = self.config.write();
        update(&mut config);
        self.query_log.set_enabled(config.enable_performance_monitoring);
    }

    pub fn query_log(&self) -> &Arc<QueryLog> {
        &self.query_log
    }

    /// Register a repository kind backed by `table`. Re-registering a kind
    /// replaces it and drops its cached instances.
    pub fn register<T: Entity>(
        &self,
        kind: impl Into<String>,
        table: impl Into<String>,
        entity: impl Into<String>,
    ) {
        let kind = kind.into();
        let table = table.into();
        let entity = entity.into();

        let store = self.store.clone();
        let query_log = self.query_log.clone();
        let (build_table, build_entity) = (table.clone(), entity.clone());
        let build: Builder = Arc::new(move |user_id| {
            let repository = Arc::new(
                BaseRepository::<T>::new(store.clone(), build_table.clone(), build_entity.clone())
                    .with_user(user_id)
                    .with_query_log(query_log.clone()),
            );
            let managed: Arc<dyn ManagedRepository> = repository.clone();
            let instance: Instance = repository;
            (instance, managed)
        });

        let previous = self.kinds.write().insert(
            kind.clone(),
            RepositoryKind {
                table: table.clone(),
                entity: entity.clone(),
                build,
            },
        );
        if previous.is_some() {
            warn!(kind = %kind, "Repository kind re-registered; replacing previous definition");
            self.remove_from_cache(&kind, None);
        }
        debug!(kind = %kind, table = %table, entity = %entity, "Repository kind registered");
    }

    pub fn is_supported(&self, kind: &str) -> bool {
        self.kinds.read().contains_key(kind)
    }

    pub fn supported_kinds(&self) -> Vec<String> {
        self.kinds.read().keys().cloned().collect()
    }

    /// Table backing `kind`, if registered.
    pub fn table_for(&self, kind: &str) -> Option<String> {
        self.kinds.read().get(kind).map(|k| k.table.clone())
    }

    fn unsupported(&self, kind: &str) -> RepositoryError {
        RepositoryError::validation(
            format!("Unsupported repository kind: {kind}"),
            vec![FieldError::new("kind", format!("'{kind}' is not registered"))
                .with_code("unsupported_kind")],
            None,
        )
    }

    fn entry(&self, kind: &str, user_id: Option<&str>) -> Result<CachedRepository, RepositoryError> {
        let (user_id, cache_enabled, cache_timeout, logging) = {
            let config = self.config.read();
            (
                user_id
                    .map(str::to_string)
                    .or_else(|| config.default_user_id.clone()),
                config.cache_enabled,
                config.cache_timeout,
                config.enable_logging,
            )
        };
        let key = cache_key(kind, user_id.as_deref());

        if let Some(cached) = self.instances.get(&key) {
            if !cache_enabled || cached.created_at.elapsed() < cache_timeout {
                return Ok(cached.clone());
            }
        }

        let build = self
            .kinds
            .read()
            .get(kind)
            .map(|k| k.build.clone())
            .ok_or_else(|| self.unsupported(kind))?;

        let (instance, managed) = build(user_id.clone());
        let cached = CachedRepository {
            instance,
            managed,
            created_at: Instant::now(),
        };
        self.instances.insert(key, cached.clone());

        if logging {
            debug!(kind = %kind, user_id = ?user_id, "Repository instance created");
        }
        Ok(cached)
    }

    /// Repository for `kind`, scoped to `user_id` (or the configured
    /// default user).
    pub fn get<T: Entity>(
        &self,
        kind: &str,
        user_id: Option<&str>,
    ) -> Result<Arc<BaseRepository<T>>, RepositoryError> {
        let cached = self.entry(kind, user_id)?;
        cached.instance.downcast::<BaseRepository<T>>().map_err(|_| {
            RepositoryError::unknown(format!(
                "Repository kind '{kind}' does not hold {}",
                type_name::<T>()
            ))
        })
    }

    /// Type-erased handle, for callers that do not know the entity type.
    pub fn managed(
        &self,
        kind: &str,
        user_id: Option<&str>,
    ) -> Result<Arc<dyn ManagedRepository>, RepositoryError> {
        Ok(self.entry(kind, user_id)?.managed)
    }

    pub fn clear_cache(&self) {
        let cleared = self.instances.len();
        self.instances.clear();
        debug!(cleared, "Repository cache cleared");
    }

    /// Drop cached instances of `kind`: one user's, or every user's when
    /// `user_id` is `None`.
    pub fn remove_from_cache(&self, kind: &str, user_id: Option<&str>) {
        match user_id {
            Some(user_id) => {
                self.instances.remove(&cache_key(kind, Some(user_id)));
            }
            None => {
                self.instances.retain(|(cached_kind, _), _| cached_kind != kind);
            }
        }
    }

    /// Build and cache `kinds` for `user_id` ahead of first use.
    pub fn preload(&self, kinds: &[&str], user_id: Option<&str>) -> Result<(), RepositoryError> {
        for kind in kinds {
            self.entry(kind, user_id)?;
        }
        info!(count = kinds.len(), user_id = ?user_id, "Repositories preloaded");
        Ok(())
    }

    pub fn stats(&self) -> FactoryStats {
        let config = self.config.read();
        FactoryStats {
            supported_kinds: self.supported_kinds(),
            cached_instances: self.instances.len(),
            cache_enabled: config.cache_enabled,
            cache_timeout: config.cache_timeout,
            queries: self.query_log.stats(),
        }
    }

    /// Run `operation` against several repositories concurrently. Results
    /// come back in `kinds` order; one failure does not stop the others.
    pub async fn execute_on_repositories<R, F, Fut>(
        &self,
        kinds: &[&str],
        user_id: Option<&str>,
        operation: F,
    ) -> Vec<(String, Result<R, RepositoryError>)>
    where
        F: Fn(Arc<dyn ManagedRepository>) -> Fut,
        Fut: Future<Output = Result<R, RepositoryError>>,
    {
        let runs = kinds.iter().map(|kind| {
            let repository = self.managed(kind, user_id);
            let operation = &operation;
            async move {
                let result = match repository {
                    Ok(repository) => operation(repository).await,
                    Err(e) => Err(e),
                };
                (kind.to_string(), result)
            }
        });
        join_all(runs).await
    }

    /// Probe every registered kind with a row count.
    pub async fn health_check(&self) -> HealthReport {
        let kinds = self.supported_kinds();
        let probes = kinds.iter().map(|kind| async move {
            let started = Instant::now();
            let result = match self.managed(kind, None) {
                Ok(repository) => repository.probe().await,
                Err(e) => Err(e),
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(rows) => RepositoryHealth {
                    kind: kind.clone(),
                    healthy: true,
                    latency_ms,
                    row_count: Some(rows),
                    error: None,
                },
                Err(e) => RepositoryHealth {
                    kind: kind.clone(),
                    healthy: false,
                    latency_ms,
                    row_count: None,
                    error: Some(e.to_string()),
                },
            }
        });
        let repositories = join_all(probes).await;

        let failing = repositories.iter().filter(|r| !r.healthy).count();
        let overall = if failing == 0 {
            HealthStatus::Healthy
        } else if failing < repositories.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        if overall != HealthStatus::Healthy {
            warn!(failing, total = repositories.len(), "Repository health check failed");
        }

        HealthReport {
            overall,
            repositories,
            checked_at: Utc::now(),
        }
    }

    /// Register the factory and one `<Kind>Repository` singleton per
    /// registered kind. Repository tokens resolve through the factory with
    /// the default user.
    pub fn register_into(self: &Arc<Self>, container: &ServiceContainer) -> Result<(), ContainerError> {
        container.register_instance(REPOSITORY_FACTORY_TOKEN, self.clone())?;

        for kind in self.supported_kinds() {
            let token = repository_token(&kind);
            let factory_token = token.clone();
            let factory: ServiceFactory = Arc::new(move |container: &ServiceContainer| {
                let factory = container.get::<RepositoryFactory>(REPOSITORY_FACTORY_TOKEN)?;
                factory
                    .entry(&kind, None)
                    .map(|cached| cached.instance)
                    .map_err(|e| ContainerError::FactoryFailed {
                        token: factory_token.clone(),
                        message: e.to_string(),
                    })
            });
            container.register_factory(
                token,
                factory,
                RegistrationOptions::singleton().depends_on([REPOSITORY_FACTORY_TOKEN]),
            )?;
        }
        Ok(())
    }

    /// Entity name recorded for `kind`, if registered.
    pub fn entity_for(&self, kind: &str) -> Option<String> {
        self.kinds.read().get(kind).map(|k| k.entity.clone())
    }
}
