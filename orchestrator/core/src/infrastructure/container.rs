// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Dependency Container
//!
//! Resolves named services from registered factories. Singletons are cached
//! on first resolution; transients are rebuilt on every `get`. Declared
//! dependencies are resolved before the dependent factory runs.
//!
//! Lifecycle: `register*` → first `get` or `initialize` seals the container →
//! `dispose` runs dispose hooks, clears the cache and unseals it again.
//!
//! Locks are held only around map lookups and never while a factory runs,
//! so factories may resolve other services from the container.

use parking_lot::{Mutex, RwLock};
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::config::ServiceConfig;
use crate::domain::service::ServiceContext;

pub type Instance = Arc<dyn Any + Send + Sync>;

/// Type-erased factory. Most callers go through the typed `register*`
/// helpers instead.
pub type ServiceFactory =
    Arc<dyn Fn(&ServiceContainer) -> Result<Instance, ContainerError> + Send + Sync>;

type Disposer = Arc<dyn Fn(&Instance) + Send + Sync>;

/// Hook run for cached singletons when the container is disposed.
pub trait Disposable: Send + Sync {
    fn dispose(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContainerError {
    #[error("Service '{0}' not found in container")]
    NotRegistered(String),

    #[error("Dependency '{dependency}' for service '{token}' not found")]
    MissingDependency { token: String, dependency: String },

    #[error("Service '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Cannot register '{0}' after container initialization")]
    Sealed(String),

    #[error("Circular dependency detected: {}", .chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("Service '{token}' is not a {expected}")]
    TypeMismatch { token: String, expected: &'static str },

    #[error("Factory for '{token}' failed: {message}")]
    FactoryFailed { token: String, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lifetime {
    #[default]
    Singleton,
    Transient,
}

#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    pub lifetime: Lifetime,
    pub depends_on: Vec<String>,
    pub config: Option<ServiceConfig>,
    pub context: Option<ServiceContext>,
}

impl RegistrationOptions {
    pub fn singleton() -> Self {
        Self::default()
    }

    pub fn transient() -> Self {
        Self {
            lifetime: Lifetime::Transient,
            ..Self::default()
        }
    }

    pub fn depends_on<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(tokens.into_iter().map(Into::into));
        self
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_context(mut self, context: ServiceContext) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Clone)]
struct Registration {
    factory: ServiceFactory,
    options: RegistrationOptions,
    disposer: Option<Disposer>,
}

/// Named-service container with singleton caching and scoped children.
pub struct ServiceContainer {
    registrations: RwLock<HashMap<String, Registration>>,
    order: RwLock<Vec<String>>,
    instances: RwLock<HashMap<String, Instance>>,
    creation_order: Mutex<Vec<String>>,
    resolving: Mutex<Vec<String>>,
    context: RwLock<ServiceContext>,
    sealed: AtomicBool,
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("tokens", &*self.order.read())
            .field("instances", &self.instances.read().len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::with_context(ServiceContext::default())
    }

    pub fn with_context(context: ServiceContext) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            instances: RwLock::new(HashMap::new()),
            creation_order: Mutex::new(Vec::new()),
            resolving: Mutex::new(Vec::new()),
            context: RwLock::new(context),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a type-erased factory.
    pub fn register_factory(
        &self,
        token: impl Into<String>,
        factory: ServiceFactory,
        options: RegistrationOptions,
    ) -> Result<(), ContainerError> {
        self.insert(token.into(), factory, options, None)
    }

    pub fn register<T, F>(
        &self,
        token: impl Into<String>,
        factory: F,
        options: RegistrationOptions,
    ) -> Result<(), ContainerError>
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceContainer) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.insert(token.into(), erase(factory), options, None)
    }

    /// Register a service whose cached instance gets `Disposable::dispose`
    /// called on [`ServiceContainer::dispose`].
    pub fn register_disposable<T, F>(
        &self,
        token: impl Into<String>,
        factory: F,
        options: RegistrationOptions,
    ) -> Result<(), ContainerError>
    where
        T: Disposable + Any,
        F: Fn(&ServiceContainer) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        let disposer: Disposer = Arc::new(|instance: &Instance| {
            if let Some(service) = instance.downcast_ref::<T>() {
                service.dispose();
            }
        });
        self.insert(token.into(), erase(factory), options, Some(disposer))
    }

    pub fn register_singleton<T, F>(
        &self,
        token: impl Into<String>,
        factory: F,
        depends_on: &[&str],
    ) -> Result<(), ContainerError>
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceContainer) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.register(
            token,
            factory,
            RegistrationOptions::singleton().depends_on(depends_on.iter().copied()),
        )
    }

    pub fn register_transient<T, F>(
        &self,
        token: impl Into<String>,
        factory: F,
        depends_on: &[&str],
    ) -> Result<(), ContainerError>
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceContainer) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.register(
            token,
            factory,
            RegistrationOptions::transient().depends_on(depends_on.iter().copied()),
        )
    }

    /// Register an already-built value. `get` returns this exact `Arc`.
    pub fn register_instance<T>(
        &self,
        token: impl Into<String>,
        instance: Arc<T>,
    ) -> Result<(), ContainerError>
    where
        T: Any + Send + Sync,
    {
        let instance: Instance = instance;
        let factory: ServiceFactory = Arc::new(move |_| Ok(instance.clone()));
        self.insert(token.into(), factory, RegistrationOptions::singleton(), None)
    }

    fn insert(
        &self,
        token: String,
        factory: ServiceFactory,
        options: RegistrationOptions,
        disposer: Option<Disposer>,
    ) -> Result<(), ContainerError> {
        if self.is_sealed() {
            return Err(ContainerError::Sealed(token));
        }
        if options.depends_on.iter().any(|dep| dep == &token) {
            return Err(ContainerError::CircularDependency {
                chain: vec![token.clone(), token],
            });
        }

        let mut registrations = self.registrations.write();
        if registrations.contains_key(&token) {
            return Err(ContainerError::AlreadyRegistered(token));
        }

        debug!(
            token = %token,
            lifetime = ?options.lifetime,
            depends_on = ?options.depends_on,
            "Service registered"
        );
        registrations.insert(
            token.clone(),
            Registration {
                factory,
                options,
                disposer,
            },
        );
        self.order.write().push(token);
        Ok(())
    }

    /// Resolve `token` as `T`, building it (and its dependencies) if needed.
    pub fn get<T>(&self, token: &str) -> Result<Arc<T>, ContainerError>
    where
        T: Any + Send + Sync,
    {
        let instance = self.resolve(token)?;
        instance
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch {
                token: token.to_string(),
                expected: type_name::<T>(),
            })
    }

    pub fn get_optional<T>(&self, token: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        match self.get(token) {
            Ok(service) => Some(service),
            Err(e) => {
                debug!(token = %token, error = %e, "Optional service unavailable");
                None
            }
        }
    }

    /// Resolve several tokens of the same type, in order.
    pub fn get_many<T>(&self, tokens: &[&str]) -> Result<Vec<Arc<T>>, ContainerError>
    where
        T: Any + Send + Sync,
    {
        tokens.iter().map(|token| self.get(token)).collect()
    }

    /// Resolve without downcasting.
    pub fn resolve(&self, token: &str) -> Result<Instance, ContainerError> {
        self.sealed.store(true, Ordering::SeqCst);

        if let Some(instance) = self.instances.read().get(token) {
            return Ok(instance.clone());
        }

        let registration = self
            .registrations
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| ContainerError::NotRegistered(token.to_string()))?;

        {
            let mut stack = self.resolving.lock();
            if stack.iter().any(|t| t == token) {
                let mut chain = stack.clone();
                chain.push(token.to_string());
                return Err(ContainerError::CircularDependency { chain });
            }
            stack.push(token.to_string());
        }

        let result = self.build(token, &registration);

        let mut stack = self.resolving.lock();
        if let Some(pos) = stack.iter().rposition(|t| t == token) {
            stack.remove(pos);
        }
        result
    }

    fn build(&self, token: &str, registration: &Registration) -> Result<Instance, ContainerError> {
        for dependency in &registration.options.depends_on {
            if !self.has(dependency) {
                return Err(ContainerError::MissingDependency {
                    token: token.to_string(),
                    dependency: dependency.clone(),
                });
            }
            self.resolve(dependency)?;
        }

        let instance = (registration.factory)(self)?;

        if registration.options.lifetime == Lifetime::Singleton {
            let mut instances = self.instances.write();
            // Keep the first cached instance if another caller got here first.
            if let Some(existing) = instances.get(token) {
                return Ok(existing.clone());
            }
            instances.insert(token.to_string(), instance.clone());
            self.creation_order.lock().push(token.to_string());
        }

        debug!(token = %token, "Service resolved");
        Ok(instance)
    }

    /// Seal the container and eagerly resolve every declared dependency.
    pub fn initialize(&self) -> Result<(), ContainerError> {
        self.sealed.store(true, Ordering::SeqCst);
        let registrations: Vec<(String, Vec<String>)> = {
            let order = self.order.read();
            let registrations = self.registrations.read();
            order
                .iter()
                .filter_map(|token| {
                    registrations
                        .get(token)
                        .map(|r| (token.clone(), r.options.depends_on.clone()))
                })
                .collect()
        };

        for (token, depends_on) in registrations {
            for dependency in depends_on {
                if !self.has(&dependency) {
                    return Err(ContainerError::MissingDependency { token, dependency });
                }
                self.resolve(&dependency)?;
            }
        }

        debug!("Service container initialized");
        Ok(())
    }

    /// Child container with the same registrations, its own instance cache
    /// and fresh request/correlation ids.
    pub fn create_scope(&self) -> ServiceContainer {
        let scope = ServiceContainer::with_context(self.context.read().child());
        *scope.registrations.write() = self.registrations.read().clone();
        *scope.order.write() = self.order.read().clone();
        scope
    }

    /// Run dispose hooks for cached singletons (most recent first), clear the
    /// cache and unseal the container.
    pub fn dispose(&self) {
        let created: Vec<String> = std::mem::take(&mut *self.creation_order.lock());
        let mut instances = std::mem::take(&mut *self.instances.write());
        let registrations = self.registrations.read().clone();

        for token in created.iter().rev() {
            let Some(instance) = instances.remove(token) else {
                continue;
            };
            if let Some(disposer) = registrations.get(token).and_then(|r| r.disposer.as_ref()) {
                debug!(token = %token, "Disposing service");
                disposer(&instance);
            }
        }

        if !instances.is_empty() {
            warn!(count = instances.len(), "Dropping untracked service instances");
        }

        self.sealed.store(false, Ordering::SeqCst);
    }

    pub fn has(&self, token: &str) -> bool {
        self.registrations.read().contains_key(token)
    }

    pub fn registered_tokens(&self) -> Vec<String> {
        self.order.read().clone()
    }

    pub fn is_singleton(&self, token: &str) -> bool {
        self.registrations
            .read()
            .get(token)
            .is_some_and(|r| r.options.lifetime == Lifetime::Singleton)
    }

    pub fn dependencies(&self, token: &str) -> Vec<String> {
        self.registrations
            .read()
            .get(token)
            .map(|r| r.options.depends_on.clone())
            .unwrap_or_default()
    }

    /// Service config attached at registration, if any.
    pub fn registration_config(&self, token: &str) -> Option<ServiceConfig> {
        self.registrations
            .read()
            .get(token)
            .and_then(|r| r.options.config.clone())
    }

    /// Context attached at registration, falling back to the container's.
    pub fn registration_context(&self, token: &str) -> ServiceContext {
        self.registrations
            .read()
            .get(token)
            .and_then(|r| r.options.context.clone())
            .unwrap_or_else(|| self.context())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> ServiceContext {
        self.context.read().clone()
    }

    pub fn update_context(&self, update: impl FnOnce(&mut ServiceContext)) {
        update(&mut self.context.write());
    }
}

fn erase<T, F>(factory: F) -> ServiceFactory
where
    T: Any + Send + Sync,
    F: Fn(&ServiceContainer) -> Result<T, ContainerError> + Send + Sync + 'static,
{
    Arc::new(move |container| factory(container).map(|service| Arc::new(service) as Instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Logger {
        prefix: String,
    }

    #[derive(Debug)]
    struct UserService {
        logger: Arc<Logger>,
    }

    #[test]
    fn test_singleton_resolves_to_same_instance() {
        let container = ServiceContainer::new();
        container
            .register_singleton(
                "Logger",
                |_| {
                    Ok(Logger {
                        prefix: "app".into(),
                    })
                },
                &[],
            )
            .unwrap();

        let a = container.get::<Logger>("Logger").unwrap();
        let b = container.get::<Logger>("Logger").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.prefix, "app");
    }

    #[test]
    fn test_transient_resolves_to_distinct_instances() {
        let container = ServiceContainer::new();
        container
            .register_transient("Logger", |_| Ok(Logger { prefix: "t".into() }), &[])
            .unwrap();

        let a = container.get::<Logger>("Logger").unwrap();
        let b = container.get::<Logger>("Logger").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(container.instance_count(), 0);
    }

    #[test]
    fn test_missing_dependency_names_the_dependency() {
        let container = ServiceContainer::new();
        container
            .register_singleton(
                "UserService",
                |c| {
                    Ok(UserService {
                        logger: c.get::<Logger>("Logger")?,
                    })
                },
                &["Logger"],
            )
            .unwrap();

        let err = container.get::<UserService>("UserService").unwrap_err();
        assert_eq!(
            err,
            ContainerError::MissingDependency {
                token: "UserService".into(),
                dependency: "Logger".into()
            }
        );
        assert!(err.to_string().contains("Logger"));
    }

    #[test]
    fn test_dependencies_resolve_first() {
        let container = ServiceContainer::new();
        let built = Arc::new(Mutex::new(Vec::new()));

        let log = built.clone();
        container
            .register_singleton(
                "UserService",
                move |c| {
                    log.lock().push("UserService");
                    Ok(UserService {
                        logger: c.get::<Logger>("Logger")?,
                    })
                },
                &["Logger"],
            )
            .unwrap();
        let log = built.clone();
        container
            .register_singleton(
                "Logger",
                move |_| {
                    log.lock().push("Logger");
                    Ok(Logger { prefix: "x".into() })
                },
                &[],
            )
            .unwrap();

        let service = container.get::<UserService>("UserService").unwrap();
        assert_eq!(service.logger.prefix, "x");
        assert_eq!(*built.lock(), vec!["Logger", "UserService"]);
    }

    #[test]
    fn test_registration_rules() {
        let container = ServiceContainer::new();
        container
            .register_singleton("Logger", |_| Ok(Logger { prefix: "".into() }), &[])
            .unwrap();

        assert_eq!(
            container
                .register_singleton("Logger", |_| Ok(Logger { prefix: "".into() }), &[])
                .unwrap_err(),
            ContainerError::AlreadyRegistered("Logger".into())
        );
        assert!(matches!(
            container
                .register_singleton("Loop", |_| Ok(Logger { prefix: "".into() }), &["Loop"])
                .unwrap_err(),
            ContainerError::CircularDependency { .. }
        ));

        container.get::<Logger>("Logger").unwrap();
        assert_eq!(
            container
                .register_singleton("Late", |_| Ok(Logger { prefix: "".into() }), &[])
                .unwrap_err(),
            ContainerError::Sealed("Late".into())
        );
    }

    #[test]
    fn test_cycles_are_detected_during_resolution() {
        let container = ServiceContainer::new();
        container
            .register_singleton("A", |_| Ok(Logger { prefix: "a".into() }), &["B"])
            .unwrap();
        container
            .register_singleton("B", |_| Ok(Logger { prefix: "b".into() }), &["A"])
            .unwrap();

        let err = container.get::<Logger>("A").unwrap_err();
        assert_eq!(
            err,
            ContainerError::CircularDependency {
                chain: vec!["A".into(), "B".into(), "A".into()]
            }
        );
    }

    #[test]
    fn test_unknown_token_and_type_mismatch() {
        let container = ServiceContainer::new();
        assert_eq!(
            container.get::<Logger>("Nope").unwrap_err(),
            ContainerError::NotRegistered("Nope".into())
        );
        assert!(container.get_optional::<Logger>("Nope").is_none());

        container
            .register_instance("Answer", Arc::new(42_u32))
            .unwrap();
        assert!(matches!(
            container.get::<Logger>("Answer").unwrap_err(),
            ContainerError::TypeMismatch { .. }
        ));
        assert_eq!(*container.get::<u32>("Answer").unwrap(), 42);
    }

    #[test]
    fn test_register_instance_returns_same_arc() {
        let container = ServiceContainer::new();
        let logger = Arc::new(Logger { prefix: "p".into() });
        container.register_instance("Logger", logger.clone()).unwrap();
        assert!(Arc::ptr_eq(&logger, &container.get::<Logger>("Logger").unwrap()));
    }

    #[test]
    fn test_get_many_preserves_order() {
        let container = ServiceContainer::new();
        container.register_instance("one", Arc::new(1_u8)).unwrap();
        container.register_instance("two", Arc::new(2_u8)).unwrap();
        let values = container.get_many::<u8>(&["two", "one"]).unwrap();
        assert_eq!(values.iter().map(|v| **v).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_scope_has_independent_cache_and_fresh_ids() {
        let container = ServiceContainer::with_context(ServiceContext::for_user("u-7"));
        container
            .register_singleton("Logger", |_| Ok(Logger { prefix: "s".into() }), &[])
            .unwrap();
        let parent = container.get::<Logger>("Logger").unwrap();

        let scope = container.create_scope();
        let scoped = scope.get::<Logger>("Logger").unwrap();

        assert!(!Arc::ptr_eq(&parent, &scoped));
        assert_eq!(scope.instance_count(), 1);
        assert_eq!(scope.context().user_id.as_deref(), Some("u-7"));
        assert_ne!(scope.context().request_id, container.context().request_id);
        assert_ne!(scope.context().correlation_id, container.context().correlation_id);
    }

    struct Pool {
        closed: Arc<AtomicUsize>,
    }

    impl Disposable for Pool {
        fn dispose(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispose_runs_hooks_and_unseals() {
        let container = ServiceContainer::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        container
            .register_disposable(
                "Pool",
                move |_| {
                    Ok(Pool {
                        closed: counter.clone(),
                    })
                },
                RegistrationOptions::singleton(),
            )
            .unwrap();

        let first = container.get::<Pool>("Pool").unwrap();
        assert!(container.is_sealed());

        container.dispose();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!container.is_sealed());
        assert_eq!(container.instance_count(), 0);

        let second = container.get::<Pool>("Pool").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_initialize_resolves_declared_dependencies() {
        let container = ServiceContainer::new();
        container
            .register_singleton("Logger", |_| Ok(Logger { prefix: "i".into() }), &[])
            .unwrap();
        container
            .register_singleton(
                "UserService",
                |c| {
                    Ok(UserService {
                        logger: c.get::<Logger>("Logger")?,
                    })
                },
                &["Logger"],
            )
            .unwrap();

        container.initialize().unwrap();
        assert!(container.is_sealed());
        assert_eq!(container.instance_count(), 1);
    }

    #[test]
    fn test_introspection_and_context_updates() {
        let container = ServiceContainer::new();
        container
            .register(
                "UserService",
                |_| Ok(Logger { prefix: "".into() }),
                RegistrationOptions::transient()
                    .depends_on(["Logger"])
                    .with_config(ServiceConfig::named("users")),
            )
            .unwrap();

        assert!(container.has("UserService"));
        assert!(!container.is_singleton("UserService"));
        assert_eq!(container.dependencies("UserService"), vec!["Logger"]);
        assert_eq!(container.registered_tokens(), vec!["UserService"]);
        assert_eq!(
            container.registration_config("UserService").map(|c| c.name),
            Some("users".to_string())
        );

        container.update_context(|ctx| ctx.user_id = Some("u-1".into()));
        assert_eq!(container.context().user_id.as_deref(), Some("u-1"));
        assert_eq!(
            container.registration_context("UserService").user_id.as_deref(),
            Some("u-1")
        );
    }
}
