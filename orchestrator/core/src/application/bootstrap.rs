// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Container wiring.
//!
//! [`bootstrap`] assembles the shared infrastructure into a
//! [`ServiceContainer`]:
//!
//! | token                 | instance                      |
//! |-----------------------|-------------------------------|
//! | `RuntimeConfig`       | the loaded [`RuntimeConfig`]  |
//! | `EventBus`            | [`EventBus`] (disposable)     |
//! | `QueryLog`            | the factory's [`QueryLog`]    |
//! | `RepositoryFactory`   | [`RepositoryFactory`]         |
//! | `<Kind>Repository`    | one per registered kind       |
//!
//! Entity services are then added with [`register_repository_service`].

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::application::crud_service::{BaseService, RepositoryCrud};
use crate::application::repository_factory::{repository_token, RepositoryFactory};
use crate::domain::config::{RuntimeConfig, ServiceConfig};
use crate::domain::repository::{Entity, TabularStore};
use crate::infrastructure::container::{
    ContainerError, Disposable, RegistrationOptions, ServiceContainer,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::repositories::BaseRepository;

pub mod tokens {
    pub const RUNTIME_CONFIG: &str = "RuntimeConfig";
    pub const EVENT_BUS: &str = "EventBus";
    pub const QUERY_LOG: &str = "QueryLog";
    pub const REPOSITORY_FACTORY: &str =
        crate::application::repository_factory::REPOSITORY_FACTORY_TOKEN;
}

/// Service sitting directly on a repository.
pub type RepositoryService<T, C, U> = BaseService<RepositoryCrud<T, C, U>>;

impl Disposable for EventBus {
    fn dispose(&self) {
        EventBus::dispose(self);
    }
}

/// Build a container holding the shared infrastructure. `register_kinds`
/// declares the repository kinds before their tokens are registered.
pub fn bootstrap(
    config: &RuntimeConfig,
    store: Arc<dyn TabularStore>,
    register_kinds: impl FnOnce(&RepositoryFactory),
) -> Result<ServiceContainer, ContainerError> {
    let container = ServiceContainer::new();

    container.register_instance(tokens::RUNTIME_CONFIG, Arc::new(config.clone()))?;

    let bus_config = config.event_bus.clone();
    container.register_disposable(
        tokens::EVENT_BUS,
        move |_| Ok(EventBus::new(bus_config.clone())),
        RegistrationOptions::singleton(),
    )?;

    let factory = RepositoryFactory::new(store, config.repository_factory.clone());
    register_kinds(&factory);
    let factory = Arc::new(factory);

    container.register_instance(tokens::QUERY_LOG, factory.query_log().clone())?;
    factory.register_into(&container)?;

    info!(
        tokens = container.registered_tokens().len(),
        repositories = factory.supported_kinds().len(),
        "Service container bootstrapped"
    );
    Ok(container)
}

/// Register `token` as a singleton [`RepositoryService`] over the repository
/// kind `kind`. The service shares the container's event bus and context.
pub fn register_repository_service<T, C, U>(
    container: &ServiceContainer,
    token: &str,
    kind: &str,
    config: ServiceConfig,
) -> Result<(), ContainerError>
where
    T: Entity,
    C: Serialize + Send + Sync + 'static,
    U: Serialize + Send + Sync + 'static,
{
    let repository_token = repository_token(kind);
    let options = RegistrationOptions::singleton()
        .depends_on([tokens::EVENT_BUS, repository_token.as_str()])
        .with_config(config.clone());

    container.register(
        token,
        move |container: &ServiceContainer| {
            let bus = container.get::<EventBus>(tokens::EVENT_BUS)?;
            let repository = container.get::<BaseRepository<T>>(&repository_token)?;
            let service: RepositoryService<T, C, U> = BaseService::new(
                Arc::new(RepositoryCrud::new(repository)),
                bus.as_ref().clone(),
                config.clone(),
            )
            .with_context(container.context());
            Ok(service)
        },
        options,
    )
}
