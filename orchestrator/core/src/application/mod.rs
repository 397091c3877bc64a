// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod bootstrap;
pub mod crud_service;
pub mod repository_factory;

// Re-export for convenience
pub use bootstrap::{bootstrap, register_repository_service, tokens, RepositoryService};
pub use crud_service::{
    BaseService, CrudBackend, OperationCallbacks, RepositoryCrud, ServiceError, TransactionEntry,
};
pub use repository_factory::{HealthReport, HealthStatus, RepositoryFactory, RepositoryHealth};
