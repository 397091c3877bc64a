// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure side of the repository abstractions defined in
//! [`crate::domain::repository`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve entities through a [`TabularStore`]
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Contents
//!
//! - **BaseRepository** - generic CRUD, condition queries, bulk operations
//!   and sequential transactions for one table
//! - **InMemoryStore** - ordered, constraint-checking store for tests and
//!   development
//! - **QueryLog** / **QueryTimer** - bounded log of timed repository calls
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use docforge_core::infrastructure::repositories::{BaseRepository, InMemoryStore};
//!
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Contract { id: String, title: String }
//! let store = Arc::new(InMemoryStore::new());
//! let contracts: BaseRepository<Contract> = BaseRepository::new(store, "contracts", "Contract");
//! assert_eq!(contracts.table_name(), "contracts");
//! ```
//!
//! [`TabularStore`]: crate::domain::repository::TabularStore

mod base;
mod in_memory;
pub mod query_log;

pub use base::{BaseRepository, ManagedRepository};
pub use in_memory::InMemoryStore;
pub use query_log::{QueryLog, QueryLogEntry, QueryLogFilter, QueryStats, QueryTimer};
