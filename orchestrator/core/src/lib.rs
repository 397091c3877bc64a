// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Docforge Core
//!
//! Service orchestration core: dependency container, event bus, generic
//! repositories over a tabular store, and generic CRUD services with
//! validation, timeouts, metrics and transaction scoping.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Shared plumbing for every entity service

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
