// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain types: errors, events, repository contracts, service records and
//! configuration.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types shared by every other layer, free of I/O

pub mod config;
pub mod errors;
pub mod events;
pub mod repository;
pub mod service;
