// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod container;
pub mod event_bus;
pub mod repositories;
pub mod telemetry;

pub use container::{ContainerError, RegistrationOptions, ServiceContainer};
pub use event_bus::{EmitReport, EventBus, EventBusError, Subscription};
