// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Graph/task dependency model and validator.
//!
//! A [`GraphDefinition`] is a static template; [`build`] validates it against
//! a [`TaskCatalog`] and produces a [`GraphInstance`] whose nodes carry
//! resolved wait requirements. Readiness and completion are pure functions of
//! the instance's task states, so every scheduler evaluates them the same way.
//!
//! | Predicate | Accepted upstream states |
//! |-----------|--------------------------|
//! | `succeeded` | `succeeded` |
//! | `failed` | `failed`, `timeout` |
//! | `finished` | `succeeded`, `failed`, `timeout`, `cancelled` |
//!
//! Top-level `waitOn` entries are ANDed; members of the `anyOf` group are ORed.

mod build;
mod catalog;
mod definition;
mod instance;
mod validate;

pub use build::{BuildOptions, SCHEDULER_OVERRIDES_OPTION, TASK_TIMEOUT_OPTION, build};
pub use catalog::{ResolvedTask, TaskCatalog};
pub use definition::{
    ANY_OF_KEY, DEFAULTS_KEY, GraphDefinition, GraphTaskNode, TaskDefinition, TaskOptions,
    WaitOnValue, WaitPredicate,
};
pub use instance::{
    GraphInstance, GraphStatus, TaskInstance, TaskState, UnknownState, WaitEdge, WaitRequirement,
};
pub use validate::{ValidationError, validate};
