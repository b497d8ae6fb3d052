// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - task kinds and the worker executing them.

pub mod builtin;
mod traits;
mod worker;

pub use builtin::{NoopKind, SleepKind};
pub use traits::*;
pub use worker::{TaskRunner, TaskRunnerConfig};
