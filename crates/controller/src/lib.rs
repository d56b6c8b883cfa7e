/*
 * 5D Labs Agent Platform - RollbackPolicy Remediation Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Closed-loop remediation controller
//!
//! Watches `RollbackPolicy` resources, evaluates their guards against the
//! live state of the targeted workload, and rolls the workload back or runs
//! a remediation handler when a guard is breached.

pub mod admission;
pub mod config;
pub mod controller;
pub mod crds;
pub mod executor;
pub mod metrics;
pub mod policy;
pub mod reconcile;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::ControllerConfig;
pub use controller::run_policy_controller;
pub use crds::{RollbackPolicy, RollbackPolicySpec, RollbackPolicyStatus};
pub use reconcile::{reconcile_policy, Cycle};
pub use types::{Context, Error, PolicyKey, ResolvedTarget, Result};
