//! Controller module for pd-operator.
//!
//! Contains the reconciliation loop, the PD member manager and its
//! collaborators, error handling, status management and validation.

pub mod context;
pub mod error;
pub mod failover_gate;
pub mod member_manager;
pub mod membership;
pub mod pd_reconciler;
pub mod status;
pub mod status_sync;
pub mod upgrade_policy;
pub mod validation;
