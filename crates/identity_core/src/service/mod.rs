//! Core use-case services.
//!
//! # Responsibility
//! - Implement the reconciliation steps over the repository contract.
//! - Wrap one reconciliation in a transaction with retry and deadline.
//! - Keep transport layers decoupled from storage details.

pub mod identity_service;
pub mod reconcile;
