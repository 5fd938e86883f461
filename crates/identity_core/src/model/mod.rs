//! Domain model for identity reconciliation.
//!
//! # Responsibility
//! - Define the contact record shared by the store and the reconciler.
//! - Define the request/response shapes of one reconciliation.
//!
//! # Invariants
//! - Every contact is identified by a store-assigned, monotonic `ContactId`.
//! - Deletion is represented by a soft-delete timestamp, never hard delete.

pub mod contact;
pub mod identify;
