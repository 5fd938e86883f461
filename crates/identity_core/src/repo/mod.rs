//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the contact store contract the reconciler depends on.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Repository writes validate contact linkage before persistence.
//! - Repository APIs return semantic errors (`NotFound`, `Conflict`) in
//!   addition to DB transport errors.

pub mod contact_repo;
