//! Core identity reconciliation for contact fragments.
//! This crate is the single source of truth for cluster invariants.

pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use logging::{default_log_level, init_logging, logging_status};
pub use model::contact::{
    Contact, ContactId, ContactLinkUpdate, ContactValidationError, LinkPrecedence, NewContact,
};
pub use model::identify::{ContactView, IdentifyRequest, IdentifyResponse, ValidationError};
pub use repo::contact_repo::{ContactRepository, RepoError, RepoResult, SqliteContactRepository};
pub use service::identity_service::{
    now_epoch_ms, IdentifyError, IdentifyOptions, IdentityService, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use service::reconcile::{reconcile, ReconcileOutcome};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
