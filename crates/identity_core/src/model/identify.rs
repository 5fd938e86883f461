//! Request and response shapes for one reconciliation.
//!
//! # Invariants
//! - Blank identifiers are treated as absent before any store access.
//! - Response fields serialize in camelCase to match the public contract.

use super::contact::ContactId;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Incoming contact fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

/// Rejection of a request before the store is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// Neither email nor phone number was supplied.
    MissingIdentifiers,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingIdentifiers => write!(f, "Email or phoneNumber is required"),
        }
    }
}

impl Error for ValidationError {}

impl IdentifyRequest {
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }

    /// Drops blank identifiers and rejects requests that carry none.
    ///
    /// Non-blank values are kept verbatim: matching is exact.
    pub fn normalized(&self) -> Result<Self, ValidationError> {
        let email = non_blank(self.email.as_deref());
        let phone_number = non_blank(self.phone_number.as_deref());
        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingIdentifiers);
        }
        Ok(Self {
            email,
            phone_number,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}

/// Consolidated identity view of one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactView {
    pub primary_contact_id: ContactId,
    /// Primary email first, then secondaries by seniority, deduplicated.
    pub emails: Vec<String>,
    /// Primary phone first, then secondaries by seniority, deduplicated.
    pub phone_numbers: Vec<String>,
    /// Ascending.
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Response envelope: `{ "contact": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: ContactView,
}

impl From<ContactView> for IdentifyResponse {
    fn from(contact: ContactView) -> Self {
        Self { contact }
    }
}
