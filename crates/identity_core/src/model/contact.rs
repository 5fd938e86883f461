//! Contact domain model.
//!
//! # Responsibility
//! - Define the canonical contact record and its link precedence.
//! - Provide validation for the primary/secondary linkage shape.
//!
//! # Invariants
//! - A primary contact never carries a `linked_id`.
//! - A secondary contact always links to another contact, never itself.
//! - At least one of `email` / `phone_number` is present.
//! - `deleted_at` is the source of truth for tombstone state.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Store-assigned contact identifier, strictly increasing with creation order.
pub type ContactId = i64;

/// Position of a contact inside its identity cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    /// Canonical record of a cluster.
    Primary,
    /// Record attached directly to the cluster primary.
    Secondary,
}

impl LinkPrecedence {
    /// Stable storage label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    /// Parses a storage label. Returns `None` for unknown values.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// Validation failures for contact linkage shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactValidationError {
    /// Neither email nor phone number is present.
    MissingIdentifiers,
    /// A primary contact carries a `linked_id`.
    PrimaryWithLink { linked_id: ContactId },
    /// A secondary contact has no `linked_id`.
    SecondaryWithoutLink,
    /// A secondary contact links to itself.
    SelfLink(ContactId),
}

impl Display for ContactValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingIdentifiers => {
                write!(f, "contact requires an email or a phone number")
            }
            Self::PrimaryWithLink { linked_id } => {
                write!(f, "primary contact must not link to contact {linked_id}")
            }
            Self::SecondaryWithoutLink => write!(f, "secondary contact requires linked_id"),
            Self::SelfLink(id) => write!(f, "contact {id} must not link to itself"),
        }
    }
}

impl Error for ContactValidationError {}

/// Canonical persisted contact record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    /// `None` for primaries; the cluster primary id for secondaries.
    pub linked_id: Option<ContactId>,
    /// Unix epoch milliseconds. Determines seniority.
    pub created_at: i64,
    /// Unix epoch milliseconds.
    pub updated_at: i64,
    /// Soft delete tombstone, unix epoch milliseconds.
    pub deleted_at: Option<i64>,
}

impl Contact {
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Returns whether this contact takes part in matching and aggregation.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Total order used to pick the cluster primary: oldest first, then lowest id.
    pub fn seniority_key(&self) -> (i64, ContactId) {
        (self.created_at, self.id)
    }

    /// Returns whether this contact stores exactly the given identifier pair.
    pub fn has_pair(&self, email: Option<&str>, phone_number: Option<&str>) -> bool {
        self.email.as_deref() == email && self.phone_number.as_deref() == phone_number
    }

    /// Validates linkage shape and identifier presence.
    pub fn validate(&self) -> Result<(), ContactValidationError> {
        validate_shape(
            Some(self.id),
            self.email.as_deref(),
            self.phone_number.as_deref(),
            self.link_precedence,
            self.linked_id,
        )
    }
}

/// Insert model for a contact that does not have a store id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    /// Unix epoch milliseconds; also used as initial `updated_at`.
    pub created_at: i64,
}

impl NewContact {
    /// Builds a new cluster primary.
    pub fn primary(
        email: Option<String>,
        phone_number: Option<String>,
        created_at: i64,
    ) -> Self {
        Self {
            email,
            phone_number,
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
            created_at,
        }
    }

    /// Builds a secondary attached to `primary_id`.
    pub fn secondary(
        email: Option<String>,
        phone_number: Option<String>,
        primary_id: ContactId,
        created_at: i64,
    ) -> Self {
        Self {
            email,
            phone_number,
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary_id),
            created_at,
        }
    }

    pub fn validate(&self) -> Result<(), ContactValidationError> {
        validate_shape(
            None,
            self.email.as_deref(),
            self.phone_number.as_deref(),
            self.link_precedence,
            self.linked_id,
        )
    }
}

/// Linkage rewrite applied by the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactLinkUpdate {
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    pub updated_at: i64,
}

impl ContactLinkUpdate {
    /// Demotes a contact to a secondary of `primary_id`.
    pub fn demote_to(primary_id: ContactId, updated_at: i64) -> Self {
        Self {
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary_id),
            updated_at,
        }
    }
}

fn validate_shape(
    id: Option<ContactId>,
    email: Option<&str>,
    phone_number: Option<&str>,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<(), ContactValidationError> {
    if email.is_none() && phone_number.is_none() {
        return Err(ContactValidationError::MissingIdentifiers);
    }

    match (link_precedence, linked_id) {
        (LinkPrecedence::Primary, Some(linked_id)) => {
            Err(ContactValidationError::PrimaryWithLink { linked_id })
        }
        (LinkPrecedence::Primary, None) => Ok(()),
        (LinkPrecedence::Secondary, None) => Err(ContactValidationError::SecondaryWithoutLink),
        (LinkPrecedence::Secondary, Some(linked_id)) if id == Some(linked_id) => {
            Err(ContactValidationError::SelfLink(linked_id))
        }
        (LinkPrecedence::Secondary, Some(_)) => Ok(()),
    }
}
