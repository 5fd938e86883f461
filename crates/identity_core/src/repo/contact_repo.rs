//! Contact repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide the store operations the reconciler depends on.
//! - Keep SQL details inside the core persistence boundary.
//!
//! # Invariants
//! - Every read excludes soft-deleted rows unless explicitly requested.
//! - Write paths validate linkage shape before SQL mutations.
//! - Read paths reject invalid persisted state instead of masking it.
//! - Lock contention is reported as `RepoError::Conflict` so callers can retry.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::contact::{
    Contact, ContactId, ContactLinkUpdate, ContactValidationError, LinkPrecedence, NewContact,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};

const CONTACT_SELECT_SQL: &str = "SELECT
    id,
    email,
    phone_number,
    link_precedence,
    linked_id,
    created_at,
    updated_at,
    deleted_at
FROM contacts";

const REQUIRED_COLUMNS: [&str; 8] = [
    "id",
    "email",
    "phone_number",
    "link_precedence",
    "linked_id",
    "created_at",
    "updated_at",
    "deleted_at",
];

// Keeps `IN (...)` lists well below SQLite's bound-parameter limit.
const MAX_IDS_PER_QUERY: usize = 500;

pub type RepoResult<T> = Result<T, RepoError>;

/// Errors from contact store operations.
#[derive(Debug)]
pub enum RepoError {
    /// Write rejected before reaching SQLite.
    Validation(ContactValidationError),
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Target contact does not exist or is soft-deleted.
    NotFound(ContactId),
    /// Database is locked by a concurrent writer.
    Conflict(rusqlite::Error),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
    /// Required column is missing from expected table.
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    /// Persisted row cannot be converted to a valid contact.
    InvalidData(String),
}

impl RepoError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "contact not found: {id}"),
            Self::Conflict(err) => write!(f, "contact store write conflict: {err}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "contact repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "contact repository requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "contact repository requires column `{column}` in table `{table}`"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted contact data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Conflict(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ContactValidationError> for RepoError {
    fn from(value: ContactValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => err.into(),
            other => Self::Db(other),
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        match value.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Self::Conflict(value),
            _ => Self::Db(DbError::Sqlite(value)),
        }
    }
}

/// Store interface consumed by the reconciler.
pub trait ContactRepository {
    /// Active contacts whose email or phone equals the given values, oldest first.
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepoResult<Vec<Contact>>;
    /// Active contacts with the given ids, ascending id.
    fn find_by_ids(&self, ids: &[ContactId]) -> RepoResult<Vec<Contact>>;
    /// Active contacts whose `linked_id` is one of `ids`, ascending id.
    fn find_by_linked_ids(&self, ids: &[ContactId]) -> RepoResult<Vec<Contact>>;
    /// The primary and its active secondaries, oldest first.
    fn find_component(&self, primary_id: ContactId) -> RepoResult<Vec<Contact>>;
    /// Loads one contact by id.
    fn get_contact(&self, id: ContactId, include_deleted: bool) -> RepoResult<Option<Contact>>;
    /// Inserts a contact and returns the persisted row.
    fn create_contact(&self, contact: &NewContact) -> RepoResult<Contact>;
    /// Rewrites linkage of an active contact and returns the persisted row.
    fn update_link(&self, id: ContactId, update: &ContactLinkUpdate) -> RepoResult<Contact>;
    /// Largest `created_at` ever stored, soft-deleted rows included.
    fn latest_created_at(&self) -> RepoResult<Option<i64>>;
}

/// SQLite-backed contact repository.
///
/// Borrowing a `Transaction` works too: all statements then run inside it.
pub struct SqliteContactRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteContactRepository<'conn> {
    /// Creates repository from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_contact_connection_ready(conn)?;
        Ok(Self { conn })
    }
}

impl ContactRepository for SqliteContactRepository<'_> {
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepoResult<Vec<Contact>> {
        if email.is_none() && phone_number.is_none() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "{CONTACT_SELECT_SQL}
             WHERE deleted_at IS NULL
               AND (email = ?1 OR phone_number = ?2)
             ORDER BY created_at ASC, id ASC;"
        ))?;
        let mut rows = stmt.query(params![email, phone_number])?;
        collect_contacts(&mut rows)
    }

    fn find_by_ids(&self, ids: &[ContactId]) -> RepoResult<Vec<Contact>> {
        select_where_in(self.conn, "id", ids)
    }

    fn find_by_linked_ids(&self, ids: &[ContactId]) -> RepoResult<Vec<Contact>> {
        select_where_in(self.conn, "linked_id", ids)
    }

    fn find_component(&self, primary_id: ContactId) -> RepoResult<Vec<Contact>> {
        let mut stmt = self.conn.prepare(&format!(
            "{CONTACT_SELECT_SQL}
             WHERE deleted_at IS NULL
               AND (id = ?1 OR linked_id = ?1)
             ORDER BY created_at ASC, id ASC;"
        ))?;
        let mut rows = stmt.query([primary_id])?;
        collect_contacts(&mut rows)
    }

    fn get_contact(&self, id: ContactId, include_deleted: bool) -> RepoResult<Option<Contact>> {
        let contact = self
            .conn
            .query_row(
                &format!(
                    "{CONTACT_SELECT_SQL}
                     WHERE id = ?1
                       AND (?2 = 1 OR deleted_at IS NULL);"
                ),
                params![id, include_deleted],
                |row| Ok(parse_contact_row(row)),
            )
            .optional()?;
        contact.transpose()
    }

    fn create_contact(&self, contact: &NewContact) -> RepoResult<Contact> {
        contact.validate()?;

        self.conn.execute(
            "INSERT INTO contacts (
                email,
                phone_number,
                link_precedence,
                linked_id,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5);",
            params![
                contact.email.as_deref(),
                contact.phone_number.as_deref(),
                contact.link_precedence.as_str(),
                contact.linked_id,
                contact.created_at,
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        load_required_contact(self.conn, id)
    }

    fn latest_created_at(&self) -> RepoResult<Option<i64>> {
        let latest = self
            .conn
            .query_row("SELECT MAX(created_at) FROM contacts;", [], |row| {
                row.get::<_, Option<i64>>(0)
            })?;
        Ok(latest)
    }

    fn update_link(&self, id: ContactId, update: &ContactLinkUpdate) -> RepoResult<Contact> {
        if update.link_precedence == LinkPrecedence::Secondary && update.linked_id == Some(id) {
            return Err(ContactValidationError::SelfLink(id).into());
        }

        let changed = self.conn.execute(
            "UPDATE contacts
             SET
                link_precedence = ?2,
                linked_id = ?3,
                updated_at = ?4
             WHERE id = ?1
               AND deleted_at IS NULL;",
            params![
                id,
                update.link_precedence.as_str(),
                update.linked_id,
                update.updated_at,
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }

        load_required_contact(self.conn, id)
    }
}

fn select_where_in(
    conn: &Connection,
    column: &'static str,
    ids: &[ContactId],
) -> RepoResult<Vec<Contact>> {
    let mut contacts = Vec::new();
    for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "{CONTACT_SELECT_SQL}
             WHERE deleted_at IS NULL
               AND {column} IN ({placeholders})
             ORDER BY id ASC;"
        ))?;
        let bind_values = chunk.iter().map(|id| Value::Integer(*id));
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        contacts.extend(collect_contacts(&mut rows)?);
    }
    if ids.len() > MAX_IDS_PER_QUERY {
        contacts.sort_by_key(|contact| contact.id);
    }
    Ok(contacts)
}

fn collect_contacts(rows: &mut rusqlite::Rows<'_>) -> RepoResult<Vec<Contact>> {
    let mut contacts = Vec::new();
    while let Some(row) = rows.next()? {
        contacts.push(parse_contact_row(row)?);
    }
    Ok(contacts)
}

fn load_required_contact(conn: &Connection, id: ContactId) -> RepoResult<Contact> {
    let mut stmt = conn.prepare(&format!(
        "{CONTACT_SELECT_SQL}
         WHERE id = ?1
           AND deleted_at IS NULL;"
    ))?;
    let mut rows = stmt.query([id])?;
    if let Some(row) = rows.next()? {
        return parse_contact_row(row);
    }
    Err(RepoError::NotFound(id))
}

fn parse_contact_row(row: &Row<'_>) -> RepoResult<Contact> {
    let precedence_text: String = row.get("link_precedence")?;
    let link_precedence = LinkPrecedence::parse(&precedence_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid link precedence `{precedence_text}` in contacts.link_precedence"
        ))
    })?;

    let contact = Contact {
        id: row.get("id")?,
        email: row.get("email")?,
        phone_number: row.get("phone_number")?,
        link_precedence,
        linked_id: row.get("linked_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
    };
    contact
        .validate()
        .map_err(|err| RepoError::InvalidData(format!("contact {}: {err}", contact.id)))?;
    Ok(contact)
}

fn ensure_contact_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    if !table_exists(conn, "contacts")? {
        return Err(RepoError::MissingRequiredTable("contacts"));
    }

    for column in REQUIRED_COLUMNS {
        if !table_has_column(conn, "contacts", column)? {
            return Err(RepoError::MissingRequiredColumn {
                table: "contacts",
                column,
            });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
