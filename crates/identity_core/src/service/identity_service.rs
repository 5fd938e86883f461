//! Identity use-case service.
//!
//! # Responsibility
//! - Validate incoming identifier pairs before any store access.
//! - Run one reconciliation inside an exclusive SQLite transaction.
//! - Retry the whole reconciliation on write conflicts, up to a bound.
//! - Abort without partial writes when the request deadline expires.
//!
//! # Invariants
//! - The write lock is taken before the initial match query and held until
//!   every merge update and new secondary commits.
//! - A failed or timed-out attempt leaves no visible writes (rollback on drop).
//! - Store-level error detail never crosses `IdentifyError::is_client_error`.

use crate::model::identify::{IdentifyRequest, IdentifyResponse, ValidationError};
use crate::repo::contact_repo::{ContactRepository, RepoError, SqliteContactRepository};
use crate::service::reconcile::{reconcile, ReconcileOutcome};
use log::{error, info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default number of reconciliation attempts per request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry and deadline policy for one `identify` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyOptions {
    /// Total attempts including the first; values below 1 behave as 1.
    pub max_attempts: u32,
    /// `None` disables the deadline.
    pub timeout: Option<Duration>,
}

impl Default for IdentifyOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

/// Errors surfaced by [`IdentityService::identify`].
#[derive(Debug)]
pub enum IdentifyError {
    /// Request carries no usable identifier.
    Validation(ValidationError),
    /// Every attempt hit a write conflict.
    ConflictRetriesExhausted { attempts: u32 },
    /// Deadline expired; the transaction was rolled back.
    Timeout { elapsed_ms: u128 },
    /// Non-retryable persistence failure.
    Store(RepoError),
}

impl IdentifyError {
    /// Whether the caller, not the server, is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ConflictRetriesExhausted { .. } => "conflict_retries_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::Store(_) => "store",
        }
    }
}

impl Display for IdentifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::ConflictRetriesExhausted { attempts } => {
                write!(f, "reconciliation conflicted on all {attempts} attempts")
            }
            Self::Timeout { elapsed_ms } => {
                write!(f, "reconciliation timed out after {elapsed_ms} ms")
            }
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for IdentifyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::ConflictRetriesExhausted { .. } | Self::Timeout { .. } => None,
        }
    }
}

impl From<ValidationError> for IdentifyError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<RepoError> for IdentifyError {
    fn from(value: RepoError) -> Self {
        Self::Store(value)
    }
}

impl From<rusqlite::Error> for IdentifyError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(value.into())
    }
}

/// Transactional reconciliation facade over one SQLite connection.
pub struct IdentityService<'conn> {
    conn: &'conn Connection,
    options: IdentifyOptions,
}

impl<'conn> IdentityService<'conn> {
    /// Creates service with default retry and deadline policy.
    pub fn new(conn: &'conn Connection) -> Self {
        Self::with_options(conn, IdentifyOptions::default())
    }

    pub fn with_options(conn: &'conn Connection, options: IdentifyOptions) -> Self {
        Self { conn, options }
    }

    /// Reconciles one identifier pair and returns the consolidated view.
    ///
    /// # Errors
    /// - `Validation` when both identifiers are absent or blank; the store is
    ///   not touched.
    /// - `ConflictRetriesExhausted` when every attempt hit a locked database.
    /// - `Timeout` when the deadline passes before commit.
    /// - `Store` for any other persistence failure.
    pub fn identify(&self, request: &IdentifyRequest) -> Result<IdentifyResponse, IdentifyError> {
        let request = match request.normalized() {
            Ok(request) => request,
            Err(err) => {
                warn!("event=identify module=service status=rejected error_code=validation");
                return Err(err.into());
            }
        };

        let started_at = Instant::now();
        let deadline = self.options.timeout.map(|timeout| started_at + timeout);
        if deadline.is_none() {
            return self.identify_until(&request, None, started_at);
        }

        // Lock waits are capped by the remaining deadline; the connection's own
        // busy timeout is restored afterwards.
        let configured_busy = self.busy_timeout()?;
        let result = self.identify_until(&request, deadline, started_at);
        self.conn.busy_timeout(configured_busy)?;
        result
    }

    fn identify_until(
        &self,
        request: &IdentifyRequest,
        deadline: Option<Instant>,
        started_at: Instant,
    ) -> Result<IdentifyResponse, IdentifyError> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut wait_capped = false;
            let result = check_deadline(deadline, started_at)
                .and_then(|()| self.cap_busy_timeout(deadline))
                .and_then(|capped| {
                    wait_capped = capped;
                    self.reconcile_once(request, deadline, started_at)
                });

            match result {
                Ok(outcome) => {
                    info!(
                        "event=identify module=service status=ok primary_id={} created={} relinked={} attempts={} duration_ms={}",
                        outcome.view.primary_contact_id,
                        outcome
                            .created
                            .map_or_else(|| "none".to_string(), |id| id.to_string()),
                        outcome.relinked.len(),
                        attempt,
                        started_at.elapsed().as_millis()
                    );
                    return Ok(outcome.view.into());
                }
                Err(IdentifyError::Store(err)) if err.is_conflict() => {
                    // A lock wait cut short by the deadline counts as a timeout.
                    let timed_out = if wait_capped {
                        Err(IdentifyError::Timeout {
                            elapsed_ms: started_at.elapsed().as_millis(),
                        })
                    } else {
                        check_deadline(deadline, started_at)
                    };
                    if let Err(timeout) = timed_out {
                        error!(
                            "event=identify module=service status=error error_code={} attempts={} duration_ms={}",
                            timeout.code(),
                            attempt,
                            started_at.elapsed().as_millis()
                        );
                        return Err(timeout);
                    }
                    if attempt >= max_attempts {
                        error!(
                            "event=identify module=service status=error error_code=conflict_retries_exhausted attempts={} duration_ms={}",
                            attempt,
                            started_at.elapsed().as_millis()
                        );
                        return Err(IdentifyError::ConflictRetriesExhausted { attempts: attempt });
                    }
                    warn!(
                        "event=identify_retry module=service status=retry attempt={} error={}",
                        attempt, err
                    );
                }
                Err(err) => {
                    error!(
                        "event=identify module=service status=error error_code={} attempts={} duration_ms={} error={}",
                        err.code(),
                        attempt,
                        started_at.elapsed().as_millis(),
                        err
                    );
                    return Err(err);
                }
            }
        }
    }

    fn busy_timeout(&self) -> Result<Duration, IdentifyError> {
        let millis: i64 = self
            .conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))?;
        Ok(Duration::from_millis(u64::try_from(millis).unwrap_or_default()))
    }

    /// Shrinks the connection busy timeout to the time left before `deadline`.
    /// Returns whether it was shrunk.
    fn cap_busy_timeout(&self, deadline: Option<Instant>) -> Result<bool, IdentifyError> {
        let Some(deadline) = deadline else {
            return Ok(false);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining < self.busy_timeout()? {
            self.conn.busy_timeout(remaining)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn reconcile_once(
        &self,
        request: &IdentifyRequest,
        deadline: Option<Instant>,
        started_at: Instant,
    ) -> Result<ReconcileOutcome, IdentifyError> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let repo = SqliteContactRepository::try_new(&tx)?;
        // Never stamp a contact older than one already stored, even if the
        // wall clock stepped backwards.
        let now = now_epoch_ms().max(repo.latest_created_at()?.unwrap_or_default());
        let outcome = reconcile(&repo, request, now)?;

        // Dropping `tx` on this path rolls back every write of the attempt.
        check_deadline(deadline, started_at)?;
        tx.commit()?;
        Ok(outcome)
    }
}

fn check_deadline(deadline: Option<Instant>, started_at: Instant) -> Result<(), IdentifyError> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(IdentifyError::Timeout {
            elapsed_ms: started_at.elapsed().as_millis(),
        }),
        _ => Ok(()),
    }
}

/// Current wall-clock time in unix epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
