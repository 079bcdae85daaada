//! # Session Registry
//!
//! In-memory records of running and recently finished signing sessions.
//!
//! Sessions move `CREATED → PENDING → IN_PROGRESS → DONE | CANCELLED |
//! TIMEOUT`. A session that does not reach a terminal state within the
//! configured timeout is timed out; terminal records are kept for the
//! retention period and then garbage-collected. All transitions for one
//! session are serialized through compare-and-swap updates so long-running
//! external calls never happen while holding the lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::abc::{AbcSessionStatus, SignatureSessionResult};
use crate::core::PartyId;
use crate::error::Error;

/// Lifecycle state of a signing session.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Record created, signing provider not yet contacted.
    Created,

    /// Waiting for the user to pick up the session.
    Pending,

    /// The user's wallet is connected and interacting.
    InProgress,

    /// The contract was signed.
    Done,

    /// The user cancelled.
    Cancelled,

    /// The session expired before completion.
    Timeout,
}

impl SessionStatus {
    /// Whether this state ends the session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Timeout)
    }
}

impl From<AbcSessionStatus> for SessionStatus {
    fn from(status: AbcSessionStatus) -> Self {
        match status {
            AbcSessionStatus::Initialized => Self::Pending,
            AbcSessionStatus::Connected => Self::InProgress,
            AbcSessionStatus::Done => Self::Done,
            AbcSessionStatus::Cancelled => Self::Cancelled,
            AbcSessionStatus::Timeout => Self::Timeout,
        }
    }
}

/// Result data of a completed session.
#[derive(Clone, Debug)]
pub struct CompletedSession {
    /// The provider's session result, including the signature.
    pub provider_result: SignatureSessionResult,

    /// The identity JWT minted from the signed contract, when signing
    /// succeeded.
    pub auth_token: Option<String>,
}

/// One signing session record.
#[derive(Clone, Debug)]
pub struct Session {
    /// Session identifier, also the provider's session token.
    pub id: String,

    /// The contract text being signed.
    pub contract_text: String,

    /// The legal entity the contract is drawn up for.
    pub legal_entity: PartyId,

    /// Current lifecycle state.
    pub status: SessionStatus,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,

    /// Result data, present once the session completed.
    pub result: Option<CompletedSession>,
}

/// The in-memory session registry.
///
/// A single map behind a reader/writer lock. Records are swept
/// opportunistically on access.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    timeout: TimeDelta,
    retention: TimeDelta,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        let five_minutes = TimeDelta::try_minutes(5).unwrap_or_default();
        Self::new(five_minutes, five_minutes)
    }
}

impl SessionRegistry {
    /// Create a registry with the given session timeout and terminal-record
    /// retention.
    #[must_use]
    pub fn new(timeout: TimeDelta, retention: TimeDelta) -> Self {
        Self { sessions: Arc::new(RwLock::new(HashMap::new())), timeout, retention }
    }

    /// Insert a new session record.
    pub fn insert(&self, session: Session) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions.insert(session.id.clone(), session);
    }

    /// A snapshot of the session with the given id.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for unknown or garbage-collected
    /// ids.
    pub fn get(&self, id: &str, now: DateTime<Utc>) -> Result<Session, Error> {
        self.sweep(now);
        let sessions = self.sessions.read().expect("session lock poisoned");
        sessions.get(id).cloned().ok_or(Error::SessionNotFound)
    }

    /// Apply an update to a session, guarded by the `updated_at` the caller
    /// observed. When another writer got there first, or the session already
    /// reached a terminal state, the stored record wins and is returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for unknown ids.
    pub fn update_if(
        &self, id: &str, seen: DateTime<Utc>, now: DateTime<Utc>,
        apply: impl FnOnce(&mut Session),
    ) -> Result<Session, Error> {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let session = sessions.get_mut(id).ok_or(Error::SessionNotFound)?;

        if session.status.is_terminal() || session.updated_at != seen {
            return Ok(session.clone());
        }

        apply(session);
        session.updated_at = now;
        Ok(session.clone())
    }

    /// Time out overdue sessions and drop terminal records past retention.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");

        for session in sessions.values_mut() {
            if !session.status.is_terminal() && now - session.created_at > self.timeout {
                session.status = SessionStatus::Timeout;
                session.updated_at = now;
            }
        }

        sessions
            .retain(|_, s| !(s.status.is_terminal() && now - s.updated_at > self.retention));
    }

    /// Number of live records, for diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().expect("session lock poisoned").len()
    }

    /// Whether the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
