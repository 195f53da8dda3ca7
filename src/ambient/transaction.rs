//! The ambient transaction shared by the scopes that created or joined it.

use crate::ambient::registry::SharedConnection;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionState, IsolationLevel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Default)]
struct TransactionState {
    aborted: Option<String>,
    finalized: bool,
    enlisted: Vec<Arc<SharedConnection>>,
}

/// A transaction spanning every connection enlisted while it was ambient.
///
/// There is no two-phase commit: finalization commits the enlisted connections
/// one after another in enlistment order.
pub struct AmbientTransaction {
    id: Uuid,
    isolation: IsolationLevel,
    timeout: Option<Duration>,
    started: Instant,
    state: Mutex<TransactionState>,
}

impl AmbientTransaction {
    pub(crate) fn new(isolation: IsolationLevel, timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            isolation,
            timeout: timeout.filter(|t| !t.is_zero()),
            started: Instant::now(),
            state: Mutex::new(TransactionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_expired(&self) -> bool {
        self.timeout
            .is_some_and(|timeout| self.started.elapsed() >= timeout)
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted.is_some()
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    /// Number of connections currently enlisted.
    pub fn enlisted_count(&self) -> usize {
        self.lock().enlisted.len()
    }

    /// Mark the transaction as doomed. The first reason wins.
    pub(crate) fn abort(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        if state.aborted.is_none() && !state.finalized {
            let reason = reason.into();
            warn!(transaction_id = %self.id, reason = %reason, "Ambient transaction aborted");
            state.aborted = Some(reason);
        }
    }

    fn timeout_reason(&self) -> String {
        format!("timed out after {:?}", self.timeout.unwrap_or_default())
    }

    /// Fails when the transaction can no longer do work.
    ///
    /// An elapsed timeout aborts the transaction on the spot.
    pub(crate) fn ensure_active(&self) -> DbResult<()> {
        let mut state = self.lock();
        if state.finalized {
            return Err(DbError::transaction(format!(
                "Ambient transaction {} has already completed",
                self.id
            )));
        }
        if state.aborted.is_none() && self.is_expired() {
            state.aborted = Some(self.timeout_reason());
        }
        match &state.aborted {
            Some(reason) => Err(DbError::transaction_aborted(self.id.to_string(), reason)),
            None => Ok(()),
        }
    }

    pub(crate) fn enlist(&self, connection: Arc<SharedConnection>) {
        self.lock().enlisted.push(connection);
    }

    /// Commit or roll back every enlisted connection, then close the ones the
    /// registry already released.
    ///
    /// Commits only when `complete` is set and the transaction neither aborted
    /// nor timed out. After a failed commit the remaining connections are rolled
    /// back and the commit error is returned. An aborted or timed-out
    /// transaction yields [`DbError::TransactionAborted`] once all connections
    /// are rolled back. So does one whose enlisted session broke; that session
    /// gets no statement, the server discards its work when it closes.
    pub(crate) async fn finalize(&self, complete: bool) -> DbResult<()> {
        let (enlisted, abort_reason) = {
            let mut state = self.lock();
            if state.finalized {
                return Err(DbError::transaction(format!(
                    "Ambient transaction {} has already completed",
                    self.id
                )));
            }
            state.finalized = true;
            if state.aborted.is_none() && self.is_expired() {
                state.aborted = Some(self.timeout_reason());
            }
            (std::mem::take(&mut state.enlisted), state.aborted.clone())
        };

        let mut abort_reason = abort_reason;
        if abort_reason.is_none() {
            for shared in &enlisted {
                let slot = shared.lock().await;
                if slot.enlisted == Some(self.id)
                    && slot.connection.state() == ConnectionState::Broken
                {
                    let reason = format!("connection '{}' broke during the transaction", shared.key());
                    warn!(transaction_id = %self.id, reason = %reason, "Ambient transaction aborted");
                    abort_reason = Some(reason);
                    break;
                }
            }
        }

        let mut commit = complete && abort_reason.is_none();
        let mut first_error = None;
        for shared in enlisted {
            let mut slot = shared.lock().await;
            if slot.enlisted == Some(self.id) {
                let broken = slot.connection.state() == ConnectionState::Broken;
                let result = if broken {
                    Ok(())
                } else if commit {
                    slot.connection.commit().await
                } else {
                    slot.connection.rollback().await
                };
                slot.unenlist();
                if let Err(e) = result {
                    warn!(
                        transaction_id = %self.id,
                        connection_key = %shared.key(),
                        error = %e,
                        "Failed to finalize enlisted connection"
                    );
                    commit = false;
                    first_error.get_or_insert(e);
                }
            }
            if shared.is_retired() {
                if let Err(e) = slot.connection.close().await {
                    warn!(connection_key = %shared.key(), error = %e, "Failed to close connection");
                }
            }
        }

        let outcome = if commit { "committed" } else { "rolled back" };
        info!(transaction_id = %self.id, outcome, "Ambient transaction finalized");

        if let Some(e) = first_error {
            return Err(e);
        }
        match abort_reason {
            Some(reason) => Err(DbError::transaction_aborted(self.id.to_string(), reason)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for AmbientTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientTransaction")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
