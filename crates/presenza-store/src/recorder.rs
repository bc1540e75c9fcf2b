//! Transactional attendance recorder.
//!
//! Per (identity, day) state machine: `NoRecord -> CheckedIn -> CheckedOut`,
//! terminal for the day. Read-decide-write runs in a single IMMEDIATE
//! transaction so near-simultaneous matches for one identity serialize and at
//! most one transition wins; the loser observes the updated state and
//! suppresses. Suppression state is always derived from storage, never
//! cached, so a failed write is safe to retry on the next match.

use crate::store::{Store, StoreError, DAY_FORMAT, TIMESTAMP_FORMAT};
use chrono::{DateTime, Local};
use presenza_core::IdentityId;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::time::Duration;

/// Why a recognized match produced no stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// Within the cooldown window of the identity's last event today.
    Cooldown,
    /// The identity already checked out today; the day is complete.
    DayComplete,
}

/// Outcome of feeding one accepted match to the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CheckedIn,
    CheckedOut,
    /// Explicitly reported so callers can decide whether to surface it;
    /// nothing was written.
    Suppressed(SuppressReason),
}

/// Decides and records check-in/check-out transitions.
pub struct AttendanceRecorder {
    store: std::sync::Arc<Store>,
    cooldown: Duration,
}

impl AttendanceRecorder {
    pub fn new(store: std::sync::Arc<Store>, cooldown: Duration) -> Self {
        Self { store, cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Record an accepted match for `id` observed at `at`.
    ///
    /// `at` is explicit rather than sampled internally so tests control the
    /// clock. A storage failure means "no event recorded"; the caller may
    /// retry on the identity's next match.
    pub fn record_match(
        &self,
        id: IdentityId,
        at: DateTime<Local>,
        distance: f32,
    ) -> Result<Transition, StoreError> {
        let day = at.format(DAY_FORMAT).to_string();
        let timestamp = at.format(TIMESTAMP_FORMAT).to_string();

        let mut conn = self.store.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last: Option<(String, String)> = tx
            .query_row(
                "SELECT kind, at FROM attendance_events
                 WHERE identity_id = ?1 AND day = ?2
                 ORDER BY id DESC LIMIT 1",
                params![id.to_string(), day],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let transition = match last {
            None => {
                tx.execute(
                    "INSERT INTO attendance_events (identity_id, kind, day, at, distance)
                     VALUES (?1, 'check_in', ?2, ?3, ?4)",
                    params![id.to_string(), day, timestamp, distance as f64],
                )?;
                Transition::CheckedIn
            }
            Some((kind, last_at)) if kind == "check_in" => {
                let checked_in = crate::store::parse_timestamp(&last_at)?;
                let elapsed = at.signed_duration_since(checked_in);
                // Strictly-later timestamp required: a check-out may never
                // share its check-in's timestamp.
                let past_cooldown = elapsed
                    .to_std()
                    .map(|e| e >= self.cooldown && !e.is_zero())
                    .unwrap_or(false);
                if past_cooldown {
                    tx.execute(
                        "INSERT INTO attendance_events (identity_id, kind, day, at, distance)
                         VALUES (?1, 'check_out', ?2, ?3, ?4)",
                        params![id.to_string(), day, timestamp, distance as f64],
                    )?;
                    Transition::CheckedOut
                } else {
                    Transition::Suppressed(SuppressReason::Cooldown)
                }
            }
            Some(_) => Transition::Suppressed(SuppressReason::DayComplete),
        };

        tx.commit()?;

        match transition {
            Transition::CheckedIn | Transition::CheckedOut => {
                tracing::info!(identity = %id, ?transition, at = %timestamp, "attendance recorded")
            }
            Transition::Suppressed(reason) => {
                tracing::debug!(identity = %id, ?reason, "match suppressed")
            }
        }
        Ok(transition)
    }
}
