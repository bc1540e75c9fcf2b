//! presenza-store — SQLite persistence for identities and attendance events.
//!
//! The event table is append-only; the per-(identity, day) check-in/check-out
//! invariant is enforced both by the recorder's transaction and by a UNIQUE
//! index, so no interleaving of writers can produce a duplicate transition.

pub mod recorder;
pub mod store;

pub use recorder::{AttendanceRecorder, SuppressReason, Transition};
pub use store::{AttendanceEvent, DayRecord, EventKind, Store, StoreError};
