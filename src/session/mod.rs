//! Producer and consumer sessions: one broker connection each, with the
//! lifecycle and delivery rules the client exposes.

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumerSession, ConsumerState};
pub use producer::{OutboundMessage, ProducerSession, ProducerState};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Session state is only touched for non-blocking transitions, so a poisoned
/// lock still holds a consistent value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
