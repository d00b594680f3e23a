//! Bounded retry for store transactions
//!
//! Store mutations run as single transactions that can fail under
//! contention. Each mutation entry point wraps its transaction in
//! [`with_retry`]: transient failures are retried with a fresh transaction
//! up to [`MAX_ATTEMPTS`] times, anything else surfaces immediately.

use crate::error::{LumiflowError, Result};
use tracing::warn;

/// Attempts granted to a store mutation before its error surfaces.
pub const MAX_ATTEMPTS: u32 = 10;

/// Whether an error is worth retrying.
///
/// Only lock contention qualifies: the writer lost a race for the database
/// and a fresh transaction can win it. Everything else (constraint
/// violations, corrupt rows, I/O) is fatal.
pub fn is_transient(err: &LumiflowError) -> bool {
    match err {
        LumiflowError::Database(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Run `op` until it succeeds, retrying transient errors.
///
/// `op` must start a fresh transaction per call; a failed attempt leaves no
/// partial state behind.
pub fn with_retry<T, F>(mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if attempt >= MAX_ATTEMPTS {
                    return match err {
                        LumiflowError::Database(source) => Err(LumiflowError::RetriesExhausted {
                            attempts: attempt,
                            source,
                        }),
                        other => Err(other),
                    };
                }
                warn!(attempt, error = %err, "transient store error, retrying");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
