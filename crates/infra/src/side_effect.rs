//! Best-effort side-channel writes.
//!
//! The audit mirror must never block or fail the primary broker path. Calls
//! to it go through [`fire_and_log`], whose [`SideEffect`] result is carried
//! next to the primary result so callers and tests can see both.

use std::fmt::Display;
use std::future::Future;

use serde::Serialize;
use tracing::warn;

/// Outcome of a best-effort write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum SideEffect<T> {
    Applied(T),
    /// The write failed; the error was logged.
    Failed(String),
    /// Nothing was attempted (e.g. no record to update).
    Skipped,
}

impl<T> SideEffect<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, SideEffect::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            SideEffect::Applied(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_applied(&self) -> Option<&T> {
        match self {
            SideEffect::Applied(value) => Some(value),
            _ => None,
        }
    }
}

/// Await `effect`; log and swallow its error.
pub async fn fire_and_log<T, E, F>(label: &str, effect: F) -> SideEffect<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match effect.await {
        Ok(value) => SideEffect::Applied(value),
        Err(e) => {
            warn!(side_effect = %label, error = %e, "best-effort write failed");
            SideEffect::Failed(e.to_string())
        }
    }
}
