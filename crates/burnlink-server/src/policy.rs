//! Expiry rules as pure functions of a record and the current time.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::store::SecretRecord;

/// Why a secret stopped being available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryReason {
    Time,
    Views,
}

/// Decision for a consume attempt at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Serve the payload; when `final_view` is set the record is destroyed
    /// right after this view.
    Serve { final_view: bool },
    Expire(ExpiryReason),
}

/// Current unix time in milliseconds, the clock every rule is evaluated
/// against. Stored timestamps use the same unit.
pub fn unix_now_ms() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

pub fn is_live(record: &SecretRecord, now: i64) -> bool {
    expiry_reason(record, now).is_none()
}

/// True when serving one more view reaches `max_views` exactly.
pub fn would_be_final_view(record: &SecretRecord) -> bool {
    match record.max_views {
        Some(max) => record.view_count.saturating_add(1) >= max,
        None => false,
    }
}

pub fn evaluate(record: &SecretRecord, now: i64) -> Verdict {
    match expiry_reason(record, now) {
        Some(reason) => Verdict::Expire(reason),
        None => Verdict::Serve {
            final_view: would_be_final_view(record),
        },
    }
}

fn expiry_reason(record: &SecretRecord, now: i64) -> Option<ExpiryReason> {
    if let Some(exp) = record.expires_at {
        if now >= exp {
            return Some(ExpiryReason::Time);
        }
    }
    if let Some(max) = record.max_views {
        if record.view_count >= max {
            return Some(ExpiryReason::Views);
        }
    }
    None
}
