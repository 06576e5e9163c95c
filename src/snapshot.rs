//! Lock/snapshot gate per period: `Unlocked -> Locked`, no way back.

use crate::config::ResultsDefaults;
use crate::error::{Result, ResultsError};
use crate::period::Period;
use crate::results::{self, LockOutcome, ResultPeriodMeta, ResultRow};
use chrono::NaiveDate;
use rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodState {
    Unlocked,
    /// `snapshot_at` is absent only on rows written before the schema
    /// required it; such periods are still locked.
    Locked { snapshot_at: Option<String> },
}

impl PeriodState {
    pub fn of(meta: &ResultPeriodMeta) -> Self {
        if meta.locked {
            PeriodState::Locked {
                snapshot_at: meta.snapshot_at.clone(),
            }
        } else {
            PeriodState::Unlocked
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, PeriodState::Locked { .. })
    }
}

/// Refuses mutations once the period is locked. Reads never go through here.
pub fn ensure_editable(meta: &ResultPeriodMeta) -> Result<()> {
    if PeriodState::of(meta).is_locked() {
        return Err(ResultsError::Locked {
            period: meta.period(),
        });
    }
    Ok(())
}

/// Presentation flag: the period precedes the calendar month of `today`.
/// A past period stays editable until it is explicitly locked.
pub fn is_past(period: Period, today: NaiveDate) -> bool {
    period < Period::containing(today)
}

/// Takes the snapshot for `period`, freezing its rows.
pub fn take_snapshot(
    conn: &mut Connection,
    defaults: &ResultsDefaults,
    period: Period,
) -> Result<LockOutcome> {
    results::lock_period(conn, defaults, period)
}

/// True when `rows` still hash to the digest recorded at lock time.
pub fn digest_matches(meta: &ResultPeriodMeta, rows: &[ResultRow]) -> Result<bool> {
    match &meta.snapshot_digest {
        Some(expected) => Ok(*expected == results::rows_digest(rows)?),
        None => Ok(false),
    }
}
