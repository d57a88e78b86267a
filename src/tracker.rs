//! Clock-in/clock-out tracking.
//!
//! A user is either idle (no open entry) or running (exactly one open entry).
//! Totals are never stored: they are summed from the entries at query time,
//! with an open entry counted up to "now".

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use thiserror::Error;

use crate::clock::Clock;
use crate::db::{self, TimeEntry};

pub const DEFAULT_HISTORY_DAYS: i64 = 30;
pub const MAX_HISTORY_DAYS: i64 = 366;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Already running")]
    AlreadyRunning,

    #[error("No running entry")]
    NotRunning,

    #[error("days must be a positive integer")]
    InvalidWindow,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stopped {
    pub entry_id: i64,
    pub seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Today {
    pub total_seconds: i64,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayTotal {
    pub day: NaiveDate,
    pub total_seconds: i64,
}

#[derive(Clone)]
pub struct TimeTracker {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl TimeTracker {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        TimeTracker {
            pool,
            clock,
            offset,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    fn today_date(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.offset).date_naive()
    }

    #[tracing::instrument(skip(self))]
    pub async fn start(&self, user_id: i64) -> Result<i64, TrackerError> {
        let id = db::write_open_entry(&self.pool, user_id, self.now())
            .await?
            .ok_or(TrackerError::AlreadyRunning)?;

        tracing::info!(entry_id = id, "time entry started");
        Ok(id)
    }

    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, user_id: i64) -> Result<Stopped, TrackerError> {
        let open = db::read_open_entry(&self.pool, user_id)
            .await?
            .ok_or(TrackerError::NotRunning)?;

        let end_at = self.now().max(open.start_at);

        // Someone else may have stopped it between the read and the update.
        if !db::close_entry(&self.pool, open.id, end_at).await? {
            return Err(TrackerError::NotRunning);
        }

        let seconds = end_at - open.start_at;
        tracing::info!(entry_id = open.id, seconds, "time entry stopped");

        Ok(Stopped {
            entry_id: open.id,
            seconds,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn today(&self, user_id: i64) -> Result<Today, TrackerError> {
        let today = self.today_date();
        let since = start_of_day(today, self.offset);
        let entries = db::read_entries_since(&self.pool, user_id, since).await?;

        let total_seconds = daily_totals(&entries, self.now(), self.offset)
            .get(&today)
            .copied()
            .unwrap_or(0);
        let running = db::count_open_entries(&self.pool, user_id).await? > 0;

        Ok(Today {
            total_seconds,
            running,
        })
    }

    /// Per-day totals for the trailing `days` days (today included), newest
    /// first. Days without entries are left out.
    #[tracing::instrument(skip(self))]
    pub async fn history(&self, user_id: i64, days: Option<i64>) -> Result<Vec<DayTotal>, TrackerError> {
        let days = history_window(days)?;
        let first_day = self.today_date() - Duration::days(days - 1);
        let since = start_of_day(first_day, self.offset);

        let entries = db::read_entries_since(&self.pool, user_id, since).await?;
        let totals = daily_totals(&entries, self.now(), self.offset);

        Ok(totals
            .into_iter()
            .rev()
            .map(|(day, total_seconds)| DayTotal { day, total_seconds })
            .collect())
    }
}

/// Defaults to 30 days, rejects anything below one and caps the rest.
pub fn history_window(days: Option<i64>) -> Result<i64, TrackerError> {
    match days {
        None => Ok(DEFAULT_HISTORY_DAYS),
        Some(d) if d < 1 => Err(TrackerError::InvalidWindow),
        Some(d) => Ok(d.min(MAX_HISTORY_DAYS)),
    }
}

/// Unix timestamp of local midnight for `day`.
pub fn start_of_day(day: NaiveDate, offset: FixedOffset) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc().timestamp())
        .unwrap_or_default()
        - i64::from(offset.local_minus_utc())
}

pub fn day_of(ts: i64, offset: FixedOffset) -> Option<NaiveDate> {
    DateTime::from_timestamp(ts, 0).map(|dt| dt.with_timezone(&offset).date_naive())
}

/// Elapsed seconds for an entry; open entries run until `now`.
pub fn entry_seconds(entry: &TimeEntry, now: i64) -> i64 {
    (entry.end_at.unwrap_or(now) - entry.start_at).max(0)
}

/// Sums entry durations per local day of their start.
pub fn daily_totals(entries: &[TimeEntry], now: i64, offset: FixedOffset) -> BTreeMap<NaiveDate, i64> {
    let mut totals = BTreeMap::new();
    for entry in entries {
        if let Some(day) = day_of(entry.start_at, offset) {
            *totals.entry(day).or_insert(0) += entry_seconds(entry, now);
        }
    }
    totals
}
