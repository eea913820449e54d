// 🎟️ Quota Governor - daily validation cap, persisted per call
//
// The counter lives in the `quota` table (one row). Every successful
// consumption is committed before `try_consume` returns true, so a crash
// right after a call can never hand that unit out again.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::temporal::day_stamp;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Calls made on `date` against `cap`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub date: NaiveDate,
    pub count: u32,
    pub cap: u32,
}

impl QuotaState {
    /// Remaining units if this state is for `today`; a new day starts full
    pub fn remaining_on(&self, today: NaiveDate) -> u32 {
        if self.date == today {
            self.cap.saturating_sub(self.count)
        } else {
            self.cap
        }
    }
}

pub struct QuotaGovernor {
    state: QuotaState,
    offset: FixedOffset,
    interval: Duration,
}

impl QuotaGovernor {
    /// Read the persisted counter (or start at zero) and adopt the configured cap
    pub fn load(
        conn: &Connection,
        cap: u32,
        interval: Duration,
        offset: FixedOffset,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let today = day_stamp(now, offset);

        let stored = read_state(conn)?;
        let state = match stored {
            Some(s) if s.date == today => QuotaState { cap, ..s },
            _ => QuotaState {
                date: today,
                count: 0,
                cap,
            },
        };

        let governor = QuotaGovernor {
            state,
            offset,
            interval,
        };
        governor.persist(conn)?;

        info!(
            date = %state.date,
            used = state.count,
            cap,
            remaining = state.remaining_on(today),
            "quota loaded"
        );

        Ok(governor)
    }

    pub fn state(&self) -> QuotaState {
        self.state
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> u32 {
        self.state.remaining_on(day_stamp(now, self.offset))
    }

    /// Minimum spacing between consecutive calls
    pub fn wait_interval(&self) -> Duration {
        self.interval
    }

    /// Take one unit if any remain today
    ///
    /// Day rollover is detected here, once per call. Rollover and increment
    /// run in one SQLite transaction; `false` leaves everything untouched.
    pub fn try_consume(&mut self, conn: &Connection, now: DateTime<Utc>) -> Result<bool> {
        let today = day_stamp(now, self.offset);
        let today_str = today.format(DATE_FORMAT).to_string();

        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO quota (id, date, count, cap) VALUES (1, ?1, 0, ?2)
             ON CONFLICT(id) DO UPDATE SET
                date = excluded.date,
                count = CASE WHEN quota.date = excluded.date THEN quota.count ELSE 0 END,
                cap = excluded.cap",
            params![today_str, self.state.cap],
        )?;

        let consumed = tx.execute(
            "UPDATE quota SET count = count + 1 WHERE id = 1 AND count < cap",
            [],
        )?;

        if consumed == 0 {
            // Nothing to record; rollback keeps the row as it was
            drop(tx);
            debug!(date = %today, cap = self.state.cap, "quota exhausted");
            return Ok(false);
        }

        let count: u32 = tx.query_row("SELECT count FROM quota WHERE id = 1", [], |row| {
            row.get(0)
        })?;
        tx.commit().context("Failed to persist quota consumption")?;

        self.state = QuotaState {
            date: today,
            count,
            cap: self.state.cap,
        };

        Ok(true)
    }

    /// Write the in-memory state back (idempotent flush point)
    pub fn persist(&self, conn: &Connection) -> Result<()> {
        write_state(conn, &self.state)
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

pub fn read_state(conn: &Connection) -> Result<Option<QuotaState>> {
    let row: Option<(String, u32, u32)> = conn
        .query_row(
            "SELECT date, count, cap FROM quota WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((date, count, cap)) = row else {
        return Ok(None);
    };

    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .with_context(|| format!("Corrupt quota date {:?}", date))?;

    Ok(Some(QuotaState { date, count, cap }))
}

fn write_state(conn: &Connection, state: &QuotaState) -> Result<()> {
    conn.execute(
        "INSERT INTO quota (id, date, count, cap) VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            date = excluded.date,
            count = MAX(excluded.count, CASE WHEN quota.date = excluded.date THEN quota.count ELSE 0 END),
            cap = excluded.cap",
        params![state.date.format(DATE_FORMAT).to_string(), state.count, state.cap],
    )
    .context("Failed to persist quota state")?;

    Ok(())
}
