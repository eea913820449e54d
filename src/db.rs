// 🗄️ Cache Store - validated certificate records in SQLite (WAL)
//
// One row per certificate id. Every write is committed before the call
// returns, so an interrupted run never loses a record it already reported
// as stored.

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::client::ValidatedRecord;
use crate::normalizer::merge_annotation;
use crate::temporal::age_seconds;

/// Cached certificate: validated attributes + discovery metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertRecord {
    /// Canonical certificate number (primary key)
    pub id: String,

    /// Structured attributes from the authority (required + optional)
    pub attributes: ValidatedRecord,

    /// Free text accumulated from every discovery source (only ever grows)
    pub annotation: String,

    /// When the authority last confirmed this record
    pub last_fetched: DateTime<Utc>,

    /// Which authority produced the attributes
    pub source: String,
}

impl CertRecord {
    pub fn new(
        id: &str,
        attributes: ValidatedRecord,
        annotation: &str,
        last_fetched: DateTime<Utc>,
        source: &str,
    ) -> Self {
        CertRecord {
            id: id.to_string(),
            attributes,
            annotation: annotation.trim().to_string(),
            last_fetched,
            source: source.to_string(),
        }
    }
}

/// Audit trail entry - every candidate outcome and every run is an event
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub cert_id: Option<String>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(
        run_id: &str,
        event_type: &str,
        cert_id: Option<&str>,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            timestamp,
            event_type: event_type.to_string(),
            cert_id: cert_id.map(str::to_string),
            data,
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Open (or create) the store at `path` and make sure the schema exists
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
    }

    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {:?}", path))?;
    setup_database(&conn)?;

    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery, FULL sync so a commit is on disk when it returns
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;

    // ==========================================================================
    // Certificates (the cache)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS certificates (
            id TEXT PRIMARY KEY NOT NULL,
            year INTEGER NOT NULL CHECK (year BETWEEN 1000 AND 9999),
            brand TEXT NOT NULL CHECK (length(trim(brand)) > 0),
            subject TEXT NOT NULL CHECK (length(trim(subject)) > 0),
            category TEXT,
            card_number TEXT,
            variety TEXT,
            card_grade TEXT,
            grade_description TEXT,
            total_population INTEGER,
            annotation TEXT NOT NULL DEFAULT '',
            last_fetched TEXT NOT NULL,
            source TEXT NOT NULL,
            http_status INTEGER NOT NULL,
            payload_json TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Quota (single row)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS quota (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            date TEXT NOT NULL,
            count INTEGER NOT NULL CHECK (count >= 0),
            cap INTEGER NOT NULL CHECK (cap >= 0)
        )",
        [],
    )?;

    // ==========================================================================
    // Events (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            run_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            cert_id TEXT,
            data TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_certificates_last_fetched ON certificates(last_fetched)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_cert ON events(cert_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// CERTIFICATES
// ============================================================================

const RECORD_COLUMNS: &str = "id, year, brand, subject, category, card_number, variety,
    card_grade, grade_description, total_population, annotation, last_fetched,
    source, http_status, payload_json";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CertRecord> {
    let last_fetched_str: String = row.get(11)?;
    let last_fetched = DateTime::parse_from_rfc3339(&last_fetched_str)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(CertRecord {
        id: row.get(0)?,
        attributes: ValidatedRecord {
            year: row.get(1)?,
            brand: row.get(2)?,
            subject: row.get(3)?,
            category: row.get(4)?,
            card_number: row.get(5)?,
            variety: row.get(6)?,
            card_grade: row.get(7)?,
            grade_description: row.get(8)?,
            total_population: row.get(9)?,
            http_status: row.get(13)?,
            payload_json: row.get(14)?,
        },
        annotation: row.get(10)?,
        last_fetched,
        source: row.get(12)?,
    })
}

pub fn get_record(conn: &Connection, id: &str) -> Result<Option<CertRecord>> {
    let sql = format!("SELECT {} FROM certificates WHERE id = ?1", RECORD_COLUMNS);

    let record = conn
        .query_row(&sql, [id], record_from_row)
        .optional()
        .with_context(|| format!("Failed to read certificate {}", id))?;

    Ok(record)
}

/// Upsert a validated record
///
/// On an existing row the annotation is merged and every structured field is
/// overwritten with the newer values. Read-merge-write runs in one SQLite
/// transaction; the row is durable when this returns.
pub fn put_record(conn: &Connection, record: &CertRecord) -> Result<CertRecord> {
    ensure!(
        record.attributes.is_complete(),
        "refusing to store incomplete record for {}",
        record.id
    );

    let tx = conn.unchecked_transaction()?;

    let existing_annotation: Option<String> = tx
        .query_row(
            "SELECT annotation FROM certificates WHERE id = ?1",
            [&record.id],
            |row| row.get(0),
        )
        .optional()?;

    let annotation = match existing_annotation {
        Some(existing) => merge_annotation(&existing, &record.annotation),
        None => record.annotation.trim().to_string(),
    };

    let attrs = &record.attributes;
    tx.execute(
        "INSERT INTO certificates (
            id, year, brand, subject, category, card_number, variety,
            card_grade, grade_description, total_population, annotation,
            last_fetched, source, http_status, payload_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT(id) DO UPDATE SET
            year = excluded.year,
            brand = excluded.brand,
            subject = excluded.subject,
            category = excluded.category,
            card_number = excluded.card_number,
            variety = excluded.variety,
            card_grade = excluded.card_grade,
            grade_description = excluded.grade_description,
            total_population = excluded.total_population,
            annotation = excluded.annotation,
            last_fetched = excluded.last_fetched,
            source = excluded.source,
            http_status = excluded.http_status,
            payload_json = excluded.payload_json,
            updated_at = CURRENT_TIMESTAMP",
        params![
            record.id,
            attrs.year,
            attrs.brand,
            attrs.subject,
            attrs.category,
            attrs.card_number,
            attrs.variety,
            attrs.card_grade,
            attrs.grade_description,
            attrs.total_population,
            annotation,
            record.last_fetched.to_rfc3339(),
            record.source,
            attrs.http_status,
            attrs.payload_json,
        ],
    )?;

    tx.commit()
        .with_context(|| format!("Failed to commit certificate {}", record.id))?;

    Ok(CertRecord {
        annotation,
        ..record.clone()
    })
}

/// Merge discovery text into an existing record without touching anything else
///
/// Returns true if the stored annotation changed. Absent record = no-op.
pub fn merge_record_annotation(conn: &Connection, id: &str, annotation: &str) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT annotation FROM certificates WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(existing) = existing else {
        return Ok(false);
    };

    let merged = merge_annotation(&existing, annotation);
    if merged == existing {
        return Ok(false);
    }

    tx.execute(
        "UPDATE certificates SET annotation = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
        params![merged, id],
    )?;
    tx.commit()?;

    Ok(true)
}

/// Staleness check
///
/// - `max_age_seconds == 0` disables the cache (always stale)
/// - absent record is stale
/// - present record is stale iff `now - last_fetched > max_age_seconds`
pub fn is_stale(
    conn: &Connection,
    id: &str,
    max_age_seconds: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    ensure!(
        max_age_seconds >= 0,
        "max_age_seconds must not be negative (got {})",
        max_age_seconds
    );

    if max_age_seconds == 0 {
        return Ok(true);
    }

    let last_fetched: Option<String> = conn
        .query_row(
            "SELECT last_fetched FROM certificates WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(last_fetched) = last_fetched else {
        return Ok(true);
    };

    // An unreadable timestamp can't prove freshness
    let stale = match DateTime::parse_from_rfc3339(&last_fetched) {
        Ok(fetched) => age_seconds(fetched.with_timezone(&Utc), now) > max_age_seconds,
        Err(_) => true,
    };

    Ok(stale)
}

pub fn get_all_records(conn: &Connection) -> Result<Vec<CertRecord>> {
    let sql = format!("SELECT {} FROM certificates ORDER BY id", RECORD_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;

    let records = stmt
        .query_map([], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

pub fn record_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM certificates", [], |row| row.get(0))?;

    Ok(count)
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, run_id, timestamp, event_type, cert_id, data
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.run_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.cert_id,
            data_json,
        ],
    )?;

    Ok(())
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let timestamp_str: String = row.get(2)?;
    let data_json: String = row.get(5)?;

    Ok(Event {
        event_id: row.get(0)?,
        run_id: row.get(1)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
            })?
            .with_timezone(&Utc),
        event_type: row.get(3)?,
        cert_id: row.get(4)?,
        data: serde_json::from_str(&data_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

/// Events for one certificate, oldest first
pub fn get_events_for_cert(conn: &Connection, cert_id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, run_id, timestamp, event_type, cert_id, data
         FROM events
         WHERE cert_id = ?1
         ORDER BY id",
    )?;

    let events = stmt
        .query_map([cert_id], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Events for one run, in the order they were written
pub fn get_events_for_run(conn: &Connection, run_id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, run_id, timestamp, event_type, cert_id, data
         FROM events
         WHERE run_id = ?1
         ORDER BY id",
    )?;

    let events = stmt
        .query_map([run_id], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// Complete attributes for a test record
    pub(crate) fn sample_attributes(year: i32, brand: &str, subject: &str) -> ValidatedRecord {
        ValidatedRecord {
            year,
            brand: brand.to_string(),
            subject: subject.to_string(),
            category: Some("BASEBALL CARDS".to_string()),
            card_number: Some("311".to_string()),
            variety: None,
            card_grade: Some("NM-MT 8".to_string()),
            grade_description: None,
            total_population: Some(12),
            http_status: 200,
            payload_json: "{}".to_string(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_put_then_get() {
        let conn = memory_db();
        let record = CertRecord::new(
            "12345678",
            sample_attributes(1952, "TOPPS", "MICKEY MANTLE"),
            "desc-A",
            t0(),
            "psa",
        );

        put_record(&conn, &record).unwrap();
        let loaded = get_record(&conn, "12345678").unwrap().unwrap();

        assert_eq!(loaded, record);
        assert_eq!(record_count(&conn).unwrap(), 1);
        assert!(get_record(&conn, "7654321").unwrap().is_none());
    }

    #[test]
    fn test_put_merges_annotation_and_overwrites_attributes() {
        let conn = memory_db();

        let first = CertRecord::new(
            "12345678",
            sample_attributes(1952, "TOPPS", "MICKEY MANTLE"),
            "desc-A",
            t0(),
            "psa",
        );
        put_record(&conn, &first).unwrap();

        let second = CertRecord::new(
            "12345678",
            sample_attributes(1952, "TOPPS CHROME", "MICKEY MANTLE"),
            "desc-B",
            t0() + Duration::days(40),
            "psa",
        );
        let stored = put_record(&conn, &second).unwrap();

        assert_eq!(stored.annotation, "desc-A desc-B");

        let loaded = get_record(&conn, "12345678").unwrap().unwrap();
        assert_eq!(loaded.annotation, "desc-A desc-B");
        assert_eq!(loaded.attributes.brand, "TOPPS CHROME");
        assert_eq!(loaded.last_fetched, t0() + Duration::days(40));
        assert_eq!(record_count(&conn).unwrap(), 1);

        println!("✅ Upsert merge test PASSED");
    }

    #[test]
    fn test_put_rejects_incomplete_record() {
        let conn = memory_db();
        let record = CertRecord::new(
            "12345678",
            sample_attributes(1952, "TOPPS", "   "),
            "",
            t0(),
            "psa",
        );

        assert!(put_record(&conn, &record).is_err());
        assert_eq!(record_count(&conn).unwrap(), 0);
    }

    #[test]
    fn test_schema_check_blocks_bad_year() {
        let conn = memory_db();

        let result = conn.execute(
            "INSERT INTO certificates (id, year, brand, subject, last_fetched, source, http_status, payload_json)
             VALUES ('1234567', 52, 'TOPPS', 'MANTLE', '2024-01-01T00:00:00+00:00', 'psa', 200, '{}')",
            [],
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_staleness_boundaries() {
        let conn = memory_db();
        let record = CertRecord::new(
            "12345678",
            sample_attributes(1952, "TOPPS", "MICKEY MANTLE"),
            "",
            t0(),
            "psa",
        );
        put_record(&conn, &record).unwrap();

        let max_age = 3600;

        // Absent = stale
        assert!(is_stale(&conn, "99999999", max_age, t0()).unwrap());

        // Exactly max_age elapsed is still fresh
        assert!(!is_stale(&conn, "12345678", max_age, t0()).unwrap());
        assert!(!is_stale(&conn, "12345678", max_age, t0() + Duration::seconds(3600)).unwrap());

        // One second past is stale
        assert!(is_stale(&conn, "12345678", max_age, t0() + Duration::seconds(3601)).unwrap());

        // 0 disables the cache
        assert!(is_stale(&conn, "12345678", 0, t0()).unwrap());

        // Negative is refused
        assert!(is_stale(&conn, "12345678", -1, t0()).is_err());
    }

    #[test]
    fn test_merge_record_annotation() {
        let conn = memory_db();
        let record = CertRecord::new(
            "12345678",
            sample_attributes(1952, "TOPPS", "MICKEY MANTLE"),
            "desc-A",
            t0(),
            "psa",
        );
        put_record(&conn, &record).unwrap();

        assert!(merge_record_annotation(&conn, "12345678", "desc-B").unwrap());
        assert!(!merge_record_annotation(&conn, "12345678", "desc-B").unwrap());
        assert!(!merge_record_annotation(&conn, "99999999", "desc-C").unwrap());

        let loaded = get_record(&conn, "12345678").unwrap().unwrap();
        assert_eq!(loaded.annotation, "desc-A desc-B");
        assert_eq!(loaded.last_fetched, t0());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("certs.db");

        {
            let conn = open_database(&path).unwrap();
            let record = CertRecord::new(
                "12345678",
                sample_attributes(1952, "TOPPS", "MICKEY MANTLE"),
                "desc-A",
                t0(),
                "psa",
            );
            put_record(&conn, &record).unwrap();
        }

        let conn = open_database(&path).unwrap();
        let all = get_all_records(&conn).unwrap();

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "12345678");
        assert_eq!(all[0].annotation, "desc-A");
    }

    #[test]
    fn test_event_log() {
        let conn = memory_db();

        let event = Event::new(
            "run-1",
            "cert_rejected",
            Some("12345678"),
            serde_json::json!({"reason": "missing subject"}),
            t0(),
        );
        insert_event(&conn, &event).unwrap();
        insert_event(
            &conn,
            &Event::new("run-1", "run_completed", None, serde_json::json!({}), t0()),
        )
        .unwrap();

        let for_cert = get_events_for_cert(&conn, "12345678").unwrap();
        assert_eq!(for_cert.len(), 1);
        assert_eq!(for_cert[0].event_type, "cert_rejected");
        assert_eq!(for_cert[0].data["reason"], "missing subject");

        let for_run = get_events_for_run(&conn, "run-1").unwrap();
        assert_eq!(for_run.len(), 2);
        assert_eq!(for_run[1].event_type, "run_completed");

        println!("✅ Event log test PASSED");
    }
}
