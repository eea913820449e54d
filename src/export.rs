// 📤 Export - validated records as CSV
//
// One row per cached certificate, ordered by id. Columns mirror the
// certificates table minus the raw payload.

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::io::Write;

use crate::db::{get_all_records, CertRecord};

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    cert_number: &'a str,
    year: i32,
    brand: &'a str,
    subject: &'a str,
    category: Option<&'a str>,
    card_number: Option<&'a str>,
    variety: Option<&'a str>,
    card_grade: Option<&'a str>,
    grade_description: Option<&'a str>,
    total_population: Option<i64>,
    annotation: &'a str,
    last_fetched: String,
    source: &'a str,
}

impl<'a> From<&'a CertRecord> for ExportRow<'a> {
    fn from(record: &'a CertRecord) -> Self {
        let attrs = &record.attributes;
        ExportRow {
            cert_number: &record.id,
            year: attrs.year,
            brand: &attrs.brand,
            subject: &attrs.subject,
            category: attrs.category.as_deref(),
            card_number: attrs.card_number.as_deref(),
            variety: attrs.variety.as_deref(),
            card_grade: attrs.card_grade.as_deref(),
            grade_description: attrs.grade_description.as_deref(),
            total_population: attrs.total_population,
            annotation: &record.annotation,
            last_fetched: record.last_fetched.to_rfc3339(),
            source: &record.source,
        }
    }
}

/// Write every record to `writer`; returns the row count
pub fn export_csv<W: Write>(conn: &Connection, writer: W) -> Result<usize> {
    let records = get_all_records(conn)?;
    let mut wtr = csv::Writer::from_writer(writer);

    for record in &records {
        wtr.serialize(ExportRow::from(record))
            .with_context(|| format!("Failed to write row for {}", record.id))?;
    }
    wtr.flush().context("Failed to flush CSV output")?;

    Ok(records.len())
}
