// 📄 Candidate file - newline-delimited raw identifiers
//
// The file is both input and output: before validation the normalized,
// merged list is written back so the next run starts from clean input.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::normalizer::{normalize_lines, parse_line, LineParse, NormalizedCandidates};

pub const FILE_HEADER: &str = "# candidates (cert-hunter)";

/// All lines of `path`; a missing file is an empty list
pub fn load_lines(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }

    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut lines = Vec::new();

    for line in BufReader::new(file).split(b'\n') {
        let bytes = line.with_context(|| format!("Failed to read {:?}", path))?;
        // Scraped text is not always valid UTF-8; keep what we can
        let text = String::from_utf8_lossy(&bytes);
        lines.push(text.trim_end_matches('\r').to_string());
    }

    Ok(lines)
}

pub fn load_candidates(path: &Path) -> Result<NormalizedCandidates> {
    Ok(normalize_lines(load_lines(path)?))
}

/// Replace the candidate file with the normalized list (temp file + rename)
pub fn rewrite_candidates(path: &Path, candidates: &NormalizedCandidates) -> Result<()> {
    ensure_parent(path)?;

    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {:?}", tmp_path))?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{}", FILE_HEADER)?;
        for line in candidates.to_lines() {
            writeln!(writer, "{}", line)?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("Failed to flush {:?}", tmp_path))?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {:?}", path))?;

    Ok(())
}

/// Append ids not already present; returns how many were added
pub fn append_identifiers<I, S>(path: &Path, ids: I) -> Result<usize>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let existing_lines = load_lines(path)?;
    let mut known: HashSet<String> = existing_lines
        .iter()
        .filter_map(|line| match parse_line(line) {
            LineParse::Candidate(c) => Some(c.id),
            _ => None,
        })
        .collect();

    let fresh: Vec<String> = ids
        .into_iter()
        .map(|id| id.as_ref().to_string())
        .filter(|id| known.insert(id.clone()))
        .collect();

    if fresh.is_empty() {
        return Ok(0);
    }

    ensure_parent(path)?;
    let needs_header = existing_lines.is_empty();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?} for append", path))?;
    let mut writer = BufWriter::new(file);

    if needs_header {
        writeln!(writer, "{}", FILE_HEADER)?;
    }
    for id in &fresh {
        writeln!(writer, "{}", id)?;
    }
    writer.flush()?;

    Ok(fresh.len())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let lines = load_lines(&dir.path().join("nope.txt")).unwrap();

        assert!(lines.is_empty());
    }

    #[test]
    fn test_rewrite_persists_merged_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("certs.txt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "1234567 desc-A\r\n1234567 desc-B\nbad line\n99999999\n").unwrap();

        let candidates = load_candidates(&path).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates.malformed, 1);

        rewrite_candidates(&path, &candidates).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            format!("{}\n1234567\tdesc-A desc-B\n99999999\n", FILE_HEADER)
        );

        // Second pass is a no-op
        let again = load_candidates(&path).unwrap();
        rewrite_candidates(&path, &again).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn test_append_skips_known_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certs.txt");

        assert_eq!(append_identifiers(&path, ["1234567", "7654321"]).unwrap(), 2);
        assert_eq!(append_identifiers(&path, ["7654321", "99999999", "99999999"]).unwrap(), 1);

        let lines = load_lines(&path).unwrap();
        assert_eq!(lines, vec![FILE_HEADER, "1234567", "7654321", "99999999"]);
    }
}
