use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::catalog::{NormalizedRecord, Record};
use crate::config::OutputSchema;
use crate::error::IngestError;

pub const RECORD_EXTENSION: &str = "json";

/// Turn a display name into a file stem that stays inside its directory.
/// Path separators and characters Windows refuses are replaced with `-`;
/// spaces, accents and apostrophes are kept.
pub fn sanitize_display_name(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.trim().chars() {
        if ch.is_control() || matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '/' | '\\') {
            output.push('-');
        } else {
            output.push(ch);
        }
    }
    let trimmed = output.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() || trimmed.chars().all(|ch| ch == '.') {
        return "_".to_string();
    }
    trimmed.to_string()
}

pub fn record_path(dir: &Path, display_name: &str) -> PathBuf {
    dir.join(format!(
        "{}.{RECORD_EXTENSION}",
        sanitize_display_name(display_name)
    ))
}

/// Write one record as pretty JSON, replacing any previous file of that name.
pub fn persist_record(
    record: &Record,
    schema: OutputSchema,
    dir: &Path,
    display_name: &str,
) -> Result<PathBuf, IngestError> {
    let path = record_path(dir, display_name);
    let rendered = match schema {
        OutputSchema::Raw => render_json(record),
        OutputSchema::Normalized => render_json(&NormalizedRecord::from(record)),
    }
    .map_err(|error| IngestError::persist(&path, error))?;
    fs::write(&path, rendered).map_err(|error| IngestError::persist(&path, error))?;
    Ok(path)
}

/// Write the full page-state document as the intermediate catalog file.
/// Non-ASCII text is written as UTF-8, not escaped.
pub fn write_catalog_file(document: &Value, path: &Path) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| IngestError::persist(parent, error))?;
    }
    let rendered = render_json(document).map_err(|error| IngestError::persist(path, error))?;
    fs::write(path, rendered).map_err(|error| IngestError::persist(path, error))
}

pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), IngestError> {
    fs::write(path, bytes).map_err(|error| IngestError::persist(path, error))
}

/// Remove a file; a file that is already gone is not an error.
pub fn remove_if_exists(path: &Path) -> Result<(), IngestError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(IngestError::persist(path, error)),
    }
}

fn render_json<T: Serialize + ?Sized>(value: &T) -> io::Result<String> {
    let mut rendered = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    rendered.push('\n');
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::{Value, json};
    use tempfile::tempdir;

    use super::{persist_record, record_path, sanitize_display_name, write_catalog_file};
    use crate::catalog::Record;
    use crate::config::OutputSchema;
    use crate::error::ErrorKind;

    fn spell() -> Record {
        let value = json!({
            "name_fr": "Lame d'Ébène",
            "name_en": "Ebony Blade",
            "cost": 2,
            "gauge2Element": null,
            "families": 7,
            "img": "x1"
        });
        serde_json::from_value(value).expect("record")
    }

    #[test]
    fn sanitize_keeps_readable_names() {
        assert_eq!(sanitize_display_name("Lame d'Ébène"), "Lame d'Ébène");
        assert_eq!(sanitize_display_name("A/B:C"), "A-B-C");
        assert_eq!(sanitize_display_name(".."), "_");
        assert_eq!(sanitize_display_name("  Dot. "), "Dot");
    }

    #[test]
    fn raw_schema_round_trips_losslessly() {
        let temp = tempdir().expect("tempdir");
        let record = spell();
        let path = persist_record(&record, OutputSchema::Raw, temp.path(), "Lame d'Ébène")
            .expect("persist");
        assert_eq!(path, record_path(temp.path(), "Lame d'Ébène"));

        let content = fs::read_to_string(&path).expect("read");
        assert!(content.contains("Ébène"));
        let parsed: Record = serde_json::from_str(&content).expect("parse");
        assert_eq!(parsed, record);
        assert_eq!(parsed.fields().get("gauge2Element"), Some(&Value::Null));
    }

    #[test]
    fn persisting_overwrites_previous_content() {
        let temp = tempdir().expect("tempdir");
        let path = record_path(temp.path(), "Ebony Blade");
        fs::write(&path, "stale").expect("seed");
        persist_record(&spell(), OutputSchema::Normalized, temp.path(), "Ebony Blade")
            .expect("persist");
        let value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["familie"], json!(7));
    }

    #[test]
    fn missing_directory_is_a_persist_error() {
        let temp = tempdir().expect("tempdir");
        let error = persist_record(
            &spell(),
            OutputSchema::Raw,
            &temp.path().join("absent"),
            "Ebony Blade",
        )
        .expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Persist);
    }

    #[test]
    fn catalog_file_is_pretty_utf8() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("catalog.json");
        let document = json!({"props": {"spells": [{"name_fr": "Éclair"}]}});
        write_catalog_file(&document, &path).expect("write");
        let content = fs::read_to_string(&path).expect("read");
        assert!(content.contains("Éclair"));
        assert!(content.contains("\n  \"props\""));
    }
}
