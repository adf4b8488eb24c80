use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::{CatalogPayload, LocalizedNames, load_catalog_file};
use crate::config::Language;
use crate::error::IngestError;
use crate::persist::sanitize_display_name;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RenamedDir {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedDir {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenameReport {
    pub success: bool,
    pub scanned: usize,
    pub renamed: Vec<RenamedDir>,
    pub skipped: Vec<SkippedDir>,
}

/// Rename identifier-named family folders (and the weapon folders inside them)
/// to their localized display names.
///
/// Only directories whose name is exactly a classifier id are touched, so once
/// a tree has been renamed a later pass finds nothing to do.
pub fn rename_folders(
    catalog: &CatalogPayload,
    output_root: &Path,
    language: Language,
) -> Result<RenameReport, IngestError> {
    if !output_root.is_dir() {
        return Err(IngestError::layout(output_root, "output root is not a directory"));
    }
    let classifiers: HashMap<&str, _> = catalog
        .classifiers
        .iter()
        .map(|classifier| (classifier.id.as_str(), classifier))
        .collect();

    let mut report = RenameReport::default();
    for dir in child_dirs(output_root, &mut report) {
        report.scanned += 1;
        let Some(classifier) = dir_name(&dir).and_then(|name| classifiers.get(name)) else {
            debug!(path = %dir.display(), "no classifier matches directory");
            continue;
        };
        let Some(renamed) = rename_one(&dir, &classifier.names, language, &mut report) else {
            continue;
        };

        let weapons: HashMap<&str, &LocalizedNames> = classifier
            .weapons
            .iter()
            .map(|weapon| (weapon.id.as_str(), &weapon.names))
            .collect();
        for subdir in child_dirs(&renamed, &mut report) {
            report.scanned += 1;
            if let Some(names) = dir_name(&subdir).and_then(|name| weapons.get(name)) {
                rename_one(&subdir, names, language, &mut report);
            }
        }
    }

    report.success = report.skipped.is_empty();
    info!(
        renamed = report.renamed.len(),
        skipped = report.skipped.len(),
        "folder rename finished"
    );
    Ok(report)
}

/// Load the persisted catalog file and rename against it.
pub fn rename_from_catalog_file(
    catalog_path: &Path,
    output_root: &Path,
    language: Language,
) -> Result<RenameReport, IngestError> {
    let catalog = load_catalog_file(catalog_path)?;
    rename_folders(&catalog, output_root, language)
}

fn rename_one(
    dir: &Path,
    names: &LocalizedNames,
    language: Language,
    report: &mut RenameReport,
) -> Option<PathBuf> {
    let Some(name) = names.get(language) else {
        return skip(report, dir, format!("no `{}` name", language.name_key()));
    };
    let target = dir.with_file_name(sanitize_display_name(name));
    if target == dir {
        return Some(target);
    }
    if target.exists() {
        return skip(report, dir, format!("{} already exists", target.display()));
    }
    if let Err(error) = fs::rename(dir, &target) {
        return skip(report, dir, error.to_string());
    }
    info!(from = %dir.display(), to = %target.display(), "renamed folder");
    report.renamed.push(RenamedDir {
        from: dir.to_path_buf(),
        to: target.clone(),
    });
    Some(target)
}

fn skip(report: &mut RenameReport, dir: &Path, reason: String) -> Option<PathBuf> {
    warn!(path = %dir.display(), %reason, "folder not renamed");
    report.skipped.push(SkippedDir {
        path: dir.to_path_buf(),
        reason,
    });
    None
}

/// Immediate subdirectories, sorted so renames happen in a stable order.
fn child_dirs(root: &Path, report: &mut RenameReport) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => dirs.push(entry.into_path()),
            Ok(_) => {}
            Err(error) => {
                let path = error.path().unwrap_or(root).to_path_buf();
                skip(report, &path, error.to_string());
            }
        }
    }
    dirs
}

fn dir_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::tempdir;

    use super::{rename_folders, rename_from_catalog_file};
    use crate::catalog::CatalogPayload;
    use crate::config::Language;
    use crate::error::ErrorKind;

    fn catalog() -> CatalogPayload {
        CatalogPayload::from_document(json!({
            "props": {
                "spells": [],
                "gods": [
                    {"id": 7, "name_en": "Fire", "name_fr": "Feu",
                     "weapons": [{"id": 12, "name_en": "Sword", "name_fr": "Épée"}]},
                    {"id": "3", "name_fr": "Eau"}
                ]
            }
        }))
        .expect("catalog")
    }

    #[test]
    fn identifier_folders_get_display_names_once() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("7/12")).expect("mkdir");
        fs::write(temp.path().join("7/12/Flame.json"), "{}").expect("write");
        fs::create_dir_all(temp.path().join("99")).expect("mkdir");

        let report = rename_folders(&catalog(), temp.path(), Language::En).expect("rename");
        assert_eq!(report.renamed.len(), 2);
        assert!(temp.path().join("Fire/Sword/Flame.json").exists());
        assert!(temp.path().join("99").is_dir());
        assert!(!temp.path().join("7").exists());

        let again = rename_folders(&catalog(), temp.path(), Language::En).expect("second pass");
        assert!(again.renamed.is_empty());
        assert!(again.skipped.is_empty());
        assert!(temp.path().join("Fire/Sword/Flame.json").exists());
    }

    #[test]
    fn missing_localized_name_is_skipped_and_recorded() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("3")).expect("mkdir");
        fs::create_dir_all(temp.path().join("7")).expect("mkdir");

        let report = rename_folders(&catalog(), temp.path(), Language::En).expect("rename");
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("name_en"));
        assert!(temp.path().join("3").is_dir());
        assert!(temp.path().join("Fire").is_dir());
        assert!(!report.success);
    }

    #[test]
    fn existing_target_blocks_rename_without_clobbering() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("7")).expect("mkdir");
        fs::create_dir_all(temp.path().join("Feu")).expect("mkdir");
        fs::write(temp.path().join("Feu/keep.txt"), "x").expect("write");

        let report = rename_folders(&catalog(), temp.path(), Language::Fr).expect("rename");
        assert!(report.renamed.is_empty());
        assert!(report.skipped[0].reason.contains("already exists"));
        assert!(temp.path().join("7").is_dir());
        assert!(temp.path().join("Feu/keep.txt").exists());
    }

    #[test]
    fn missing_catalog_file_is_fatal() {
        let temp = tempdir().expect("tempdir");
        let error = rename_from_catalog_file(
            &temp.path().join("absent.json"),
            temp.path(),
            Language::Fr,
        )
        .expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Extraction);
    }

    #[test]
    fn renames_from_persisted_catalog() {
        let temp = tempdir().expect("tempdir");
        let catalog_path = temp.path().join("catalog.json");
        fs::write(&catalog_path, catalog().document.to_string()).expect("write catalog");
        let root = temp.path().join("out");
        fs::create_dir_all(root.join("7")).expect("mkdir");

        let report = rename_from_catalog_file(&catalog_path, &root, Language::Fr).expect("rename");
        assert_eq!(report.renamed.len(), 1);
        assert!(root.join("Feu").is_dir());
    }
}
