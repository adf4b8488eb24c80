use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use crate::catalog::ClassKey;
use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDir {
    pub path: PathBuf,
    /// True only for the call that actually created at least one segment.
    pub created: bool,
}

type LayoutKey = (String, Option<String>);

/// Maps (family, weapon) to `root/family[/weapon]`, creating directories on
/// first use. Safe to share across worker threads.
#[derive(Debug)]
pub struct LayoutResolver {
    root: PathBuf,
    cache: Mutex<HashMap<LayoutKey, PathBuf>>,
}

impl LayoutResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Pure path computation, no filesystem access.
    pub fn path_for(
        &self,
        family: &ClassKey,
        weapon: Option<&ClassKey>,
    ) -> Result<PathBuf, IngestError> {
        let mut path = self.root.join(checked_segment(&self.root, family.as_str())?);
        if let Some(weapon) = weapon {
            path.push(checked_segment(&path, weapon.as_str())?);
        }
        Ok(path)
    }

    pub fn resolve(
        &self,
        family: &ClassKey,
        weapon: Option<&ClassKey>,
    ) -> Result<ResolvedDir, IngestError> {
        let key = (
            family.as_str().to_string(),
            weapon.map(|weapon| weapon.as_str().to_string()),
        );
        if let Some(path) = self.cached(&key) {
            return Ok(ResolvedDir {
                path,
                created: false,
            });
        }

        let path = self.path_for(family, weapon)?;
        let mut created = ensure_dir(&self.root)?;
        let family_dir = self.root.join(family.as_str());
        created |= ensure_dir(&family_dir)?;
        if weapon.is_some() {
            created |= ensure_dir(&path)?;
        }
        if created {
            info!(path = %path.display(), "created directory");
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, path.clone());
        }
        Ok(ResolvedDir { path, created })
    }

    /// Number of distinct (family, weapon) pairs resolved so far.
    pub fn resolved_count(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    fn cached(&self, key: &LayoutKey) -> Option<PathBuf> {
        self.cache.lock().ok().and_then(|cache| cache.get(key).cloned())
    }
}

/// Create `path` if absent. Returns whether this call created it. Losing a
/// creation race to another worker counts as success.
fn ensure_dir(path: &Path) -> Result<bool, IngestError> {
    match fs::create_dir(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
            if path.is_dir() {
                Ok(false)
            } else {
                Err(IngestError::layout(path, "path exists and is not a directory"))
            }
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            match path.parent() {
                Some(parent) if parent != path => {
                    ensure_dir(parent)?;
                }
                _ => return Err(IngestError::layout(path, error.to_string())),
            }
            ensure_dir(path)
        }
        Err(error) => Err(IngestError::layout(path, error.to_string())),
    }
}

fn checked_segment<'a>(parent: &Path, segment: &'a str) -> Result<&'a str, IngestError> {
    let invalid = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\'])
        || segment.contains('\0');
    if invalid {
        return Err(IngestError::layout(
            parent.join(segment),
            format!("`{segment}` is not a usable directory name"),
        ));
    }
    Ok(segment)
}
