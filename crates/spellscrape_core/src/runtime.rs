use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{FileConfig, load_config};

pub const CONFIG_FILENAME: &str = "spellscrape.toml";
pub const CATALOG_FILENAME: &str = "Waven_DB_Spells.json";
pub const LOG_FILENAME: &str = "spellscrape.log";
pub const DEFAULT_OUTPUT_DIR: &str = "spells";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub catalog_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub output_root: PathBuf,
    pub config_path: PathBuf,
    pub catalog_path: PathBuf,
    pub log_path: PathBuf,
    pub root_source: ValueSource,
    pub output_source: ValueSource,
    pub config_source: ValueSource,
    pub catalog_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\noutput_root={} ({})\nconfig_path={} ({})\ncatalog_path={} ({})\nlog_path={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.output_root),
            self.output_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.catalog_path),
            self.catalog_source.as_str(),
            normalize_for_display(&self.log_path),
        )
    }
}

/// Resolved paths plus the config file they were resolved against.
#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    pub paths: ResolvedPaths,
    pub config: FileConfig,
}

pub fn resolve_runtime(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<RuntimeLayout> {
    resolve_runtime_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_runtime_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<RuntimeLayout>
where
    F: Fn(&str) -> Option<String>,
{
    let env_path = |key: &str| {
        lookup_env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    };

    let (project_root, root_source) = if let Some(path) = overrides.project_root.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(path) = env_path("SPELLSCRAPE_PROJECT_ROOT") {
        (absolutize(&path, &context.cwd), ValueSource::Env)
    } else {
        (context.cwd.clone(), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(path) = env_path("SPELLSCRAPE_CONFIG") {
        (absolutize(&path, &project_root), ValueSource::Env)
    } else {
        (project_root.join(CONFIG_FILENAME), ValueSource::Default)
    };
    let config = load_config(&config_path)?;

    let (output_root, output_source) = pick_path(
        overrides.output_dir.as_deref(),
        env_path("SPELLSCRAPE_OUTPUT_DIR"),
        config.output.root.as_deref(),
        DEFAULT_OUTPUT_DIR,
        &project_root,
    );
    let (catalog_path, catalog_source) = pick_path(
        overrides.catalog_file.as_deref(),
        env_path("SPELLSCRAPE_CATALOG_FILE"),
        config.output.catalog_file.as_deref(),
        CATALOG_FILENAME,
        &project_root,
    );
    let log_path = match overrides.log_file.as_deref() {
        Some(path) => absolutize(path, &project_root),
        None => env_path("SPELLSCRAPE_LOG_FILE")
            .map(|path| absolutize(&path, &project_root))
            .unwrap_or_else(|| project_root.join(LOG_FILENAME)),
    };

    Ok(RuntimeLayout {
        paths: ResolvedPaths {
            project_root,
            output_root,
            config_path,
            catalog_path,
            log_path,
            root_source,
            output_source,
            config_source,
            catalog_source,
        },
        config,
    })
}

fn pick_path(
    flag: Option<&Path>,
    env: Option<PathBuf>,
    config: Option<&str>,
    default: &str,
    project_root: &Path,
) -> (PathBuf, ValueSource) {
    if let Some(path) = flag {
        return (absolutize(path, project_root), ValueSource::Flag);
    }
    if let Some(path) = env {
        return (absolutize(&path, project_root), ValueSource::Env);
    }
    if let Some(value) = config.map(str::trim).filter(|value| !value.is_empty()) {
        return (absolutize(Path::new(value), project_root), ValueSource::Config);
    }
    (project_root.join(default), ValueSource::Default)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        CATALOG_FILENAME, PathOverrides, ResolutionContext, ValueSource,
        resolve_runtime_with_lookup,
    };

    #[test]
    fn resolve_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext { cwd: cwd.clone() };
        let env = HashMap::from([(
            "SPELLSCRAPE_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved =
            resolve_runtime_with_lookup(&context, &overrides, |key| env.get(key).cloned())
                .expect("resolve");
        assert_eq!(resolved.paths.project_root, from_flag);
        assert_eq!(resolved.paths.root_source, ValueSource::Flag);
    }

    #[test]
    fn defaults_land_under_project_root() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let resolved = resolve_runtime_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        let paths = resolved.paths;
        assert_eq!(paths.output_root, temp.path().join("spells"));
        assert_eq!(paths.catalog_path, temp.path().join(CATALOG_FILENAME));
        assert_eq!(paths.output_source, ValueSource::Default);
        assert!(paths.diagnostics().contains("output_root="));
    }

    #[test]
    fn config_file_supplies_output_root() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join("spellscrape.toml"),
            "[output]\nroot = \"data/out\"\n",
        )
        .expect("write config");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let resolved = resolve_runtime_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(resolved.paths.output_root, temp.path().join("data/out"));
        assert_eq!(resolved.paths.output_source, ValueSource::Config);
        assert_eq!(resolved.config.output.root.as_deref(), Some("data/out"));
    }

    #[test]
    fn env_output_dir_beats_config_file() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join("spellscrape.toml"),
            "[output]\nroot = \"from-config\"\n",
        )
        .expect("write config");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let env = HashMap::from([("SPELLSCRAPE_OUTPUT_DIR".to_string(), "from-env".to_string())]);
        let resolved =
            resolve_runtime_with_lookup(&context, &PathOverrides::default(), |key| {
                env.get(key).cloned()
            })
            .expect("resolve");
        assert_eq!(resolved.paths.output_root, temp.path().join("from-env"));
        assert_eq!(resolved.paths.output_source, ValueSource::Env);
    }
}
