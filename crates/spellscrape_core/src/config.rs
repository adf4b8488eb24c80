use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::runtime::ResolvedPaths;

pub const DEFAULT_USER_AGENT: &str = "spellscrape/0.2";
pub const DEFAULT_PAGE_URL: &str = "https://wavendb.com/spells";
pub const DEFAULT_IMAGE_BASE_URL: &str = "https://wavendb.com/img/spells";
pub const DEFAULT_IMAGE_SOURCE_EXT: &str = "png.webp";
pub const DEFAULT_CONTAINER_SELECTOR: &str = "[data-page]";
pub const DEFAULT_PAYLOAD_ATTRIBUTE: &str = "data-page";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 350;
pub const DEFAULT_BACKGROUND: [u8; 3] = [255, 255, 255];
pub const MAX_WORKERS: usize = 32;

/// Output language for file names and renamed folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    #[default]
    Fr,
    Es,
    De,
    Pt,
}

impl Language {
    pub const ALL: [Language; 5] = [Self::En, Self::Fr, Self::Es, Self::De, Self::Pt];

    pub fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Fr => "fr",
            Self::Es => "es",
            Self::De => "de",
            Self::Pt => "pt",
        }
    }

    /// Catalog field holding the display name in this language.
    pub fn name_key(self) -> &'static str {
        match self {
            Self::En => "name_en",
            Self::Fr => "name_fr",
            Self::Es => "name_es",
            Self::De => "name_de",
            Self::Pt => "name_pt",
        }
    }

    pub fn parse(value: &str) -> Result<Self, IngestError> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|language| trimmed.eq_ignore_ascii_case(language.code()))
            .ok_or_else(|| {
                IngestError::Config(format!(
                    "unsupported language: {trimmed} (expected en|fr|es|de|pt)"
                ))
            })
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Shape of the per-record JSON files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSchema {
    /// Exact catalog object, field names and order untouched.
    #[default]
    Raw,
    /// Flattened legacy field set (`gauge_nb`, `familie`, ...).
    Normalized,
}

impl OutputSchema {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Normalized => "normalized",
        }
    }

    pub fn parse(value: &str) -> Result<Self, IngestError> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("raw") {
            return Ok(Self::Raw);
        }
        if trimmed.eq_ignore_ascii_case("normalized") || trimmed.eq_ignore_ascii_case("legacy") {
            return Ok(Self::Normalized);
        }
        Err(IngestError::Config(format!(
            "unsupported output schema: {trimmed} (expected raw|normalized)"
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageTarget {
    #[default]
    Png,
    Jpeg,
}

impl ImageTarget {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    pub fn format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
        }
    }

    pub fn parse(value: &str) -> Result<Self, IngestError> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("png") {
            return Ok(Self::Png);
        }
        if trimmed.eq_ignore_ascii_case("jpeg") || trimmed.eq_ignore_ascii_case("jpg") {
            return Ok(Self::Jpeg);
        }
        Err(IngestError::Config(format!(
            "unsupported image target: {trimmed} (expected png|jpeg)"
        )))
    }
}

/// Contents of `spellscrape.toml`. Every key is optional.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FileConfig {
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CatalogSection {
    pub page_url: Option<String>,
    pub image_base_url: Option<String>,
    pub image_source_ext: Option<String>,
    pub container_selector: Option<String>,
    pub payload_attribute: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct OutputSection {
    pub root: Option<String>,
    pub catalog_file: Option<String>,
    pub language: Option<String>,
    pub schema: Option<String>,
    pub image_target: Option<String>,
    pub background: Option<[u8; 3]>,
    pub keep_failed_intermediates: Option<bool>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub deadline_secs: Option<u64>,
}

/// Load and parse a FileConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<FileConfig> {
    if !config_path.exists() {
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: FileConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

/// Values supplied on the command line; `None` falls through to env, file, default.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub language: Option<Language>,
    pub schema: Option<OutputSchema>,
    pub image_target: Option<ImageTarget>,
    pub workers: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub deadline_secs: Option<u64>,
    pub keep_failed_intermediates: Option<bool>,
    pub skip_images: bool,
}

/// Immutable configuration for one run, built once at startup and passed by
/// reference into every pipeline stage.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub page_url: String,
    pub image_base_url: String,
    pub image_source_ext: String,
    pub container_selector: String,
    pub payload_attribute: String,
    pub output_root: PathBuf,
    pub catalog_path: PathBuf,
    pub language: Language,
    pub schema: OutputSchema,
    pub image_target: ImageTarget,
    pub background: [u8; 3],
    pub keep_failed_intermediates: bool,
    pub download_images: bool,
    pub workers: usize,
    pub deadline: Option<Duration>,
    pub http: HttpSettings,
}

impl RunConfig {
    /// Defaults for a given output root and catalog path; used by tests and as the
    /// bottom layer of [`RunConfig::resolve`].
    pub fn with_paths(output_root: impl Into<PathBuf>, catalog_path: impl Into<PathBuf>) -> Self {
        Self {
            page_url: DEFAULT_PAGE_URL.to_string(),
            image_base_url: DEFAULT_IMAGE_BASE_URL.to_string(),
            image_source_ext: DEFAULT_IMAGE_SOURCE_EXT.to_string(),
            container_selector: DEFAULT_CONTAINER_SELECTOR.to_string(),
            payload_attribute: DEFAULT_PAYLOAD_ATTRIBUTE.to_string(),
            output_root: output_root.into(),
            catalog_path: catalog_path.into(),
            language: Language::default(),
            schema: OutputSchema::default(),
            image_target: ImageTarget::default(),
            background: DEFAULT_BACKGROUND,
            keep_failed_intermediates: true,
            download_images: true,
            workers: 1,
            deadline: None,
            http: HttpSettings::default(),
        }
    }

    pub fn resolve(
        paths: &ResolvedPaths,
        file: &FileConfig,
        overrides: &RunOverrides,
    ) -> Result<Self, IngestError> {
        Self::resolve_with_lookup(paths, file, overrides, |key| std::env::var(key).ok())
    }

    pub(crate) fn resolve_with_lookup<F>(
        paths: &ResolvedPaths,
        file: &FileConfig,
        overrides: &RunOverrides,
        lookup_env: F,
    ) -> Result<Self, IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::with_paths(&paths.output_root, &paths.catalog_path);

        if let Some(value) = env("SPELLSCRAPE_PAGE_URL").or_else(|| file.catalog.page_url.clone()) {
            config.page_url = value;
        }
        if let Some(value) =
            env("SPELLSCRAPE_IMAGE_BASE_URL").or_else(|| file.catalog.image_base_url.clone())
        {
            config.image_base_url = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = file.catalog.image_source_ext.clone() {
            config.image_source_ext = value.trim_start_matches('.').to_string();
        }
        if let Some(value) = file.catalog.container_selector.clone() {
            config.container_selector = value;
        }
        if let Some(value) = file.catalog.payload_attribute.clone() {
            config.payload_attribute = value;
        }

        config.language = match overrides.language {
            Some(language) => language,
            None => match env("SPELLSCRAPE_LANG").or_else(|| file.output.language.clone()) {
                Some(value) => Language::parse(&value)?,
                None => Language::default(),
            },
        };
        config.schema = match overrides.schema {
            Some(schema) => schema,
            None => match env("SPELLSCRAPE_SCHEMA").or_else(|| file.output.schema.clone()) {
                Some(value) => OutputSchema::parse(&value)?,
                None => OutputSchema::default(),
            },
        };
        config.image_target = match overrides.image_target {
            Some(target) => target,
            None => match file.output.image_target.as_deref() {
                Some(value) => ImageTarget::parse(value)?,
                None => ImageTarget::default(),
            },
        };
        if let Some(background) = file.output.background {
            config.background = background;
        }
        config.keep_failed_intermediates = overrides
            .keep_failed_intermediates
            .or(file.output.keep_failed_intermediates)
            .unwrap_or(true);
        config.download_images = !overrides.skip_images;

        let workers = match overrides.workers {
            Some(workers) => workers,
            None => match env("SPELLSCRAPE_WORKERS") {
                Some(value) => parse_number("SPELLSCRAPE_WORKERS", &value)?,
                None => file.output.workers.unwrap_or(1),
            },
        };
        if workers == 0 || workers > MAX_WORKERS {
            return Err(IngestError::Config(format!(
                "workers must be between 1 and {MAX_WORKERS}, got {workers}"
            )));
        }
        config.workers = workers;

        if let Some(value) = env("SPELLSCRAPE_USER_AGENT").or_else(|| file.http.user_agent.clone())
        {
            config.http.user_agent = value;
        }
        config.http.timeout_ms = match overrides.timeout_ms {
            Some(value) => value,
            None => match env("SPELLSCRAPE_HTTP_TIMEOUT_MS") {
                Some(value) => parse_number("SPELLSCRAPE_HTTP_TIMEOUT_MS", &value)?,
                None => file.http.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            },
        };
        if config.http.timeout_ms == 0 {
            return Err(IngestError::Config(
                "http timeout must be greater than zero".to_string(),
            ));
        }
        config.http.retries = match overrides.retries {
            Some(value) => value,
            None => match env("SPELLSCRAPE_HTTP_RETRIES") {
                Some(value) => parse_number("SPELLSCRAPE_HTTP_RETRIES", &value)?,
                None => file.http.retries.unwrap_or(DEFAULT_RETRIES),
            },
        };
        config.http.retry_delay_ms = match env("SPELLSCRAPE_HTTP_RETRY_DELAY_MS") {
            Some(value) => parse_number("SPELLSCRAPE_HTTP_RETRY_DELAY_MS", &value)?,
            None => file.http.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
        };
        config.deadline = overrides
            .deadline_secs
            .or(file.http.deadline_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(config)
    }

    /// URL of the source-encoded image for one catalog image id.
    pub fn image_url(&self, image_id: &str) -> String {
        format!(
            "{}/{}.{}",
            self.image_base_url.trim_end_matches('/'),
            image_id,
            self.image_source_ext
        )
    }

    pub fn summary(&self) -> String {
        format!(
            "page_url={}\nimage_url_template={}\noutput_root={}\ncatalog_path={}\nlanguage={}\nschema={}\nimage_target={}\nworkers={}\ntimeout_ms={}\nretries={}\ndeadline_secs={}",
            self.page_url,
            self.image_url("{img}"),
            self.output_root.to_string_lossy().replace('\\', "/"),
            self.catalog_path.to_string_lossy().replace('\\', "/"),
            self.language,
            self.schema.as_str(),
            self.image_target.extension(),
            self.workers,
            self.http.timeout_ms,
            self.http.retries,
            self.deadline
                .map(|value| value.as_secs().to_string())
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, IngestError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| {
            IngestError::Config(format!(
                "{key} must be a non-negative integer, got {value}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::*;
    use crate::error::ErrorKind;
    use crate::runtime::ValueSource;

    fn paths(root: &Path) -> ResolvedPaths {
        ResolvedPaths {
            project_root: root.to_path_buf(),
            output_root: root.join("spells"),
            config_path: root.join("spellscrape.toml"),
            catalog_path: root.join("Waven_DB_Spells.json"),
            log_path: root.join("spellscrape.log"),
            root_source: ValueSource::Flag,
            output_source: ValueSource::Default,
            config_source: ValueSource::Default,
            catalog_source: ValueSource::Default,
        }
    }

    #[test]
    fn language_parse_accepts_enumerated_codes_only() {
        assert_eq!(Language::parse("EN").expect("en"), Language::En);
        assert_eq!(Language::parse(" pt ").expect("pt"), Language::Pt);
        let error = Language::parse("it").expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Config);
        assert!(error.to_string().contains("expected en|fr|es|de|pt"));
    }

    #[test]
    fn language_name_keys_match_catalog_fields() {
        assert_eq!(Language::Fr.name_key(), "name_fr");
        assert_eq!(Language::De.name_key(), "name_de");
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/spellscrape.toml")).expect("load");
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("spellscrape.toml");
        fs::write(
            &config_path,
            r#"
[catalog]
page_url = "https://example.test/spells"
image_base_url = "https://example.test/img/"

[output]
language = "en"
schema = "normalized"
workers = 4
background = [0, 0, 0]

[http]
retries = 5
"#,
        )
        .expect("write config");

        let file = load_config(&config_path).expect("load");
        assert_eq!(
            file.catalog.page_url.as_deref(),
            Some("https://example.test/spells")
        );
        assert_eq!(file.output.workers, Some(4));
        assert_eq!(file.http.retries, Some(5));

        let config = RunConfig::resolve_with_lookup(
            &paths(temp.path()),
            &file,
            &RunOverrides::default(),
            |_| None,
        )
        .expect("resolve");
        assert_eq!(config.language, Language::En);
        assert_eq!(config.schema, OutputSchema::Normalized);
        assert_eq!(config.workers, 4);
        assert_eq!(config.background, [0, 0, 0]);
        assert_eq!(config.image_base_url, "https://example.test/img");
        assert_eq!(config.http.retries, 5);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("spellscrape.toml");
        fs::write(&config_path, "[output\nlanguage = \"fr\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn flags_override_env_and_env_overrides_file() {
        let temp = tempdir().expect("tempdir");
        let file = FileConfig {
            output: OutputSection {
                language: Some("de".to_string()),
                ..OutputSection::default()
            },
            ..FileConfig::default()
        };
        let env = HashMap::from([("SPELLSCRAPE_LANG".to_string(), "es".to_string())]);

        let from_env = RunConfig::resolve_with_lookup(
            &paths(temp.path()),
            &file,
            &RunOverrides::default(),
            |key| env.get(key).cloned(),
        )
        .expect("resolve");
        assert_eq!(from_env.language, Language::Es);

        let from_flag = RunConfig::resolve_with_lookup(
            &paths(temp.path()),
            &file,
            &RunOverrides {
                language: Some(Language::Pt),
                ..RunOverrides::default()
            },
            |key| env.get(key).cloned(),
        )
        .expect("resolve");
        assert_eq!(from_flag.language, Language::Pt);
    }

    #[test]
    fn invalid_language_in_file_is_a_config_error() {
        let temp = tempdir().expect("tempdir");
        let file = FileConfig {
            output: OutputSection {
                language: Some("klingon".to_string()),
                ..OutputSection::default()
            },
            ..FileConfig::default()
        };
        let error = RunConfig::resolve_with_lookup(
            &paths(temp.path()),
            &file,
            &RunOverrides::default(),
            |_| None,
        )
        .expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Config);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let error = RunConfig::resolve_with_lookup(
            &paths(temp.path()),
            &FileConfig::default(),
            &RunOverrides {
                workers: Some(0),
                ..RunOverrides::default()
            },
            |_| None,
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("workers must be between"));
    }

    #[test]
    fn image_url_joins_base_id_and_source_extension() {
        let config = RunConfig::with_paths(PathBuf::from("out"), PathBuf::from("catalog.json"));
        assert_eq!(
            config.image_url("abc123"),
            "https://wavendb.com/img/spells/abc123.png.webp"
        );
    }
}
