//! Catalog data model and extraction of the JSON payload embedded in the
//! spell listing page.
//!
//! The page is an Inertia-style document: one element carries a `data-page`
//! attribute whose value is the JSON-encoded page state. Spells live under
//! `props.spells` and gods (with their weapons) under `props.gods`.

use std::fmt;
use std::fs;
use std::path::Path;

use scraper::{Html, Selector};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::Language;
use crate::error::IngestError;

const RECORDS_KEY: &str = "spells";
const CLASSIFIERS_KEY: &str = "gods";

/// Scalar identifier coerced to its string form (`7` and `"7"` are the same key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassKey(String);

impl ClassKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
            }
            Value::Number(number) => Some(Self(number.to_string())),
            Value::Bool(flag) => Some(Self(flag.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ClassKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ClassKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).ok_or_else(|| D::Error::custom("expected a scalar identifier"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LocalizedNames {
    pub name_en: Option<String>,
    pub name_fr: Option<String>,
    pub name_es: Option<String>,
    pub name_de: Option<String>,
    pub name_pt: Option<String>,
}

impl LocalizedNames {
    pub fn get(&self, language: Language) -> Option<&str> {
        let value = match language {
            Language::En => &self.name_en,
            Language::Fr => &self.name_fr,
            Language::Es => &self.name_es,
            Language::De => &self.name_de,
            Language::Pt => &self.name_pt,
        };
        value.as_deref().map(str::trim).filter(|name| !name.is_empty())
    }
}

/// A weapon nested under a god.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubClassifier {
    pub id: ClassKey,
    #[serde(flatten)]
    pub names: LocalizedNames,
}

/// A god: translates a numeric family folder to a display name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Classifier {
    pub id: ClassKey,
    #[serde(flatten)]
    pub names: LocalizedNames,
    #[serde(default)]
    pub weapons: Vec<SubClassifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaugeSlot {
    First,
    Second,
}

impl GaugeSlot {
    fn keys(self) -> (&'static str, &'static str) {
        match self {
            Self::First => ("gauge1Element", "gauge1Value"),
            Self::Second => ("gauge2Element", "gauge2Value"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gauge {
    pub element: Value,
    pub value: Value,
}

/// One spell, backed by the exact JSON object from the catalog so that the raw
/// output schema round-trips without losing or reordering fields.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn display_name(&self, language: Language) -> Option<&str> {
        self.fields
            .get(language.name_key())
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Best human-readable handle for log lines: first available name, then image id.
    pub fn identity(&self) -> String {
        Language::ALL
            .into_iter()
            .find_map(|language| self.display_name(language))
            .map(ToString::to_string)
            .or_else(|| self.fields.get("img").and_then(ClassKey::from_value).map(|key| key.0))
            .unwrap_or_else(|| "<unnamed>".to_string())
    }

    pub fn family(&self) -> Result<ClassKey, IngestError> {
        self.fields
            .get("families")
            .and_then(ClassKey::from_value)
            .ok_or_else(|| IngestError::Record("missing or non-scalar `families`".to_string()))
    }

    /// `None` means the spell is usable with every weapon.
    pub fn weapon(&self) -> Result<Option<ClassKey>, IngestError> {
        match self.fields.get("specific_to_weapon") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => ClassKey::from_value(value).map(Some).ok_or_else(|| {
                IngestError::Record("non-scalar `specific_to_weapon`".to_string())
            }),
        }
    }

    pub fn image_id(&self) -> Result<String, IngestError> {
        self.fields
            .get("img")
            .and_then(ClassKey::from_value)
            .map(|key| key.0)
            .ok_or_else(|| IngestError::Record("missing or non-scalar `img`".to_string()))
    }

    pub fn cost(&self) -> Option<&Value> {
        self.fields.get("cost")
    }

    pub fn element(&self) -> Option<&Value> {
        self.fields.get("element")
    }

    /// Both halves of a gauge pair are null or missing -> `None`.
    pub fn gauge(&self, slot: GaugeSlot) -> Option<Gauge> {
        let (element_key, value_key) = slot.keys();
        let element = self.fields.get(element_key).cloned().unwrap_or(Value::Null);
        let value = self.fields.get(value_key).cloned().unwrap_or(Value::Null);
        if element.is_null() && value.is_null() {
            return None;
        }
        Some(Gauge { element, value })
    }
}

/// Legacy flattened record layout. Values are copied as they appear in the
/// catalog, names included.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NormalizedRecord {
    pub name_fr: Value,
    pub name_en: Value,
    pub cost: Value,
    pub element: Value,
    pub gauge_element: Value,
    pub gauge_nb: Value,
    pub gauge2_element: Value,
    pub gauge2_nb: Value,
    pub weapon: Value,
    pub familie: Value,
}

impl From<&Record> for NormalizedRecord {
    fn from(record: &Record) -> Self {
        let field = |key: &str| record.fields.get(key).cloned().unwrap_or(Value::Null);
        let first = record.gauge(GaugeSlot::First);
        let second = record.gauge(GaugeSlot::Second);
        Self {
            name_fr: field("name_fr"),
            name_en: field("name_en"),
            cost: field("cost"),
            element: field("element"),
            gauge_element: first.as_ref().map(|g| g.element.clone()).unwrap_or(Value::Null),
            gauge_nb: first.map(|g| g.value).unwrap_or(Value::Null),
            gauge2_element: second.as_ref().map(|g| g.element.clone()).unwrap_or(Value::Null),
            gauge2_nb: second.map(|g| g.value).unwrap_or(Value::Null),
            weapon: field("specific_to_weapon"),
            familie: field("families"),
        }
    }
}

/// Everything one run needs from the page.
#[derive(Debug, Clone)]
pub struct CatalogPayload {
    /// Full page-state document, written verbatim to the intermediate catalog file.
    pub document: Value,
    pub records: Vec<Record>,
    pub classifiers: Vec<Classifier>,
}

impl CatalogPayload {
    pub fn from_document(document: Value) -> Result<Self, IngestError> {
        let props = document
            .get("props")
            .and_then(Value::as_object)
            .ok_or_else(|| IngestError::Extraction("payload has no `props` object".to_string()))?;
        let raw_records = props
            .get(RECORDS_KEY)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                IngestError::Extraction(format!("payload has no `props.{RECORDS_KEY}` array"))
            })?;

        let mut records = Vec::with_capacity(raw_records.len());
        for (index, entry) in raw_records.iter().enumerate() {
            match entry {
                Value::Object(fields) => records.push(Record::from_fields(fields.clone())),
                _ => warn!(index, "skipping catalog entry that is not a JSON object"),
            }
        }

        let mut classifiers = Vec::new();
        if let Some(raw_classifiers) = props.get(CLASSIFIERS_KEY).and_then(Value::as_array) {
            for (index, entry) in raw_classifiers.iter().enumerate() {
                match serde_json::from_value::<Classifier>(entry.clone()) {
                    Ok(classifier) => classifiers.push(classifier),
                    Err(error) => warn!(index, %error, "skipping malformed classifier"),
                }
            }
        }

        Ok(Self {
            document,
            records,
            classifiers,
        })
    }
}

/// Locate the page-state container in `html` and parse its JSON attribute.
pub fn extract_catalog(
    html: &str,
    selector: &str,
    attribute: &str,
) -> Result<CatalogPayload, IngestError> {
    let selector = Selector::parse(selector)
        .map_err(|error| IngestError::Config(format!("invalid container selector: {error:?}")))?;
    let document = Html::parse_document(html);
    let container = document.select(&selector).next().ok_or_else(|| {
        IngestError::Extraction("no element matches the payload container selector".to_string())
    })?;
    let raw = container.value().attr(attribute).ok_or_else(|| {
        IngestError::Extraction(format!("container has no `{attribute}` attribute"))
    })?;
    let payload: Value = serde_json::from_str(raw).map_err(|error| {
        IngestError::Extraction(format!("`{attribute}` is not valid JSON: {error}"))
    })?;
    CatalogPayload::from_document(payload)
}

/// Read the intermediate catalog file written by a previous ingestion run.
pub fn load_catalog_file(path: &Path) -> Result<CatalogPayload, IngestError> {
    let content = fs::read_to_string(path).map_err(|error| {
        IngestError::Extraction(format!("failed to read {}: {error}", path.display()))
    })?;
    let document: Value = serde_json::from_str(&content).map_err(|error| {
        IngestError::Extraction(format!("invalid JSON in {}: {error}", path.display()))
    })?;
    CatalogPayload::from_document(document)
}
