//! DSL parser: converts raw YAML/JSON/TOML text into [`WorkflowSchema`].

use super::schema::{WorkflowSchema, SUPPORTED_DSL_VERSIONS};
use crate::error::WorkflowError;

/// Supported DSL input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DslFormat {
    /// YAML format (`.yaml` / `.yml`).
    Yaml,
    /// JSON format (`.json`).
    Json,
    /// TOML format (`.toml`).
    Toml,
}

impl DslFormat {
    /// Guess the format from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(DslFormat::Yaml),
            "json" => Some(DslFormat::Json),
            "toml" => Some(DslFormat::Toml),
            _ => None,
        }
    }
}

/// Parse DSL content into WorkflowSchema and check its version.
pub fn parse_dsl(content: &str, format: DslFormat) -> Result<WorkflowSchema, WorkflowError> {
    let schema = parse_value(content, format)?;
    check_version(&schema)?;
    Ok(schema)
}

/// Deserialize any DSL-shaped document (workflow, config) from text.
pub(crate) fn parse_value<T>(content: &str, format: DslFormat) -> Result<T, WorkflowError>
where
    T: serde::de::DeserializeOwned,
{
    match format {
        DslFormat::Yaml => serde_saphyr::from_str_with_options(content, yaml_options())
            .map_err(|e| WorkflowError::DslParseError(e.to_string())),
        DslFormat::Json => serde_json::from_str(content)
            .map_err(|e| WorkflowError::DslParseError(e.to_string())),
        DslFormat::Toml => {
            // Go through serde_json::Value so fields typed as Value keep their shape.
            let toml_val: toml::Value = toml::from_str(content)
                .map_err(|e| WorkflowError::DslParseError(e.to_string()))?;
            let json_val = toml_value_to_json(toml_val);
            serde_json::from_value(json_val)
                .map_err(|e| WorkflowError::DslParseError(e.to_string()))
        }
    }
}

/// YAML 1.2 core-schema booleans: only `true`/`false`. Plain words such as
/// `n`, `no` or `on` stay strings in variable names and selectors.
fn yaml_options() -> serde_saphyr::Options {
    serde_saphyr::Options {
        strict_booleans: true,
        ..serde_saphyr::Options::default()
    }
}

fn check_version(schema: &WorkflowSchema) -> Result<(), WorkflowError> {
    if SUPPORTED_DSL_VERSIONS.contains(&schema.version.as_str()) {
        Ok(())
    } else {
        Err(WorkflowError::UnsupportedVersion {
            found: schema.version.clone(),
            supported: SUPPORTED_DSL_VERSIONS.join(", "),
        })
    }
}

/// Convert a [`toml::Value`] into a [`serde_json::Value`].
///
/// TOML has no datetime in JSON, so `Datetime` values are stringified.
fn toml_value_to_json(val: toml::Value) -> serde_json::Value {
    match val {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_value_to_json).collect())
        }
        toml::Value::Table(tbl) => serde_json::Value::Object(
            tbl.into_iter()
                .map(|(k, v)| (k, toml_value_to_json(v)))
                .collect(),
        ),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
    }
}
