//! Desired-state extraction.
//!
//! Defaulting, in order:
//! - `tableName` from the spec, else the declaration's name
//! - `project` from the spec, else the process-wide default, else an error
//! - `dataset` from the spec, else an error
//!
//! An empty string counts as unset.

use std::fmt;

use serde_json::{Map, Value};

use crate::{ConfigError, Declaration};

/// Defaulted `(project, dataset, tableName)` for one declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DesiredState {
    pub project: String,
    pub dataset: String,
    pub table_name: String,
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table_name)
    }
}

/// Derive the desired state of a declaration.
pub fn extract(
    declaration: &Declaration,
    default_project: Option<&str>,
) -> Result<DesiredState, ConfigError> {
    let spec = &declaration.spec;

    let table_name = string_field(spec, "tableName")?
        .unwrap_or(declaration.metadata.name.as_str())
        .to_string();

    let project = string_field(spec, "project")?
        .or(default_project.filter(|p| !p.is_empty()))
        .ok_or(ConfigError::ProjectUnset)?
        .to_string();

    let dataset = string_field(spec, "dataset")?
        .ok_or(ConfigError::DatasetUnset)?
        .to_string();

    Ok(DesiredState {
        project,
        dataset,
        table_name,
    })
}

fn string_field<'a>(
    spec: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, ConfigError> {
    match spec.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ConfigError::InvalidField { field }),
    }
}
