//! YAML document model for administering reference data.
//!
//! A document is a YAML mapping of *instructions*, each holding a list of
//! items. Four instructions are recognised:
//!
//! ```yaml
//! define entities:
//!   - name: VAT Rate
//!     version: 1
//!     fields:
//!       - name: type
//!         type: TEXT
//!       - name: rate
//!         type: NUMERIC
//!     identified_by:
//!       - type
//!
//! add projections:
//!   - name: VAT Rates
//!     version: 1
//!     dependencies:
//!       - entity: VAT Rate
//!         version: 1
//!
//! add change set:
//!   - effective: 2020-04-05T00:00:00Z
//!     description: UK VAT rates
//!     frames:
//!       - entity: VAT Rate
//!         version: 1
//!         action: POST
//!         data:
//!           - type: standard
//!             rate: 0.10
//!
//! add hooks:
//!   - name: sns-vat
//!     event: VAT Rates Changed
//!     projection: VAT Rates
//!     version: 1
//! ```
//!
//! Documents are validated structurally before anything is executed; every
//! violation is reported as a pointer-style message such as
//! `/add_change_set/0 must have required property 'effective'` so external
//! tooling can match on it.

mod validator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::FrameAction;

/// Errors raised while parsing, validating, or compiling a DSL document.
#[derive(Debug, Error)]
pub enum DslError {
    /// The document failed a structural check. The message carries the
    /// `/<instruction>/<index>[/<path>]` pointer of the offending node.
    #[error("{0}")]
    Validation(String),

    /// The document is not well-formed YAML.
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A frame or dependency names an entity that has not been defined.
    #[error("{pointer} references unknown entity '{name}' v{version}")]
    UnknownEntity {
        pointer: String,
        name: String,
        version: i32,
    },

    /// A hook names a projection that has not been added.
    #[error("{pointer} references unknown projection '{name}' v{version}")]
    UnknownProjection {
        pointer: String,
        name: String,
        version: i32,
    },
}

/// One top-level instruction, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    DefineEntities(Vec<EntityDef>),
    AddProjections(Vec<ProjectionDef>),
    AddChangeSets(Vec<ChangeSetDef>),
    AddHooks(Vec<HookDef>),
}

impl Instruction {
    /// The instruction keyword as written in a document.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::DefineEntities(_) => "define entities",
            Instruction::AddProjections(_) => "add projections",
            Instruction::AddChangeSets(_) => "add change set",
            Instruction::AddHooks(_) => "add hooks",
        }
    }
}

/// Declaration of one entity schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub version: i32,
    pub fields: Vec<FieldDef>,
    pub identified_by: Vec<String>,
}

/// One column of an entity. The type is an opaque database column type,
/// validated by the database at DDL time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

/// Declaration of a projection and the entity versions it depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionDef {
    pub name: String,
    pub version: i32,
    pub dependencies: Vec<EntityRef>,
}

/// Reference to an entity version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity: String,
    pub version: i32,
}

/// One change set with its data frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSetDef {
    pub description: Option<String>,
    pub effective: DateTime<Utc>,
    pub frames: Vec<FrameDef>,
}

/// One POST or DELETE of rows for an entity version within a change set.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDef {
    pub entity: String,
    pub version: i32,
    pub action: FrameAction,
    pub data: Vec<DataRow>,
}

/// One payload row: field name to scalar value, in document order.
pub type DataRow = Vec<(String, ScalarValue)>;

/// A scalar payload value. Numbers keep their literal rendering so the
/// database performs the final coercion to the declared column type.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Number(String),
    String(String),
}

/// Declaration of a hook. `projection`/`version` omitted together makes a
/// wildcard hook that fires for every affected projection.
#[derive(Debug, Clone, PartialEq)]
pub struct HookDef {
    pub name: String,
    pub event: String,
    pub projection: Option<EntityRefLike>,
}

/// A `{name, version}` pair naming a projection.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRefLike {
    pub name: String,
    pub version: i32,
}

/// Parse and validate a YAML document into typed instructions.
///
/// The whole document is validated before anything is returned; the first
/// violation aborts with a pointer-style [`DslError::Validation`].
pub fn parse_document(yaml: &str) -> Result<Vec<Instruction>, DslError> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    validator::validate_document(&value)
}

/// Canonical identifier for an entity name: lowercased, with runs of
/// non-alphanumeric characters collapsed to single underscores.
/// `VAT Rate` becomes `vat_rate`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_separator = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            out.push('_');
            last_was_separator = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Whether a string is usable verbatim as an unquoted SQL identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_collapses_separators() {
        assert_eq!(snake_case("VAT Rate"), "vat_rate");
        assert_eq!(snake_case("Park Opening  Times"), "park_opening_times");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert_eq!(snake_case("Trailing-"), "trailing");
    }

    #[test]
    fn identifier_check_rejects_uppercase_and_leading_digits() {
        assert!(is_valid_identifier("rate"));
        assert!(is_valid_identifier("_rate2"));
        assert!(!is_valid_identifier("Rate"));
        assert!(!is_valid_identifier("2rate"));
        assert!(!is_valid_identifier("ra-te"));
        assert!(!is_valid_identifier(""));
    }
}
