//! Structural validation of DSL documents.
//!
//! Validation walks the raw YAML value and either returns fully typed
//! [`Instruction`]s or the first violation as a deterministic pointer
//! message, e.g. `/add_change_set/0 must have required property 'effective'`.
//! Nothing is executed until the whole document has passed.

use chrono::{DateTime, Utc};
use serde_yaml::{Mapping, Value};

use super::{
    is_valid_identifier, snake_case, ChangeSetDef, DataRow, DslError, EntityDef, EntityRef,
    EntityRefLike, FieldDef, FrameDef, HookDef, Instruction, ProjectionDef, ScalarValue,
};
use crate::model::FrameAction;

const INSTRUCTIONS: [&str; 4] = [
    "define entities",
    "add projections",
    "add change set",
    "add hooks",
];

pub(super) fn validate_document(value: &Value) -> Result<Vec<Instruction>, DslError> {
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        Value::Null => return Ok(Vec::new()),
        _ => {
            return Err(violation(
                "/",
                "must be a mapping of instructions to lists of items",
            ))
        }
    };

    let mut instructions = Vec::with_capacity(mapping.len());
    for (key, items) in mapping {
        let keyword = match key.as_str() {
            Some(keyword) if INSTRUCTIONS.contains(&keyword) => keyword,
            _ => {
                let shown = key.as_str().map(snake_case).unwrap_or_default();
                return Err(violation(
                    &format!("/{shown}"),
                    "must be one of 'define entities', 'add projections', 'add change set', 'add hooks'",
                ));
            }
        };

        let pointer = format!("/{}", snake_case(keyword));
        let items = as_array(items, &pointer)?;
        let instruction = match keyword {
            "define entities" => Instruction::DefineEntities(validate_entities(items, &pointer)?),
            "add projections" => {
                Instruction::AddProjections(validate_projections(items, &pointer)?)
            }
            "add change set" => Instruction::AddChangeSets(validate_change_sets(items, &pointer)?),
            "add hooks" => Instruction::AddHooks(validate_hooks(items, &pointer)?),
            _ => unreachable!("keyword checked against INSTRUCTIONS"),
        };
        instructions.push(instruction);
    }

    Ok(instructions)
}

fn validate_entities(items: &[Value], base: &str) -> Result<Vec<EntityDef>, DslError> {
    let mut entities = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let pointer = format!("{base}/{index}");
        let mapping = as_object(item, &pointer)?;

        let name = required_string(mapping, &pointer, "name")?;
        if snake_case(&name).is_empty() {
            return Err(violation(
                &format!("{pointer}/name"),
                "must contain at least one alphanumeric character",
            ));
        }
        let version = required_integer(mapping, &pointer, "version")?;

        let fields_value = require(mapping, &pointer, "fields")?;
        let fields_pointer = format!("{pointer}/fields");
        let field_items = as_non_empty_array(fields_value, &fields_pointer)?;
        let mut fields: Vec<FieldDef> = Vec::with_capacity(field_items.len());
        for (field_index, field_item) in field_items.iter().enumerate() {
            let field_pointer = format!("{fields_pointer}/{field_index}");
            let field_mapping = as_object(field_item, &field_pointer)?;
            let field_name = required_string(field_mapping, &field_pointer, "name")?;
            if !is_valid_identifier(&field_name) {
                return Err(violation(
                    &format!("{field_pointer}/name"),
                    "must be a valid identifier",
                ));
            }
            if fields.iter().any(|f| f.name == field_name) {
                return Err(violation(
                    &field_pointer,
                    &format!("must not duplicate field '{field_name}'"),
                ));
            }
            let field_type = required_string(field_mapping, &field_pointer, "type")?;
            fields.push(FieldDef {
                name: field_name,
                field_type,
            });
        }

        let identified_value = require(mapping, &pointer, "identified_by")?;
        let identified_pointer = format!("{pointer}/identified_by");
        let identifier_items = as_non_empty_array(identified_value, &identified_pointer)?;
        let mut identified_by = Vec::with_capacity(identifier_items.len());
        for (id_index, id_item) in identifier_items.iter().enumerate() {
            let id_pointer = format!("{identified_pointer}/{id_index}");
            let identifier = as_string(id_item, &id_pointer)?;
            if !fields.iter().any(|f| f.name == identifier) {
                return Err(violation(&id_pointer, "must reference a declared field"));
            }
            identified_by.push(identifier);
        }

        entities.push(EntityDef {
            name,
            version,
            fields,
            identified_by,
        });
    }
    Ok(entities)
}

fn validate_projections(items: &[Value], base: &str) -> Result<Vec<ProjectionDef>, DslError> {
    let mut projections = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let pointer = format!("{base}/{index}");
        let mapping = as_object(item, &pointer)?;

        let name = required_string(mapping, &pointer, "name")?;
        let version = required_integer(mapping, &pointer, "version")?;

        let dependencies_value = require(mapping, &pointer, "dependencies")?;
        let dependencies_pointer = format!("{pointer}/dependencies");
        let dependency_items = as_non_empty_array(dependencies_value, &dependencies_pointer)?;
        let mut dependencies = Vec::with_capacity(dependency_items.len());
        for (dep_index, dep_item) in dependency_items.iter().enumerate() {
            let dep_pointer = format!("{dependencies_pointer}/{dep_index}");
            let dep_mapping = as_object(dep_item, &dep_pointer)?;
            dependencies.push(EntityRef {
                entity: required_string(dep_mapping, &dep_pointer, "entity")?,
                version: required_integer(dep_mapping, &dep_pointer, "version")?,
            });
        }

        projections.push(ProjectionDef {
            name,
            version,
            dependencies,
        });
    }
    Ok(projections)
}

fn validate_change_sets(items: &[Value], base: &str) -> Result<Vec<ChangeSetDef>, DslError> {
    let mut change_sets = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let pointer = format!("{base}/{index}");
        let mapping = as_object(item, &pointer)?;

        let effective_value = require(mapping, &pointer, "effective")?;
        let effective_pointer = format!("{pointer}/effective");
        let effective_text = as_string(effective_value, &effective_pointer)?;
        let effective = parse_timestamp(&effective_text)
            .ok_or_else(|| violation(&effective_pointer, "must be an RFC 3339 timestamp"))?;

        let description = match mapping.get("description") {
            None | Some(Value::Null) => None,
            Some(value) => Some(as_string(value, &format!("{pointer}/description"))?),
        };

        let frames_value = require(mapping, &pointer, "frames")?;
        let frames_pointer = format!("{pointer}/frames");
        let frame_items = as_non_empty_array(frames_value, &frames_pointer)?;
        let mut frames = Vec::with_capacity(frame_items.len());
        for (frame_index, frame_item) in frame_items.iter().enumerate() {
            frames.push(validate_frame(
                frame_item,
                &format!("{frames_pointer}/{frame_index}"),
            )?);
        }

        change_sets.push(ChangeSetDef {
            description,
            effective,
            frames,
        });
    }
    Ok(change_sets)
}

fn validate_frame(item: &Value, pointer: &str) -> Result<FrameDef, DslError> {
    let mapping = as_object(item, pointer)?;

    let entity = required_string(mapping, pointer, "entity")?;
    let version = required_integer(mapping, pointer, "version")?;

    let action_value = require(mapping, pointer, "action")?;
    let action_pointer = format!("{pointer}/action");
    let action = match action_value.as_str() {
        Some("POST") => FrameAction::Post,
        Some("DELETE") => FrameAction::Delete,
        _ => {
            return Err(violation(
                &action_pointer,
                "must be equal to one of the allowed values 'POST', 'DELETE'",
            ))
        }
    };

    let data_value = require(mapping, pointer, "data")?;
    let data_pointer = format!("{pointer}/data");
    let row_items = as_non_empty_array(data_value, &data_pointer)?;
    let mut data = Vec::with_capacity(row_items.len());
    for (row_index, row_item) in row_items.iter().enumerate() {
        let row_pointer = format!("{data_pointer}/{row_index}");
        let row_mapping = as_object(row_item, &row_pointer)?;
        let mut row: DataRow = Vec::with_capacity(row_mapping.len());
        for (key, value) in row_mapping {
            let Some(field) = key.as_str().filter(|k| is_valid_identifier(k)) else {
                return Err(violation(
                    &row_pointer,
                    "must use valid identifiers as field names",
                ));
            };
            let scalar = match value {
                Value::Null => ScalarValue::Null,
                Value::Bool(b) => ScalarValue::Bool(*b),
                Value::Number(n) => ScalarValue::Number(n.to_string()),
                Value::String(s) => ScalarValue::String(s.clone()),
                _ => {
                    return Err(violation(
                        &format!("{row_pointer}/{field}"),
                        "must be a scalar value",
                    ))
                }
            };
            row.push((field.to_string(), scalar));
        }
        data.push(row);
    }

    Ok(FrameDef {
        entity,
        version,
        action,
        data,
    })
}

fn validate_hooks(items: &[Value], base: &str) -> Result<Vec<HookDef>, DslError> {
    let mut hooks = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let pointer = format!("{base}/{index}");
        let mapping = as_object(item, &pointer)?;

        let name = required_string(mapping, &pointer, "name")?;
        let event = required_string(mapping, &pointer, "event")?;

        let projection = match (mapping.get("projection"), mapping.get("version")) {
            (None, None) => None,
            (Some(projection_value), Some(version_value)) => Some(EntityRefLike {
                name: as_string(projection_value, &format!("{pointer}/projection"))?,
                version: as_integer(version_value, &format!("{pointer}/version"))?,
            }),
            _ => {
                return Err(violation(
                    &pointer,
                    "must have both 'projection' and 'version' or neither",
                ))
            }
        };

        hooks.push(HookDef {
            name,
            event,
            projection,
        });
    }
    Ok(hooks)
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn violation(pointer: &str, requirement: &str) -> DslError {
    DslError::Validation(format!("{pointer} {requirement}"))
}

fn require<'a>(mapping: &'a Mapping, pointer: &str, key: &str) -> Result<&'a Value, DslError> {
    match mapping.get(key) {
        Some(Value::Null) | None => Err(violation(
            pointer,
            &format!("must have required property '{key}'"),
        )),
        Some(value) => Ok(value),
    }
}

fn required_string(mapping: &Mapping, pointer: &str, key: &str) -> Result<String, DslError> {
    let value = require(mapping, pointer, key)?;
    as_string(value, &format!("{pointer}/{key}"))
}

fn required_integer(mapping: &Mapping, pointer: &str, key: &str) -> Result<i32, DslError> {
    let value = require(mapping, pointer, key)?;
    as_integer(value, &format!("{pointer}/{key}"))
}

fn as_object<'a>(value: &'a Value, pointer: &str) -> Result<&'a Mapping, DslError> {
    value
        .as_mapping()
        .ok_or_else(|| violation(pointer, "must be an object"))
}

fn as_array<'a>(value: &'a Value, pointer: &str) -> Result<&'a [Value], DslError> {
    value
        .as_sequence()
        .map(Vec::as_slice)
        .ok_or_else(|| violation(pointer, "must be an array"))
}

fn as_non_empty_array<'a>(value: &'a Value, pointer: &str) -> Result<&'a [Value], DslError> {
    let items = as_array(value, pointer)?;
    if items.is_empty() {
        return Err(violation(pointer, "must be a non-empty array"));
    }
    Ok(items)
}

fn as_string(value: &Value, pointer: &str) -> Result<String, DslError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| violation(pointer, "must be a string"))
}

fn as_integer(value: &Value, pointer: &str) -> Result<i32, DslError> {
    value
        .as_i64()
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| violation(pointer, "must be an integer"))
}
