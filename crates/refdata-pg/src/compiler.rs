//! DSL-to-SQL compiler.
//!
//! Takes a validated document and executes it against the connection of the
//! enclosing migration transaction: either every instruction commits or none
//! does. Payload rows are compiled into strongly typed side tables at
//! migration time; the runtime query path never carries dynamic maps.
//!
//! Payload scalars are rendered as quoted SQL literals so the database
//! performs the final coercion to the declared column type. Column types are
//! opaque to the compiler; an unknown type surfaces as the database's own
//! DDL error.

use refdata_core::dsl::{
    self, ChangeSetDef, DslError, EntityDef, FrameDef, HookDef, Instruction, ProjectionDef,
    ScalarValue,
};
use sqlx::PgConnection;
use tracing::debug;

use crate::migrations::MigrationError;

/// Parse, validate and execute one YAML document.
pub(crate) async fn apply_document(
    conn: &mut PgConnection,
    yaml: &str,
) -> Result<(), MigrationError> {
    let instructions = dsl::parse_document(yaml)?;
    for instruction in &instructions {
        apply_instruction(conn, instruction).await?;
    }
    Ok(())
}

async fn apply_instruction(
    conn: &mut PgConnection,
    instruction: &Instruction,
) -> Result<(), MigrationError> {
    debug!(instruction = instruction.keyword(), "applying instruction");
    match instruction {
        Instruction::DefineEntities(entities) => {
            for entity in entities {
                define_entity(conn, entity).await?;
            }
        }
        Instruction::AddProjections(projections) => {
            for (index, projection) in projections.iter().enumerate() {
                add_projection(conn, index, projection).await?;
            }
        }
        Instruction::AddChangeSets(change_sets) => {
            for (index, change_set) in change_sets.iter().enumerate() {
                add_change_set(conn, index, change_set).await?;
            }
        }
        Instruction::AddHooks(hooks) => {
            for (index, hook) in hooks.iter().enumerate() {
                add_hook(conn, index, hook).await?;
            }
        }
    }
    Ok(())
}

async fn define_entity(conn: &mut PgConnection, entity: &EntityDef) -> Result<(), MigrationError> {
    sqlx::query("INSERT INTO fby_entity (name, version) VALUES ($1, $2) ON CONFLICT (name, version) DO NOTHING")
        .bind(&entity.name)
        .bind(entity.version)
        .execute(&mut *conn)
        .await?;

    sqlx::raw_sql(&build_side_table(entity))
        .execute(&mut *conn)
        .await?;
    sqlx::raw_sql(&build_aggregate_function(entity))
        .execute(&mut *conn)
        .await?;

    debug!(entity = %entity.name, version = entity.version, "entity defined");
    Ok(())
}

async fn add_projection(
    conn: &mut PgConnection,
    index: usize,
    projection: &ProjectionDef,
) -> Result<(), MigrationError> {
    let projection_id: i32 = sqlx::query_scalar(
        "INSERT INTO fby_projection (name, version) VALUES ($1, $2) RETURNING id",
    )
    .bind(&projection.name)
    .bind(projection.version)
    .fetch_one(&mut *conn)
    .await?;

    for (dep_index, dependency) in projection.dependencies.iter().enumerate() {
        let entity_id = lookup_entity(conn, &dependency.entity, dependency.version)
            .await?
            .ok_or_else(|| DslError::UnknownEntity {
                pointer: format!("/add_projections/{index}/dependencies/{dep_index}"),
                name: dependency.entity.clone(),
                version: dependency.version,
            })?;
        sqlx::query("INSERT INTO fby_projection_entity (projection_id, entity_id) VALUES ($1, $2)")
            .bind(projection_id)
            .bind(entity_id)
            .execute(&mut *conn)
            .await?;
    }

    debug!(projection = %projection.name, version = projection.version, "projection added");
    Ok(())
}

async fn add_change_set(
    conn: &mut PgConnection,
    index: usize,
    change_set: &ChangeSetDef,
) -> Result<(), MigrationError> {
    let change_set_id: i32 = sqlx::query_scalar(
        "INSERT INTO fby_change_set (description, effective) VALUES ($1, $2) RETURNING id",
    )
    .bind(&change_set.description)
    .bind(change_set.effective)
    .fetch_one(&mut *conn)
    .await?;

    for (frame_index, frame) in change_set.frames.iter().enumerate() {
        let entity_id = lookup_entity(conn, &frame.entity, frame.version)
            .await?
            .ok_or_else(|| DslError::UnknownEntity {
                pointer: format!("/add_change_set/{index}/frames/{frame_index}"),
                name: frame.entity.clone(),
                version: frame.version,
            })?;
        add_frame(conn, change_set_id, entity_id, frame).await?;
    }

    debug!(
        change_set_id,
        frames = change_set.frames.len(),
        "change set added"
    );
    Ok(())
}

/// Each payload row becomes its own data frame plus one side-table row
/// keyed by the frame id.
async fn add_frame(
    conn: &mut PgConnection,
    change_set_id: i32,
    entity_id: i32,
    frame: &FrameDef,
) -> Result<(), MigrationError> {
    let table = side_table_name(&frame.entity, frame.version);
    for row in &frame.data {
        let frame_id: i32 = sqlx::query_scalar(
            "INSERT INTO fby_data_frame (change_set_id, entity_id, action) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(change_set_id)
        .bind(entity_id)
        .bind(frame.action.as_str())
        .fetch_one(&mut *conn)
        .await?;

        let mut columns = vec!["rdf_frame_id".to_string()];
        let mut values = vec![frame_id.to_string()];
        for (field, value) in row {
            columns.push(field.clone());
            values.push(render_literal(value));
        }
        let insert = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            values.join(", ")
        );
        sqlx::raw_sql(&insert).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn add_hook(
    conn: &mut PgConnection,
    index: usize,
    hook: &HookDef,
) -> Result<(), MigrationError> {
    let projection_id = match &hook.projection {
        None => None,
        Some(projection) => {
            let id: Option<i32> =
                sqlx::query_scalar("SELECT id FROM fby_projection WHERE name = $1 AND version = $2")
                    .bind(&projection.name)
                    .bind(projection.version)
                    .fetch_optional(&mut *conn)
                    .await?;
            Some(id.ok_or_else(|| DslError::UnknownProjection {
                pointer: format!("/add_hooks/{index}"),
                name: projection.name.clone(),
                version: projection.version,
            })?)
        }
    };

    sqlx::query("INSERT INTO fby_hook (name, event, projection_id) VALUES ($1, $2, $3)")
        .bind(&hook.name)
        .bind(&hook.event)
        .bind(projection_id)
        .execute(&mut *conn)
        .await?;

    debug!(hook = %hook.name, event = %hook.event, wildcard = projection_id.is_none(), "hook added");
    Ok(())
}

async fn lookup_entity(
    conn: &mut PgConnection,
    name: &str,
    version: i32,
) -> Result<Option<i32>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM fby_entity WHERE name = $1 AND version = $2")
        .bind(name)
        .bind(version)
        .fetch_optional(conn)
        .await
}

/// `VAT Rate` v1 lives in `vat_rate_v1`.
fn side_table_name(entity_name: &str, version: i32) -> String {
    format!("{}_v{}", dsl::snake_case(entity_name), version)
}

fn build_side_table(entity: &EntityDef) -> String {
    let table = side_table_name(&entity.name, entity.version);
    let mut columns = vec![
        "rdf_frame_id INTEGER PRIMARY KEY REFERENCES fby_data_frame (id) ON DELETE CASCADE"
            .to_string(),
    ];
    for field in &entity.fields {
        // Identifier columns are mandatory even on DELETE frames.
        let not_null = if entity.identified_by.contains(&field.name) {
            " NOT NULL"
        } else {
            ""
        };
        columns.push(format!("{} {}{}", field.name, field.field_type, not_null));
    }
    format!("CREATE TABLE {table} (\n    {}\n)", columns.join(",\n    "))
}

/// The point-in-time aggregate: for each identifier tuple, the last frame in
/// `(effective, change set id, frame id)` order over change sets at or
/// before the argument; DELETE frames remove the tuple from the result.
fn build_aggregate_function(entity: &EntityDef) -> String {
    let table = side_table_name(&entity.name, entity.version);
    let returns = entity
        .fields
        .iter()
        .map(|f| format!("{} {}", f.name, f.field_type))
        .collect::<Vec<_>>()
        .join(", ");
    let outer_columns = entity
        .fields
        .iter()
        .map(|f| format!("x.{}", f.name))
        .collect::<Vec<_>>()
        .join(", ");
    let inner_columns = entity
        .fields
        .iter()
        .map(|f| format!("t.{}", f.name))
        .collect::<Vec<_>>()
        .join(", ");
    let partition = entity
        .identified_by
        .iter()
        .map(|f| format!("t.{f}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"CREATE OR REPLACE FUNCTION get_{table}_aggregate(p_change_set_id INTEGER)
RETURNS TABLE ({returns}) AS $$
BEGIN
    RETURN QUERY
    SELECT {outer_columns}
    FROM (
        SELECT {inner_columns}, f.action,
               row_number() OVER (
                   PARTITION BY {partition}
                   ORDER BY c.effective DESC, c.id DESC, f.id DESC
               ) AS rn
        FROM {table} t
        INNER JOIN fby_data_frame f ON f.id = t.rdf_frame_id
        INNER JOIN fby_change_set c ON c.id = f.change_set_id
        WHERE (c.effective, c.id) <= (
            SELECT cs.effective, cs.id FROM fby_change_set cs WHERE cs.id = p_change_set_id
        )
    ) x
    WHERE x.rn = 1 AND x.action <> 'DELETE';
END;
$$ LANGUAGE plpgsql"#
    )
}

/// Render a payload scalar as a SQL literal. Everything except NULL is
/// quoted, leaving the cast to the target column type to the database.
fn render_literal(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Null => "NULL".to_string(),
        ScalarValue::Bool(true) => "'true'".to_string(),
        ScalarValue::Bool(false) => "'false'".to_string(),
        ScalarValue::Number(n) => format!("'{n}'"),
        ScalarValue::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refdata_core::dsl::FieldDef;

    fn vat_rate() -> EntityDef {
        EntityDef {
            name: "VAT Rate".to_string(),
            version: 1,
            fields: vec![
                FieldDef {
                    name: "type".to_string(),
                    field_type: "TEXT".to_string(),
                },
                FieldDef {
                    name: "rate".to_string(),
                    field_type: "DOUBLE PRECISION".to_string(),
                },
            ],
            identified_by: vec!["type".to_string()],
        }
    }

    #[test]
    fn side_table_marks_identifiers_not_null() {
        let ddl = build_side_table(&vat_rate());
        assert!(ddl.starts_with("CREATE TABLE vat_rate_v1 ("));
        assert!(ddl.contains(
            "rdf_frame_id INTEGER PRIMARY KEY REFERENCES fby_data_frame (id) ON DELETE CASCADE"
        ));
        assert!(ddl.contains("type TEXT NOT NULL"));
        assert!(ddl.contains("rate DOUBLE PRECISION,") || ddl.ends_with("rate DOUBLE PRECISION\n)"));
    }

    #[test]
    fn aggregate_function_partitions_by_identifiers() {
        let sql = build_aggregate_function(&vat_rate());
        assert!(sql.contains("FUNCTION get_vat_rate_v1_aggregate(p_change_set_id INTEGER)"));
        assert!(sql.contains("RETURNS TABLE (type TEXT, rate DOUBLE PRECISION)"));
        assert!(sql.contains("PARTITION BY t.type"));
        assert!(sql.contains("ORDER BY c.effective DESC, c.id DESC, f.id DESC"));
        assert!(sql.contains("WHERE x.rn = 1 AND x.action <> 'DELETE'"));
    }

    #[test]
    fn aggregate_function_bounds_history_at_the_argument() {
        let sql = build_aggregate_function(&vat_rate());
        assert!(sql.contains(
            "WHERE (c.effective, c.id) <= (\n            SELECT cs.effective, cs.id FROM fby_change_set cs WHERE cs.id = p_change_set_id\n        )"
        ));
    }

    #[test]
    fn literals_are_quoted_and_escaped() {
        assert_eq!(render_literal(&ScalarValue::Null), "NULL");
        assert_eq!(render_literal(&ScalarValue::Bool(true)), "'true'");
        assert_eq!(
            render_literal(&ScalarValue::Number("0.10".to_string())),
            "'0.10'"
        );
        assert_eq!(
            render_literal(&ScalarValue::String("O'Brien".to_string())),
            "'O''Brien'"
        );
    }

    #[test]
    fn side_table_names_are_snake_cased() {
        assert_eq!(side_table_name("VAT Rate", 1), "vat_rate_v1");
        assert_eq!(side_table_name("Park Opening Times", 3), "park_opening_times_v3");
    }
}
