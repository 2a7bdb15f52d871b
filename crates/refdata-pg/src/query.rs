//! Read operations.
//!
//! All functions take the connection of an enclosing transaction (see
//! [`crate::transaction`]) so concurrent writers never tear a snapshot.
//! The authoritative order of history is `(effective ASC, id ASC)`.

use chrono::{DateTime, Utc};
use refdata_core::model::{ChangeSet, Projection};
use sqlx::{FromRow, PgConnection};

#[derive(FromRow)]
struct ProjectionRow {
    id: i32,
    name: String,
    version: i32,
}

impl From<ProjectionRow> for Projection {
    fn from(row: ProjectionRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            version: row.version,
        }
    }
}

#[derive(FromRow)]
struct ChangeSetRow {
    id: i32,
    description: Option<String>,
    effective: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    entity_tag: String,
}

impl From<ChangeSetRow> for ChangeSet {
    fn from(row: ChangeSetRow) -> Self {
        Self {
            id: row.id,
            description: row.description,
            effective: row.effective,
            last_modified: row.last_modified,
            entity_tag: row.entity_tag,
        }
    }
}

/// Every projection, ordered by `(name, version)`.
pub(crate) async fn get_projections(
    conn: &mut PgConnection,
) -> Result<Vec<Projection>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ProjectionRow>(
        "SELECT id, name, version FROM fby_projection ORDER BY name, version",
    )
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(Projection::from).collect())
}

/// One projection by name and version.
pub(crate) async fn get_projection(
    conn: &mut PgConnection,
    name: &str,
    version: i32,
) -> Result<Option<Projection>, sqlx::Error> {
    let row = sqlx::query_as::<_, ProjectionRow>(
        "SELECT id, name, version FROM fby_projection WHERE name = $1 AND version = $2",
    )
    .bind(name)
    .bind(version)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(Projection::from))
}

/// Every change set that touches any entity the projection depends on, in
/// `(effective ASC, id ASC)` order, de-duplicated by change-set id.
pub(crate) async fn get_change_log(
    conn: &mut PgConnection,
    projection: &Projection,
) -> Result<Vec<ChangeSet>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ChangeSetRow>(
        r#"
        SELECT DISTINCT c.id, c.description, c.effective, c.last_modified, c.entity_tag
        FROM fby_change_set c
        INNER JOIN fby_data_frame f ON f.change_set_id = c.id
        INNER JOIN fby_projection_entity pe ON pe.entity_id = f.entity_id
        WHERE pe.projection_id = $1
        ORDER BY c.effective ASC, c.id ASC
        "#,
    )
    .bind(projection.id)
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(ChangeSet::from).collect())
}

/// One change set by id.
pub(crate) async fn get_change_set(
    conn: &mut PgConnection,
    id: i32,
) -> Result<Option<ChangeSet>, sqlx::Error> {
    let row = sqlx::query_as::<_, ChangeSetRow>(
        "SELECT id, description, effective, last_modified, entity_tag FROM fby_change_set WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(ChangeSet::from))
}

/// The last entry of the projection's change log whose effective date is not
/// in the future.
pub(crate) async fn get_current_change_set(
    conn: &mut PgConnection,
    projection: &Projection,
) -> Result<Option<ChangeSet>, sqlx::Error> {
    let row = sqlx::query_as::<_, ChangeSetRow>(
        r#"
        SELECT DISTINCT c.id, c.description, c.effective, c.last_modified, c.entity_tag
        FROM fby_change_set c
        INNER JOIN fby_data_frame f ON f.change_set_id = c.id
        INNER JOIN fby_projection_entity pe ON pe.entity_id = f.entity_id
        WHERE pe.projection_id = $1
          AND c.effective <= now()
        ORDER BY c.effective DESC, c.id DESC
        LIMIT 1
        "#,
    )
    .bind(projection.id)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(ChangeSet::from))
}
