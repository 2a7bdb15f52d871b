//! Framework storage schema.
//!
//! Tables, triggers and stored routines owned by the framework, all prefixed
//! `fby_`. The bootstrap is idempotent (`IF NOT EXISTS` / `CREATE OR
//! REPLACE`) and runs inside one transaction at `init`, before any user
//! migrations.
//!
//! # Schema
//!
//! ```text
//! fby_projection --< fby_projection_entity >-- fby_entity
//!       |                                          |
//!       |                                     fby_data_frame >-- fby_change_set
//!       |                                          |
//! fby_hook --< fby_notification                <entity>_v<n> side tables
//! ```
//!
//! An AFTER INSERT trigger on `fby_data_frame` schedules a notification for
//! every hook whose projection depends on the frame's entity, so committing
//! a change set produces work for exactly the affected hooks.

use sqlx::{Executor, PgConnection};
use tracing::debug;

const TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS fby_projection (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    version INTEGER NOT NULL,
    CONSTRAINT fby_projection_name_version_uq UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS fby_entity (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    version INTEGER NOT NULL,
    CONSTRAINT fby_entity_name_version_uq UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS fby_projection_entity (
    projection_id INTEGER NOT NULL REFERENCES fby_projection (id) ON DELETE CASCADE,
    entity_id INTEGER NOT NULL REFERENCES fby_entity (id) ON DELETE RESTRICT,
    PRIMARY KEY (projection_id, entity_id)
);

CREATE TABLE IF NOT EXISTS fby_change_set (
    id SERIAL PRIMARY KEY,
    description TEXT,
    effective TIMESTAMPTZ NOT NULL,
    last_modified TIMESTAMPTZ NOT NULL DEFAULT now(),
    entity_tag CHAR(20) NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS fby_change_set_effective_idx
    ON fby_change_set (effective, id);

CREATE TABLE IF NOT EXISTS fby_data_frame (
    id SERIAL PRIMARY KEY,
    change_set_id INTEGER NOT NULL REFERENCES fby_change_set (id),
    entity_id INTEGER NOT NULL REFERENCES fby_entity (id) ON DELETE RESTRICT,
    action TEXT NOT NULL CHECK (action IN ('POST', 'DELETE'))
);

CREATE INDEX IF NOT EXISTS fby_data_frame_change_set_idx ON fby_data_frame (change_set_id);
CREATE INDEX IF NOT EXISTS fby_data_frame_entity_idx ON fby_data_frame (entity_id);

CREATE TABLE IF NOT EXISTS fby_hook (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    event TEXT NOT NULL,
    projection_id INTEGER REFERENCES fby_projection (id) ON DELETE CASCADE,
    CONSTRAINT fby_hook_name_event_projection_uq UNIQUE (name, event, projection_id)
);

CREATE TABLE IF NOT EXISTS fby_notification (
    id BIGSERIAL PRIMARY KEY,
    hook_id INTEGER NOT NULL REFERENCES fby_hook (id) ON DELETE CASCADE,
    projection_id INTEGER NOT NULL REFERENCES fby_projection (id) ON DELETE CASCADE,
    scheduled_for TIMESTAMPTZ NOT NULL DEFAULT now(),
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'PENDING' CHECK (status IN ('PENDING', 'OK')),
    last_attempted TIMESTAMPTZ,
    last_error TEXT,
    CONSTRAINT fby_notification_hook_projection_status_uq
        UNIQUE (hook_id, projection_id, status)
);

CREATE INDEX IF NOT EXISTS fby_notification_due_idx
    ON fby_notification (scheduled_for)
    WHERE status = 'PENDING';

CREATE TABLE IF NOT EXISTS fby_migration (
    number INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    checksum CHAR(64) NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

const ROUTINES: &str = r#"
CREATE OR REPLACE FUNCTION fby_set_change_set_defaults() RETURNS TRIGGER AS $$
BEGIN
    NEW.last_modified := now();
    NEW.entity_tag := substr(md5(random()::text || clock_timestamp()::text), 1, 20);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION fby_schedule_notification(p_hook_id INTEGER, p_projection_id INTEGER)
RETURNS VOID AS $$
BEGIN
    INSERT INTO fby_notification (hook_id, projection_id)
    VALUES (p_hook_id, p_projection_id)
    ON CONFLICT (hook_id, projection_id, status)
    DO UPDATE SET scheduled_for = now(), attempts = 0, last_error = NULL;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION fby_notify(p_entity_name TEXT, p_entity_version INTEGER)
RETURNS VOID AS $$
DECLARE
    v_match RECORD;
BEGIN
    FOR v_match IN
        SELECT h.id AS hook_id, p.id AS projection_id
        FROM fby_projection p
        INNER JOIN fby_projection_entity pe ON pe.projection_id = p.id
        INNER JOIN fby_entity e ON e.id = pe.entity_id
        INNER JOIN fby_hook h ON h.projection_id = p.id OR h.projection_id IS NULL
        WHERE e.name = p_entity_name AND e.version = p_entity_version
    LOOP
        PERFORM fby_schedule_notification(v_match.hook_id, v_match.projection_id);
    END LOOP;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION fby_on_data_frame_insert() RETURNS TRIGGER AS $$
DECLARE
    v_entity fby_entity%ROWTYPE;
BEGIN
    SELECT * INTO v_entity FROM fby_entity WHERE id = NEW.entity_id;
    PERFORM fby_notify(v_entity.name, v_entity.version);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION fby_get_next_notification(p_max_attempts INTEGER)
RETURNS SETOF fby_notification AS $$
    SELECT n.*
    FROM fby_notification n
    WHERE n.status = 'PENDING'
      AND n.scheduled_for <= now()
      AND n.attempts < p_max_attempts
    ORDER BY n.scheduled_for
    LIMIT 1
    FOR UPDATE SKIP LOCKED
$$ LANGUAGE sql;

CREATE OR REPLACE FUNCTION fby_pass_notification(p_id BIGINT) RETURNS VOID AS $$
DECLARE
    v_notification fby_notification%ROWTYPE;
BEGIN
    SELECT * INTO v_notification FROM fby_notification WHERE id = p_id;
    DELETE FROM fby_notification
    WHERE hook_id = v_notification.hook_id
      AND projection_id = v_notification.projection_id
      AND status = 'OK';
    UPDATE fby_notification
    SET status = 'OK', last_attempted = now(), last_error = NULL
    WHERE id = p_id;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION fby_fail_notification(p_id BIGINT, p_scheduled_for TIMESTAMPTZ, p_error TEXT)
RETURNS VOID AS $$
BEGIN
    UPDATE fby_notification
    SET attempts = attempts + 1,
        last_attempted = now(),
        last_error = p_error,
        scheduled_for = p_scheduled_for
    WHERE id = p_id;
END;
$$ LANGUAGE plpgsql;
"#;

const TRIGGERS: &str = r#"
DROP TRIGGER IF EXISTS fby_change_set_defaults ON fby_change_set;
CREATE TRIGGER fby_change_set_defaults
    BEFORE INSERT ON fby_change_set
    FOR EACH ROW EXECUTE FUNCTION fby_set_change_set_defaults();

DROP TRIGGER IF EXISTS fby_data_frame_notify ON fby_data_frame;
CREATE TRIGGER fby_data_frame_notify
    AFTER INSERT ON fby_data_frame
    FOR EACH ROW EXECUTE FUNCTION fby_on_data_frame_insert();
"#;

const DROP_OBJECTS: &str = r#"
DROP TABLE IF EXISTS
    fby_notification,
    fby_hook,
    fby_data_frame,
    fby_projection_entity,
    fby_change_set,
    fby_projection,
    fby_entity,
    fby_migration
CASCADE;

DROP FUNCTION IF EXISTS fby_set_change_set_defaults();
DROP FUNCTION IF EXISTS fby_schedule_notification(INTEGER, INTEGER);
DROP FUNCTION IF EXISTS fby_notify(TEXT, INTEGER);
DROP FUNCTION IF EXISTS fby_on_data_frame_insert();
DROP FUNCTION IF EXISTS fby_pass_notification(BIGINT);
DROP FUNCTION IF EXISTS fby_fail_notification(BIGINT, TIMESTAMPTZ, TEXT);
"#;

/// Create or refresh every framework object. Safe to run repeatedly.
pub(crate) async fn bootstrap(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    debug!("bootstrapping framework schema");
    conn.execute(sqlx::raw_sql(TABLES)).await?;
    conn.execute(sqlx::raw_sql(ROUTINES)).await?;
    conn.execute(sqlx::raw_sql(TRIGGERS)).await?;
    Ok(())
}

/// Drop every framework table and routine. Side tables and aggregate
/// functions created by user migrations are the caller's responsibility
/// (the `nuke_custom_objects` hook); the data-frame foreign keys they carry
/// are removed by the cascade.
///
/// `fby_get_next_notification` depends on the `fby_notification` row type,
/// so the table cascade drops it.
pub(crate) async fn drop_framework_objects(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    debug!("dropping framework schema");
    conn.execute(sqlx::raw_sql(DROP_OBJECTS)).await?;
    Ok(())
}
