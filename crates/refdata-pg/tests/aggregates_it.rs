//! Aggregation over change-set history: the generated
//! `get_<entity>_v<version>_aggregate` functions fold POST and DELETE frames
//! in `(effective, id)` order up to the requested change set.

mod common;

use std::fs;

use refdata_pg::RefData;
use tempfile::TempDir;

const DEFINE_VAT_RATE: &str = r#"
define entities:
  - name: VAT Rate
    version: 1
    fields:
      - name: type
        type: TEXT
      - name: rate
        type: DOUBLE PRECISION
    identified_by:
      - type

add projections:
  - name: VAT Rates
    version: 1
    dependencies:
      - entity: VAT Rate
        version: 1
"#;

const VAT_HISTORY: &str = r#"
add change set:
  - effective: 2020-04-05T00:00:00Z
    description: 2020 rates
    frames:
      - entity: VAT Rate
        version: 1
        action: POST
        data:
          - type: standard
            rate: 0.10
          - type: reduced
            rate: 0.05
          - type: zero
            rate: 0
  - effective: 2021-04-05T00:00:00Z
    description: 2021 rates
    frames:
      - entity: VAT Rate
        version: 1
        action: POST
        data:
          - type: standard
            rate: 0.125
          - type: reduced
            rate: 0.07
          - type: zero
            rate: 0
  - effective: 2022-04-05T00:00:00Z
    description: 2022 rates
    frames:
      - entity: VAT Rate
        version: 1
        action: POST
        data:
          - type: standard
            rate: 0.15
          - type: reduced
            rate: 0.10
          - type: zero
            rate: 0
"#;

const VAT_HISTORY_WITH_DELETE: &str = r#"
add change set:
  - effective: 2020-04-05T00:00:00Z
    frames:
      - entity: VAT Rate
        version: 1
        action: POST
        data:
          - type: standard
            rate: 0.10
          - type: reduced
            rate: 0.05
          - type: zero
            rate: 0
  - effective: 2022-04-05T00:00:00Z
    frames:
      - entity: VAT Rate
        version: 1
        action: POST
        data:
          - type: standard
            rate: 0.15
          - type: reduced
            rate: 0.10
      - entity: VAT Rate
        version: 1
        action: DELETE
        data:
          - type: zero
"#;

fn write_migrations(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

async fn aggregate(refdata: &RefData, change_set_id: i32) -> Vec<(String, f64)> {
    let mut rows: Vec<(String, f64)> =
        sqlx::query_as("SELECT type, rate FROM get_vat_rate_v1_aggregate($1) ORDER BY type")
            .bind(change_set_id)
            .fetch_all(refdata.pool())
            .await
            .unwrap();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

fn assert_rate(rows: &[(String, f64)], rate_type: &str, expected: f64) {
    let (_, actual) = rows
        .iter()
        .find(|(t, _)| t == rate_type)
        .unwrap_or_else(|| panic!("missing rate type {rate_type}"));
    assert!(
        (actual - expected).abs() < 1e-9,
        "{rate_type}: expected {expected}, got {actual}"
    );
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn aggregate_returns_the_latest_rates_at_each_change_set() {
    let dir = write_migrations(&[
        ("001.define-vat-rate.yaml", DEFINE_VAT_RATE),
        ("002.vat-history.yaml", VAT_HISTORY),
    ]);
    let (pool, config) = common::test_database(dir.path()).await;
    let refdata = RefData::init_with_pool(pool, config).await.unwrap();

    let projection = refdata.get_projection("VAT Rates", 1).await.unwrap().unwrap();
    let change_log = refdata.get_change_log(&projection).await.unwrap();
    assert_eq!(change_log.len(), 3);

    let at_latest = aggregate(&refdata, change_log[2].id).await;
    assert_eq!(at_latest.len(), 3);
    assert_rate(&at_latest, "standard", 0.15);
    assert_rate(&at_latest, "reduced", 0.10);
    assert_rate(&at_latest, "zero", 0.0);

    let at_first = aggregate(&refdata, change_log[0].id).await;
    assert_eq!(at_first.len(), 3);
    assert_rate(&at_first, "standard", 0.10);
    assert_rate(&at_first, "reduced", 0.05);
    assert_rate(&at_first, "zero", 0.0);
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn delete_frames_remove_the_identified_row_from_later_aggregates() {
    let dir = write_migrations(&[
        ("001.define-vat-rate.yaml", DEFINE_VAT_RATE),
        ("002.vat-history.yaml", VAT_HISTORY_WITH_DELETE),
    ]);
    let (pool, config) = common::test_database(dir.path()).await;
    let refdata = RefData::init_with_pool(pool, config).await.unwrap();

    let projection = refdata.get_projection("VAT Rates", 1).await.unwrap().unwrap();
    let change_log = refdata.get_change_log(&projection).await.unwrap();
    assert_eq!(change_log.len(), 2);

    let after_delete = aggregate(&refdata, change_log[1].id).await;
    assert_eq!(after_delete.len(), 2, "the zero rate was retracted");
    assert_rate(&after_delete, "standard", 0.15);
    assert_rate(&after_delete, "reduced", 0.10);

    let before_delete = aggregate(&refdata, change_log[0].id).await;
    assert_eq!(before_delete.len(), 3, "history before the delete is intact");
    assert_rate(&before_delete, "zero", 0.0);
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn change_log_is_ordered_and_deduplicated() {
    let dir = write_migrations(&[
        ("001.define-vat-rate.yaml", DEFINE_VAT_RATE),
        ("002.vat-history.yaml", VAT_HISTORY),
    ]);
    let (pool, config) = common::test_database(dir.path()).await;
    let refdata = RefData::init_with_pool(pool, config).await.unwrap();

    let projection = refdata.get_projection("VAT Rates", 1).await.unwrap().unwrap();
    let change_log = refdata.get_change_log(&projection).await.unwrap();

    for pair in change_log.windows(2) {
        assert!(
            pair[0].effective < pair[1].effective
                || (pair[0].effective == pair[1].effective && pair[0].id < pair[1].id),
            "change log must be ordered by (effective, id)"
        );
    }

    let mut ids: Vec<i32> = change_log.iter().map(|c| c.id).collect();
    ids.dedup();
    assert_eq!(ids.len(), change_log.len(), "no duplicate change sets");
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn entity_tags_are_twenty_hex_characters_and_stable() {
    let dir = write_migrations(&[
        ("001.define-vat-rate.yaml", DEFINE_VAT_RATE),
        ("002.vat-history.yaml", VAT_HISTORY),
    ]);
    let (pool, config) = common::test_database(dir.path()).await;
    let refdata = RefData::init_with_pool(pool, config).await.unwrap();

    let projection = refdata.get_projection("VAT Rates", 1).await.unwrap().unwrap();
    let change_log = refdata.get_change_log(&projection).await.unwrap();

    for entry in &change_log {
        let tag = entry.entity_tag.trim();
        assert_eq!(tag.len(), 20, "entity tag must be 20 characters");
        assert!(
            tag.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()),
            "entity tag must be lowercase hex: {tag}"
        );
    }

    let reread = refdata
        .get_change_set(change_log[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        reread.entity_tag, change_log[0].entity_tag,
        "entity tag is stable across reads"
    );
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn current_change_set_ignores_future_effective_dates() {
    let future = r#"
add change set:
  - effective: 2999-01-01T00:00:00Z
    description: far future rates
    frames:
      - entity: VAT Rate
        version: 1
        action: POST
        data:
          - type: standard
            rate: 0.99
"#;
    let dir = write_migrations(&[
        ("001.define-vat-rate.yaml", DEFINE_VAT_RATE),
        ("002.vat-history.yaml", VAT_HISTORY),
        ("003.future.yaml", future),
    ]);
    let (pool, config) = common::test_database(dir.path()).await;
    let refdata = RefData::init_with_pool(pool, config).await.unwrap();

    let projection = refdata.get_projection("VAT Rates", 1).await.unwrap().unwrap();
    let change_log = refdata.get_change_log(&projection).await.unwrap();
    assert_eq!(change_log.len(), 4);

    let current = refdata
        .get_current_change_set(&projection)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        current.id, change_log[2].id,
        "the future change set is in the log but not current"
    );
}
