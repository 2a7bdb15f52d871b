//! Shared PostgreSQL test harness.
//!
//! One container for the whole test binary, one database per test.

use std::path::Path;

use std::time::Duration;

use refdata_core::config::{DatabaseConfig, NotificationsConfig, RefDataConfig};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, PgConnection};
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedPostgres {
    _container: ContainerAsync<Postgres>,
    host: String,
    port: u16,
}

static POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();

async fn shared_postgres() -> &'static SharedPostgres {
    POSTGRES
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("16-alpine")
                .start()
                .await
                .expect("failed to start postgres container");

            let host = container
                .get_host()
                .await
                .expect("failed to get container host")
                .to_string();
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get container port");

            SharedPostgres {
                _container: container,
                host,
                port,
            }
        })
        .await
}

/// Create a fresh database and return a pool plus a config pointing at the
/// given migrations directory, tuned for fast test polling.
pub async fn test_database(migrations: &Path) -> (PgPool, RefDataConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let shared = shared_postgres().await;

    let db_name = format!("refdata_test_{}", Uuid::new_v4().simple());
    let admin_url = format!(
        "postgres://postgres:postgres@{}:{}/postgres",
        shared.host, shared.port
    );
    let mut admin = PgConnection::connect(&admin_url)
        .await
        .expect("failed to connect to postgres admin database");
    sqlx::query(&format!("CREATE DATABASE {db_name}"))
        .execute(&mut admin)
        .await
        .expect("failed to create test database");

    let url = format!(
        "postgres://postgres:postgres@{}:{}/{}",
        shared.host, shared.port, db_name
    );
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to test database");

    let config = RefDataConfig {
        database: DatabaseConfig::from_url(&url).expect("test database url should parse"),
        migrations: migrations.to_path_buf(),
        notifications: NotificationsConfig {
            initial_delay: Duration::ZERO,
            interval: Duration::from_millis(50),
            max_attempts: 10,
            max_reschedule_delay: Duration::from_millis(50),
            base_reschedule_delay: Duration::from_millis(10),
        },
    };

    (pool, config)
}

/// Poll `probe` until it returns `Some`, panicking after five seconds.
pub async fn eventually<T, F, Fut>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
