//! Throwaway Postgres databases for outbox store tests.
//!
//! Every test gets its own database, created from `TEST_ADMIN_DATABASE_URL`,
//! migrated with the `outbox-relay` schema, and dropped again when the test
//! body returns `Ok`. Failing tests (or any run with `TEST_KEEP_DB` set) leave
//! the database behind so the outbox rows can be inspected with `psql`.

use std::{future::Future, pin::Pin};

use anyhow::{Context, Result};
use sqlx::{Connection, Executor, PgConnection, PgPool, postgres::PgPoolOptions};
use url::Url;
use uuid::Uuid;

/// Connections per test pool.
///
/// Concurrent-claim tests open several transactions at once, so this must stay
/// above the number of parallel claimers they spawn.
const POOL_SIZE: u32 = 8;

/// Run `f` against a freshly migrated database named after `test_name`.
pub async fn with_test_db<F, T>(test_name: &str, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a PgPool) -> Pin<Box<dyn Future<Output = Result<T>> + 'a>>,
{
    dotenvy::from_filename(".env").ok();

    let admin_url = std::env::var("TEST_ADMIN_DATABASE_URL")
        .context("TEST_ADMIN_DATABASE_URL must be set for outbox store tests")?;
    let mut admin_conn = PgConnection::connect(&admin_url).await?;

    let db_name = outbox_db_name(test_name);
    admin_conn
        .execute(format!(r#"CREATE DATABASE "{db_name}""#).as_str())
        .await?;

    let mut db_url = Url::parse(&admin_url)?;
    db_url.set_path(&format!("/{db_name}"));

    let pool = PgPoolOptions::new()
        .max_connections(POOL_SIZE)
        .connect(db_url.as_str())
        .await?;

    sqlx::migrate!("../outbox-relay/migrations").run(&pool).await?;

    let result = f(&pool).await;
    let keep = std::env::var("TEST_KEEP_DB").is_ok();

    if result.is_ok() && !keep {
        pool.close().await;
        let drop_sql = format!(r#"DROP DATABASE IF EXISTS "{db_name}" WITH (FORCE);"#);
        match admin_conn.execute(drop_sql.as_str()).await {
            Ok(_) => eprintln!("[with_test_db] dropped '{db_name}'"),
            Err(e) => eprintln!("[with_test_db] failed to drop '{db_name}': {e}"),
        }
    } else {
        eprintln!("[with_test_db] keeping '{db_name}' for inspection");
    }

    result
}

/// Postgres identifiers cap out at 63 bytes: `outbox_` + test name + `_` + 32 hex chars.
fn outbox_db_name(test_name: &str) -> String {
    const PREFIX: &str = "outbox_";
    const MAX_IDENT: usize = 63;
    const SUFFIX_LEN: usize = 33;

    let mut safe: String = test_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .trim_matches('_')
        .to_owned();

    safe.truncate(MAX_IDENT - PREFIX.len() - SUFFIX_LEN);

    format!("{PREFIX}{safe}_{}", Uuid::now_v7().simple())
}

/// Define an async test that receives a migrated `&PgPool`.
///
/// ```ignore
/// use test_utils::db_test;
///
/// db_test!(claim_returns_oldest_first, |pool| {
///     let store = PgStore::new(pool.clone());
///     // ...
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! db_test {
    ($name:ident, |$pool:ident| $body:block) => {
        #[tokio::test(flavor = "multi_thread")]
        async fn $name() -> anyhow::Result<()> {
            use $crate::db::with_test_db;

            with_test_db(stringify!($name), |$pool| {
                let fut = async move { $body };
                Box::pin(fut)
            })
            .await
        }
    };
}
