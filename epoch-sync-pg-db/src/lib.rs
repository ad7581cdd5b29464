// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Postgres access for the epoch sync store
//!
//! [`Db`] owns a bb8 pool of `diesel-async` connections. Schemas are applied with
//! embedded diesel migrations, run on a blocking thread through
//! [`AsyncConnectionWrapper`].

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use anyhow::{anyhow, Context};
use diesel::migration::{Migration, MigrationSource, MigrationVersion};
use diesel::pg::Pg;
use diesel::sql_types::Text;
use diesel::{ConnectionError, QueryableByName};
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, ManagerConfig};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use futures::FutureExt;
use tracing::{debug, info};
use url::Url;

pub mod query;

pub use query::Query;

#[derive(clap::Args, Debug, Clone)]
pub struct DbArgs {
    /// Maximum number of pooled connections
    #[arg(long, env = "EPOCH_SYNC_DB_POOL_SIZE", default_value_t = Self::default().db_pool_size)]
    pub db_pool_size: u32,

    /// How long to wait for a free pooled connection (milliseconds)
    #[arg(long, env = "EPOCH_SYNC_DB_ACQUIRE_TIMEOUT_MS", default_value_t = Self::default().db_acquire_timeout_ms)]
    pub db_acquire_timeout_ms: u64,

    /// Server-side `statement_timeout` of every connection (milliseconds)
    #[arg(long, env = "EPOCH_SYNC_DB_STATEMENT_TIMEOUT_MS")]
    pub db_statement_timeout_ms: Option<u64>,
}

impl Default for DbArgs {
    fn default() -> Self {
        Self {
            db_pool_size: 20,
            db_acquire_timeout_ms: 60_000,
            db_statement_timeout_ms: None,
        }
    }
}

impl DbArgs {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.db_acquire_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.db_statement_timeout_ms.map(Duration::from_millis)
    }
}

/// Shared handle to the connection pool; clones use the same pool.
#[derive(Clone)]
pub struct Db {
    pool: Pool<AsyncPgConnection>,
    database_url: Url,
}

/// Connection checked out of [`Db`]'s pool, returned on drop.
pub struct Connection<'a>(PooledConnection<'a, AsyncPgConnection>);

impl Db {
    pub async fn for_write(database_url: Url, args: DbArgs) -> anyhow::Result<Self> {
        let pool = build_pool(&database_url, &args).await?;
        info!(
            pool_size = args.db_pool_size,
            statement_timeout_ms = ?args.db_statement_timeout_ms,
            "[Db] Connection pool ready"
        );
        Ok(Self { pool, database_url })
    }

    /// Check a connection out of the pool, waiting at most
    /// [`DbArgs::acquire_timeout`].
    pub async fn connect(&self) -> anyhow::Result<Connection<'_>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get a pooled connection")?;
        Ok(Connection(conn))
    }

    pub fn state(&self) -> bb8::State {
        self.pool.state()
    }

    /// Apply the pending `migrations`; returns the versions applied.
    pub async fn run_migrations(
        &self,
        migrations: &'static EmbeddedMigrations,
    ) -> anyhow::Result<Vec<MigrationVersion<'static>>> {
        let conn = AsyncPgConnection::establish(self.database_url.as_str())
            .await
            .map_err(|e| anyhow!("Failed to connect for migrations: {}", e))?;
        let mut wrapper: AsyncConnectionWrapper<AsyncPgConnection> = conn.into();

        let applied = tokio::task::spawn_blocking(move || {
            wrapper
                .run_pending_migrations(StaticMigrations(migrations))
                .map(|versions| versions.iter().map(MigrationVersion::as_owned).collect::<Vec<_>>())
        })
        .await?
        .map_err(|e| anyhow!("Failed to run migrations: {:?}", e))?;

        info!("[Db] Applied {} pending migrations", applied.len());
        Ok(applied)
    }

    /// Drop every table of the `public` schema, including runtime-created shards.
    async fn drop_tables(&self) -> anyhow::Result<()> {
        #[derive(QueryableByName)]
        struct TableName {
            #[diesel(sql_type = Text)]
            tablename: String,
        }

        let mut conn = self.connect().await?;
        let tables: Vec<TableName> =
            diesel::sql_query("SELECT tablename FROM pg_tables WHERE schemaname = 'public'")
                .load(&mut conn)
                .await
                .context("Failed to list tables")?;

        for table in &tables {
            // Postgres folds unquoted names to lowercase, which `Query::ident` requires
            Query::new("DROP TABLE IF EXISTS ")
                .ident(&table.tablename)
                .sql(" CASCADE")
                .execute(&mut conn)
                .await
                .with_context(|| format!("Failed to drop table {}", table.tablename))?;
            debug!("[Db] Dropped table {}", table.tablename);
        }

        info!("[Db] Dropped {} tables", tables.len());
        Ok(())
    }
}

/// `MigrationSource` is implemented for the embedded set itself, not for references to it.
struct StaticMigrations(&'static EmbeddedMigrations);

impl MigrationSource<Pg> for StaticMigrations {
    fn migrations(&self) -> diesel::migration::Result<Vec<Box<dyn Migration<Pg>>>> {
        MigrationSource::<Pg>::migrations(self.0)
    }
}

/// Drop all tables, then apply `migrations` if given.
pub async fn reset_database(
    database_url: Url,
    args: DbArgs,
    migrations: Option<&'static EmbeddedMigrations>,
) -> anyhow::Result<()> {
    let db = Db::for_write(database_url, args).await?;
    db.drop_tables().await?;
    if let Some(migrations) = migrations {
        db.run_migrations(migrations).await?;
    }
    Ok(())
}

impl<'a> Deref for Connection<'a> {
    type Target = PooledConnection<'a, AsyncPgConnection>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

async fn build_pool(database_url: &Url, args: &DbArgs) -> anyhow::Result<Pool<AsyncPgConnection>> {
    let statement_timeout = args.statement_timeout();

    let mut manager_config = ManagerConfig::default();
    manager_config.custom_setup = Box::new(move |url| {
        async move {
            let mut conn = AsyncPgConnection::establish(url).await?;
            if let Some(timeout) = statement_timeout {
                diesel::sql_query(format!("SET statement_timeout = {}", timeout.as_millis()))
                    .execute(&mut conn)
                    .await
                    .map_err(ConnectionError::CouldntSetupConfiguration)?;
            }
            Ok(conn)
        }
        .boxed()
    });

    let manager =
        AsyncDieselConnectionManager::new_with_config(database_url.as_str(), manager_config);
    Pool::builder()
        .max_size(args.db_pool_size)
        .connection_timeout(args.acquire_timeout())
        .build(manager)
        .await
        .context("Failed to build connection pool")
}
