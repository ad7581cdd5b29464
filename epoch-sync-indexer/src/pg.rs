// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Postgres storage backend
//!
//! Partition metadata, contracts and the epoch to block map are regular diesel
//! tables. Log shards are created at runtime from the `logs` template, so their
//! statements go through [`Query`].

use anyhow::Context;
use diesel::dsl;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, QueryableByName, SelectableHelper};
use diesel::sql_types::{BigInt, Bytea, Nullable, Text};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use epoch_sync::{
    BlockRange, EpochData, EpochStore, PartitionConfig, StoreError, StoreResult,
};
use epoch_sync_pg_db::{Db, Query};
use epoch_sync_schema::models::{BnPartitionRow, ContractRow, EpochBlockMapRow, NewContract};
use epoch_sync_schema::schema::{bn_partitions, contracts, epoch_block_map};
use epoch_sync_schema::{LOGS_TEMPLATE_TABLE, MIGRATIONS};
use tracing::{debug, info};

use crate::log_store::{
    BlockMapResolver, Contract, ContractResolver, CountDrift, LogRecord, LogRowStorage,
};
use crate::partition::{Partition, PartitionStorage};
use crate::store::{EpochBlockMap, EpochLogStore, EpochMapStorage};

/// Rows per INSERT statement; each row takes 9 bind parameters and Postgres
/// accepts at most 65535 per statement.
const INSERT_CHUNK_ROWS: usize = 5_000;

#[derive(QueryableByName)]
struct CountResult {
    #[diesel(sql_type = BigInt)]
    cnt: i64,
}

fn to_i64(value: u64, what: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Corrupted(format!("{} {} out of range", what, value)))
}

fn to_u64(value: i64, what: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupted(format!("negative {} {}", what, value)))
}

fn partition_from_row(row: BnPartitionRow) -> StoreResult<Partition> {
    let index = u32::try_from(row.idx)
        .map_err(|_| StoreError::Corrupted(format!("negative partition index {}", row.idx)))?;
    let bn_range = match (row.bn_min, row.bn_max) {
        (Some(bn_min), Some(bn_max)) => Some(BlockRange::new(
            to_u64(bn_min, "bn_min")?,
            to_u64(bn_max, "bn_max")?,
        )),
        (None, None) => None,
        _ => {
            return Err(StoreError::Corrupted(format!(
                "partition {} of '{}' has a half-open block range",
                index, row.entity
            )))
        }
    };
    Ok(Partition {
        index,
        bn_range,
        count: to_u64(row.cnt, "partition count")?,
    })
}

fn partition_to_row(entity: &str, partition: &Partition) -> StoreResult<BnPartitionRow> {
    let idx = i32::try_from(partition.index).map_err(|_| {
        StoreError::Corrupted(format!("partition index {} out of range", partition.index))
    })?;
    let (bn_min, bn_max) = match partition.bn_range {
        Some(range) => (
            Some(to_i64(range.from, "bn_min")?),
            Some(to_i64(range.to, "bn_max")?),
        ),
        None => (None, None),
    };
    Ok(BnPartitionRow {
        entity: entity.to_string(),
        idx,
        bn_min,
        bn_max,
        cnt: to_i64(partition.count, "partition count")?,
    })
}

fn epoch_map_from_row(row: EpochBlockMapRow) -> StoreResult<EpochBlockMap> {
    Ok(EpochBlockMap {
        epoch: to_u64(row.epoch, "epoch")?,
        bn_range: BlockRange::new(to_u64(row.bn_min, "bn_min")?, to_u64(row.bn_max, "bn_max")?),
        pivot_hash: row.pivot_hash,
    })
}

fn epoch_map_to_row(map: &EpochBlockMap) -> StoreResult<EpochBlockMapRow> {
    Ok(EpochBlockMapRow {
        epoch: to_i64(map.epoch, "epoch")?,
        bn_min: to_i64(map.bn_range.from, "bn_min")?,
        bn_max: to_i64(map.bn_range.to, "bn_max")?,
        pivot_hash: map.pivot_hash.clone(),
    })
}

/// Storage handle over one connection, usually inside a transaction
pub struct PgUnitOfWork<'c> {
    conn: &'c mut AsyncPgConnection,
}

impl<'c> PgUnitOfWork<'c> {
    pub fn new(conn: &'c mut AsyncPgConnection) -> Self {
        Self { conn }
    }

    fn conn(&mut self) -> &mut AsyncPgConnection {
        &mut *self.conn
    }
}

#[async_trait::async_trait]
impl PartitionStorage for PgUnitOfWork<'_> {
    async fn load_partitions(&mut self, entity: &str) -> StoreResult<Vec<Partition>> {
        let rows: Vec<BnPartitionRow> = bn_partitions::table
            .filter(bn_partitions::entity.eq(entity))
            .order(bn_partitions::idx.asc())
            .select(BnPartitionRow::as_select())
            .load(self.conn())
            .await
            .context("Failed to load partitions")?;

        rows.into_iter().map(partition_from_row).collect()
    }

    async fn load_partition(&mut self, entity: &str, index: u32) -> StoreResult<Option<Partition>> {
        let idx = i32::try_from(index)
            .map_err(|_| StoreError::Corrupted(format!("partition index {} out of range", index)))?;
        let row: Option<BnPartitionRow> = bn_partitions::table
            .find((entity, idx))
            .select(BnPartitionRow::as_select())
            .first(self.conn())
            .await
            .optional()
            .context("Failed to load partition")?;

        row.map(partition_from_row).transpose()
    }

    async fn latest_partition(&mut self, entity: &str) -> StoreResult<Option<Partition>> {
        let row: Option<BnPartitionRow> = bn_partitions::table
            .filter(bn_partitions::entity.eq(entity))
            .order(bn_partitions::idx.desc())
            .select(BnPartitionRow::as_select())
            .first(self.conn())
            .await
            .optional()
            .context("Failed to load latest partition")?;

        row.map(partition_from_row).transpose()
    }

    async fn save_partition(&mut self, entity: &str, partition: &Partition) -> StoreResult<()> {
        let row = partition_to_row(entity, partition)?;
        diesel::insert_into(bn_partitions::table)
            .values(&row)
            .on_conflict((bn_partitions::entity, bn_partitions::idx))
            .do_update()
            .set(&row)
            .execute(self.conn())
            .await
            .context("Failed to save partition")?;
        Ok(())
    }

    async fn create_shard(&mut self, shard: &str) -> StoreResult<()> {
        Query::new("CREATE TABLE IF NOT EXISTS ")
            .ident(shard)
            .sql(" (LIKE ")
            .ident(LOGS_TEMPLATE_TABLE)
            .sql(" INCLUDING ALL)")
            .execute(self.conn())
            .await
            .with_context(|| format!("Failed to create shard {}", shard))?;

        debug!("[PgStore] Ensured shard table {}", shard);
        Ok(())
    }
}

#[async_trait::async_trait]
impl LogRowStorage for PgUnitOfWork<'_> {
    async fn insert_logs(&mut self, shard: &str, logs: &[LogRecord]) -> StoreResult<u64> {
        let mut inserted = 0;

        for chunk in logs.chunks(INSERT_CHUNK_ROWS) {
            let mut query = Query::new("INSERT INTO ").ident(shard).sql(
                " (cid, bn, epoch, topic0, topic1, topic2, topic3, log_index, extra) VALUES ",
            );

            for (i, log) in chunk.iter().enumerate() {
                if i > 0 {
                    query = query.sql(", ");
                }
                let [topic0, topic1, topic2, topic3] = log.topics.clone();
                query = query
                    .sql("(")
                    .bind::<BigInt, _>(to_i64(log.contract_id, "contract id")?)
                    .sql(", ")
                    .bind::<BigInt, _>(to_i64(log.block_number, "block number")?)
                    .sql(", ")
                    .bind::<BigInt, _>(to_i64(log.epoch, "epoch")?)
                    .sql(", ")
                    .bind::<Nullable<Text>, _>(topic0)
                    .sql(", ")
                    .bind::<Nullable<Text>, _>(topic1)
                    .sql(", ")
                    .bind::<Nullable<Text>, _>(topic2)
                    .sql(", ")
                    .bind::<Nullable<Text>, _>(topic3)
                    .sql(", ")
                    .bind::<BigInt, _>(to_i64(log.log_index, "log index")?)
                    .sql(", ")
                    .bind::<Nullable<Bytea>, _>(log.extra.clone())
                    .sql(")");
            }

            inserted += query
                .execute(self.conn())
                .await
                .with_context(|| format!("Failed to insert logs into {}", shard))?
                as u64;
        }

        Ok(inserted)
    }

    async fn delete_logs_from(&mut self, shard: &str, bn: u64) -> StoreResult<u64> {
        let deleted = Query::new("DELETE FROM ")
            .ident(shard)
            .sql(" WHERE bn >= ")
            .bind::<BigInt, _>(to_i64(bn, "block number")?)
            .execute(self.conn())
            .await
            .with_context(|| format!("Failed to delete logs from {}", shard))?;
        Ok(deleted as u64)
    }

    async fn count_logs(&mut self, shard: &str) -> StoreResult<u64> {
        let result: CountResult = Query::new("SELECT COUNT(*) AS cnt FROM ")
            .ident(shard)
            .get_result(self.conn())
            .await
            .with_context(|| format!("Failed to count logs of {}", shard))?;
        to_u64(result.cnt, "log count")
    }
}

#[async_trait::async_trait]
impl ContractResolver for PgUnitOfWork<'_> {
    async fn add_contract_if_absent(&mut self, address: &str) -> StoreResult<(Contract, bool)> {
        let inserted = diesel::insert_into(contracts::table)
            .values(&NewContract { address })
            .on_conflict(contracts::address)
            .do_nothing()
            .execute(self.conn())
            .await
            .context("Failed to insert contract")?;

        let row: ContractRow = contracts::table
            .filter(contracts::address.eq(address))
            .select(ContractRow::as_select())
            .first(self.conn())
            .await
            .context("Failed to load contract")?;

        Ok((
            Contract {
                id: to_u64(row.id, "contract id")?,
                address: row.address,
            },
            inserted == 1,
        ))
    }
}

#[async_trait::async_trait]
impl BlockMapResolver for PgUnitOfWork<'_> {
    async fn block_range(&mut self, epoch: u64) -> StoreResult<Option<BlockRange>> {
        let row: Option<EpochBlockMapRow> = epoch_block_map::table
            .find(to_i64(epoch, "epoch")?)
            .select(EpochBlockMapRow::as_select())
            .first(self.conn())
            .await
            .optional()
            .context("Failed to load epoch block map")?;

        Ok(row.map(epoch_map_from_row).transpose()?.map(|map| map.bn_range))
    }
}

#[async_trait::async_trait]
impl EpochMapStorage for PgUnitOfWork<'_> {
    async fn save_epoch_maps(&mut self, maps: &[EpochBlockMap]) -> StoreResult<()> {
        if maps.is_empty() {
            return Ok(());
        }
        let rows = maps
            .iter()
            .map(epoch_map_to_row)
            .collect::<StoreResult<Vec<_>>>()?;

        diesel::insert_into(epoch_block_map::table)
            .values(&rows)
            .execute(self.conn())
            .await
            .context("Failed to save epoch block maps")?;
        Ok(())
    }

    async fn delete_epoch_maps_from(&mut self, epoch: u64) -> StoreResult<u64> {
        let deleted = diesel::delete(
            epoch_block_map::table.filter(epoch_block_map::epoch.ge(to_i64(epoch, "epoch")?)),
        )
        .execute(self.conn())
        .await
        .context("Failed to delete epoch block maps")?;
        Ok(deleted as u64)
    }

    async fn epoch_map_range(&mut self) -> StoreResult<Option<(u64, u64)>> {
        let (min_epoch, max_epoch): (Option<i64>, Option<i64>) = epoch_block_map::table
            .select((
                dsl::min(epoch_block_map::epoch),
                dsl::max(epoch_block_map::epoch),
            ))
            .first(self.conn())
            .await
            .context("Failed to load epoch range")?;

        match (min_epoch, max_epoch) {
            (Some(min_epoch), Some(max_epoch)) => Ok(Some((
                to_u64(min_epoch, "epoch")?,
                to_u64(max_epoch, "epoch")?,
            ))),
            _ => Ok(None),
        }
    }

    async fn epoch_pivot_hash(&mut self, epoch: u64) -> StoreResult<Option<String>> {
        let hash: Option<String> = epoch_block_map::table
            .find(to_i64(epoch, "epoch")?)
            .select(epoch_block_map::pivot_hash)
            .first(self.conn())
            .await
            .optional()
            .context("Failed to load pivot hash")?;
        Ok(hash)
    }

    async fn clear_epoch_maps(&mut self) -> StoreResult<()> {
        diesel::delete(epoch_block_map::table)
            .execute(self.conn())
            .await
            .context("Failed to clear epoch block maps")?;
        Ok(())
    }
}

/// [`EpochStore`] over Postgres; every mutation runs in one transaction.
#[derive(Clone)]
pub struct PgEpochStore {
    db: Db,
    store: EpochLogStore,
}

impl PgEpochStore {
    pub fn new(db: Db, config: &PartitionConfig) -> Self {
        Self {
            db,
            store: EpochLogStore::new(config),
        }
    }

    /// Apply the pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let applied = self.db.run_migrations(&MIGRATIONS).await?;
        info!("[PgStore] Applied {} migrations", applied.len());
        Ok(())
    }

    /// Compare partition counts with the rows stored in each shard.
    pub async fn reconcile(&self) -> StoreResult<Vec<CountDrift>> {
        let mut conn = self.db.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        self.store.logs().reconcile(&mut PgUnitOfWork::new(conn)).await
    }
}

#[async_trait::async_trait]
impl EpochStore for PgEpochStore {
    async fn global_epoch_range(&self) -> StoreResult<(u64, u64)> {
        let mut conn = self.db.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        self.store
            .global_epoch_range(&mut PgUnitOfWork::new(conn))
            .await
    }

    async fn pushn(&self, data: &[EpochData]) -> StoreResult<()> {
        let mut conn = self.db.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let store = &self.store;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                store.pushn(&mut PgUnitOfWork::new(conn), data).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(StoreError::from_anyhow)
    }

    async fn popn(&self, revert_to: u64) -> StoreResult<()> {
        let mut conn = self.db.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let store = &self.store;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                store.popn(&mut PgUnitOfWork::new(conn), revert_to).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(StoreError::from_anyhow)
    }

    async fn flush(&self) -> StoreResult<()> {
        let mut conn = self.db.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let store = &self.store;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                store.flush(&mut PgUnitOfWork::new(conn)).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(StoreError::from_anyhow)
    }

    async fn epoch_pivot_hash(&self, epoch: u64) -> StoreResult<Option<String>> {
        let mut conn = self.db.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        self.store
            .epoch_pivot_hash(&mut PgUnitOfWork::new(conn), epoch)
            .await
    }
}

#[cfg(all(test, feature = "db-tests"))]
mod tests {
    use super::*;
    use crate::log_store::{LogRecordExtra, LOGS_ENTITY};
    use epoch_sync::test_utils::EpochDataBuilder;
    use epoch_sync_pg_db::{reset_database, DbArgs};
    use epoch_sync_schema::models::LogRow;
    use serial_test::serial;
    use url::Url;

    fn epoch_with_logs(epoch: u64) -> EpochData {
        EpochDataBuilder::new(epoch)
            .block(epoch * 10, &format!("0xpivot-{}", epoch))
            .executed_tx(&format!("0xtx{}", epoch), &["0xa", "0xb"])
            .build()
    }

    async fn setup(volume_size: u64) -> PgEpochStore {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let database_url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL environment variable must be set");
        let url: Url = database_url.parse().expect("Invalid database URL format");

        reset_database(url.clone(), DbArgs::default(), Some(&MIGRATIONS))
            .await
            .expect("Failed to reset database");
        let db = Db::for_write(url, DbArgs::default())
            .await
            .expect("Failed to create connection pool");
        PgEpochStore::new(
            db,
            &PartitionConfig {
                log_volume_size: volume_size,
            },
        )
    }

    async fn shard_count(store: &PgEpochStore, shard: &str) -> u64 {
        let mut conn = store.db.connect().await.unwrap();
        let conn: &mut AsyncPgConnection = &mut conn;
        PgUnitOfWork::new(conn).count_logs(shard).await.unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn test_push_pop_flush() {
        let store = setup(4).await;
        assert!(store.global_epoch_range().await.unwrap_err().is_record_not_found());

        store
            .pushn(&[epoch_with_logs(1), epoch_with_logs(2)])
            .await
            .unwrap();
        store.pushn(&[epoch_with_logs(3)]).await.unwrap();
        assert_eq!(store.global_epoch_range().await.unwrap(), (1, 3));
        assert_eq!(
            store.epoch_pivot_hash(3).await.unwrap().as_deref(),
            Some("0xpivot-3")
        );
        assert_eq!(shard_count(&store, "logs_0").await, 4);
        assert_eq!(shard_count(&store, "logs_1").await, 2);

        store.popn(2).await.unwrap();
        assert_eq!(store.global_epoch_range().await.unwrap(), (1, 1));
        assert_eq!(shard_count(&store, "logs_0").await, 2);
        assert_eq!(shard_count(&store, "logs_1").await, 0);
        assert!(store.reconcile().await.unwrap().is_empty());

        store.flush().await.unwrap();
        assert!(store.global_epoch_range().await.unwrap_err().is_record_not_found());
        assert_eq!(shard_count(&store, "logs_0").await, 0);

        let mut conn = store.db.connect().await.unwrap();
        let conn: &mut AsyncPgConnection = &mut conn;
        let partitions = PgUnitOfWork::new(conn)
            .load_partitions(LOGS_ENTITY)
            .await
            .unwrap();
        assert_eq!(partitions, vec![Partition::new(0), Partition::new(1)]);
    }

    #[tokio::test]
    #[serial]
    async fn test_rejected_push_leaves_store_unchanged() {
        let store = setup(100).await;
        store.pushn(&[epoch_with_logs(1)]).await.unwrap();

        let err = store.pushn(&[epoch_with_logs(3)]).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(_)));

        // batch repeating an epoch
        let err = store
            .pushn(&[epoch_with_logs(2), epoch_with_logs(2)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(_)));

        assert_eq!(store.global_epoch_range().await.unwrap(), (1, 1));
        assert_eq!(shard_count(&store, "logs_0").await, 2);
        assert!(store.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_contracts_are_shared_across_batches() {
        let store = setup(100).await;
        store.pushn(&[epoch_with_logs(1)]).await.unwrap();
        store.pushn(&[epoch_with_logs(2)]).await.unwrap();

        let mut conn = store.db.connect().await.unwrap();
        let count: i64 = contracts::table
            .count()
            .get_result(&mut conn)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    #[serial]
    async fn test_shard_rows_carry_log_fields() {
        let store = setup(100).await;
        store.pushn(&[epoch_with_logs(3)]).await.unwrap();

        let mut conn = store.db.connect().await.unwrap();
        let conn: &mut AsyncPgConnection = &mut conn;
        let rows: Vec<LogRow> = Query::new("SELECT * FROM ")
            .ident("logs_0")
            .sql(" ORDER BY id")
            .load(conn)
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.bn == 30 && row.epoch == 3));
        assert_eq!(rows.iter().map(|row| row.log_index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(rows[0].topic0.as_deref(), Some("0xtopic0"));
        assert_eq!(rows[1].topic0.as_deref(), Some("0xtopic1"));
        assert!(rows[1].topic1.is_none());
        assert_ne!(rows[0].cid, rows[1].cid);

        let extra: LogRecordExtra =
            serde_json::from_slice(rows[0].extra.as_deref().unwrap()).unwrap();
        assert_eq!(extra.tx_hash, "0xtx3");
        assert_eq!(extra.block_hash, "0xpivot-3");
    }

    #[tokio::test]
    #[serial]
    async fn test_migrations_are_idempotent() {
        let store = setup(100).await;
        store.run_migrations().await.unwrap();

        let applied = store.db.run_migrations(&MIGRATIONS).await.unwrap();
        assert!(applied.is_empty());
    }
}
