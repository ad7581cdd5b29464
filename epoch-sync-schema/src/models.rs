// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use diesel::{AsChangeset, Insertable, Queryable, QueryableByName, Selectable};

use crate::schema::{bn_partitions, contracts, epoch_block_map, logs};

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = bn_partitions, primary_key(entity, idx), treat_none_as_null = true)]
pub struct BnPartitionRow {
    pub entity: String,
    pub idx: i32,
    pub bn_min: Option<i64>,
    pub bn_max: Option<i64>,
    pub cnt: i64,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = contracts)]
pub struct ContractRow {
    pub id: i64,
    pub address: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = contracts)]
pub struct NewContract<'a> {
    pub address: &'a str,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = epoch_block_map)]
pub struct EpochBlockMapRow {
    pub epoch: i64,
    pub bn_min: i64,
    pub bn_max: i64,
    pub pivot_hash: String,
}

/// Row of a log partition table; shards share the `logs` layout.
#[derive(QueryableByName, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = logs)]
pub struct LogRow {
    pub id: i64,
    pub cid: i64,
    pub bn: i64,
    pub epoch: i64,
    pub topic0: Option<String>,
    pub topic1: Option<String>,
    pub topic2: Option<String>,
    pub topic3: Option<String>,
    pub log_index: i64,
    pub extra: Option<Vec<u8>>,
}
