// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{marker::PhantomData, ops};

use diesel::{
    pg::Pg,
    query_builder::{AstPass, QueryFragment, QueryId},
    result::Error as DieselError,
    serialize::ToSql,
    sql_types::{HasSqlType, Untyped},
    QueryResult,
};

// Raw SQL assembled from snippets, bind parameters, and identifiers.
//
// Used for statements diesel's DSL cannot express statically, such as statements against tables
// whose names are only known at runtime (`logs_0`, `logs_1`, ...). Binds are written inline and
// rendered as `$n` placeholders in order.
#[derive(Default)]
pub struct Query<'f> {
    parts: Vec<Part<'f>>,
}

enum Part<'f> {
    Sql(String),
    Ident(String),
    Bind(Box<dyn QueryFragment<Pg> + Send + 'f>),
}

struct Bind<ST, U> {
    value: U,
    _data: PhantomData<ST>,
}

impl<'f> Query<'f> {
    pub fn new(sql: impl AsRef<str>) -> Self {
        Self {
            parts: vec![Part::Sql(sql.as_ref().to_owned())],
        }
    }

    // Append `query` at the end of `self`.
    pub fn query(mut self, query: Query<'f>) -> Self {
        self.parts.extend(query.parts);
        self
    }

    pub fn sql(mut self, sql: impl AsRef<str>) -> Self {
        self.parts.push(Part::Sql(sql.as_ref().to_owned()));
        self
    }

    // Append a quoted identifier (table or column name). Only lowercase ASCII letters, digits and
    // underscores are accepted; anything else fails when the query is rendered.
    pub fn ident(mut self, name: impl AsRef<str>) -> Self {
        self.parts.push(Part::Ident(name.as_ref().to_owned()));
        self
    }

    // Embed `value` into the query as a bind parameter, at the end of the query.
    pub fn bind<ST, V>(mut self, value: V) -> Self
    where
        Pg: HasSqlType<ST>,
        V: ToSql<ST, Pg> + Send + 'f,
        ST: Send + 'f,
    {
        self.parts.push(Part::Bind(Box::new(Bind {
            value,
            _data: PhantomData,
        })));

        self
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

pub fn is_valid_ident(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl QueryFragment<Pg> for Query<'_> {
    fn walk_ast<'b>(&'b self, mut out: AstPass<'_, 'b, Pg>) -> QueryResult<()> {
        for part in &self.parts {
            match part {
                Part::Sql(sql) => out.push_sql(sql),
                Part::Ident(name) => {
                    if !is_valid_ident(name) {
                        return Err(DieselError::QueryBuilderError(
                            format!("invalid identifier: {:?}", name).into(),
                        ));
                    }
                    out.push_identifier(name)?;
                }
                Part::Bind(bind) => bind.walk_ast(out.reborrow())?,
            }
        }

        Ok(())
    }
}

impl<ST, U> QueryFragment<Pg> for Bind<ST, U>
where
    Pg: HasSqlType<ST>,
    U: ToSql<ST, Pg>,
{
    fn walk_ast<'b>(&'b self, mut out: AstPass<'_, 'b, Pg>) -> QueryResult<()> {
        out.push_bind_param(&self.value)
    }
}

impl QueryId for Query<'_> {
    type QueryId = ();
    const HAS_STATIC_QUERY_ID: bool = false;
}

impl diesel::query_builder::Query for Query<'_> {
    type SqlType = Untyped;
}

impl ops::Add for Query<'_> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        self.query(rhs)
    }
}

impl ops::AddAssign for Query<'_> {
    fn add_assign(&mut self, rhs: Self) {
        self.parts.extend(rhs.parts);
    }
}
