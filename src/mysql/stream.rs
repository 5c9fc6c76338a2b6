//! Driver bindings for the batch processor's feed and sink traits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::{Protocol, Queryable};
use mysql_async::{Conn, QueryResult, Row, Value};

use crate::batch::{BatchSink, RowFeed};

/// Streams rows out of a running query, one at a time.
pub struct MysqlRowFeed<'a, P: Protocol> {
    inner: QueryResult<'a, 'static, P>,
}

impl<'a, P: Protocol> MysqlRowFeed<'a, P> {
    pub fn new(inner: QueryResult<'a, 'static, P>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<'a, P: Protocol> RowFeed for MysqlRowFeed<'a, P> {
    async fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        let row = self
            .inner
            .next()
            .await
            .context("failed to read next source row")?;
        Ok(row.map(Row::unwrap))
    }
}

/// Executes batch statements on the target connection.
pub struct MysqlBatchSink<'a> {
    conn: &'a mut Conn,
}

impl<'a> MysqlBatchSink<'a> {
    pub fn new(conn: &'a mut Conn) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<'a> BatchSink for MysqlBatchSink<'a> {
    async fn write_batch(&mut self, statement: &str, params: Vec<Value>) -> Result<u64> {
        self.conn
            .exec_drop(statement, params)
            .await
            .context("batch insert failed")?;
        Ok(self.conn.affected_rows())
    }
}
