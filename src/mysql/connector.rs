//! Dialing and pooling glue for mysql connections.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, SslOpts};
use sync_core::ConnectionDescriptor;

use crate::optimize::{ConnectionFactory, PooledConn};

/// Connection establishment timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens mysql connections for the pool.
pub struct MysqlConnector {
    /// Enable protocol-level compression on new connections.
    pub compress: bool,
}

impl MysqlConnector {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }
}

#[async_trait]
impl ConnectionFactory<Conn> for MysqlConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        database: Option<&str>,
    ) -> Result<Conn> {
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(descriptor.host.clone())
            .tcp_port(descriptor.port)
            .user(Some(descriptor.username.clone()))
            .pass(Some(descriptor.password.clone()))
            .db_name(database.map(str::to_string));

        if self.compress {
            opts = opts.compression(mysql_async::Compression::default());
        }
        if descriptor.use_tls {
            opts = opts.ssl_opts(SslOpts::default());
        }

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, Conn::new(opts))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "connection timeout after {CONNECT_TIMEOUT:?} to {}:{}",
                    descriptor.host,
                    descriptor.port
                )
            })?
            .with_context(|| {
                format!(
                    "failed to connect to {}:{} as {}",
                    descriptor.host, descriptor.port, descriptor.username
                )
            })?;

        Ok(conn)
    }
}

#[async_trait]
impl PooledConn for Conn {
    async fn ping(&mut self) -> Result<()> {
        Queryable::ping(self).await.context("liveness ping failed")
    }

    async fn close(self) -> Result<()> {
        self.disconnect().await.context("failed to close connection")
    }
}
