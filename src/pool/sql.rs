// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! sqlx-backed connection factory.
//!
//! Works with any URL the sqlx `Any` driver understands (`sqlite:`,
//! `mysql:`). The liveness probe is `SELECT 1`; on SQLite the optimize hook
//! runs `PRAGMA optimize`, which is safe outside a transaction.

use async_trait::async_trait;
use sqlx::{AnyConnection, Connection};
use std::sync::Once;
use tracing::debug;

use super::{ConnectionFactory, PoolError};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlConnectionFactory {
    url: String,
    is_sqlite: bool,
}

impl SqlConnectionFactory {
    pub fn new(url: impl Into<String>) -> Self {
        install_drivers();
        let url = url.into();
        let is_sqlite = url.starts_with("sqlite:");
        Self { url, is_sqlite }
    }

    #[must_use]
    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }
}

impl std::fmt::Debug for SqlConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // URLs carry credentials
        f.debug_struct("SqlConnectionFactory")
            .field("is_sqlite", &self.is_sqlite)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnectionFactory for SqlConnectionFactory {
    type Connection = AnyConnection;

    async fn create(&self) -> Result<AnyConnection, PoolError> {
        let mut conn = AnyConnection::connect(&self.url)
            .await
            .map_err(|e| PoolError::create(&e))?;
        if self.is_sqlite {
            sqlx::query("PRAGMA busy_timeout = 5000")
                .execute(&mut conn)
                .await
                .map_err(|e| PoolError::create(&e))?;
        }
        Ok(conn)
    }

    async fn destroy(&self, conn: AnyConnection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Connection close failed");
        }
    }

    async fn probe(&self, conn: &mut AnyConnection) -> bool {
        sqlx::query("SELECT 1").execute(&mut *conn).await.is_ok()
    }

    async fn optimize_hook(&self, conn: &mut AnyConnection) -> Result<(), PoolError> {
        if !self.is_sqlite {
            return Ok(());
        }
        sqlx::query("PRAGMA optimize")
            .execute(&mut *conn)
            .await
            .map_err(|e| PoolError::create(&e))?;
        Ok(())
    }
}
