// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Start and shutdown of the background tasks.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Background, Substrate, SubstrateState};
use crate::error::{ErrorKind, SubstrateError};
use crate::pool::ConnectionFactory;

impl<F: ConnectionFactory> Substrate<F> {
    /// Start the health monitor and the retention scheduler.
    ///
    /// The scheduler reconciles partial deletes before its first tick.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> Result<(), SubstrateError> {
        let state = self.state();
        if state != SubstrateState::Created {
            return Err(SubstrateError::operation(
                ErrorKind::Permanent,
                format!("cannot start substrate in state {state}"),
            ));
        }

        self.scheduler.start()?;

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&self.monitor).spawn(cancel.clone());
        *self.background.lock() = Some(Background { cancel, handle });

        self.state.send_replace(SubstrateState::Running);
        info!(
            health_interval_s = self.config.health.check_interval_s,
            retention_tick_s = self.config.retention.tick_s,
            "Substrate running"
        );
        Ok(())
    }

    /// Stop background tasks, then close the pool. Leased connections are
    /// destroyed as their holders release them.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), SubstrateState::ShuttingDown | SubstrateState::Stopped) {
            return;
        }
        self.state.send_replace(SubstrateState::ShuttingDown);
        info!("Substrate shutting down");

        let background = self.background.lock().take();
        if let Some(Background { cancel, handle }) = background {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }

        self.scheduler.stop().await;
        self.pool.close().await;

        let retry = self.retry.stats();
        info!(
            total_attempts = retry.total_attempts,
            failed = retry.failed_attempts,
            "Substrate stopped"
        );
        self.state.send_replace(SubstrateState::Stopped);
    }
}
