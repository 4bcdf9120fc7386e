//! Command-scoped orchestration
//!
//! Everything between taking a pooled connection and judging the device's
//! answer happens under one `command_<consumer>` semaphore hold, so a
//! periodic refresh and a user command for the same consumer never
//! interleave their pumps.

use crate::auth::Credential;
use crate::config::ValidatorSection;
use crate::error::{SydpowerError, SydpowerResult};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::protocol::{Command, CommandRejected, DeviceState, StateField};
use crate::semaphore::Semaphore;
use crate::validation::{ResponseValidator, ValidationReport};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Instrument};

/// Result of one command, as reported to collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The device state confirms the command
    Confirmed {
        state: Option<DeviceState>,
        elapsed_ms: u64,
    },
    /// An output toggle whose switch matches while power-flow or settings
    /// fields never arrived
    Degraded {
        state: Option<DeviceState>,
        missing_fields: Vec<StateField>,
        elapsed_ms: u64,
    },
    /// Some telemetry arrived but it does not confirm the command
    Partial {
        state: Option<DeviceState>,
        missing_fields: Vec<StateField>,
        elapsed_ms: u64,
        device_reachable: bool,
    },
    /// Nothing arrived for the device
    TimedOut {
        missing_fields: Vec<StateField>,
        elapsed_ms: u64,
        device_reachable: bool,
    },
    /// Never sent
    Rejected { reason: CommandRejected },
}

impl CommandOutcome {
    /// Confirmed, or degraded but acceptable
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CommandOutcome::Confirmed { .. } | CommandOutcome::Degraded { .. }
        )
    }
}

fn is_output_switch(field: StateField) -> bool {
    matches!(
        field,
        StateField::AcOutput | StateField::DcOutput | StateField::UsbOutput | StateField::LedOutput
    )
}

/// Accept an unconfirmed output toggle when the switch itself matches
fn degraded_success(command: Command, report: &ValidationReport) -> bool {
    let Some((field, on)) = command.output_target() else {
        return false;
    };
    let Some(state) = &report.state else {
        return false;
    };

    state.readings.switch(field) == Some(on)
        && !report.missing_fields.is_empty()
        && report.missing_fields.iter().all(|f| !is_output_switch(*f))
}

pub struct CommandExecutor {
    pool: Arc<ConnectionPool>,
    semaphore: Semaphore,
    validator: ResponseValidator,
    lock_timeout: Duration,
    refresh_listen: Duration,
}

impl CommandExecutor {
    pub fn new(pool: Arc<ConnectionPool>, semaphore: Semaphore, section: &ValidatorSection) -> Self {
        Self {
            pool,
            semaphore,
            validator: ResponseValidator::new(section),
            lock_timeout: Duration::from_millis(section.command_lock_timeout_ms),
            refresh_listen: Duration::from_millis(section.refresh_listen_ms),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    /// Resolve `command_name` through the whitelist and run it
    pub async fn execute(
        &self,
        credential: &Credential,
        consumer: &str,
        device_id: &str,
        command_name: &str,
        value: Option<u16>,
    ) -> SydpowerResult<CommandOutcome> {
        match Command::from_name(command_name) {
            Ok(command) => {
                self.execute_command(credential, consumer, device_id, command, value)
                    .await
            }
            Err(reason) => {
                warn!(command = %command_name, "Rejected command outside the whitelist");
                Ok(CommandOutcome::Rejected { reason })
            }
        }
    }

    /// Send `command` and wait for the device to confirm it
    pub async fn execute_command(
        &self,
        credential: &Credential,
        consumer: &str,
        device_id: &str,
        command: Command,
        value: Option<u16>,
    ) -> SydpowerResult<CommandOutcome> {
        let span = crate::command_span!(command = %command, device_id = %device_id);

        self.with_connection(credential, consumer, |connection| async move {
            let client = connection.client();
            let mut client = client.lock().await;

            match client.send_command(device_id, command, value).await {
                Ok(()) => {}
                Err(SydpowerError::CommandRejected(reason)) => {
                    warn!(reason = %reason, "Command rejected before sending");
                    return Ok(CommandOutcome::Rejected { reason });
                }
                Err(e) => return Err(e),
            }

            let report = self
                .validator
                .wait_for_valid_response(&mut client, device_id, command, value)
                .await?;
            let elapsed_ms = report.elapsed_ms();

            if report.success {
                info!(elapsed_ms, "Command confirmed");
                return Ok(CommandOutcome::Confirmed {
                    state: report.state,
                    elapsed_ms,
                });
            }

            if degraded_success(command, &report) {
                info!(missing = ?report.missing_fields, "Output switch confirmed without full telemetry");
                return Ok(CommandOutcome::Degraded {
                    state: report.state,
                    missing_fields: report.missing_fields,
                    elapsed_ms,
                });
            }

            let device_reachable = client.quick_ping(device_id).await.unwrap_or(false);
            Ok(match report.state {
                Some(state) => CommandOutcome::Partial {
                    state: Some(state),
                    missing_fields: report.missing_fields,
                    elapsed_ms,
                    device_reachable,
                },
                None => CommandOutcome::TimedOut {
                    missing_fields: report.missing_fields,
                    elapsed_ms,
                    device_reachable,
                },
            })
        })
        .instrument(span)
        .await
    }

    /// Request settings, listen for the next state change, return the snapshot
    pub async fn refresh_status(
        &self,
        credential: &Credential,
        consumer: &str,
        device_id: &str,
    ) -> SydpowerResult<Option<DeviceState>> {
        let listen = self.refresh_listen;
        self.with_connection(credential, consumer, |connection| async move {
            let client = connection.client();
            let mut client = client.lock().await;

            client.request_device_settings(device_id).await?;
            if !client.wait_for_data_update(device_id, listen).await? {
                warn!(device_id = %device_id, "No status update within the listen window");
            }
            Ok(client.get_device_status(device_id).cloned())
        })
        .await
    }

    /// Hold the consumer's command lock around a pooled-connection operation.
    ///
    /// Transport failures tear the pool entry down; everything else only
    /// releases the pool lock.
    async fn with_connection<T, F, Fut>(
        &self,
        credential: &Credential,
        consumer: &str,
        op: F,
    ) -> SydpowerResult<T>
    where
        F: FnOnce(PooledConnection) -> Fut,
        Fut: Future<Output = SydpowerResult<T>>,
    {
        let resource = format!("command_{consumer}");
        self.semaphore
            .with_lock(&resource, self.lock_timeout, || async {
                let connection = self.pool.get_connection(credential, consumer).await?;
                let result = op(connection.clone()).await;

                match &result {
                    Err(e) if e.is_transport_failure() => {
                        self.pool.invalidate(&connection).await;
                    }
                    _ => self.pool.release_connection(consumer).await,
                }
                result
            })
            .await
    }
}
