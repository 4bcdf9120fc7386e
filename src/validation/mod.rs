//! Response validation
//!
//! Correlates a sent command with the telemetry that confirms it. The device
//! never acknowledges a write directly; instead the validator asks for a
//! settings dump and pumps the broker session on an adaptive schedule until
//! the merged state satisfies the command's predicate or its budget runs out.

pub mod expectations;

pub use expectations::{
    expectation_for, is_output_command, is_settings_command, CommandExpectation, Predicate,
};

use crate::config::ValidatorSection;
use crate::device::DeviceClient;
use crate::error::SydpowerResult;
use crate::protocol::{Command, DeviceState, StateField};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pump intervals in milliseconds; the last one repeats
pub const POLL_SCHEDULE_MS: [u64; 6] = [50, 100, 100, 200, 200, 500];

const GENERIC_SLICE: Duration = Duration::from_millis(100);

/// Outcome of one validation wait
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub command: Command,
    pub success: bool,
    /// Last observed snapshot, complete on success, partial otherwise
    pub state: Option<DeviceState>,
    pub missing_fields: Vec<StateField>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    /// Distinct snapshots observed while waiting
    pub updates: u32,
    pub timed_out: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ValidationReport {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

#[derive(Debug, Clone)]
pub struct ResponseValidator {
    generic_wait: Duration,
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::new(&ValidatorSection::default())
    }
}

impl ResponseValidator {
    pub fn new(section: &ValidatorSection) -> Self {
        Self {
            generic_wait: Duration::from_millis(section.generic_wait_ms),
        }
    }

    fn poll_interval(index: usize) -> Duration {
        let ms = POLL_SCHEDULE_MS[index.min(POLL_SCHEDULE_MS.len() - 1)];
        Duration::from_millis(ms)
    }

    /// Pump one interval, or just sleep it off when the session is down
    async fn poll(client: &mut DeviceClient, interval: Duration) -> SydpowerResult<()> {
        if client.is_healthy() {
            client.listen_for_updates(interval).await?;
        } else {
            tokio::time::sleep(interval).await;
        }
        Ok(())
    }

    /// Wait until `device_id`'s state confirms `command`.
    ///
    /// Running out of time is not an error: the report then carries the last
    /// partial state and the required fields still missing.
    pub async fn wait_for_valid_response(
        &self,
        client: &mut DeviceClient,
        device_id: &str,
        command: Command,
        expected: Option<u16>,
    ) -> SydpowerResult<ValidationReport> {
        let Some(expectation) = expectation_for(command) else {
            debug!(command = %command, "No expectation, using generic wait");
            return self.generic_wait(client, device_id, command).await;
        };

        let started = Instant::now();
        client.request_device_settings(device_id).await?;

        let mut last: Option<DeviceState> = None;
        let mut updates = 0u32;
        let mut poll_index = 0usize;

        while started.elapsed() < expectation.max_wait {
            let remaining = expectation.max_wait - started.elapsed();
            Self::poll(client, Self::poll_interval(poll_index).min(remaining)).await?;
            poll_index += 1;

            let current = client.get_device_status(device_id).cloned();
            if current == last {
                continue;
            }
            updates += 1;
            last = current;

            let Some(state) = last.as_ref() else {
                continue;
            };
            let missing = state.missing(expectation.fields);
            debug!(update = updates, missing = ?missing, "State changed");

            if missing.is_empty() {
                if expectation.predicate.evaluate(state, expected) {
                    let elapsed = started.elapsed();
                    info!(command = %command, elapsed_ms = elapsed.as_millis() as u64, "Command confirmed");
                    return Ok(ValidationReport {
                        command,
                        success: true,
                        state: last,
                        missing_fields: Vec::new(),
                        elapsed,
                        updates,
                        timed_out: false,
                    });
                }
                debug!("Fields present but predicate not met");
            }
        }

        let missing_fields = match &last {
            Some(state) => state.missing(expectation.fields),
            None => expectation.fields.to_vec(),
        };
        let elapsed = started.elapsed();
        warn!(
            command = %command,
            elapsed_ms = elapsed.as_millis() as u64,
            missing = ?missing_fields,
            "No confirming response before timeout"
        );

        Ok(ValidationReport {
            command,
            success: false,
            state: last,
            missing_fields,
            elapsed,
            updates,
            timed_out: true,
        })
    }

    /// Refresh, listen for the generic wait, return whatever state there is
    async fn generic_wait(
        &self,
        client: &mut DeviceClient,
        device_id: &str,
        command: Command,
    ) -> SydpowerResult<ValidationReport> {
        let started = Instant::now();
        let before = client.get_device_status(device_id).cloned();
        client.request_device_settings(device_id).await?;

        while started.elapsed() < self.generic_wait {
            let remaining = self.generic_wait - started.elapsed();
            Self::poll(client, GENERIC_SLICE.min(remaining)).await?;
        }

        let state = client.get_device_status(device_id).cloned();
        let updates = u32::from(state.is_some() && state != before);
        Ok(ValidationReport {
            command,
            success: state.as_ref().is_some_and(|s| !s.readings.is_empty()),
            state,
            missing_fields: Vec::new(),
            elapsed: started.elapsed(),
            updates,
            timed_out: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_client, DeviceSimulator, MockTransport, TEST_DEVICE};
    use crate::transport::InboundFrame;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ac_on_confirmed_within_budget() {
        let transport = MockTransport::new();
        let simulator = DeviceSimulator::new(TEST_DEVICE);
        transport.set_responder(simulator.responder()).await;
        let (mut client, _dir) = test_client(transport.clone()).await;

        client
            .send_command(TEST_DEVICE, Command::EnableAcOutput, None)
            .await
            .unwrap();
        let report = ResponseValidator::default()
            .wait_for_valid_response(&mut client, TEST_DEVICE, Command::EnableAcOutput, None)
            .await
            .unwrap();

        assert!(report.success);
        assert!(report.elapsed < Duration::from_millis(2000));
        assert_eq!(report.state.unwrap().readings.ac_output, Some(true));
        assert!(report.updates >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_with_missing_fields() {
        let transport = MockTransport::new();
        let (mut client, _dir) = test_client(transport.clone()).await;

        let report = ResponseValidator::default()
            .wait_for_valid_response(&mut client, TEST_DEVICE, Command::EnableAcOutput, None)
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.timed_out);
        assert_eq!(
            report.missing_fields,
            vec![
                StateField::AcOutput,
                StateField::MaximumChargingCurrent,
                StateField::TotalOutput
            ]
        );
        assert!(report.elapsed >= Duration::from_millis(2000));
        assert!(report.elapsed < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_state_reports_only_missing_fields() {
        let transport = MockTransport::new();
        let simulator = DeviceSimulator::new(TEST_DEVICE);
        // Charging current register reads 0, i.e. not reported
        simulator.set(20, 0);
        transport.set_responder(simulator.responder()).await;
        let (mut client, _dir) = test_client(transport.clone()).await;

        client
            .send_command(TEST_DEVICE, Command::EnableDcOutput, None)
            .await
            .unwrap();
        let report = ResponseValidator::default()
            .wait_for_valid_response(&mut client, TEST_DEVICE, Command::EnableDcOutput, None)
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.missing_fields, vec![StateField::MaximumChargingCurrent]);
        assert_eq!(report.state.unwrap().readings.dc_output, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_confirmed_with_tolerance() {
        let transport = MockTransport::new();
        let simulator = DeviceSimulator::new(TEST_DEVICE);
        transport.set_responder(simulator.responder()).await;
        let (mut client, _dir) = test_client(transport.clone()).await;

        client
            .send_command(TEST_DEVICE, Command::DischargeLowerLimit, Some(20))
            .await
            .unwrap();
        let report = ResponseValidator::default()
            .wait_for_valid_response(
                &mut client,
                TEST_DEVICE,
                Command::DischargeLowerLimit,
                Some(20),
            )
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.state.unwrap().readings.discharge_lower_limit, Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_wait_for_commands_without_expectation() {
        let transport = MockTransport::new();
        let simulator = DeviceSimulator::new(TEST_DEVICE);
        transport.set_responder(simulator.responder()).await;
        let (mut client, _dir) = test_client(transport.clone()).await;

        let report = ResponseValidator::default()
            .wait_for_valid_response(&mut client, TEST_DEVICE, Command::StopChargeAfter, Some(30))
            .await
            .unwrap();

        assert!(report.success);
        assert!(!report.timed_out);
        assert!(report.elapsed >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_drop_mid_wait_degrades_to_timeout() {
        let transport = MockTransport::new();
        let dropper = transport.clone();
        transport
            .set_responder(Arc::new(move |_: &str, _: &[u8]| {
                dropper.drop_connection();
                Vec::<InboundFrame>::new()
            }))
            .await;
        let (mut client, _dir) = test_client(transport.clone()).await;

        let report = ResponseValidator::default()
            .wait_for_valid_response(&mut client, TEST_DEVICE, Command::RequestSettings, None)
            .await
            .unwrap();

        assert!(!client.is_healthy());
        assert!(report.timed_out);
        assert_eq!(report.missing_fields.len(), 3);
        assert!(report.elapsed >= Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_refresh_fails_when_session_is_gone() {
        let transport = MockTransport::new();
        let (mut client, _dir) = test_client(transport.clone()).await;
        transport.drop_connection();

        let result = ResponseValidator::default()
            .wait_for_valid_response(&mut client, TEST_DEVICE, Command::RequestSettings, None)
            .await;
        assert!(result.unwrap_err().is_transport_failure());
    }
}
