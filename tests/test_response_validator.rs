//! Response validation over a connected client and simulated device

use std::sync::Arc;
use std::time::Duration;
use sydpower::protocol::modbus::registers as reg;
use sydpower::protocol::{Command, StateField};
use sydpower::testing::frames::full_dump;
use sydpower::testing::{connected_client, DeviceSimulator, MockCloudApi, MockTransport, TEST_DEVICE};
use sydpower::validation::ResponseValidator;
use tempfile::TempDir;

#[tokio::test(start_paused = true)]
async fn test_max_charge_current_confirmed() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let simulator = DeviceSimulator::new(TEST_DEVICE);
    transport.set_responder(simulator.responder()).await;
    let mut client = connected_client(dir.path(), transport, Arc::new(MockCloudApi::new()))
        .await
        .unwrap();

    client
        .send_command(TEST_DEVICE, Command::MaxChargeCurrent, Some(15))
        .await
        .unwrap();
    let report = ResponseValidator::default()
        .wait_for_valid_response(&mut client, TEST_DEVICE, Command::MaxChargeCurrent, Some(15))
        .await
        .unwrap();

    assert!(report.success, "{report:?}");
    assert!(report.missing_fields.is_empty());
    assert_eq!(
        report.state.unwrap().readings.maximum_charging_current,
        Some(15)
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_value_is_not_a_confirmation() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let simulator = DeviceSimulator::new(TEST_DEVICE);
    // The device keeps answering but never applies the write
    let ignoring = simulator.clone();
    transport
        .set_responder(Arc::new(move |topic: &str, _: &[u8]| {
            ignoring.handle(topic, &sydpower::protocol::modbus::read_registers(0, 80))
        }))
        .await;
    let mut client = connected_client(dir.path(), transport, Arc::new(MockCloudApi::new()))
        .await
        .unwrap();

    client
        .send_command(TEST_DEVICE, Command::ChargeUpperLimit, Some(80))
        .await
        .unwrap();
    let report = ResponseValidator::default()
        .wait_for_valid_response(&mut client, TEST_DEVICE, Command::ChargeUpperLimit, Some(80))
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.timed_out);
    assert!(report.missing_fields.is_empty(), "fields arrived, value is wrong");
    assert_eq!(report.state.unwrap().readings.ac_charging_upper_limit, Some(1000));
    assert!(report.elapsed >= Duration::from_millis(2500));
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_arriving_late_is_picked_up() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut client = connected_client(dir.path(), transport.clone(), Arc::new(MockCloudApi::new()))
        .await
        .unwrap();

    let late = transport.clone();
    let push = async move {
        tokio::time::sleep(Duration::from_millis(700)).await;
        late.push_frame(
            format!("{TEST_DEVICE}/device/response/client/04"),
            full_dump(|dump| {
                dump.set(reg::STATE_OF_CHARGE, 640)
                    .set(reg::TOTAL_INPUT, 0)
                    .set(reg::TOTAL_OUTPUT, 55);
            }),
        )
        .await;
    };
    let validator = ResponseValidator::default();
    let wait = validator.wait_for_valid_response(
        &mut client,
        TEST_DEVICE,
        Command::RequestSettings,
        None,
    );

    let (report, ()) = tokio::join!(wait, push);
    let report = report.unwrap();

    assert!(report.success);
    assert!(report.elapsed >= Duration::from_millis(700));
    let readings = report.state.unwrap().readings;
    assert_eq!(readings.soc, Some(64.0));
    assert_eq!(readings.total_output, Some(55));
    assert!(!report.missing_fields.contains(&StateField::TotalInput));
}
