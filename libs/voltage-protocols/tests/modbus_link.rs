//! ModbusTcpLink against the in-process simulator

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::time::Duration;

use voltage_modbus::{ModbusClient, ModbusTcpClient};
use voltage_protocols::modbus::{
    encode_do_command, BreakerModel, LinkError, ModbusSimulator, ModbusTcpLink, WordOrdering,
    DEFAULT_ORDERINGS, DO_ACTION_OFF, DO_ACTION_ON,
};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn connect(sim: &ModbusSimulator) -> ModbusTcpLink {
    let addr = sim.start(0).await.unwrap();
    ModbusTcpLink::connect("127.0.0.1", addr.port(), 1, TIMEOUT)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_write_register_drives_breaker_status() {
    let sim = ModbusSimulator::with_breaker(BreakerModel::default(), false).await;
    let mut link = connect(&sim).await;

    link.write_single_register(60008, encode_do_command(0, DO_ACTION_ON))
        .await
        .unwrap();
    assert_eq!(link.read_holding_register(207).await.unwrap() & 0x0001, 1);
    assert!(link.read_discrete_input(400).await.unwrap());

    link.write_single_register(60008, encode_do_command(0, DO_ACTION_OFF))
        .await
        .unwrap();
    assert_eq!(link.read_holding_register(207).await.unwrap() & 0x0001, 0);
    assert!(!link.read_discrete_input(400).await.unwrap());

    link.close().await;
    assert!(!link.is_connected());
}

#[tokio::test]
async fn test_write_coil_fallback_path() {
    let sim = ModbusSimulator::with_breaker(BreakerModel::default(), false).await;
    let mut link = connect(&sim).await;

    link.write_single_coil(0, true).await.unwrap();
    assert_eq!(sim.coil(0).await, Some(true));
    assert_eq!(sim.breaker_state().await, Some(true));
}

#[tokio::test]
async fn test_exception_response_is_an_error_and_keeps_connection() {
    let sim = ModbusSimulator::with_breaker(BreakerModel::default(), false).await;
    sim.set_register_write_exception(Some(0x04)).await;
    let mut link = connect(&sim).await;

    let err = link.write_single_register(60008, 256).await.unwrap_err();
    assert_eq!(
        err,
        LinkError::Exception {
            function: 0x06,
            code: 0x04
        }
    );
    assert!(link.is_connected());

    // Same socket still serves requests
    assert_eq!(link.read_holding_register(207).await.unwrap(), 0);
    assert_eq!(sim.connection_count(), 1);
}

#[tokio::test]
async fn test_read_float_with_ordering_fallback() {
    let sim = ModbusSimulator::new();
    sim.set_holding_register(100, 0x42F6).await;
    sim.set_holding_register(101, 0xE979).await;
    let mut link = connect(&sim).await;

    let value = link
        .read_float32(100, &DEFAULT_ORDERINGS)
        .await
        .unwrap()
        .unwrap();
    assert!((value - 123.456).abs() < 1e-3);

    let value = link.read_float32(100, &[WordOrdering::BADC]).await.unwrap();
    assert_eq!(value, None);
}

#[tokio::test]
async fn test_read_input_registers() {
    let sim = ModbusSimulator::new();
    sim.set_input_register(10, 7).await;
    sim.set_input_register(11, 9).await;
    let mut link = connect(&sim).await;

    assert_eq!(link.read_input_registers(10, 2).await.unwrap(), vec![7, 9]);
}

#[tokio::test]
async fn test_connect_refused() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = ModbusTcpLink::connect("127.0.0.1", port, 1, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Connection(_)));
    assert!(err.is_connection_fatal());
}

#[tokio::test]
async fn test_host_names_are_resolved() {
    let sim = ModbusSimulator::new();
    let addr = sim.start(0).await.unwrap();

    let link = ModbusTcpLink::connect("localhost", addr.port(), 3, TIMEOUT)
        .await
        .unwrap();
    assert!(link.peer().ip().is_loopback());
    assert_eq!(link.unit_id(), 3);
}

#[tokio::test]
async fn test_closed_link_reports_not_connected() {
    let sim = ModbusSimulator::new();
    let mut link = connect(&sim).await;
    link.close().await;

    let err = link.read_holding_register(0).await.unwrap_err();
    assert_eq!(err, LinkError::NotConnected);
}

#[tokio::test]
async fn test_read_discrete_input_bits() {
    let sim = ModbusSimulator::new();
    sim.set_discrete_input(20, true).await;
    sim.set_discrete_input(22, true).await;
    sim.set_discrete_input(29, true).await;
    let mut link = connect(&sim).await;

    let bits = link.read_discrete_inputs(20, 10).await.unwrap();
    assert_eq!(
        bits,
        vec![true, false, true, false, false, false, false, false, false, true]
    );
}

#[tokio::test]
async fn test_read_float64_big_endian() {
    let sim = ModbusSimulator::new();
    for (offset, word) in [0x405E, 0xDD2F, 0x1A9F, 0xBE77].into_iter().enumerate() {
        sim.set_holding_register(300 + offset as u16, word).await;
    }
    let mut link = connect(&sim).await;

    let value = link
        .read_float64(300, &[WordOrdering::ABCD])
        .await
        .unwrap()
        .unwrap();
    assert!((value - 123.456).abs() < 1e-9);
}

#[tokio::test]
async fn test_rejected_coil_write() {
    let sim = ModbusSimulator::with_breaker(BreakerModel::default(), true).await;
    sim.set_coil_write_exception(Some(0x02)).await;
    let mut link = connect(&sim).await;

    let err = link.write_single_coil(0, false).await.unwrap_err();
    assert!(!err.is_connection_fatal());
    assert_eq!(sim.breaker_state().await, Some(true));
}

#[tokio::test]
async fn test_simulator_serves_plain_voltage_modbus_client() {
    let sim = ModbusSimulator::with_breaker(BreakerModel::default(), false).await;
    let addr = sim.start(0).await.unwrap();

    let mut client = ModbusTcpClient::from_address(&addr.to_string(), TIMEOUT)
        .await
        .unwrap();
    client.write_06(1, 60008, 256).await.unwrap();
    let regs = client.read_03(1, 207, 1).await.unwrap();
    assert_eq!(regs, vec![1]);
    client.close().await.unwrap();
}
