//! End-to-end tests of connections over the mock line.

mod common;

use common::{BenchPsu, Psu};
use daq_link::connection::{ConnectionEvent, ConnectionState};
use daq_link::error::LinkError;
use daq_link::manager::ConnectionManager;
use daq_link::transport::mock::MockDevice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};

fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ConnectionEvent::Idle | ConnectionEvent::StateChanged(_)) => {}
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => {}
            Err(_) => return events,
        }
    }
}

fn psu_device() -> MockDevice {
    let device = MockDevice::new().with_terminator("\n");
    device.respond_with(|frame| match frame {
        b"*IDN?\n" => Some(b"ACME BENCH PSU 2.1\n".to_vec()),
        b"*RST\n" => None,
        b"STATUS?\n" => Some(b"\x13OK\x11\n".to_vec()),
        _ => Some(b"ACK\n".to_vec()),
    });
    device
}

#[test]
fn test_set_voltage_ack_and_nak() {
    let device = MockDevice::new().with_terminator("\n");
    let mut replies = ["ACK", "ERR", "ACK"].into_iter();
    device.respond_with(move |_| replies.next().map(|reply| format!("{reply}\n").into_bytes()));
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    psu.connect("COM1").unwrap();

    psu.command_with(Psu::SetVoltage, "5.00").unwrap();
    assert_eq!(device.frames(), vec!["VSET 5.00\n".to_string()]);

    let err = psu.command_with(Psu::SetVoltage, "5.00").unwrap_err();
    assert!(matches!(
        err,
        LinkError::Protocol { ref command, ref reply, .. } if command == "SetVoltage" && reply == "ERR"
    ));
    assert!(psu.state().contains(ConnectionState::ERROR));

    psu.command_with(Psu::Output, "1").unwrap();
    assert!(!psu.state().contains(ConnectionState::ERROR));
    assert_eq!(psu.error_count(), 0);
    assert_eq!(device.frames().last().map(String::as_str), Some("OUT:1\n"));
}

#[test]
fn test_request_strips_flow_control() {
    let device = psu_device();
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    psu.connect("COM1").unwrap();
    assert_eq!(psu.request(Psu::Status).unwrap(), "OK");
    assert_eq!(psu.custom_request("STATUS?").unwrap(), "OK");
}

#[test]
fn test_shared_line_notifies_every_owner() {
    let device = psu_device();
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), Some("bus")).unwrap();
    let load = manager.open(BenchPsu::new("load"), Some("bus")).unwrap();
    let mut psu_events = psu.subscribe();
    let mut load_events = load.subscribe();

    psu.connect("COM1").unwrap();
    assert_eq!(drain(&mut psu_events), vec![ConnectionEvent::Connected]);
    assert_eq!(drain(&mut load_events), vec![ConnectionEvent::Connected]);
    assert!(load.is_connected());

    psu.initialize().unwrap();
    assert_eq!(load.state(), ConnectionState::READY);
    assert_eq!(drain(&mut load_events), vec![ConnectionEvent::Initialized]);

    load.disconnect().unwrap();
    assert!(!psu.is_connected());
    assert_eq!(
        drain(&mut psu_events),
        vec![ConnectionEvent::Initialized, ConnectionEvent::Disconnected]
    );
    assert_eq!(device.frames().last().map(String::as_str), Some("*RST\n"));
}

#[test]
fn test_failed_connect_notifies_once() {
    let device = psu_device();
    device.fail_open(true);
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), Some("bus")).unwrap();
    let load = manager.open(BenchPsu::new("load"), Some("bus")).unwrap();
    let mut psu_events = psu.subscribe();
    let mut load_events = load.subscribe();

    let err = psu.connect("COM9").unwrap_err();
    assert!(matches!(err, LinkError::PortUnavailable { ref port, .. } if port == "COM9"));
    assert_eq!(drain(&mut psu_events), vec![ConnectionEvent::Disconnected]);
    assert_eq!(drain(&mut load_events), vec![ConnectionEvent::Disconnected]);
    assert_eq!(load.state(), ConnectionState::DISCONNECTED);
}

#[test]
fn test_connect_same_port_is_noop() {
    let device = psu_device();
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    psu.connect("COM1").unwrap();
    psu.connect("COM1").unwrap();
    assert_eq!(device.opened_ports(), vec!["COM1".to_string()]);

    psu.connect("COM2").unwrap();
    assert_eq!(device.opened_ports(), vec!["COM1".to_string(), "COM2".to_string()]);
}

#[test]
fn test_abort_interrupts_long_read() {
    let device = MockDevice::new().with_terminator("\n");
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    psu.connect("COM1").unwrap();

    let aborter = psu.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        aborter.abort();
    });
    let start = Instant::now();
    let err = psu
        .request_bytes(Psu::Fetch, 16, Some(Duration::from_secs(5)))
        .unwrap_err();
    handle.join().unwrap();
    assert!(err.is_abort(), "expected abort, got {err}");
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(psu.error_count(), 0);

    psu.clear_abort();
    let err = psu
        .request_bytes(Psu::Fetch, 16, Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, LinkError::Timeout { received: 0, .. }));
    assert_eq!(psu.error_count(), 1);
}

#[test]
fn test_abort_interrupts_text_request() {
    let device = MockDevice::new().with_terminator("\n");
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    psu.connect("COM1").unwrap();

    let aborter = psu.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        aborter.abort();
    });
    let start = Instant::now();
    let err = psu
        .request_with_timeout(Psu::Status, None, Duration::from_secs(5))
        .unwrap_err();
    handle.join().unwrap();
    assert!(err.is_abort(), "expected abort, got {err}");
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(!psu.state().contains(ConnectionState::ERROR));

    psu.clear_abort();
    let err = psu
        .request_with_timeout(Psu::Status, None, Duration::from_millis(60))
        .unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err}");
    assert_eq!(psu.error_count(), 1);
}

#[test]
fn test_binary_partial_reply_reports_received() {
    let device = MockDevice::new().with_terminator("\n");
    device.respond_with(|_| Some(vec![0x10, 0x20]));
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    psu.connect("COM1").unwrap();

    let start = Instant::now();
    let err = psu
        .request_bytes(Psu::Fetch, 4, Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(matches!(
        err,
        LinkError::Timeout { requested: 4, received: 2, .. }
    ));
}

#[test]
fn test_error_limit_closes_port() {
    let device = MockDevice::new().with_terminator("\n");
    device.respond_with(|_| Some(b"ERR\n".to_vec()));
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    psu.connect("COM1").unwrap();

    for _ in 0..3 {
        assert!(psu.command(Psu::Output).is_err());
    }
    psu.wait_for_idle(Duration::from_secs(1)).unwrap();
    assert!(!psu.is_connected());
    assert!(!device.is_open());
    assert!(psu.command(Psu::Output).unwrap_err().is_not_connected());
}

#[test]
fn test_blocking_call_from_worker_is_rejected() {
    let device = psu_device();
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    let inner = psu.clone();
    let err = psu.run(move |_| inner.flush()).unwrap_err();
    assert!(matches!(err, LinkError::WorkerThread { .. }));
}

#[test]
fn test_idle_timeout_polls_each_owner() {
    let device = psu_device();
    let manager = ConnectionManager::new(device.opener());
    let wait = Duration::from_millis(15);
    let psu = manager
        .open(BenchPsu::new("psu").with_idle_wait(wait), Some("poll-bus"))
        .unwrap();
    let load = manager
        .open(BenchPsu::new("load").with_idle_wait(wait), Some("poll-bus"))
        .unwrap();
    let mut events = psu.subscribe();

    let psu_polls = Arc::new(AtomicUsize::new(0));
    let load_polls = Arc::new(AtomicUsize::new(0));
    let counter = psu_polls.clone();
    psu.on_idle_timeout(move |engine| {
        assert!(engine.shared().state().contains(ConnectionState::AUTO_POLLING));
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = load_polls.clone();
    load.on_idle_timeout(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    psu.connect("COM1").unwrap();
    thread::sleep(Duration::from_millis(250));
    assert!(psu_polls.load(Ordering::SeqCst) > 0);
    assert!(load_polls.load(Ordering::SeqCst) > 0);
    assert!(drain(&mut events).contains(&ConnectionEvent::IdleTimeout));
}

#[test]
fn test_reset_and_abort_device_commands() {
    let device = psu_device();
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    psu.connect("COM1").unwrap();
    psu.reset().unwrap();
    psu.abort_device().unwrap();
    let frames = device.frames();
    assert_eq!(frames[0], "*RST\n");
    assert_eq!(frames[1], "ABOR\n");
}

#[tokio::test]
async fn test_async_operations() {
    let device = psu_device();
    let manager = ConnectionManager::new(device.opener());
    let psu = manager.open(BenchPsu::new("psu"), None).unwrap();
    psu.connect_async("COM1").await.unwrap();
    let identification = psu.initialize_async().await.unwrap();
    assert_eq!(identification, "ACME BENCH PSU 2.1");
    psu.command_async(Psu::SetVoltage, Some("12.5".into()))
        .await
        .unwrap();
    assert_eq!(psu.request_async(Psu::Status, None).await.unwrap(), "OK");
    psu.disconnect_async().await.unwrap();
    assert!(!psu.is_connected());
}
