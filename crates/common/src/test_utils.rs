//! Test utilities for the ADB bridge
//!
//! Provides in-memory stand-ins for a claimed USB interface and helper
//! functions shared by the test suites of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device_info;
//!
//! let device = create_mock_device_info(1);
//! assert_eq!(device.serial_number, "SN000001");
//! ```

use crate::usb_types::{DeviceInfo, DeviceLister, TransportError, UsbConnector, UsbTransport};
use protocol::{Packet, UsbHeaderRead, classify_usb_header, usb_transfers};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock DeviceInfo with serial `SN{id:06}`
pub fn create_mock_device_info(id: u32) -> DeviceInfo {
    DeviceInfo::new(
        format!("SN{:06}", id),
        format!("Test Device {}", id),
        0x18d1,
        0x4ee7,
    )
}

/// Create `count` mock devices with distinct serials
pub fn create_mock_device_list(count: u32) -> Vec<DeviceInfo> {
    (1..=count).map(create_mock_device_info).collect()
}

/// Ask the OS for a currently free localhost TCP port
pub fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Rebuild packets from a sequence of bulk-out transfers
///
/// Zero-length and non-header transfers between packets are skipped.
pub fn decode_usb_transfers(transfers: &[Vec<u8>]) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut iter = transfers.iter();
    while let Some(transfer) = iter.next() {
        let UsbHeaderRead::Header(header) = classify_usb_header(transfer) else {
            continue;
        };
        let mut payload = Vec::with_capacity(header.payload_len());
        while payload.len() < header.payload_len() {
            match iter.next() {
                Some(chunk) => payload.extend_from_slice(chunk),
                None => return packets,
            }
        }
        if let Ok(packet) = Packet::from_parts(header, payload) {
            packets.push(packet);
        }
    }
    packets
}

// ============================================================================
// Mock USB transport
// ============================================================================

enum Inbound {
    Data(Vec<u8>),
    Fail(TransportError),
}

struct Shared {
    written: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    released: AtomicBool,
}

/// In-memory claimed interface handed to the code under test
pub struct MockTransport {
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    shared: Arc<Shared>,
}

/// Test-side handle of a [`MockTransport`], playing the device
///
/// Dropping the handle makes further reads fail with
/// [`TransportError::Disconnected`], like an unplugged cable.
pub struct MockDevice {
    inbound: mpsc::Sender<Inbound>,
    shared: Arc<Shared>,
}

/// Create a connected transport/device pair
pub fn mock_transport() -> (Arc<MockTransport>, MockDevice) {
    let (tx, rx) = mpsc::channel();
    let shared = Arc::new(Shared {
        written: Mutex::new(Vec::new()),
        fail_writes: AtomicBool::new(false),
        released: AtomicBool::new(false),
    });
    let transport = MockTransport {
        inbound: Mutex::new(rx),
        shared: Arc::clone(&shared),
    };
    (
        Arc::new(transport),
        MockDevice {
            inbound: tx,
            shared,
        },
    )
}

impl UsbTransport for MockTransport {
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let inbound = self
            .inbound
            .lock()
            .map_err(|_| TransportError::Io("mock poisoned".into()))?;
        match inbound.recv_timeout(timeout) {
            Ok(Inbound::Data(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Ok(Inbound::Fail(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn write_bulk(&self, buf: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("mock write failure".into()));
        }
        let mut written = self
            .shared
            .written
            .lock()
            .map_err(|_| TransportError::Io("mock poisoned".into()))?;
        written.push(buf.to_vec());
        Ok(buf.len())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.shared.released.store(true, Ordering::SeqCst);
    }
}

impl MockDevice {
    /// Queue one raw bulk-in transfer
    pub fn send_raw(&self, data: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(Inbound::Data(data.into()));
    }

    /// Queue a packet as header and payload transfers
    pub fn send_packet(&self, packet: &Packet) {
        for transfer in usb_transfers(packet, protocol::USB_MAX_PACKET_SIZE) {
            if !transfer.is_empty() {
                self.send_raw(transfer.to_vec());
            }
        }
    }

    /// Make the next read fail with `err`
    pub fn fail_read(&self, err: TransportError) {
        let _ = self.inbound.send(Inbound::Fail(err));
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every bulk-out transfer so far, zero-length ones included
    pub fn written_transfers(&self) -> Vec<Vec<u8>> {
        self.shared
            .written
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    pub fn written_packets(&self) -> Vec<Packet> {
        decode_usb_transfers(&self.written_transfers())
    }

    /// Poll until at least `count` packets were written to the device
    pub async fn wait_for_packets(&self, count: usize, timeout: Duration) -> Vec<Packet> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let packets = self.written_packets();
            if packets.len() >= count || tokio::time::Instant::now() >= deadline {
                return packets;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// True once the transport side was dropped
    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Poll until the transport side was dropped
    pub async fn wait_released(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_released() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

// ============================================================================
// Mock connector and lister
// ============================================================================

/// Connector producing [`MockTransport`]s
///
/// Each successful connect delivers the matching [`MockDevice`] on the
/// receiver returned by [`MockConnector::new`].
pub struct MockConnector {
    attempts: AtomicUsize,
    failures_remaining: AtomicUsize,
    connect_delay: Mutex<Duration>,
    devices: UnboundedSender<MockDevice>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<MockDevice>) {
        let (tx, rx) = unbounded_channel();
        let connector = Self {
            attempts: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            devices: tx,
        };
        (Arc::new(connector), rx)
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Block every connect attempt for `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.connect_delay.lock() {
            *current = delay;
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl UsbConnector for MockConnector {
    fn connect(&self, device: &DeviceInfo) -> crate::Result<Arc<dyn UsbTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.connect_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(crate::Error::DeviceNotFound(device.serial_number.clone()));
        }

        let (transport, mock_device) = mock_transport();
        let _ = self.devices.send(mock_device);
        Ok(transport)
    }
}

/// Lister returning a settable device list
#[derive(Default)]
pub struct MockLister {
    devices: Mutex<Vec<DeviceInfo>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockLister {
    pub fn new(devices: Vec<DeviceInfo>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            ..Default::default()
        })
    }

    pub fn set_devices(&self, devices: Vec<DeviceInfo>) {
        if let Ok(mut current) = self.devices.lock() {
            *current = devices;
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeviceLister for MockLister {
    fn list_devices(&self) -> crate::Result<Vec<DeviceInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(crate::Error::Usb("mock enumeration failure".into()));
        }
        self.devices
            .lock()
            .map(|d| d.clone())
            .map_err(|_| crate::Error::Other("mock poisoned".into()))
    }
}
