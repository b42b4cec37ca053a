//! USB pump pair
//!
//! Two dedicated OS threads bound to one claimed ADB interface:
//!
//! - `usb-read` reads bulk-in transfers, reassembles packets and emits them
//!   as [`PumpEvent`]s for the TCP side.
//! - `usb-write` drains a bounded packet queue to bulk-out, one packet at a
//!   time, in submission order.
//!
//! The threads use the blocking ends of `async_channel` queues and the tokio
//! side uses the async ends, so neither blocks the runtime.

use crate::config::BridgeSettings;
use async_channel::{Receiver, Sender, TryRecvError, bounded};
use common::{Error, Result, TransportError, UsbTransport};
use protocol::{
    MAX_PAYLOAD_SIZE, Packet, PacketHeader, USB_READ_BUFFER_SIZE, UsbHeaderRead,
    classify_usb_header, usb_transfers,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Span, debug, info, trace, warn};

/// Extra wait on top of the read poll timeout when stopping the read pump
const READ_STOP_MARGIN: Duration = Duration::from_millis(500);

/// Output of the read pump
#[derive(Debug)]
pub enum PumpEvent {
    Packet(Packet),
    /// Bulk-in failed; the read pump has stopped
    ReadFailed(String),
}

/// Producer handle for the write pump
#[derive(Clone)]
pub struct PumpWriter {
    queue: Sender<Packet>,
    errors: Receiver<TransportError>,
}

impl PumpWriter {
    /// Queue a packet for the device
    ///
    /// A write failure that nobody has seen yet is returned (and consumed)
    /// instead of queuing. Waits while the queue is full.
    pub async fn enqueue(&self, packet: Packet) -> Result<()> {
        match self.errors.try_recv() {
            Ok(err) => return Err(Error::Usb(format!("USB write failed: {}", err))),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {}
        }
        self.queue
            .send(packet)
            .await
            .map_err(|_| Error::Usb("USB write pump stopped".to_string()))
    }
}

/// Read and write threads for one claimed interface
///
/// A new pair is started on every (re)connect. [`UsbPumpPair::shutdown`]
/// stops both threads and releases the interface; dropping the pair only
/// signals the threads.
pub struct UsbPumpPair {
    generation: u64,
    transport: Option<Arc<dyn UsbTransport>>,
    running: Arc<AtomicBool>,
    writer: PumpWriter,
    events: Receiver<PumpEvent>,
    write_done: Receiver<()>,
    read_done: Receiver<()>,
    read_poll: Duration,
    stop_timeout: Duration,
}

impl UsbPumpPair {
    /// Start both pumps on `transport`
    pub fn start(
        transport: Arc<dyn UsbTransport>,
        generation: u64,
        settings: &BridgeSettings,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (queue_tx, queue_rx) = bounded::<Packet>(settings.write_queue_capacity);
        let (error_tx, error_rx) = bounded::<TransportError>(1);
        let (event_tx, event_rx) = bounded::<PumpEvent>(settings.read_queue_capacity);
        let (write_done_tx, write_done_rx) = bounded::<()>(1);
        let (read_done_tx, read_done_rx) = bounded::<()>(1);

        let write_pump = WritePump {
            transport: Arc::clone(&transport),
            queue: queue_rx,
            errors: error_tx,
            write_timeout: settings.usb_write_timeout(),
            _done: write_done_tx,
        };
        let span = Span::current();
        std::thread::Builder::new()
            .name("usb-write".to_string())
            .spawn(move || {
                let _enter = span.enter();
                write_pump.run();
            })?;

        let read_pump = ReadPump {
            transport: Arc::clone(&transport),
            events: event_tx,
            running: Arc::clone(&running),
            poll: settings.usb_read_poll(),
            _done: read_done_tx,
        };
        let span = Span::current();
        let spawned = std::thread::Builder::new()
            .name("usb-read".to_string())
            .spawn(move || {
                let _enter = span.enter();
                read_pump.run();
            });
        if let Err(e) = spawned {
            queue_tx.close();
            return Err(e.into());
        }

        debug!(generation, "USB pumps started");
        Ok(Self {
            generation,
            transport: Some(transport),
            running,
            writer: PumpWriter {
                queue: queue_tx,
                errors: error_rx,
            },
            events: event_rx,
            write_done: write_done_rx,
            read_done: read_done_rx,
            read_poll: settings.usb_read_poll(),
            stop_timeout: settings.pump_stop_timeout(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn writer(&self) -> PumpWriter {
        self.writer.clone()
    }

    pub fn events(&self) -> Receiver<PumpEvent> {
        self.events.clone()
    }

    /// Stop both pumps and release the interface
    ///
    /// Queued writes are drained first. Each wait is bounded, so this
    /// returns even if a thread is stuck in a transfer.
    pub async fn shutdown(mut self) {
        self.writer.queue.close();
        match tokio::time::timeout(self.stop_timeout, self.write_done.recv()).await {
            Ok(_) => debug!("USB write pump stopped"),
            Err(_) => warn!(
                "Timed out after {:?} waiting for USB write pump to stop",
                self.stop_timeout
            ),
        }

        self.running.store(false, Ordering::SeqCst);
        self.events.close();
        let read_wait = self.read_poll + READ_STOP_MARGIN;
        match tokio::time::timeout(read_wait, self.read_done.recv()).await {
            Ok(_) => debug!("USB read pump stopped"),
            Err(_) => warn!("Timed out after {:?} waiting for USB read pump", read_wait),
        }

        self.transport.take();
        info!(generation = self.generation, "USB pumps shut down");
    }
}

impl Drop for UsbPumpPair {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.writer.queue.close();
        self.events.close();
    }
}

struct WritePump {
    transport: Arc<dyn UsbTransport>,
    queue: Receiver<Packet>,
    errors: Sender<TransportError>,
    write_timeout: Duration,
    /// Dropped when the thread exits, which is the stop acknowledgement
    _done: Sender<()>,
}

impl WritePump {
    fn run(self) {
        debug!("USB write pump started");
        while let Ok(packet) = self.queue.recv_blocking() {
            if let Err(e) = self.write_packet(&packet) {
                warn!("USB write failed: {}", e);
                // Single slot; an older unseen failure already says enough
                let _ = self.errors.try_send(e);
                break;
            }
        }
        debug!("USB write pump finished");
    }

    fn write_packet(&self, packet: &Packet) -> std::result::Result<(), TransportError> {
        let max_packet_size = self.transport.max_packet_size();
        for transfer in usb_transfers(packet, max_packet_size) {
            let written = self.transport.write_bulk(&transfer, self.write_timeout)?;
            if written != transfer.len() {
                return Err(TransportError::Io(format!(
                    "short write: {} of {} bytes",
                    written,
                    transfer.len()
                )));
            }
        }
        trace!(
            command = ?packet.command_type(),
            len = packet.payload().len(),
            "Packet written to USB"
        );
        Ok(())
    }
}

struct ReadPump {
    transport: Arc<dyn UsbTransport>,
    events: Sender<PumpEvent>,
    running: Arc<AtomicBool>,
    poll: Duration,
    _done: Sender<()>,
}

impl ReadPump {
    fn run(self) {
        debug!("USB read pump started");
        let mut buf = [0u8; USB_READ_BUFFER_SIZE];

        while self.running.load(Ordering::SeqCst) {
            let len = match self.transport.read_bulk(&mut buf, self.poll) {
                Ok(len) => len,
                Err(TransportError::Timeout) => continue,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            };

            let header = match classify_usb_header(&buf[..len]) {
                UsbHeaderRead::Header(header) => header,
                UsbHeaderRead::Noise { len } => {
                    debug!("Discarding {} byte transfer while waiting for a header", len);
                    continue;
                }
                UsbHeaderRead::UnknownCommand(header) => {
                    debug!(
                        "Discarding header with unknown command {:#010x}",
                        header.command
                    );
                    continue;
                }
            };

            if header.payload_len() > MAX_PAYLOAD_SIZE {
                warn!(
                    "Discarding header announcing {} payload bytes",
                    header.payload_len()
                );
                continue;
            }

            let payload = match self.read_payload(&header) {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            };

            let packet = match Packet::from_parts(header, payload) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Dropping malformed packet: {}", e);
                    continue;
                }
            };
            trace!(command = ?packet.command_type(), "Packet read from USB");
            if self.events.send_blocking(PumpEvent::Packet(packet)).is_err() {
                break;
            }
        }
        debug!("USB read pump finished");
    }

    /// Read exactly `data_length` bytes; `None` if stopped meanwhile
    fn read_payload(
        &self,
        header: &PacketHeader,
    ) -> std::result::Result<Option<Vec<u8>>, TransportError> {
        let mut payload = vec![0u8; header.payload_len()];
        let mut filled = 0;
        while filled < payload.len() {
            match self.transport.read_bulk(&mut payload[filled..], self.poll) {
                Ok(n) => filled += n,
                Err(TransportError::Timeout) => {
                    if !self.running.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(payload))
    }

    fn fail(&self, err: TransportError) {
        warn!("USB read failed: {}", err);
        let _ = self.events.send_blocking(PumpEvent::ReadFailed(err.to_string()));
    }
}
