//! Single-client TCP router
//!
//! Accepts connections on the bridge's listener and pairs at most one of
//! them with the USB pump pair. Device packets go to that client in the
//! order the read pump produced them; client packets go to the write pump.
//! A second client is disconnected on accept, never queued.
//!
//! The slot lock only guards which client is current. Writes happen on the
//! client's own write half, raced against its close signal, so a client
//! that stops reading can still be disconnected and its slot freed.

use crate::bridge::ops::BridgeOp;
use crate::usb::pump::{PumpEvent, PumpWriter};
use async_channel::{Receiver, Sender};
use protocol::{Packet, read_tcp_packet_async, write_tcp_packet_async};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, Span, debug, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Write side of one accepted client
struct ClientConn {
    id: u64,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl ClientConn {
    fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Write one frame; `None` when the client was closed first
    async fn write(&self, packet: &Packet) -> Option<protocol::Result<()>> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            result = async {
                let mut writer = self.writer.lock().await;
                write_tcp_packet_async(&mut *writer, packet).await
            } => Some(result),
            _ = closed.wait_for(|closed| *closed) => None,
        }
    }
}

struct ActiveClient {
    conn: Arc<ClientConn>,
    receiver: AbortHandle,
    /// Holding the permit is what marks the slot as taken
    _permit: OwnedSemaphorePermit,
}

struct Shared {
    active: Mutex<Option<ActiveClient>>,
    slot: Arc<Semaphore>,
    writer: PumpWriter,
    ops: Sender<BridgeOp>,
    generation: u64,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<ActiveClient>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_client(&self) -> Option<Arc<ClientConn>> {
        self.active().as_ref().map(|client| Arc::clone(&client.conn))
    }

    /// Disconnect the active client; with `id`, only if it is still that one
    ///
    /// Never waits on socket I/O, so the slot is free when this returns.
    fn close_client(&self, id: Option<u64>) {
        let client = {
            let mut active = self.active();
            match active.as_ref() {
                Some(client) if id.is_none_or(|id| id == client.conn.id) => active.take(),
                _ => None,
            }
        };
        if let Some(client) = client {
            debug!(peer = %client.conn.peer, "Closing client connection");
            client.conn.close();
            client.receiver.abort();
        }
    }

    /// Ask the bridge to tear down this pump pair and reconnect
    fn escalate(&self, reason: String) {
        let op = BridgeOp::UsbFailed {
            generation: self.generation,
            reason,
        };
        if self.ops.try_send(op).is_err() {
            debug!("Bridge no longer accepting operations");
        }
    }
}

/// Running router; stopping it closes the client and the listener
pub struct RouterHandle {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    accept_task: JoinHandle<()>,
    sender_task: JoinHandle<()>,
}

impl RouterHandle {
    /// Start routing between `listener` and one pump pair
    ///
    /// USB failures seen by the router are reported on `ops` as
    /// [`BridgeOp::UsbFailed`] for `generation`.
    pub fn start(
        listener: TcpListener,
        events: Receiver<PumpEvent>,
        writer: PumpWriter,
        ops: Sender<BridgeOp>,
        generation: u64,
    ) -> Self {
        let local_addr = listener.local_addr().ok();
        let shared = Arc::new(Shared {
            active: Mutex::new(None),
            slot: Arc::new(Semaphore::new(1)),
            writer,
            ops,
            generation,
        });

        let accept_task = tokio::spawn(
            accept_loop(listener, Arc::clone(&shared)).instrument(Span::current()),
        );
        let sender_task =
            tokio::spawn(send_loop(Arc::clone(&shared), events).instrument(Span::current()));

        Self {
            shared,
            local_addr,
            accept_task,
            sender_task,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting, close the active client and drop the listener
    pub async fn shutdown(mut self) {
        self.accept_task.abort();
        self.sender_task.abort();
        self.shared.close_client(None);
        // Wait until the listener is actually dropped so the port can be reused
        let _ = (&mut self.accept_task).await;
        debug!("Router stopped");
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.sender_task.abort();
        self.shared.close_client(None);
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut next_id = 0u64;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept TCP connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let permit = match Arc::clone(&shared.slot).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%peer, "Refusing connection, another client is active");
                drop(stream);
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "Could not set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        next_id += 1;
        let conn = Arc::new(ClientConn {
            id: next_id,
            peer,
            writer: tokio::sync::Mutex::new(write_half),
            closed: watch::Sender::new(false),
        });

        // Register before the receiver can run, so its close always finds it
        {
            let mut active = shared.active();
            let receiver = tokio::spawn(
                receive_loop(Arc::clone(&shared), next_id, peer, read_half)
                    .instrument(Span::current()),
            );
            *active = Some(ActiveClient {
                conn,
                receiver: receiver.abort_handle(),
                _permit: permit,
            });
        }
        info!(%peer, "TCP connection active");
    }
}

async fn send_loop(shared: Arc<Shared>, events: Receiver<PumpEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            PumpEvent::Packet(packet) => {
                let Some(client) = shared.current_client() else {
                    debug!(
                        command = ?packet.command_type(),
                        "Dropping packet, nobody connected"
                    );
                    continue;
                };
                match client.write(&packet).await {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        warn!(peer = %client.peer, "Writing to TCP failed: {}", e);
                        shared.close_client(Some(client.id));
                    }
                    None => debug!(peer = %client.peer, "Client closed mid-write, packet dropped"),
                }
            }
            PumpEvent::ReadFailed(reason) => {
                warn!("Bridge failed reading from USB: {}", reason);
                shared.close_client(None);
                shared.escalate(reason);
                break;
            }
        }
    }
    debug!("TCP sender finished");
}

async fn receive_loop(shared: Arc<Shared>, id: u64, peer: SocketAddr, read_half: OwnedReadHalf) {
    let mut reader = BufReader::new(read_half);
    loop {
        let packet = match read_tcp_packet_async(&mut reader).await {
            Ok(packet) => packet,
            Err(e) if e.is_clean_eof() => {
                info!(%peer, "Client disconnected");
                break;
            }
            Err(e) => {
                warn!(%peer, "Reading from TCP failed: {}", e);
                break;
            }
        };
        if let Err(e) = shared.writer.enqueue(packet).await {
            warn!(%peer, "Bridge failed writing to USB: {}", e);
            shared.escalate(e.to_string());
            break;
        }
    }
    shared.close_client(Some(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeSettings;
    use crate::usb::pump::UsbPumpPair;
    use bytes::Bytes;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, MockDevice, mock_transport};
    use protocol::{Command, Packet};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Harness {
        router: RouterHandle,
        pumps: UsbPumpPair,
        device: MockDevice,
        ops: Receiver<BridgeOp>,
        addr: SocketAddr,
    }

    async fn harness() -> Harness {
        let (transport, device) = mock_transport();
        let settings = BridgeSettings {
            usb_read_poll_ms: 20,
            ..Default::default()
        };
        let pumps = UsbPumpPair::start(transport, 7, &settings).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (ops_tx, ops_rx) = async_channel::unbounded();
        let router = RouterHandle::start(listener, pumps.events(), pumps.writer(), ops_tx, 7);
        Harness {
            router,
            pumps,
            device,
            ops: ops_rx,
            addr,
        }
    }

    /// Queue far more device data than the socket buffers can hold
    fn flood(device: &MockDevice) {
        for i in 0..64 {
            device.send_packet(&Packet::new(Command::Wrte, 1, i, vec![0x5a; 256 * 1024]));
        }
    }

    async fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).await.unwrap();
        // Give the accept loop time to register the client
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream
    }

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let h = harness().await;
        let mut client = connect(h.addr).await;

        let to_device = Packet::new(Command::Open, 1, 0, &b"shell:\0"[..]);
        write_tcp_packet_async(&mut client, &to_device).await.unwrap();
        let written = h.device.wait_for_packets(1, DEFAULT_TEST_TIMEOUT).await;
        assert_eq!(written, vec![to_device]);

        let from_device = Packet::new(Command::Okay, 9, 1, Bytes::new());
        h.device.send_packet(&from_device);
        let received = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, read_tcp_packet_async(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, from_device);

        h.router.shutdown().await;
        h.pumps.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_client_is_refused() {
        let h = harness().await;
        let mut first = connect(h.addr).await;
        let mut second = connect(h.addr).await;

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, second.read(&mut buf))
            .await
            .expect("refused connection should be closed");
        assert!(matches!(read, Ok(0) | Err(_)));

        // The first client is undisturbed
        let packet = Packet::new(Command::Wrte, 2, 3, vec![1u8, 2, 3]);
        h.device.send_packet(&packet);
        let received = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, read_tcp_packet_async(&mut first))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, packet);

        h.router.shutdown().await;
        h.pumps.shutdown().await;
    }

    #[tokio::test]
    async fn test_slot_freed_after_client_disconnects() {
        let h = harness().await;
        let first = connect(h.addr).await;
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = connect(h.addr).await;
        let packet = Packet::new(Command::Okay, 1, 1, Bytes::new());
        h.device.send_packet(&packet);
        let received = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, read_tcp_packet_async(&mut second))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, packet);
        assert!(h.ops.is_empty());

        h.router.shutdown().await;
        h.pumps.shutdown().await;
    }

    #[tokio::test]
    async fn test_packets_dropped_without_client() {
        let h = harness().await;
        h.device
            .send_packet(&Packet::new(Command::Wrte, 1, 1, vec![0u8; 4]));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut client = connect(h.addr).await;
        let fresh = Packet::new(Command::Okay, 2, 2, Bytes::new());
        h.device.send_packet(&fresh);
        let received = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, read_tcp_packet_async(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, fresh);

        h.router.shutdown().await;
        h.pumps.shutdown().await;
    }

    #[tokio::test]
    async fn test_usb_read_failure_escalates() {
        let h = harness().await;
        let mut client = connect(h.addr).await;

        h.device.fail_read(common::TransportError::Disconnected);

        let op = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, h.ops.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(op, BridgeOp::UsbFailed { generation: 7, .. }));

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        h.router.shutdown().await;
        h.pumps.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_port() {
        let h = harness().await;
        let _client = connect(h.addr).await;

        h.router.shutdown().await;
        let rebound = TcpListener::bind(h.addr).await;
        assert!(rebound.is_ok());
        h.pumps.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_client_frees_slot_on_eof() {
        let h = harness().await;
        let mut stalled = connect(h.addr).await;

        // Never read, so the sender ends up parked in a socket write
        flood(&h.device);
        tokio::time::sleep(Duration::from_millis(200)).await;
        stalled.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut second = connect(h.addr).await;
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(300), second.read(&mut buf)).await;
        assert!(
            matches!(read, Err(_) | Ok(Ok(1))),
            "second client was refused: {:?}",
            read
        );
        assert!(h.ops.is_empty());

        h.router.shutdown().await;
        h.pumps.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_disconnects_client_during_stalled_write() {
        let h = harness().await;
        let mut client = connect(h.addr).await;
        flood(&h.device);
        tokio::time::sleep(Duration::from_millis(200)).await;

        drop(h.router);

        // Drain whatever was buffered; the stream must then end
        let drained = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, async {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match client.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "client was never disconnected");
        h.pumps.shutdown().await;
    }
}
