//! Per-device bridge
//!
//! A [`Bridge`] ties one USB device to one fixed TCP port. Its lifecycle is
//! driven by a single dispatcher task that consumes [`BridgeOp`]s one at a
//! time; USB threads, router tasks and the public API only ever queue
//! operations, so the state has exactly one writer.

use crate::bridge::context::BridgeContext;
use crate::bridge::ops::BridgeOp;
use crate::bridge::router::RouterHandle;
use crate::bridge::state::BridgeState;
use crate::usb::pump::UsbPumpPair;
use async_channel::{Receiver, Sender};
use common::{DeviceInfo, Error, Result, UsbConnector};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

/// Bridge between one ADB device and one TCP port
pub struct Bridge {
    device: DeviceInfo,
    port: u16,
    ctx: BridgeContext,
    state: Arc<watch::Sender<BridgeState>>,
    ops: Sender<BridgeOp>,
    /// Dispatcher waiting for `start`
    pending: Mutex<Option<Dispatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Bridge {
    pub fn new(
        device: DeviceInfo,
        port: u16,
        connector: Arc<dyn UsbConnector>,
        ctx: BridgeContext,
    ) -> Self {
        let (state_tx, _) = watch::channel(BridgeState::NotInitialized);
        let state = Arc::new(state_tx);
        let (ops_tx, ops_rx) = async_channel::unbounded();

        let dispatcher = Dispatcher {
            device: device.clone(),
            port,
            ctx: ctx.clone(),
            connector,
            state: Arc::clone(&state),
            ops_tx: ops_tx.clone(),
            ops_rx,
            generation: 0,
            pumps: None,
            router: None,
            backoff: None,
        };

        Self {
            device,
            port,
            ctx,
            state,
            ops: ops_tx,
            pending: Mutex::new(Some(dispatcher)),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Spawn the dispatcher and begin connecting to the device
    ///
    /// Must be called from within a Tokio runtime. Fails if the bridge was
    /// already started or closed.
    pub fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Other(format!(
                "bridge for {} is closed",
                self.device.serial_number
            )));
        }
        let dispatcher = self
            .pending
            .lock()
            .map_err(|_| Error::Other("bridge lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| {
                Error::Other(format!(
                    "bridge for {} already started",
                    self.device.serial_number
                ))
            })?;

        self.ops
            .try_send(BridgeOp::ConnectUsb)
            .map_err(|e| Error::Channel(e.to_string()))?;

        let span = info_span!(
            parent: &self.ctx.span,
            "bridge",
            serial = %self.device.serial_number,
            port = self.port
        );
        let handle = tokio::spawn(dispatcher.run().instrument(span));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    /// Release the USB interface and TCP port and stop the dispatcher
    ///
    /// Waits at most `close_timeout` for an orderly release, then aborts the
    /// dispatcher, which drops whatever it still owns. Returns
    /// [`Error::Timeout`] in that case. Closing again returns `Ok`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let task = self.task.lock().ok().and_then(|mut task| task.take());
        let Some(task) = task else {
            // Never started: nothing was acquired
            if let Ok(mut pending) = self.pending.lock() {
                pending.take();
            }
            self.state.send_replace(BridgeState::Disconnected);
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.ops.send(BridgeOp::Close { ack: ack_tx }).await.is_err() {
            // The dispatcher already stopped on the shutdown signal
            let _ = task.await;
            self.state.send_replace(BridgeState::Disconnected);
            return Ok(());
        }

        let timeout = self.ctx.settings.close_timeout();
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(_) => {
                let _ = task.await;
                Ok(())
            }
            Err(_) => {
                warn!(
                    serial = %self.device.serial_number,
                    "Bridge did not close within {:?}, aborting", timeout
                );
                task.abort();
                let _ = task.await;
                self.state.send_replace(BridgeState::Disconnected);
                Err(Error::Timeout(format!(
                    "closing bridge for {}",
                    self.device.serial_number
                )))
            }
        }
    }

    pub fn current_state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn current_state_name(&self) -> &'static str {
        self.current_state().name()
    }

    pub fn serial_number(&self) -> &str {
        &self.device.serial_number
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Observe state changes
    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock()
            && let Some(task) = task.take()
        {
            task.abort();
        }
    }
}

/// Sole owner of a bridge's mutable lifecycle state
struct Dispatcher {
    device: DeviceInfo,
    port: u16,
    ctx: BridgeContext,
    connector: Arc<dyn UsbConnector>,
    state: Arc<watch::Sender<BridgeState>>,
    ops_tx: Sender<BridgeOp>,
    ops_rx: Receiver<BridgeOp>,
    generation: u64,
    pumps: Option<UsbPumpPair>,
    router: Option<RouterHandle>,
    backoff: Option<JoinHandle<()>>,
}

impl Dispatcher {
    async fn run(mut self) {
        info!("Bridge started");
        let shutdown = self.ctx.shutdown.clone();
        loop {
            let next = tokio::select! {
                op = self.ops_rx.recv() => op.ok(),
                _ = shutdown.wait() => None,
            };
            let Some(op) = next else {
                info!("Shutdown requested, releasing bridge");
                self.cancel_backoff();
                self.release().await;
                self.set_state(BridgeState::Disconnected);
                break;
            };
            if self.handle(op).await.is_break() {
                break;
            }
        }
        self.ops_rx.close();
        debug!("Bridge dispatcher finished");
    }

    async fn handle(&mut self, op: BridgeOp) -> ControlFlow<()> {
        let current = self.current();
        if current.is_terminal() && !matches!(op, BridgeOp::Close { .. }) {
            debug!(op = op.name(), state = %current, "Skipping operation in error state");
            return ControlFlow::Continue(());
        }
        debug!(op = op.name(), state = %current, "Handling operation");

        match op {
            BridgeOp::ConnectUsb => self.connect_usb().await,
            BridgeOp::ConnectTcp => self.connect_tcp().await,
            BridgeOp::UsbFailed { generation, reason } => {
                self.usb_failed(generation, reason).await
            }
            BridgeOp::DeviceDetached => self.device_detached().await,
            BridgeOp::Close { ack } => {
                self.close(ack).await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn connect_usb(&mut self) {
        let current = self.current();
        if !current.can_connect_usb() {
            debug!(state = %current, "Already connected, ignoring USB connect");
            return;
        }
        self.set_state(BridgeState::ConnectingUsb);

        let connector = Arc::clone(&self.connector);
        let device = self.device.clone();
        let transport =
            match tokio::task::spawn_blocking(move || connector.connect(&device)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    warn!("Failed to connect USB device: {}", e);
                    self.queue(BridgeOp::DeviceDetached);
                    return;
                }
                Err(e) => {
                    error!("USB connect task failed: {}", e);
                    self.queue(BridgeOp::DeviceDetached);
                    return;
                }
            };

        self.generation += 1;
        match UsbPumpPair::start(transport, self.generation, &self.ctx.settings) {
            Ok(pumps) => {
                self.pumps = Some(pumps);
                self.set_state(BridgeState::ConnectedUsb);
                self.queue(BridgeOp::ConnectTcp);
            }
            Err(e) => {
                error!("Failed to start USB pumps: {}", e);
                self.set_state(BridgeState::ErrorUsb);
            }
        }
    }

    async fn connect_tcp(&mut self) {
        let current = self.current();
        if current != BridgeState::ConnectedUsb {
            debug!(state = %current, "Not waiting for TCP, ignoring");
            return;
        }
        let Some(pumps) = self.pumps.as_ref() else {
            error!("USB pumps missing in connectedUSB");
            self.set_state(BridgeState::ErrorUsb);
            return;
        };

        match TcpListener::bind((self.ctx.bind_addr, self.port)).await {
            Ok(listener) => {
                let router = RouterHandle::start(
                    listener,
                    pumps.events(),
                    pumps.writer(),
                    self.ops_tx.clone(),
                    pumps.generation(),
                );
                self.router = Some(router);
                self.set_state(BridgeState::Online);
                info!(
                    "Listening on {}:{} for {}",
                    self.ctx.bind_addr, self.port, self.device
                );
            }
            Err(source) => {
                let err = Error::Bind {
                    port: self.port,
                    source,
                };
                error!("{}", err);
                self.release().await;
                self.set_state(BridgeState::ErrorTcp);
            }
        }
    }

    async fn usb_failed(&mut self, generation: u64, reason: String) {
        let current_generation = self.pumps.as_ref().map(UsbPumpPair::generation);
        if current_generation != Some(generation) {
            debug!(generation, "Ignoring failure of a previous USB connection");
            return;
        }
        warn!(generation, "USB connection lost: {}", reason);
        self.release().await;
        self.set_state(BridgeState::Disconnected);
        self.queue(BridgeOp::DeviceDetached);
    }

    async fn device_detached(&mut self) {
        self.release().await;
        self.set_state(BridgeState::Detached);

        self.cancel_backoff();
        let delay = self.ctx.settings.reconnect_backoff();
        let ops = self.ops_tx.clone();
        debug!("Reconnecting in {:?}", delay);
        let retry = async move {
            tokio::time::sleep(delay).await;
            let _ = ops.send(BridgeOp::ConnectUsb).await;
        };
        self.backoff = Some(tokio::spawn(retry.instrument(Span::current())));
    }

    async fn close(&mut self, ack: oneshot::Sender<()>) {
        self.cancel_backoff();
        self.release().await;
        self.set_state(BridgeState::Disconnected);

        self.ops_rx.close();
        let mut acks = vec![ack];
        while let Ok(op) = self.ops_rx.try_recv() {
            match op {
                BridgeOp::Close { ack } => acks.push(ack),
                other => debug!(op = other.name(), "Dropping queued operation"),
            }
        }
        for ack in acks {
            let _ = ack.send(());
        }
        info!("Bridge closed");
    }

    /// Stop routing and release the USB interface, in that order
    async fn release(&mut self) {
        if let Some(router) = self.router.take() {
            router.shutdown().await;
        }
        if let Some(pumps) = self.pumps.take() {
            pumps.shutdown().await;
        }
    }

    fn cancel_backoff(&mut self) {
        if let Some(backoff) = self.backoff.take() {
            backoff.abort();
        }
    }

    fn queue(&self, op: BridgeOp) {
        let name = op.name();
        if self.ops_tx.try_send(op).is_err() {
            debug!(op = name, "Operation queue closed");
        }
    }

    fn current(&self) -> BridgeState {
        *self.state.borrow()
    }

    fn set_state(&self, new: BridgeState) {
        let old = self.state.send_replace(new);
        if old != new {
            info!(from = %old, to = %new, "Bridge state changed");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel_backoff();
    }
}
