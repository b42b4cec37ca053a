//! Device presence poller
//!
//! Lists attached ADB devices every poll interval and diffs the result by
//! serial number against the previous pass. Listeners hear about each
//! device once when it appears and once when it goes away.

use crate::orchestration::DeviceListener;
use common::{DeviceInfo, DeviceLister, Result, ShutdownSignal};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span, debug, info, warn};

#[derive(Default)]
struct DetectorState {
    listeners: Vec<Arc<dyn DeviceListener>>,
    devices: Vec<DeviceInfo>,
}

struct Shared {
    lister: Arc<dyn DeviceLister>,
    state: Mutex<DetectorState>,
}

pub struct DeviceDetector {
    shared: Arc<Shared>,
    poll_interval: Duration,
    stop: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceDetector {
    pub fn new(lister: Arc<dyn DeviceLister>, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                lister,
                state: Mutex::new(DetectorState::default()),
            }),
            poll_interval,
            stop: ShutdownSignal::new(),
            task: Mutex::new(None),
        }
    }

    /// Register a listener
    ///
    /// The listener immediately receives the devices known so far through
    /// [`DeviceListener::initial_list`]; the same list is returned.
    pub fn add_listener(&self, listener: Arc<dyn DeviceListener>) -> Vec<DeviceInfo> {
        let Ok(mut state) = self.shared.state.lock() else {
            return Vec::new();
        };
        listener.initial_list(&state.devices);
        state.listeners.push(listener);
        state.devices.clone()
    }

    /// Devices seen by the last pass
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.shared
            .state
            .lock()
            .map(|state| state.devices.clone())
            .unwrap_or_default()
    }

    /// Run one listing pass now
    ///
    /// A failed listing leaves the known devices untouched.
    pub async fn detect(&self) -> Result<()> {
        self.shared.detect().await
    }

    /// Poll in the background until [`DeviceDetector::close`]
    pub fn start_listening(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let stop = self.stop.clone();
        let poll_interval = self.poll_interval;
        let poll = async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = shared.detect().await {
                            warn!("Error getting device list: {}", e);
                        }
                    }
                }
            }
            debug!("Device detector stopped");
        };
        *task = Some(tokio::spawn(poll.instrument(Span::current())));
        info!("Polling for devices every {:?}", poll_interval);
    }

    /// Stop polling; safe to call more than once
    pub async fn close(&self) {
        self.stop.trigger();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for DeviceDetector {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

impl Shared {
    async fn detect(&self) -> Result<()> {
        let lister = Arc::clone(&self.lister);
        let current = tokio::task::spawn_blocking(move || lister.list_devices())
            .await
            .map_err(|e| common::Error::Other(format!("device listing task failed: {}", e)))??;

        let mut state = self
            .state
            .lock()
            .map_err(|_| common::Error::Other("detector lock poisoned".to_string()))?;
        debug!(count = current.len(), "Listed devices");

        let added: Vec<DeviceInfo> = current
            .iter()
            .filter(|device| !state.devices.contains(device))
            .cloned()
            .collect();
        let removed: Vec<DeviceInfo> = state
            .devices
            .iter()
            .filter(|device| !current.contains(device))
            .cloned()
            .collect();

        for device in &added {
            info!("Device attached: {}", device);
            state.devices.push(device.clone());
            for listener in &state.listeners {
                listener.device_added(device);
            }
        }
        for device in &removed {
            info!("Device removed: {}", device);
            state.devices.retain(|known| known != device);
            for listener in &state.listeners {
                listener.device_removed(device);
            }
        }
        Ok(())
    }
}
