//! Scripted in-memory hardware library
//!
//! Used by tests across the workspace. Every call that acquires or releases
//! a hardware resource is counted so tests can assert that sessions and
//! subscriptions are released on every exit path.

use async_trait::async_trait;
use gpuplug_core::{HardwareError, InitError, MonitorError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::traits::{DeviceLib, EventSource, HealthEvent, LibHandle, Partition, PhysicalDevice};

type EventResult = Result<HealthEvent, MonitorError>;

/// Test-side handle feeding one event stream
pub type MockEventSender = mpsc::UnboundedSender<EventResult>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct MockState {
    inits: AtomicUsize,
    shutdowns: AtomicUsize,
    subscriptions: AtomicUsize,
    closes: AtomicUsize,
    subscribed: Mutex<Vec<Vec<String>>>,
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<EventResult>>>,
    idle: Mutex<Vec<MockEventSender>>,
}

/// Hardware library double with a fixed inventory
#[derive(Debug, Clone, Default)]
pub struct MockDeviceLib {
    gpus: Vec<(PhysicalDevice, Vec<Partition>)>,
    profiles: Vec<String>,
    partition_support: bool,
    init_error: Option<String>,
    enumerate_error: Option<HardwareError>,
    subscribe_error: Option<MonitorError>,
    unsupported: Vec<String>,
    state: Arc<MockState>,
}

impl MockDeviceLib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a GPU without partitions
    pub fn with_gpu(mut self, device: PhysicalDevice) -> Self {
        self.gpus.push((device, Vec::new()));
        self
    }

    /// Add a partitioned GPU; partition support is switched on
    pub fn with_mig_gpu(mut self, mut device: PhysicalDevice, partitions: Vec<Partition>) -> Self {
        device.mig_enabled = true;
        self.gpus.push((device, partitions));
        self.partition_support = true;
        self
    }

    /// Extra profiles reported by `partition_profiles`
    pub fn with_profiles(mut self, profiles: &[&str]) -> Self {
        self.profiles.extend(profiles.iter().map(|p| p.to_string()));
        self
    }

    pub fn with_partition_support(mut self, supported: bool) -> Self {
        self.partition_support = supported;
        self
    }

    /// Make `init` fail
    pub fn failing_init(mut self, message: &str) -> Self {
        self.init_error = Some(message.to_string());
        self
    }

    /// Make device enumeration fail after a successful init
    pub fn failing_enumeration(mut self, error: HardwareError) -> Self {
        self.enumerate_error = Some(error);
        self
    }

    /// Make `subscribe` fail
    pub fn failing_subscribe(mut self, error: MonitorError) -> Self {
        self.subscribe_error = Some(error);
        self
    }

    /// Report the GPU as unable to register for health events
    pub fn with_unsupported_events(mut self, uuid: &str) -> Self {
        self.unsupported.push(uuid.to_string());
        self
    }

    /// Queue an event stream for the next subscription.
    ///
    /// Subscriptions take queued streams in order; dropping the returned
    /// sender ends the stream.
    pub fn event_stream(&self) -> MockEventSender {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state.streams).push_back(rx);
        tx
    }

    pub fn init_count(&self) -> usize {
        self.state.inits.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.state.subscriptions.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// UUID lists passed to each `subscribe` call
    pub fn subscribed_uuids(&self) -> Vec<Vec<String>> {
        lock(&self.state.subscribed).clone()
    }
}

impl DeviceLib for MockDeviceLib {
    fn init(&self) -> Result<Box<dyn LibHandle>, InitError> {
        if let Some(message) = &self.init_error {
            return Err(InitError::Unavailable(message.clone()));
        }
        self.state.inits.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHandle {
            lib: self.clone(),
            open: true,
        }))
    }

    fn has_partition_support(&self) -> bool {
        self.partition_support
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct MockHandle {
    lib: MockDeviceLib,
    open: bool,
}

impl LibHandle for MockHandle {
    fn devices(&self) -> Result<Vec<PhysicalDevice>, HardwareError> {
        if let Some(err) = &self.lib.enumerate_error {
            return Err(err.clone());
        }
        Ok(self.lib.gpus.iter().map(|(d, _)| d.clone()).collect())
    }

    fn partitions(&self, device: &PhysicalDevice) -> Result<Vec<Partition>, HardwareError> {
        Ok(self
            .lib
            .gpus
            .iter()
            .find(|(d, _)| d.uuid == device.uuid)
            .map(|(_, parts)| parts.clone())
            .unwrap_or_default())
    }

    fn partition_profiles(&self) -> Result<Vec<String>, HardwareError> {
        let mut profiles: Vec<String> = self
            .lib
            .gpus
            .iter()
            .flat_map(|(_, parts)| parts.iter().map(|p| p.profile.clone()))
            .chain(self.lib.profiles.iter().cloned())
            .collect();
        profiles.sort();
        profiles.dedup();
        Ok(profiles)
    }

    fn subscribe(&self, uuids: &[String]) -> Result<Box<dyn EventSource>, MonitorError> {
        if let Some(err) = &self.lib.subscribe_error {
            return Err(err.clone());
        }
        let state = &self.lib.state;
        state.subscriptions.fetch_add(1, Ordering::SeqCst);
        lock(&state.subscribed).push(uuids.to_vec());

        let rx = lock(&state.streams).pop_front().unwrap_or_else(|| {
            // No scripted stream: stay silent until closed
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&state.idle).push(tx);
            rx
        });

        let pending = self
            .lib
            .unsupported
            .iter()
            .filter(|u| uuids.contains(*u))
            .map(|u| HealthEvent {
                uuid: Some(u.clone()),
                kind: crate::traits::EventKind::RegistrationUnsupported,
                placement: None,
            })
            .collect();

        Ok(Box::new(MockEventSource {
            pending,
            rx,
            state: state.clone(),
            closed: false,
        }))
    }

    fn shutdown(&mut self) -> Result<(), HardwareError> {
        if std::mem::replace(&mut self.open, false) {
            self.lib.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MockEventSource {
    pending: VecDeque<HealthEvent>,
    rx: mpsc::UnboundedReceiver<EventResult>,
    state: Arc<MockState>,
    closed: bool,
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn next_event(&mut self) -> Option<EventResult> {
        if let Some(event) = self.pending.pop_front() {
            return Some(Ok(event));
        }
        self.rx.recv().await
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            self.rx.close();
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockEventSource {
    fn drop(&mut self) {
        self.close();
    }
}
