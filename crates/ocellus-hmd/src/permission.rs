//! Capability gating with blocking checks and polled async requests.
//!
//! Records live behind one mutex that is held only for the read-modify-write
//! of a single record. Device calls run with the lock released; a generation
//! number per record discards results that land after a `reset_all`.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;

use ocellus_xr::{CapabilityApi, CapabilityDecision, CapabilityId, RequestHandle, RequestPoll};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    NotRequested,
    Pending,
    Granted,
    Denied,
    Error,
}

impl PermissionState {
    /// Granted, Denied and Error never change until the next reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Granted | Self::Denied | Self::Error)
    }
}

impl From<CapabilityDecision> for PermissionState {
    fn from(decision: CapabilityDecision) -> Self {
        match decision {
            CapabilityDecision::Granted => Self::Granted,
            CapabilityDecision::Denied => Self::Denied,
        }
    }
}

/// Outstanding async capability request.
#[derive(Clone)]
pub struct PendingRequest {
    handle: RequestHandle,
    device: Arc<dyn CapabilityApi>,
}

impl PendingRequest {
    fn new(handle: RequestHandle, device: Arc<dyn CapabilityApi>) -> Self {
        Self { handle, device }
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Non-blocking poll of the device request.
    pub fn try_get(&self) -> Poll<PermissionState> {
        match self.device.poll_capability_request(self.handle) {
            RequestPoll::Pending => Poll::Pending,
            RequestPoll::Granted => Poll::Ready(PermissionState::Granted),
            RequestPoll::Denied => Poll::Ready(PermissionState::Denied),
            RequestPoll::Error => Poll::Ready(PermissionState::Error),
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("handle", &self.handle)
            .finish()
    }
}

#[derive(Debug)]
pub struct PermissionRecord {
    state: PermissionState,
    request: Option<PendingRequest>,
    generation: u64,
}

impl PermissionRecord {
    fn new() -> Self {
        Self {
            state: PermissionState::NotRequested,
            request: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> PermissionState {
        self.state
    }

    pub fn request_handle(&self) -> Option<RequestHandle> {
        self.request.as_ref().map(PendingRequest::handle)
    }

    fn reset(&mut self) {
        self.state = PermissionState::NotRequested;
        self.request = None;
        self.generation += 1;
    }
}

enum DeviceStep {
    Check,
    Request,
    Poll(PendingRequest),
}

pub struct PermissionGate {
    device: Arc<dyn CapabilityApi>,
    records: Mutex<HashMap<CapabilityId, PermissionRecord>>,
    all_settled: AtomicBool,
    service_running: AtomicBool,
}

impl PermissionGate {
    pub fn new(device: Arc<dyn CapabilityApi>) -> Self {
        Self {
            device,
            records: Mutex::new(HashMap::new()),
            all_settled: AtomicBool::new(false),
            service_running: AtomicBool::new(false),
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<CapabilityId, PermissionRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start the device capability service. Returns false if it failed to start.
    pub fn startup(&self) -> bool {
        if self.service_running.load(Ordering::Acquire) {
            return true;
        }
        match self.device.startup() {
            Ok(()) => {
                self.service_running.store(true, Ordering::Release);
                info!("capability service started");
                true
            }
            Err(err) => {
                error!("capability service failed to start: {err}");
                false
            }
        }
    }

    /// Stop the service and drop every record.
    pub fn shutdown(&self) {
        if self.service_running.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.device.shutdown() {
                error!("capability service shutdown failed: {err}");
            }
        }
        self.lock_records().clear();
        self.all_settled.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.service_running.load(Ordering::Acquire)
    }

    pub fn all_settled(&self) -> bool {
        self.all_settled.load(Ordering::Acquire)
    }

    /// Current state without touching the device.
    pub fn state(&self, capability: &CapabilityId) -> PermissionState {
        self.lock_records()
            .get(capability)
            .map_or(PermissionState::NotRequested, PermissionRecord::state)
    }

    pub fn snapshot(&self) -> BTreeMap<CapabilityId, PermissionState> {
        self.lock_records()
            .iter()
            .map(|(id, record)| (id.clone(), record.state))
            .collect()
    }

    /// Register capabilities so the next `poll_all` requests them.
    pub fn request_all<'a>(&self, capabilities: impl IntoIterator<Item = &'a CapabilityId>) {
        let mut records = self.lock_records();
        for capability in capabilities {
            if let Entry::Vacant(slot) = records.entry(capability.clone()) {
                slot.insert(PermissionRecord::new());
                self.all_settled.store(false, Ordering::Release);
            }
        }
    }

    pub fn status(&self, capability: &CapabilityId, blocking: bool) -> PermissionState {
        if !self.is_running() {
            return PermissionState::Error;
        }

        let (generation, step) = {
            let mut records = self.lock_records();
            let record = match records.entry(capability.clone()) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => {
                    self.all_settled.store(false, Ordering::Release);
                    slot.insert(PermissionRecord::new())
                }
            };
            let current = record.state;
            let step = match current {
                state if state.is_terminal() => return state,
                _ if blocking => DeviceStep::Check,
                PermissionState::NotRequested => {
                    // Reserve the slot so concurrent callers poll instead of
                    // issuing a second request.
                    record.state = PermissionState::Pending;
                    DeviceStep::Request
                }
                _ => match &record.request {
                    Some(request) => DeviceStep::Poll(request.clone()),
                    None => return PermissionState::Pending,
                },
            };
            (record.generation, step)
        };

        match step {
            DeviceStep::Check => {
                let next = match self.device.check_capability(capability) {
                    Ok(decision) => decision.into(),
                    Err(err) => {
                        warn!(%capability, "capability check failed: {err}");
                        PermissionState::Error
                    }
                };
                self.settle(capability, generation, next)
            }
            DeviceStep::Request => match self.device.request_capability_async(capability) {
                Ok(handle) => {
                    debug!(%capability, ?handle, "capability requested");
                    let mut records = self.lock_records();
                    match records.get_mut(capability) {
                        Some(record)
                            if record.generation == generation
                                && record.state == PermissionState::Pending =>
                        {
                            record.request =
                                Some(PendingRequest::new(handle, self.device.clone()));
                            PermissionState::Pending
                        }
                        Some(record) => record.state,
                        None => PermissionState::NotRequested,
                    }
                }
                Err(err) => {
                    warn!(%capability, "capability request failed: {err}");
                    self.settle(capability, generation, PermissionState::Error)
                }
            },
            DeviceStep::Poll(request) => match request.try_get() {
                Poll::Pending => PermissionState::Pending,
                Poll::Ready(next) => self.settle(capability, generation, next),
            },
        }
    }

    /// Store a terminal state unless a reset or another caller got there first.
    fn settle(
        &self,
        capability: &CapabilityId,
        generation: u64,
        next: PermissionState,
    ) -> PermissionState {
        let mut records = self.lock_records();
        let Some(record) = records.get_mut(capability) else {
            return PermissionState::NotRequested;
        };
        if record.generation != generation || record.state.is_terminal() {
            return record.state;
        }
        record.state = next;
        record.request = None;
        debug!(%capability, state = ?next, "capability settled");
        next
    }

    /// Advance every unsettled capability one step without blocking.
    ///
    /// Returns the transitions observed in this pass. Skipped entirely once
    /// every capability is terminal.
    pub fn poll_all(&self) -> Vec<(CapabilityId, PermissionState)> {
        if !self.is_running() || self.all_settled() {
            return Vec::new();
        }

        let unsettled: Vec<(CapabilityId, PermissionState)> = self
            .lock_records()
            .iter()
            .filter(|(_, record)| !record.state.is_terminal())
            .map(|(id, record)| (id.clone(), record.state))
            .collect();

        let mut changes = Vec::new();
        for (capability, before) in unsettled {
            let after = self.status(&capability, false);
            if after != before {
                changes.push((capability, after));
            }
        }

        // Published under the records lock, which request_all also holds.
        let records = self.lock_records();
        let settled = records.values().all(|record| record.state.is_terminal());
        self.all_settled.store(settled, Ordering::Release);
        drop(records);
        changes
    }

    /// Back to NotRequested for a fresh acquisition cycle. Outstanding device
    /// requests are abandoned, not cancelled.
    pub fn reset_all(&self) {
        let mut records = self.lock_records();
        for record in records.values_mut() {
            record.reset();
        }
        self.all_settled.store(false, Ordering::Release);
        debug!(capabilities = records.len(), "capability records reset");
    }
}

impl fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionGate")
            .field("records", &self.snapshot())
            .field("all_settled", &self.all_settled())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn gate(device: &Arc<MockDevice>) -> PermissionGate {
        let gate = PermissionGate::new(device.clone());
        assert!(gate.startup());
        gate
    }

    #[test]
    fn test_nonblocking_request_issued_once() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.polls_until_resolved = 3);
        let gate = gate(&device);
        let camera = CapabilityId::from("camera");

        assert_eq!(gate.status(&camera, false), PermissionState::Pending);
        assert_eq!(gate.status(&camera, false), PermissionState::Pending);
        assert_eq!(device.calls().request_capability_async, 1);
        assert_eq!(device.calls().poll_capability_request, 1);
    }

    #[test]
    fn test_pending_resolves_and_is_memoized() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.polls_until_resolved = 1);
        let gate = gate(&device);
        let camera = CapabilityId::from("camera");

        assert_eq!(gate.status(&camera, false), PermissionState::Pending);
        assert_eq!(gate.status(&camera, false), PermissionState::Pending);
        assert_eq!(gate.status(&camera, false), PermissionState::Granted);
        let polls = device.calls().poll_capability_request;
        assert_eq!(gate.status(&camera, false), PermissionState::Granted);
        assert_eq!(gate.status(&camera, true), PermissionState::Granted);
        assert_eq!(device.calls().poll_capability_request, polls);
        assert_eq!(device.calls().check_capability, 0);
    }

    #[test]
    fn test_blocking_check_denied() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.deny("mic"));
        let gate = gate(&device);
        let mic = CapabilityId::from("mic");
        assert_eq!(gate.status(&mic, true), PermissionState::Denied);
        assert_eq!(gate.state(&mic), PermissionState::Denied);
        assert_eq!(device.calls().check_capability, 1);
    }

    #[test]
    fn test_blocking_check_transport_error() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.fail_capability_check = true);
        let gate = gate(&device);
        assert_eq!(
            gate.status(&CapabilityId::from("camera"), true),
            PermissionState::Error
        );
    }

    #[test]
    fn test_blocking_check_replaces_pending() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.polls_until_resolved = 10);
        let gate = gate(&device);
        let camera = CapabilityId::from("camera");
        assert_eq!(gate.status(&camera, false), PermissionState::Pending);
        assert_eq!(gate.status(&camera, true), PermissionState::Granted);
        assert_eq!(gate.state(&camera), PermissionState::Granted);
    }

    #[test]
    fn test_status_without_service_is_error() {
        let device = Arc::new(MockDevice::new());
        let gate = PermissionGate::new(device.clone());
        assert_eq!(
            gate.status(&CapabilityId::from("camera"), false),
            PermissionState::Error
        );
        assert!(gate.snapshot().is_empty());
        assert_eq!(device.calls().request_capability_async, 0);
    }

    #[test]
    fn test_reset_all_idempotent() {
        let device = Arc::new(MockDevice::new());
        let gate = gate(&device);
        gate.status(&CapabilityId::from("camera"), true);
        gate.status(&CapabilityId::from("mic"), false);

        gate.reset_all();
        let once = gate.snapshot();
        gate.reset_all();
        assert_eq!(gate.snapshot(), once);
        assert!(once.values().all(|s| *s == PermissionState::NotRequested));
        assert!(!gate.all_settled());
    }

    #[test]
    fn test_stale_poll_result_discarded_after_reset() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.polls_until_resolved = 0);
        let gate = gate(&device);
        let camera = CapabilityId::from("camera");
        assert_eq!(gate.status(&camera, false), PermissionState::Pending);
        let (generation, request) = {
            let records = gate.lock_records();
            let record = &records[&camera];
            (record.generation, record.request.clone().unwrap())
        };
        gate.reset_all();
        let Poll::Ready(next) = request.try_get() else {
            panic!("request should be resolved");
        };
        assert_eq!(
            gate.settle(&camera, generation, next),
            PermissionState::NotRequested
        );
        assert_eq!(gate.state(&camera), PermissionState::NotRequested);
    }

    #[test]
    fn test_poll_all_reports_transitions_and_settles() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| {
            s.polls_until_resolved = 1;
            s.deny("mic");
        });
        let gate = gate(&device);
        let camera = CapabilityId::from("camera");
        let mic = CapabilityId::from("mic");
        gate.request_all([&camera, &mic]);

        let first = gate.poll_all();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|(_, s)| *s == PermissionState::Pending));
        assert!(gate.poll_all().is_empty());
        let mut third = gate.poll_all();
        third.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            third,
            vec![
                (camera.clone(), PermissionState::Granted),
                (mic.clone(), PermissionState::Denied)
            ]
        );
        assert!(gate.all_settled());

        let polls = device.calls().poll_capability_request;
        assert!(gate.poll_all().is_empty());
        assert_eq!(device.calls().poll_capability_request, polls);
    }

    #[test]
    fn test_request_after_settle_reopens_polling() {
        let device = Arc::new(MockDevice::new());
        let gate = gate(&device);
        let camera = CapabilityId::from("camera");
        gate.request_all([&camera]);
        gate.poll_all();
        gate.poll_all();
        assert!(gate.all_settled());

        let mic = CapabilityId::from("mic");
        gate.request_all([&mic]);
        assert!(!gate.all_settled());
        assert_eq!(gate.poll_all(), vec![(mic.clone(), PermissionState::Pending)]);
        assert_eq!(gate.poll_all(), vec![(mic.clone(), PermissionState::Granted)]);
        assert!(gate.all_settled());
    }

    #[test]
    fn test_concurrent_request_all_never_stranded_by_poll_all() {
        let device = Arc::new(MockDevice::new());
        let gate = Arc::new(gate(&device));

        let poller = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    gate.poll_all();
                }
            })
        };
        let requester = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    gate.request_all([&CapabilityId::from(format!("cap-{i}").as_str())]);
                }
            })
        };
        poller.join().unwrap();
        requester.join().unwrap();

        if gate.all_settled() {
            assert!(gate.snapshot().values().all(|state| state.is_terminal()));
        }
        // Request then resolve whatever registered after the poller's last pass.
        gate.poll_all();
        gate.poll_all();
        let snapshot = gate.snapshot();
        assert_eq!(snapshot.len(), 500);
        assert!(snapshot.values().all(|state| *state == PermissionState::Granted));
        assert!(gate.all_settled());
    }

    #[test]
    fn test_states_only_move_forward() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.polls_until_resolved = 2);
        let gate = gate(&device);
        let camera = CapabilityId::from("camera");
        let rank = |s: PermissionState| match s {
            PermissionState::NotRequested => 0,
            PermissionState::Pending => 1,
            _ => 2,
        };
        let mut last = rank(gate.state(&camera));
        for _ in 0..6 {
            let now = rank(gate.status(&camera, false));
            assert!(now >= last);
            last = now;
        }
        assert_eq!(gate.state(&camera), PermissionState::Granted);
    }

    #[test]
    fn test_concurrent_status_requests_once() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.polls_until_resolved = 1000);
        let gate = Arc::new(gate(&device));
        let camera = CapabilityId::from("camera");

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let camera = camera.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        assert_eq!(gate.status(&camera, false), PermissionState::Pending);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(device.calls().request_capability_async, 1);
    }

    #[test]
    fn test_shutdown_clears_records() {
        let device = Arc::new(MockDevice::new());
        let gate = gate(&device);
        gate.status(&CapabilityId::from("camera"), true);
        gate.shutdown();
        assert!(gate.snapshot().is_empty());
        assert!(!gate.is_running());
        assert_eq!(device.calls().capability_shutdown, 1);
    }
}
