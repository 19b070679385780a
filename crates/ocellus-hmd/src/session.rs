//! Device session lifecycle.
//!
//! The application stage owns a [`DeviceSessionManager`] handle and requests
//! bring-up; the render stage owns the matching [`RenderSessionTasks`] and
//! performs the blocking creation call. State lives in a shared atomic so
//! either side can observe it without locking.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use ocellus_xr::{ClientHandle, FrameTimingHint, SessionApi, SessionOptions, XrError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Destroying = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Destroying,
            _ => Self::Uninitialized,
        }
    }
}

/// What `request_init` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitRequest {
    Scheduled,
    AlreadyQueued,
    AlreadyReady,
    /// Bring-up disabled until [`DeviceSessionManager::enable`].
    Disabled,
    /// Device not reachable; bring-up is now disabled.
    Unreachable,
    /// Teardown in progress.
    Busy,
    /// Render stage dropped its task receiver.
    RenderStageGone,
}

/// Result of one render-stage init task.
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    Ready(ClientHandle),
    Failed(XrError),
}

#[derive(Debug)]
enum SessionTask {
    Init {
        options: SessionOptions,
        hint: FrameTimingHint,
    },
}

#[derive(Debug, Default)]
struct LeaseTable {
    outstanding: usize,
    client: Option<ClientHandle>,
}

#[derive(Debug)]
struct SessionShared {
    state: AtomicU8,
    just_ready: AtomicBool,
    disabled: AtomicBool,
    leases: Mutex<LeaseTable>,
    drained: Condvar,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock_leases(&self) -> MutexGuard<'_, LeaseTable> {
        match self.leases.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Application-side session handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct DeviceSessionManager {
    shared: Arc<SessionShared>,
    device: Arc<dyn SessionApi>,
    tasks: Sender<SessionTask>,
}

/// Render-side half: consumes init tasks queued by the application stage.
pub struct RenderSessionTasks {
    shared: Arc<SessionShared>,
    device: Arc<dyn SessionApi>,
    tasks: Receiver<SessionTask>,
}

impl DeviceSessionManager {
    pub fn new(device: Arc<dyn SessionApi>) -> (Self, RenderSessionTasks) {
        let shared = Arc::new(SessionShared {
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            just_ready: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            leases: Mutex::new(LeaseTable::default()),
            drained: Condvar::new(),
        });
        let (tx, rx) = mpsc::channel();
        let manager = Self {
            shared: shared.clone(),
            device: device.clone(),
            tasks: tx,
        };
        let render = RenderSessionTasks {
            shared,
            device,
            tasks: rx,
        };
        (manager, render)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::Acquire)
    }

    /// Clear the disabled condition left by an unreachable device or a
    /// failed bring-up.
    pub fn enable(&self) {
        if self.shared.disabled.swap(false, Ordering::AcqRel) {
            info!("device session re-enabled");
        }
    }

    pub fn client(&self) -> Option<ClientHandle> {
        self.shared.lock_leases().client
    }

    /// Schedule session creation on the render stage. Never blocks.
    pub fn request_init(&self, options: SessionOptions, hint: FrameTimingHint) -> InitRequest {
        if self.is_disabled() {
            return InitRequest::Disabled;
        }
        match self.state() {
            SessionState::Uninitialized => {}
            SessionState::Initializing => {
                warn!("session create call already queued");
                return InitRequest::AlreadyQueued;
            }
            SessionState::Ready => return InitRequest::AlreadyReady,
            SessionState::Destroying => return InitRequest::Busy,
        }

        if !self.device.is_reachable() {
            info!("device not reachable; HMD session disabled");
            self.shared.disabled.store(true, Ordering::Release);
            return InitRequest::Unreachable;
        }

        if !self
            .shared
            .transition(SessionState::Uninitialized, SessionState::Initializing)
        {
            warn!("session create call already queued");
            return InitRequest::AlreadyQueued;
        }

        if self.tasks.send(SessionTask::Init { options, hint }).is_err() {
            warn!("render stage gone; session init not scheduled");
            self.shared.set_state(SessionState::Uninitialized);
            return InitRequest::RenderStageGone;
        }
        debug!("session init scheduled on render stage");
        InitRequest::Scheduled
    }

    /// Consume the one-shot "just became ready" flag. Render stage only.
    pub(crate) fn take_just_ready(&self) -> bool {
        self.shared.just_ready.swap(false, Ordering::AcqRel)
    }

    /// Borrow the live session for render or submission work. Teardown waits
    /// until every lease is dropped.
    pub fn lease(&self) -> Option<SessionLease> {
        let mut table = self.shared.lock_leases();
        if self.state() != SessionState::Ready {
            return None;
        }
        let client = table.client?;
        table.outstanding += 1;
        Some(SessionLease {
            shared: self.shared.clone(),
            client,
        })
    }

    pub fn outstanding_leases(&self) -> usize {
        self.shared.lock_leases().outstanding
    }

    /// Destroy a Ready session. Blocks until outstanding leases drain.
    /// Returns false if the session was not Ready.
    pub fn request_teardown(&self) -> bool {
        if !self
            .shared
            .transition(SessionState::Ready, SessionState::Destroying)
        {
            debug!(state = ?self.state(), "teardown ignored; session not ready");
            return false;
        }
        self.shared.just_ready.store(false, Ordering::Release);

        let client = {
            let mut table = self.shared.lock_leases();
            while table.outstanding > 0 {
                debug!(outstanding = table.outstanding, "waiting for session leases");
                table = match self.shared.drained.wait(table) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            table.client.take()
        };

        if let Some(client) = client {
            match self.device.destroy_session(client) {
                Ok(()) => info!(client = client.0, "device session destroyed"),
                Err(err) => error!("destroy_session failed: {err}"),
            }
        }
        self.shared.set_state(SessionState::Uninitialized);
        true
    }
}

impl std::fmt::Debug for DeviceSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSessionManager")
            .field("state", &self.state())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

impl RenderSessionTasks {
    /// Drain queued tasks. Returns the outcome of the last init run, if any.
    pub fn run_pending(&mut self) -> Option<InitOutcome> {
        let mut outcome = None;
        loop {
            match self.tasks.try_recv() {
                Ok(SessionTask::Init { options, hint }) => {
                    outcome = Some(self.run_init(&options, hint));
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        outcome
    }

    fn run_init(&self, options: &SessionOptions, hint: FrameTimingHint) -> InitOutcome {
        debug_assert_eq!(self.shared.state(), SessionState::Initializing);
        match self.device.create_session(options) {
            Ok(client) => {
                if let Err(err) = self.device.set_frame_timing_hint(client, hint) {
                    warn!(?hint, "frame timing hint rejected: {err}");
                }
                self.shared.lock_leases().client = Some(client);
                self.shared.set_state(SessionState::Ready);
                self.shared.just_ready.store(true, Ordering::Release);
                info!(client = client.0, ?hint, "device session ready");
                InitOutcome::Ready(client)
            }
            Err(err) => {
                error!("create_session failed; HMD session disabled: {err}");
                self.shared.lock_leases().client = None;
                self.shared.disabled.store(true, Ordering::Release);
                self.shared.set_state(SessionState::Uninitialized);
                InitOutcome::Failed(err)
            }
        }
    }
}

/// Proof that the session is Ready while render or submission work uses it.
#[derive(Debug)]
pub struct SessionLease {
    shared: Arc<SessionShared>,
    client: ClientHandle,
}

impl SessionLease {
    pub fn client(&self) -> ClientHandle {
        self.client
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut table = self.shared.lock_leases();
        table.outstanding = table.outstanding.saturating_sub(1);
        if table.outstanding == 0 {
            self.shared.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use std::thread;
    use std::time::Duration;

    fn manager(device: &Arc<MockDevice>) -> (DeviceSessionManager, RenderSessionTasks) {
        DeviceSessionManager::new(device.clone())
    }

    fn init(manager: &DeviceSessionManager) -> InitRequest {
        manager.request_init(SessionOptions::default(), FrameTimingHint::Hz60)
    }

    #[test]
    fn test_unreachable_disables_without_task() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.reachable = false);
        let (manager, mut render) = manager(&device);

        assert_eq!(init(&manager), InitRequest::Unreachable);
        assert_eq!(manager.state(), SessionState::Uninitialized);
        assert!(manager.is_disabled());
        assert_eq!(render.run_pending(), None);
        assert_eq!(device.calls().create_session, 0);
        assert_eq!(init(&manager), InitRequest::Disabled);
    }

    #[test]
    fn test_init_runs_once_on_render_stage() {
        let device = Arc::new(MockDevice::new());
        let (manager, mut render) = manager(&device);

        assert_eq!(init(&manager), InitRequest::Scheduled);
        assert_eq!(manager.state(), SessionState::Initializing);
        assert_eq!(init(&manager), InitRequest::AlreadyQueued);

        assert!(matches!(render.run_pending(), Some(InitOutcome::Ready(_))));
        assert_eq!(render.run_pending(), None);
        assert_eq!(device.calls().create_session, 1);
        assert_eq!(device.calls().timing_hints, vec![FrameTimingHint::Hz60]);
        assert!(manager.is_ready());

        assert!(manager.take_just_ready());
        assert!(!manager.take_just_ready());
        assert_eq!(init(&manager), InitRequest::AlreadyReady);
    }

    #[test]
    fn test_failed_create_disables_until_enable() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.fail_session_create = true);
        let (manager, mut render) = manager(&device);

        init(&manager);
        assert!(matches!(render.run_pending(), Some(InitOutcome::Failed(_))));
        assert_eq!(manager.state(), SessionState::Uninitialized);
        assert!(manager.is_disabled());
        assert!(!manager.take_just_ready());

        for _ in 0..5 {
            assert_eq!(init(&manager), InitRequest::Disabled);
            render.run_pending();
        }
        assert_eq!(device.calls().create_session, 1);

        device.with_state(|s| s.fail_session_create = false);
        manager.enable();
        assert_eq!(init(&manager), InitRequest::Scheduled);
        assert!(matches!(render.run_pending(), Some(InitOutcome::Ready(_))));
    }

    #[test]
    fn test_timing_hint_failure_keeps_session() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.fail_timing_hint = true);
        let (manager, mut render) = manager(&device);
        init(&manager);
        assert!(matches!(render.run_pending(), Some(InitOutcome::Ready(_))));
        assert!(manager.is_ready());
    }

    #[test]
    fn test_lease_only_when_ready() {
        let device = Arc::new(MockDevice::new());
        let (manager, mut render) = manager(&device);
        assert!(manager.lease().is_none());
        init(&manager);
        assert!(manager.lease().is_none());
        render.run_pending();
        let lease = manager.lease().unwrap();
        assert_eq!(Some(lease.client()), manager.client());
        assert_eq!(manager.outstanding_leases(), 1);
        drop(lease);
        assert_eq!(manager.outstanding_leases(), 0);
    }

    #[test]
    fn test_teardown_only_from_ready() {
        let device = Arc::new(MockDevice::new());
        let (manager, mut render) = manager(&device);
        assert!(!manager.request_teardown());
        init(&manager);
        assert!(!manager.request_teardown());
        render.run_pending();
        assert!(manager.request_teardown());
        assert_eq!(manager.state(), SessionState::Uninitialized);
        assert_eq!(manager.client(), None);
        assert_eq!(device.calls().destroy_session, 1);
    }

    #[test]
    fn test_teardown_advances_when_destroy_fails() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.fail_session_destroy = true);
        let (manager, mut render) = manager(&device);
        init(&manager);
        render.run_pending();
        assert!(manager.request_teardown());
        assert_eq!(manager.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_teardown_waits_for_leases() {
        let device = Arc::new(MockDevice::new());
        let (manager, mut render) = manager(&device);
        init(&manager);
        render.run_pending();

        let lease = manager.lease().unwrap();
        let released = Arc::new(AtomicBool::new(false));
        let worker = {
            let released = released.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                released.store(true, Ordering::SeqCst);
                drop(lease);
            })
        };

        assert!(manager.request_teardown());
        assert!(released.load(Ordering::SeqCst));
        assert!(manager.lease().is_none());
        worker.join().unwrap();
        assert_eq!(device.calls().destroy_session, 1);
    }

    #[test]
    fn test_render_stage_gone() {
        let device = Arc::new(MockDevice::new());
        let (manager, render) = manager(&device);
        drop(render);
        assert_eq!(init(&manager), InitRequest::RenderStageGone);
        assert_eq!(manager.state(), SessionState::Uninitialized);
    }
}
