//! Scriptable in-process device for tests, benches and the CLI driver.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use glam::{Quat, Vec3};
use ocellus_xr::{
    CapabilityApi, CapabilityDecision, CapabilityId, ClientHandle, ClipExtents, CoordinateFrameId,
    FrameApi, FrameInfoHandle, FrameTimingHint, HeadTrackingError, HeadTrackingMode,
    HeadTrackingState, MapEvents, PerceptionApi, Pose, RenderTargetLimits, RequestHandle, RequestPoll, SessionApi, SessionOptions, SnapshotHandle, ViewExtent, XrError,
    XrResult,
};

use crate::backend::RenderBackend;
use crate::frame::FrameStateRecord;

const HEAD_FRAME: CoordinateFrameId = CoordinateFrameId(1);

/// Call counters, one per device entry point.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MockCalls {
    pub create_session: u32,
    pub destroy_session: u32,
    pub timing_hints: Vec<FrameTimingHint>,
    pub acquire_snapshot: u32,
    pub release_snapshot: u32,
    pub query_pose: u32,
    pub head_tracking_state: u32,
    pub head_tracking_map_events: u32,
    pub capability_startup: u32,
    pub capability_shutdown: u32,
    pub check_capability: u32,
    pub request_capability_async: u32,
    pub poll_capability_request: u32,
    pub query_render_target_limits: u32,
    pub query_clip_extents: u32,
    pub begin_frame: u32,
    pub end_frame: u32,
}

#[derive(Debug)]
struct MockRequest {
    capability: CapabilityId,
    polls_remaining: u32,
}

/// Knobs and bookkeeping behind a [`MockDevice`].
#[derive(Debug)]
pub struct MockDeviceState {
    pub reachable: bool,
    pub fail_session_create: bool,
    pub fail_session_destroy: bool,
    pub fail_timing_hint: bool,
    pub fail_capability_startup: bool,
    pub fail_capability_check: bool,
    pub fail_snapshot: bool,
    pub fail_clip_extents: bool,
    pub fail_render_limits: bool,
    pub fail_begin_frame: bool,
    pub fail_head_tracking_state: bool,
    pub fail_map_events: bool,
    pub head_tracking: HeadTrackingState,
    /// Consumed one entry per map-event query; empty once drained.
    pub map_events: VecDeque<MapEvents>,
    /// Consumed one entry per `query_pose`; `base_pose` once empty.
    pub pose_script: VecDeque<XrResult<Pose>>,
    pub base_pose: Pose,
    /// Capabilities not listed here are granted.
    pub decisions: HashMap<CapabilityId, CapabilityDecision>,
    /// Polls answered Pending before an async request resolves.
    pub polls_until_resolved: u32,
    pub limits: RenderTargetLimits,
    pub extents: ClipExtents,
    pub calls: MockCalls,
    requests: HashMap<RequestHandle, MockRequest>,
    live_snapshots: HashSet<SnapshotHandle>,
    next_handle: u64,
}

impl MockDeviceState {
    pub fn deny(&mut self, capability: &str) {
        self.decisions
            .insert(CapabilityId::from(capability), CapabilityDecision::Denied);
    }

    pub fn grant(&mut self, capability: &str) {
        self.decisions
            .insert(CapabilityId::from(capability), CapabilityDecision::Granted);
    }

    fn decision(&self, capability: &CapabilityId) -> CapabilityDecision {
        self.decisions
            .get(capability)
            .copied()
            .unwrap_or(CapabilityDecision::Granted)
    }

    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl Default for MockDeviceState {
    fn default() -> Self {
        Self {
            reachable: true,
            fail_session_create: false,
            fail_session_destroy: false,
            fail_timing_hint: false,
            fail_capability_startup: false,
            fail_capability_check: false,
            fail_snapshot: false,
            fail_clip_extents: false,
            fail_render_limits: false,
            fail_begin_frame: false,
            fail_head_tracking_state: false,
            fail_map_events: false,
            head_tracking: HeadTrackingState {
                mode: HeadTrackingMode::PositionAndOrientation,
                error: HeadTrackingError::None,
                confidence: 1.0,
            },
            map_events: VecDeque::new(),
            pose_script: VecDeque::new(),
            base_pose: Pose::new(Vec3::new(0.0, 160.0, 0.0), Quat::IDENTITY),
            decisions: HashMap::new(),
            polls_until_resolved: 0,
            limits: RenderTargetLimits {
                min_clip: 0.37,
                max_clip: 1000.0,
                target_size: (2560, 960),
            },
            extents: ClipExtents {
                views: [
                    ViewExtent {
                        horizontal_fov: 40.0,
                        vertical_fov: 30.0,
                    },
                    ViewExtent {
                        horizontal_fov: 40.0,
                        vertical_fov: 30.0,
                    },
                ],
            },
            calls: MockCalls::default(),
            requests: HashMap::new(),
            live_snapshots: HashSet::new(),
            next_handle: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockDevice {
    state: Mutex<MockDeviceState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockDeviceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Inspect or reconfigure the device.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockDeviceState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn calls(&self) -> MockCalls {
        self.lock().calls.clone()
    }

    pub fn live_snapshots(&self) -> usize {
        self.lock().live_snapshots.len()
    }
}

impl SessionApi for MockDevice {
    fn is_reachable(&self) -> bool {
        self.lock().reachable
    }

    fn create_session(&self, _options: &SessionOptions) -> XrResult<ClientHandle> {
        let mut state = self.lock();
        state.calls.create_session += 1;
        if state.fail_session_create {
            return Err(XrError::call("create_session", "graphics client rejected"));
        }
        Ok(ClientHandle(state.next_handle()))
    }

    fn destroy_session(&self, _client: ClientHandle) -> XrResult<()> {
        let mut state = self.lock();
        state.calls.destroy_session += 1;
        if state.fail_session_destroy {
            return Err(XrError::call("destroy_session", "client busy"));
        }
        Ok(())
    }

    fn set_frame_timing_hint(&self, _client: ClientHandle, hint: FrameTimingHint) -> XrResult<()> {
        let mut state = self.lock();
        state.calls.timing_hints.push(hint);
        if state.fail_timing_hint {
            return Err(XrError::call("set_frame_timing_hint", "unsupported"));
        }
        Ok(())
    }
}

impl PerceptionApi for MockDevice {
    fn head_coordinate_frame(&self) -> CoordinateFrameId {
        HEAD_FRAME
    }

    fn acquire_snapshot(&self) -> XrResult<SnapshotHandle> {
        let mut state = self.lock();
        state.calls.acquire_snapshot += 1;
        if state.fail_snapshot {
            return Err(XrError::Unavailable("perception".into()));
        }
        let snapshot = SnapshotHandle(state.next_handle());
        state.live_snapshots.insert(snapshot);
        Ok(snapshot)
    }

    fn release_snapshot(&self, snapshot: SnapshotHandle) -> XrResult<()> {
        let mut state = self.lock();
        state.calls.release_snapshot += 1;
        if state.live_snapshots.remove(&snapshot) {
            Ok(())
        } else {
            Err(XrError::call("release_snapshot", "unknown snapshot"))
        }
    }

    fn query_pose(&self, snapshot: SnapshotHandle, frame: CoordinateFrameId) -> XrResult<Pose> {
        let mut state = self.lock();
        state.calls.query_pose += 1;
        if !state.live_snapshots.contains(&snapshot) {
            return Err(XrError::call("query_pose", "stale snapshot"));
        }
        if frame != HEAD_FRAME {
            return Err(XrError::PoseNotFound(frame));
        }
        match state.pose_script.pop_front() {
            Some(scripted) => scripted,
            None => Ok(state.base_pose),
        }
    }

    fn head_tracking_state(&self) -> XrResult<HeadTrackingState> {
        let mut state = self.lock();
        state.calls.head_tracking_state += 1;
        if state.fail_head_tracking_state {
            return Err(XrError::call("head_tracking_state", "tracker offline"));
        }
        Ok(state.head_tracking)
    }

    fn head_tracking_map_events(&self) -> XrResult<MapEvents> {
        let mut state = self.lock();
        state.calls.head_tracking_map_events += 1;
        if state.fail_map_events {
            return Err(XrError::call("head_tracking_map_events", "tracker offline"));
        }
        Ok(state.map_events.pop_front().unwrap_or_default())
    }
}

impl CapabilityApi for MockDevice {
    fn startup(&self) -> XrResult<()> {
        let mut state = self.lock();
        state.calls.capability_startup += 1;
        if state.fail_capability_startup {
            return Err(XrError::Unavailable("capability service".into()));
        }
        Ok(())
    }

    fn shutdown(&self) -> XrResult<()> {
        self.lock().calls.capability_shutdown += 1;
        Ok(())
    }

    fn check_capability(&self, capability: &CapabilityId) -> XrResult<CapabilityDecision> {
        let mut state = self.lock();
        state.calls.check_capability += 1;
        if state.fail_capability_check {
            return Err(XrError::call("check_capability", "service unreachable"));
        }
        Ok(state.decision(capability))
    }

    fn request_capability_async(&self, capability: &CapabilityId) -> XrResult<RequestHandle> {
        let mut state = self.lock();
        state.calls.request_capability_async += 1;
        if state.fail_capability_check {
            return Err(XrError::call("request_capability_async", "service unreachable"));
        }
        let handle = RequestHandle(state.next_handle());
        let polls_remaining = state.polls_until_resolved;
        state.requests.insert(
            handle,
            MockRequest {
                capability: capability.clone(),
                polls_remaining,
            },
        );
        Ok(handle)
    }

    fn poll_capability_request(&self, request: RequestHandle) -> RequestPoll {
        let mut state = self.lock();
        state.calls.poll_capability_request += 1;
        let Some(pending) = state.requests.get_mut(&request) else {
            return RequestPoll::Error;
        };
        if pending.polls_remaining > 0 {
            pending.polls_remaining -= 1;
            return RequestPoll::Pending;
        }
        let capability = pending.capability.clone();
        match state.decision(&capability) {
            CapabilityDecision::Granted => RequestPoll::Granted,
            CapabilityDecision::Denied => RequestPoll::Denied,
        }
    }
}

impl FrameApi for MockDevice {
    fn query_render_target_limits(&self, _client: ClientHandle) -> XrResult<RenderTargetLimits> {
        let mut state = self.lock();
        state.calls.query_render_target_limits += 1;
        if state.fail_render_limits {
            return Err(XrError::call("query_render_target_limits", "not ready"));
        }
        Ok(state.limits)
    }

    fn query_clip_extents(&self, _client: ClientHandle) -> XrResult<ClipExtents> {
        let mut state = self.lock();
        state.calls.query_clip_extents += 1;
        if state.fail_clip_extents {
            return Err(XrError::call("query_clip_extents", "frame info invalid"));
        }
        Ok(state.extents)
    }

    fn begin_frame(&self, _client: ClientHandle) -> XrResult<FrameInfoHandle> {
        let mut state = self.lock();
        state.calls.begin_frame += 1;
        if state.fail_begin_frame {
            return Err(XrError::call("begin_frame", "timed out"));
        }
        Ok(FrameInfoHandle(state.next_handle()))
    }

    fn end_frame(&self, _client: ClientHandle, _frame: FrameInfoHandle) -> XrResult<()> {
        self.lock().calls.end_frame += 1;
        Ok(())
    }
}

/// Backend that remembers which frames it was handed.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub submitted: Vec<u64>,
    pub fail: bool,
}

impl RenderBackend for RecordingBackend {
    fn submit(&mut self, record: &FrameStateRecord) -> XrResult<()> {
        if self.fail {
            return Err(XrError::call("submit", "backend rejected frame"));
        }
        self.submitted.push(record.frame_number);
        Ok(())
    }
}
