use crate::{
    types::{
        CapabilityDecision, CapabilityId, ClientHandle, ClipExtents, CoordinateFrameId,
        FrameInfoHandle, FrameTimingHint, HeadTrackingState, MapEvents, Pose, RenderTargetLimits,
        RequestHandle, RequestPoll, SessionOptions, SnapshotHandle,
    },
    XrResult,
};

/// Graphics client lifetime.
pub trait SessionApi: Send + Sync {
    /// Cheap reachability check; must not block on the device.
    fn is_reachable(&self) -> bool;
    fn create_session(&self, options: &SessionOptions) -> XrResult<ClientHandle>;
    fn destroy_session(&self, client: ClientHandle) -> XrResult<()>;
    fn set_frame_timing_hint(&self, client: ClientHandle, hint: FrameTimingHint) -> XrResult<()>;
}

/// Perception snapshots and head pose.
pub trait PerceptionApi: Send + Sync {
    /// Coordinate frame of the head tracker, fixed for the device lifetime.
    fn head_coordinate_frame(&self) -> CoordinateFrameId;
    fn acquire_snapshot(&self) -> XrResult<SnapshotHandle>;
    fn release_snapshot(&self, snapshot: SnapshotHandle) -> XrResult<()>;
    fn query_pose(&self, snapshot: SnapshotHandle, frame: CoordinateFrameId) -> XrResult<Pose>;
    fn head_tracking_state(&self) -> XrResult<HeadTrackingState>;
    /// Map events raised since the previous call.
    fn head_tracking_map_events(&self) -> XrResult<MapEvents>;
}

/// Capability (privilege) service.
pub trait CapabilityApi: Send + Sync {
    fn startup(&self) -> XrResult<()>;
    fn shutdown(&self) -> XrResult<()>;

    // Blocking check.
    fn check_capability(&self, capability: &CapabilityId) -> XrResult<CapabilityDecision>;

    // Non-blocking request/poll pair.
    fn request_capability_async(&self, capability: &CapabilityId) -> XrResult<RequestHandle>;
    fn poll_capability_request(&self, request: RequestHandle) -> RequestPoll;
}

/// Per-frame render limits, clip extents and frame pacing.
pub trait FrameApi: Send + Sync {
    fn query_render_target_limits(&self, client: ClientHandle) -> XrResult<RenderTargetLimits>;
    fn query_clip_extents(&self, client: ClientHandle) -> XrResult<ClipExtents>;
    fn begin_frame(&self, client: ClientHandle) -> XrResult<FrameInfoHandle>;
    fn end_frame(&self, client: ClientHandle, frame: FrameInfoHandle) -> XrResult<()>;
}

/// Everything the stage core needs from a device.
pub trait HmdDevice: SessionApi + PerceptionApi + CapabilityApi + FrameApi {}

impl<T> HmdDevice for T where T: SessionApi + PerceptionApi + CapabilityApi + FrameApi {}
