//! Drives the application, render and submission stages in handoff order.

use std::sync::Arc;

use ocellus_xr::{
    CapabilityApi, CapabilityId, HeadTrackingState, HmdDevice, MapEvents, SessionApi,
};
use tracing::{debug, debug_span, info, trace, warn};

use crate::backend::RenderBackend;
use crate::clip::ClipRangeNegotiator;
use crate::config::HmdConfig;
use crate::events::{EventRegistry, HmdEvent};
use crate::frame::{
    FrameStateBuffer, FrameStateRecord, PoseSource, RefreshContext, Stage, WorldContext,
};
use crate::permission::{PermissionGate, PermissionState};
use crate::session::{DeviceSessionManager, InitOutcome, RenderSessionTasks, SessionState};
use crate::stats::{bump, SchedulerStats};

pub const DEFAULT_RENDER_TARGET_SIZE: (u32, u32) = (2560, 960);

pub struct StageScheduler {
    config: HmdConfig,
    device: Arc<dyn HmdDevice>,
    buffer: FrameStateBuffer,
    negotiator: ClipRangeNegotiator,
    session: DeviceSessionManager,
    render_tasks: RenderSessionTasks,
    permissions: Arc<PermissionGate>,
    events: EventRegistry,
    stats: Arc<SchedulerStats>,
    frame_counter: u64,
    hmd_enabled: bool,
    rendering_paused: bool,
    focus_target: Option<f32>,
    stabilization_target: Option<f32>,
    render_target_size: (u32, u32),
}

impl StageScheduler {
    pub fn new<D>(device: Arc<D>, config: HmdConfig) -> Self
    where
        D: HmdDevice + 'static,
    {
        let session_api: Arc<dyn SessionApi> = device.clone();
        let capability_api: Arc<dyn CapabilityApi> = device.clone();
        let (session, render_tasks) = DeviceSessionManager::new(session_api);

        let negotiator = ClipRangeNegotiator::new(config.engine_near_clip, config.engine_far_clip);
        let mut initial = FrameStateRecord::new(
            negotiator.negotiate_current(config.default_world_to_meters, None, None),
            config.default_fov,
            config.default_world_to_meters,
        );
        initial.recommended_far_clip = negotiator.recommended_far(config.default_world_to_meters);

        Self {
            buffer: FrameStateBuffer::new(initial),
            negotiator,
            session,
            render_tasks,
            permissions: Arc::new(PermissionGate::new(capability_api)),
            events: EventRegistry::new(),
            stats: Arc::new(SchedulerStats::default()),
            frame_counter: 0,
            hmd_enabled: true,
            rendering_paused: false,
            focus_target: None,
            stabilization_target: None,
            render_target_size: DEFAULT_RENDER_TARGET_SIZE,
            device,
            config,
        }
    }

    /// Start the capability service and register required capabilities.
    pub fn startup(&mut self) {
        if !self.permissions.startup() {
            warn!("capability service unavailable; head tracking stays gated");
            return;
        }
        self.permissions
            .request_all(&self.config.required_capabilities);
        if self.config.block_on_capabilities {
            self.check_required_blocking();
        }
    }

    pub fn config(&self) -> &HmdConfig {
        &self.config
    }

    pub fn frame_state(&self, stage: Stage) -> &FrameStateRecord {
        self.buffer.record(stage)
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn session(&self) -> DeviceSessionManager {
        self.session.clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn permissions(&self) -> Arc<PermissionGate> {
        self.permissions.clone()
    }

    pub fn capability_state(&self, capability: &CapabilityId) -> PermissionState {
        self.permissions.state(capability)
    }

    pub fn capability_status(&self, capability: &CapabilityId, blocking: bool) -> PermissionState {
        self.permissions.status(capability, blocking)
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    pub fn events_mut(&mut self) -> &mut EventRegistry {
        &mut self.events
    }

    pub fn render_target_size(&self) -> (u32, u32) {
        self.render_target_size
    }

    /// Tracker state read on the last application tick.
    pub fn head_tracking_state(&self) -> Option<HeadTrackingState> {
        self.buffer.record(Stage::Application).head_tracking_state
    }

    pub fn head_tracking_map_events(&self) -> Option<MapEvents> {
        self.buffer.record(Stage::Application).map_events
    }

    pub fn is_paused(&self) -> bool {
        self.rendering_paused
    }

    pub fn set_hmd_enabled(&mut self, enabled: bool) {
        self.hmd_enabled = enabled;
        if enabled {
            self.session.enable();
        }
        info!(enabled, "HMD enabled state changed");
    }

    pub fn set_clipping_planes(&mut self, near: f32, far: Option<f32>) {
        self.negotiator.set_clipping_planes(near, far);
    }

    pub fn set_focus_distance(&mut self, distance: Option<f32>) {
        self.focus_target = distance;
    }

    pub fn set_stabilization_distance(&mut self, distance: Option<f32>) {
        self.stabilization_target = distance;
    }

    /// Application stage. Returns false when the tick was skipped.
    pub fn application_tick(&mut self, world: Option<&WorldContext>) -> bool {
        let Some(world) = world.filter(|world| world.is_game_world) else {
            self.buffer.record_mut(Stage::Application).world = None;
            trace!("no game world; tick skipped");
            return false;
        };

        self.frame_counter += 1;
        let span = debug_span!("application_tick", frame = self.frame_counter);
        let _enter = span.enter();

        if self.hmd_enabled {
            self.session
                .request_init(self.config.session, self.config.frame_timing_hint);
        }
        self.poll_capabilities();

        let tracking_permitted = self.tracking_permitted();
        let lease = self.session.lease();
        let ctx = RefreshContext {
            frame_number: self.frame_counter,
            world,
            client: lease.as_ref().map(|lease| lease.client()),
            tracking_permitted,
            focus_target: self.focus_target,
            stabilization_target: self.stabilization_target,
            default_fov: self.config.default_fov,
            default_world_to_meters: self.config.default_world_to_meters,
            max_stale_pose_frames: self.config.max_stale_pose_frames,
        };
        let outcome = self
            .buffer
            .refresh_application_record(self.device.as_ref(), &ctx);
        drop(lease);

        if let Some(events) = self.head_tracking_map_events().filter(|events| !events.is_empty()) {
            info!(?events, "head tracking map events");
            self.events
                .dispatch(&HmdEvent::HeadTrackingMapEvents { events });
        }
        if outcome.pose != PoseSource::Device {
            bump(&self.stats.pose_fallbacks);
        }
        bump(&self.stats.frames_ticked);
        true
    }

    /// Render stage: run queued session work, take the application record and
    /// negotiate its clip chain.
    pub fn render_pass(&mut self) {
        let span = debug_span!("render_pass", frame = self.frame_counter);
        let _enter = span.enter();

        match self.render_tasks.run_pending() {
            Some(InitOutcome::Ready(_)) => bump(&self.stats.session_inits),
            Some(InitOutcome::Failed(_)) => {
                bump(&self.stats.session_init_failures);
                self.events.dispatch(&HmdEvent::SessionInitFailed);
            }
            None => {}
        }

        self.buffer.handoff_to_render();

        if self.session.take_just_ready() {
            self.on_session_ready();
        }

        let record = self.buffer.record_mut(Stage::Render);
        let chain = self.negotiator.negotiate_current(
            record.world_to_meters_scale,
            record.focus_target,
            record.stabilization_target,
        );
        record.apply_clip_chain(chain);
        record.recommended_far_clip = self.negotiator.recommended_far(record.world_to_meters_scale);
    }

    /// Submission stage: begin the device frame, hand the record to the
    /// backend, end the frame and keep the result as the previous frame.
    pub fn submission_pass(&mut self, backend: &mut dyn RenderBackend) {
        let span = debug_span!("submission_pass", frame = self.frame_counter);
        let _enter = span.enter();

        let separate = self.config.separate_submission_stage;
        let stage = if separate {
            self.buffer.handoff_to_submission();
            Stage::Submission
        } else {
            Stage::Render
        };

        let lease = if self.rendering_paused {
            None
        } else {
            self.session.lease()
        };
        let record = self.buffer.record_mut(stage);
        record.begin_frame_succeeded = false;
        record.frame_info = None;

        if let Some(lease) = lease {
            match self.device.begin_frame(lease.client()) {
                Ok(frame) => {
                    record.frame_info = Some(frame);
                    record.begin_frame_succeeded = true;
                    if let Err(err) = backend.submit(record) {
                        warn!(frame = record.frame_number, "backend submit failed: {err}");
                    }
                    if let Err(err) = self.device.end_frame(lease.client(), frame) {
                        warn!(frame = record.frame_number, "end_frame failed: {err}");
                    }
                    bump(&self.stats.frames_submitted);
                }
                Err(err) => {
                    warn!(frame = record.frame_number, "begin_frame failed: {err}");
                    bump(&self.stats.begin_frame_failures);
                }
            }
        }

        self.buffer.snapshot_as_previous(separate);
    }

    /// One full frame through all three stages.
    pub fn run_frame(
        &mut self,
        world: Option<&WorldContext>,
        backend: &mut dyn RenderBackend,
    ) -> bool {
        if !self.application_tick(world) {
            return false;
        }
        self.render_pass();
        self.submission_pass(backend);
        true
    }

    pub fn pause(&mut self) {
        if self.rendering_paused {
            return;
        }
        self.rendering_paused = true;
        info!("rendering paused");
        self.events.dispatch(&HmdEvent::Paused);
    }

    /// Resume rendering and start a fresh capability acquisition cycle.
    pub fn resume(&mut self) {
        if !self.rendering_paused {
            return;
        }
        self.rendering_paused = false;
        self.permissions.reset_all();
        if self.config.block_on_capabilities {
            self.check_required_blocking();
        }
        info!("rendering resumed");
        self.events.dispatch(&HmdEvent::Resumed);
    }

    /// Tear down the session, release the live snapshot and stop the
    /// capability service.
    pub fn shutdown(&mut self) {
        self.render_tasks.run_pending();
        if self.session.request_teardown() {
            self.events.dispatch(&HmdEvent::SessionDestroyed);
        }
        self.negotiator.clear_device_limits();
        self.buffer.release_snapshot(self.device.as_ref());
        self.buffer.clear_head_tracking();
        self.permissions.shutdown();
        info!(frames = self.frame_counter, "stage scheduler shut down");
    }

    fn on_session_ready(&mut self) {
        if let Some(lease) = self.session.lease() {
            match self.device.query_render_target_limits(lease.client()) {
                Ok(limits) => {
                    self.negotiator
                        .set_device_limits(limits.min_clip, limits.max_clip);
                    self.render_target_size = limits.target_size;
                    debug!(
                        min_clip = limits.min_clip,
                        max_clip = limits.max_clip,
                        width = limits.target_size.0,
                        height = limits.target_size.1,
                        "render target limits"
                    );
                }
                Err(err) => warn!("query_render_target_limits failed: {err}"),
            }
        }
        self.events.dispatch(&HmdEvent::SessionReady {
            render_target_size: self.render_target_size,
        });
    }

    fn tracking_permitted(&self) -> bool {
        self.config
            .required_capabilities
            .iter()
            .all(|capability| self.permissions.state(capability) == PermissionState::Granted)
    }

    fn poll_capabilities(&mut self) {
        if self.config.block_on_capabilities {
            self.check_required_blocking();
        }
        for (capability, state) in self.permissions.poll_all() {
            debug!(%capability, ?state, "capability changed");
            self.events
                .dispatch(&HmdEvent::CapabilityChanged { capability, state });
        }
    }

    fn check_required_blocking(&mut self) {
        for capability in &self.config.required_capabilities {
            let before = self.permissions.state(capability);
            if before != PermissionState::NotRequested {
                continue;
            }
            let state = self.permissions.status(capability, true);
            if state != before {
                self.events.dispatch(&HmdEvent::CapabilityChanged {
                    capability: capability.clone(),
                    state,
                });
            }
        }
    }
}

impl std::fmt::Debug for StageScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageScheduler")
            .field("frame_counter", &self.frame_counter)
            .field("session", &self.session)
            .field("paused", &self.rendering_paused)
            .field("hmd_enabled", &self.hmd_enabled)
            .finish()
    }
}
