//! Per-stage frame records and the value-copy handoffs between them.

use ocellus_xr::{
    ClientHandle, FrameApi, FrameInfoHandle, HeadTrackingState, MapEvents, PerceptionApi, Pose,
    SnapshotHandle, XrError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::clip::ClipChain;
use crate::config::{DEFAULT_FOV_DEGREES, DEFAULT_WORLD_TO_METERS};

/// Quaternions within this distance of unit length are re-normalized;
/// anything further out is treated as a failed fetch.
const ROTATION_NORMALIZE_TOLERANCE: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Application,
    Render,
    Submission,
    Previous,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Application,
        Stage::Render,
        Stage::Submission,
        Stage::Previous,
    ];

    const fn index(self) -> usize {
        match self {
            Stage::Application => 0,
            Stage::Render => 1,
            Stage::Submission => 2,
            Stage::Previous => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldContextId(pub u64);

/// The game world a tick runs against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldContext {
    pub id: WorldContextId,
    /// World units per meter; zero or invalid falls back to the configured default.
    pub world_to_meters: f32,
    pub is_game_world: bool,
}

impl WorldContext {
    pub fn game(id: u64, world_to_meters: f32) -> Self {
        Self {
            id: WorldContextId(id),
            world_to_meters,
            is_game_world: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameStateRecord {
    pub frame_number: u64,
    pub raw_pose: Pose,
    /// The pose was fetched from the device this tick.
    pub has_head_tracking_position: bool,
    pub consecutive_pose_failures: u32,
    pub tracking_permitted: bool,
    /// `None` when the tracker state could not be read this tick.
    pub head_tracking_state: Option<HeadTrackingState>,
    pub map_events: Option<MapEvents>,
    pub horizontal_fov: f32,
    pub vertical_fov: f32,
    pub world_to_meters_scale: f32,
    pub near_clip: f32,
    pub focus_distance: f32,
    pub stabilization_depth: f32,
    pub far_clip: f32,
    pub recommended_far_clip: f32,
    pub focus_target: Option<f32>,
    pub stabilization_target: Option<f32>,
    pub begin_frame_succeeded: bool,
    pub snapshot: Option<SnapshotHandle>,
    pub frame_info: Option<FrameInfoHandle>,
    pub world: Option<WorldContextId>,
}

impl FrameStateRecord {
    pub fn new(chain: ClipChain, fov: (f32, f32), world_to_meters: f32) -> Self {
        Self {
            frame_number: 0,
            raw_pose: Pose::IDENTITY,
            has_head_tracking_position: false,
            consecutive_pose_failures: 0,
            tracking_permitted: false,
            head_tracking_state: None,
            map_events: None,
            horizontal_fov: fov.0,
            vertical_fov: fov.1,
            world_to_meters_scale: world_to_meters,
            near_clip: chain.near,
            focus_distance: chain.focus,
            stabilization_depth: chain.stabilization,
            far_clip: chain.far,
            recommended_far_clip: chain.far,
            focus_target: None,
            stabilization_target: None,
            begin_frame_succeeded: false,
            snapshot: None,
            frame_info: None,
            world: None,
        }
    }

    pub fn clip_chain(&self) -> ClipChain {
        ClipChain {
            near: self.near_clip,
            focus: self.focus_distance,
            stabilization: self.stabilization_depth,
            far: self.far_clip,
        }
    }

    pub fn apply_clip_chain(&mut self, chain: ClipChain) {
        debug_assert!(chain.is_ordered(), "clip chain out of order: {chain:?}");
        self.near_clip = chain.near;
        self.focus_distance = chain.focus;
        self.stabilization_depth = chain.stabilization;
        self.far_clip = chain.far;
    }
}

impl Default for FrameStateRecord {
    fn default() -> Self {
        Self::new(
            ClipChain::default(),
            DEFAULT_FOV_DEGREES,
            DEFAULT_WORLD_TO_METERS,
        )
    }
}

/// Where the application record's pose came from this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseSource {
    Device,
    Previous,
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub pose: PoseSource,
    /// Clip extents were fetched and valid this tick.
    pub metadata_fresh: bool,
}

/// Inputs for one application-stage refresh.
#[derive(Debug, Clone, Copy)]
pub struct RefreshContext<'a> {
    pub frame_number: u64,
    pub world: &'a WorldContext,
    pub client: Option<ClientHandle>,
    pub tracking_permitted: bool,
    pub focus_target: Option<f32>,
    pub stabilization_target: Option<f32>,
    pub default_fov: (f32, f32),
    pub default_world_to_meters: f32,
    pub max_stale_pose_frames: u32,
}

#[derive(Debug, Error)]
enum PoseFailure {
    #[error("head tracking not permitted")]
    NotPermitted,
    #[error("perception snapshot unavailable: {0}")]
    Snapshot(XrError),
    #[error(transparent)]
    Query(#[from] XrError),
    #[error("degenerate head pose")]
    Degenerate,
}

/// One record per stage. Records only cross stages by value copy.
#[derive(Debug, Clone)]
pub struct FrameStateBuffer {
    records: [FrameStateRecord; 4],
}

impl FrameStateBuffer {
    pub fn new(initial: FrameStateRecord) -> Self {
        Self {
            records: [initial; 4],
        }
    }

    pub fn record(&self, stage: Stage) -> &FrameStateRecord {
        &self.records[stage.index()]
    }

    pub(crate) fn record_mut(&mut self, stage: Stage) -> &mut FrameStateRecord {
        &mut self.records[stage.index()]
    }

    pub fn handoff_to_render(&mut self) {
        self.records[Stage::Render.index()] = self.records[Stage::Application.index()];
    }

    pub fn handoff_to_submission(&mut self) {
        self.records[Stage::Submission.index()] = self.records[Stage::Render.index()];
    }

    /// Keep the completed frame as the fallback source for the next tick.
    pub fn snapshot_as_previous(&mut self, separate_submission_stage: bool) {
        let source = if separate_submission_stage {
            Stage::Submission
        } else {
            Stage::Render
        };
        self.records[Stage::Previous.index()] = self.records[source.index()];
    }

    /// Application stage only: re-fetch pose, capability gating and frame
    /// metadata into the application record.
    pub fn refresh_application_record<D>(
        &mut self,
        device: &D,
        ctx: &RefreshContext<'_>,
    ) -> RefreshOutcome
    where
        D: PerceptionApi + FrameApi + ?Sized,
    {
        let previous = self.records[Stage::Previous.index()];
        let record = &mut self.records[Stage::Application.index()];

        record.frame_number = ctx.frame_number;
        record.world = Some(ctx.world.id);
        record.world_to_meters_scale = world_scale(ctx.world, ctx.default_world_to_meters);
        record.tracking_permitted = ctx.tracking_permitted;
        record.focus_target = ctx.focus_target;
        record.stabilization_target = ctx.stabilization_target;
        record.begin_frame_succeeded = false;
        // Only valid between begin_frame and end_frame of one frame.
        record.frame_info = None;

        // Last negotiated chain; the render stage re-negotiates.
        record.apply_clip_chain(previous.clip_chain());
        record.recommended_far_clip = previous.recommended_far_clip;

        let pose = match fetch_pose(device, &mut record.snapshot, ctx.tracking_permitted) {
            Ok(pose) => {
                record.raw_pose = pose;
                record.has_head_tracking_position = true;
                record.consecutive_pose_failures = 0;
                PoseSource::Device
            }
            Err(failure) => {
                record.has_head_tracking_position = false;
                record.consecutive_pose_failures = record.consecutive_pose_failures.saturating_add(1);
                if matches!(failure, PoseFailure::NotPermitted) {
                    debug!(frame = ctx.frame_number, "{failure}; reusing previous pose");
                } else {
                    warn!(frame = ctx.frame_number, "pose fetch failed: {failure}; reusing previous pose");
                }
                if record.consecutive_pose_failures > ctx.max_stale_pose_frames {
                    record.raw_pose = Pose::IDENTITY;
                    PoseSource::Identity
                } else {
                    record.raw_pose = previous.raw_pose;
                    PoseSource::Previous
                }
            }
        };

        record.head_tracking_state = match device.head_tracking_state() {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(frame = ctx.frame_number, "head tracking state unavailable: {err}");
                None
            }
        };
        record.map_events = match device.head_tracking_map_events() {
            Ok(events) => Some(events),
            Err(err) => {
                error!(frame = ctx.frame_number, "head tracking map events unavailable: {err}");
                None
            }
        };

        let metadata_fresh = match ctx.client {
            Some(client) => match device.query_clip_extents(client) {
                Ok(extents) => match extents.combined_fov() {
                    Some((horizontal, vertical)) => {
                        record.horizontal_fov = horizontal;
                        record.vertical_fov = vertical;
                        true
                    }
                    None => {
                        warn!(frame = ctx.frame_number, "degenerate clip extents; using default field of view");
                        reset_fov(record, ctx.default_fov);
                        false
                    }
                },
                Err(err) => {
                    warn!(frame = ctx.frame_number, "query_clip_extents failed: {err}");
                    reset_fov(record, ctx.default_fov);
                    false
                }
            },
            None => {
                reset_fov(record, ctx.default_fov);
                false
            }
        };

        RefreshOutcome {
            pose,
            metadata_fresh,
        }
    }

    /// Forget tracker state once head tracking is torn down.
    pub fn clear_head_tracking(&mut self) {
        for record in &mut self.records {
            record.head_tracking_state = None;
            record.map_events = None;
        }
    }

    /// Release the application record's live snapshot, if any.
    pub fn release_snapshot<D: PerceptionApi + ?Sized>(&mut self, device: &D) {
        if let Some(snapshot) = self.records[Stage::Application.index()].snapshot.take() {
            if let Err(err) = device.release_snapshot(snapshot) {
                warn!("release_snapshot failed: {err}");
            }
        }
    }
}

fn world_scale(world: &WorldContext, default: f32) -> f32 {
    if world.world_to_meters.is_finite() && world.world_to_meters > 0.0 {
        world.world_to_meters
    } else {
        default
    }
}

fn reset_fov(record: &mut FrameStateRecord, fov: (f32, f32)) {
    record.horizontal_fov = fov.0;
    record.vertical_fov = fov.1;
}

// Snapshots are paired: the stale one is released before the next acquire,
// even when the fetch that follows fails.
fn fetch_pose<D>(
    device: &D,
    slot: &mut Option<SnapshotHandle>,
    tracking_permitted: bool,
) -> Result<Pose, PoseFailure>
where
    D: PerceptionApi + ?Sized,
{
    if let Some(stale) = slot.take() {
        if let Err(err) = device.release_snapshot(stale) {
            warn!("release_snapshot failed: {err}");
        }
    }
    let snapshot = device.acquire_snapshot().map_err(PoseFailure::Snapshot)?;
    *slot = Some(snapshot);

    if !tracking_permitted {
        return Err(PoseFailure::NotPermitted);
    }
    let pose = device.query_pose(snapshot, device.head_coordinate_frame())?;
    sanitize_pose(pose).ok_or(PoseFailure::Degenerate)
}

/// Reject NaN/inf and far-from-unit rotations; re-normalize near-unit ones.
pub fn sanitize_pose(pose: Pose) -> Option<Pose> {
    if !pose.is_finite() {
        return None;
    }
    let length = pose.orientation.length();
    if (length - 1.0).abs() > ROTATION_NORMALIZE_TOLERANCE {
        return None;
    }
    let orientation = if pose.orientation.is_normalized() {
        pose.orientation
    } else {
        pose.orientation.normalize()
    };
    Some(Pose::new(pose.position, orientation))
}
