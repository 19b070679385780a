#![forbid(unsafe_code)]

pub mod device;
pub mod types;

pub use device::{CapabilityApi, FrameApi, HmdDevice, PerceptionApi, SessionApi};
pub use types::{
    CapabilityDecision, CapabilityId, ClientHandle, ClipExtents, CoordinateFrameId,
    FrameInfoHandle, FrameTimingHint, HeadTrackingError, HeadTrackingMode, HeadTrackingState,
    MapEvents, Pose, RenderTargetLimits, RequestHandle, RequestPoll, SessionOptions,
    SnapshotHandle, SurfaceFormat, ViewExtent,
};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum XrError {
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("{call} failed: {reason}")]
    Call { call: &'static str, reason: String },
    #[error("no pose for coordinate frame {0:?}")]
    PoseNotFound(CoordinateFrameId),
    #[error("degenerate result from {0}")]
    Degenerate(&'static str),
}

impl XrError {
    pub fn call(call: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Call {
            call,
            reason: reason.to_string(),
        }
    }
}

pub type XrResult<T> = Result<T, XrError>;
