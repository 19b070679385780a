use std::fmt;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Head transform in tracking space, in world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        orientation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.orientation.is_finite()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameInfoHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestHandle(pub u64);

/// Device coordinate frame a pose is queried against (e.g. the head frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CoordinateFrameId(pub u64);

/// Named permission the device may grant or deny.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(String);

impl CapabilityId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CapabilityId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityDecision {
    Granted,
    Denied,
}

/// Result of polling an outstanding async capability request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPoll {
    Granted,
    Denied,
    Pending,
    Error,
}

/// Device-reported render limits. Clip distances are in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderTargetLimits {
    pub min_clip: f32,
    pub max_clip: f32,
    pub target_size: (u32, u32),
}

/// Field of view of one virtual camera, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewExtent {
    pub horizontal_fov: f32,
    pub vertical_fov: f32,
}

/// Per-view clip extents for the two eyes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipExtents {
    pub views: [ViewExtent; 2],
}

impl ClipExtents {
    /// Combined field of view covering both views, or `None` if any value is
    /// non-finite or non-positive.
    pub fn combined_fov(&self) -> Option<(f32, f32)> {
        let mut horizontal = 0.0f32;
        let mut vertical = 0.0f32;
        for view in &self.views {
            let valid = |v: f32| v.is_finite() && v > 0.0;
            if !valid(view.horizontal_fov) || !valid(view.vertical_fov) {
                return None;
            }
            horizontal = horizontal.max(view.horizontal_fov);
            vertical = vertical.max(view.vertical_fov);
        }
        Some((horizontal, vertical))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadTrackingMode {
    PositionAndOrientation,
    Unavailable,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadTrackingError {
    None,
    NotEnoughFeatures,
    LowLight,
    Unknown,
}

/// Head tracker status reported alongside each perception snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadTrackingState {
    pub mode: HeadTrackingMode,
    pub error: HeadTrackingError,
    /// Tracker confidence in `[0, 1]`.
    pub confidence: f32,
}

impl Default for HeadTrackingState {
    fn default() -> Self {
        Self {
            mode: HeadTrackingMode::Unknown,
            error: HeadTrackingError::None,
            confidence: 0.0,
        }
    }
}

bitflags::bitflags! {
    /// Tracking-map events raised by the device since the previous query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MapEvents: u8 {
        const LOST = 1 << 0;
        const RECOVERED = 1 << 1;
        const RECOVERY_FAILED = 1 << 2;
        const NEW_SESSION = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    D24UnormS8,
    D32Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameTimingHint {
    #[default]
    Unspecified,
    Maximum,
    #[serde(rename = "60hz")]
    Hz60,
    #[serde(rename = "120hz")]
    Hz120,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub color_format: SurfaceFormat,
    pub depth_format: SurfaceFormat,
    pub debug: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            color_format: SurfaceFormat::Rgba8UnormSrgb,
            depth_format: SurfaceFormat::D32Float,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extents(h: f32, v: f32) -> ClipExtents {
        ClipExtents {
            views: [
                ViewExtent {
                    horizontal_fov: h,
                    vertical_fov: v,
                },
                ViewExtent {
                    horizontal_fov: h - 2.0,
                    vertical_fov: v,
                },
            ],
        }
    }

    #[test]
    fn test_combined_fov_takes_widest_view() {
        assert_eq!(extents(50.0, 40.0).combined_fov(), Some((50.0, 40.0)));
    }

    #[test]
    fn test_combined_fov_rejects_nan() {
        assert_eq!(extents(f32::NAN, 40.0).combined_fov(), None);
        assert_eq!(extents(50.0, 0.0).combined_fov(), None);
    }

    #[test]
    fn test_pose_finite() {
        assert!(Pose::IDENTITY.is_finite());
        let pose = Pose::new(Vec3::new(f32::NAN, 0.0, 0.0), Quat::IDENTITY);
        assert!(!pose.is_finite());
    }

    #[test]
    fn test_map_events_flags() {
        let events = MapEvents::LOST | MapEvents::NEW_SESSION;
        assert!(events.contains(MapEvents::LOST));
        assert!(!events.contains(MapEvents::RECOVERED));
        let names: Vec<_> = events.iter_names().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["LOST", "NEW_SESSION"]);
        assert!(MapEvents::default().is_empty());
    }

    #[test]
    fn test_timing_hint_serde_names() {
        let raw = serde_json::to_string(&FrameTimingHint::Hz120).unwrap();
        assert_eq!(raw, "\"120hz\"");
    }
}
