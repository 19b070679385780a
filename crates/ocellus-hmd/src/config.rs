use std::path::Path;

use ocellus_common::{config::load_json, Error, Result};
use ocellus_xr::{CapabilityId, FrameTimingHint, SessionOptions};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NEAR_CLIP: f32 = 10.0;
pub const DEFAULT_WORLD_TO_METERS: f32 = 100.0;
pub const DEFAULT_FOV_DEGREES: (f32, f32) = (90.0, 90.0);
pub const DEFAULT_MAX_STALE_POSE_FRAMES: u32 = 90;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmdConfig {
    /// Engine-requested near plane, in world units.
    pub engine_near_clip: f32,
    /// Engine-requested far plane; `None` leaves far bounded by the device only.
    pub engine_far_clip: Option<f32>,
    pub default_world_to_meters: f32,
    /// Horizontal and vertical field of view used when the device reports none.
    pub default_fov: (f32, f32),
    /// Capabilities that must be granted before head tracking is used.
    pub required_capabilities: Vec<CapabilityId>,
    pub block_on_capabilities: bool,
    pub max_stale_pose_frames: u32,
    pub separate_submission_stage: bool,
    pub frame_timing_hint: FrameTimingHint,
    pub session: SessionOptions,
}

impl Default for HmdConfig {
    fn default() -> Self {
        Self {
            engine_near_clip: DEFAULT_NEAR_CLIP,
            engine_far_clip: None,
            default_world_to_meters: DEFAULT_WORLD_TO_METERS,
            default_fov: DEFAULT_FOV_DEGREES,
            required_capabilities: Vec::new(),
            block_on_capabilities: false,
            max_stale_pose_frames: DEFAULT_MAX_STALE_POSE_FRAMES,
            separate_submission_stage: true,
            frame_timing_hint: FrameTimingHint::Unspecified,
            session: SessionOptions::default(),
        }
    }
}

impl HmdConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.engine_near_clip.is_finite() && self.engine_near_clip > 0.0) {
            return Err(Error::config(format!(
                "engine_near_clip must be positive, got {}",
                self.engine_near_clip
            )));
        }
        if let Some(far) = self.engine_far_clip {
            if !far.is_finite() || far < self.engine_near_clip {
                return Err(Error::config(format!(
                    "engine_far_clip {far} is below engine_near_clip {}",
                    self.engine_near_clip
                )));
            }
        }
        if !(self.default_world_to_meters.is_finite() && self.default_world_to_meters > 0.0) {
            return Err(Error::config(format!(
                "default_world_to_meters must be positive, got {}",
                self.default_world_to_meters
            )));
        }
        let (h, v) = self.default_fov;
        if !(h.is_finite() && h > 0.0 && v.is_finite() && v > 0.0) {
            return Err(Error::config(format!("invalid default_fov ({h}, {v})")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(HmdConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: HmdConfig = ocellus_common::config::parse_json(
            r#"{ "engine_near_clip": 20.0, "required_capabilities": ["camera"] }"#,
        )
        .unwrap();
        assert_eq!(config.engine_near_clip, 20.0);
        assert_eq!(config.required_capabilities, vec![CapabilityId::from("camera")]);
        assert_eq!(config.max_stale_pose_frames, DEFAULT_MAX_STALE_POSE_FRAMES);
        assert!(config.separate_submission_stage);
    }

    #[test]
    fn test_rejects_far_below_near() {
        let config = HmdConfig {
            engine_far_clip: Some(5.0),
            ..HmdConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_scale() {
        let config = HmdConfig {
            default_world_to_meters: 0.0,
            ..HmdConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
