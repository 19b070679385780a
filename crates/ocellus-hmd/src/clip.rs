use serde::Serialize;
use tracing::debug;

use crate::config::DEFAULT_NEAR_CLIP;

/// Far plane used when neither the device nor the engine bounds it.
pub const FALLBACK_FAR_CLIP: f32 = 100_000.0;

/// Ordered clip distances, in world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClipChain {
    pub near: f32,
    pub focus: f32,
    pub stabilization: f32,
    pub far: f32,
}

impl ClipChain {
    /// Chain with focus and stabilization pushed out to `far`.
    pub fn uniform(near: f32, far: f32) -> Self {
        Self {
            near,
            focus: far,
            stabilization: far,
            far,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.near <= self.focus && self.focus <= self.stabilization && self.stabilization <= self.far
    }
}

impl Default for ClipChain {
    fn default() -> Self {
        Self::uniform(DEFAULT_NEAR_CLIP, FALLBACK_FAR_CLIP)
    }
}

/// Device clip limits in meters, as reported once the session is ready.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceClipLimits {
    pub min_clip: f32,
    pub max_clip: f32,
}

/// Reconciles engine-requested planes, device limits and the focus and
/// stabilization targets into one ordered [`ClipChain`].
#[derive(Debug, Clone)]
pub struct ClipRangeNegotiator {
    requested_near: f32,
    requested_far: Option<f32>,
    device_limits: Option<DeviceClipLimits>,
}

impl ClipRangeNegotiator {
    pub fn new(requested_near: f32, requested_far: Option<f32>) -> Self {
        Self {
            requested_near: finite_or(requested_near, DEFAULT_NEAR_CLIP),
            requested_far: requested_far.filter(|far| far.is_finite()),
            device_limits: None,
        }
    }

    /// Engine-requested planes. The far plane becomes the ceiling for every
    /// later negotiation; `None` removes it.
    pub fn set_clipping_planes(&mut self, near: f32, far: Option<f32>) {
        self.requested_near = finite_or(near, self.requested_near);
        self.requested_far = far.filter(|far| far.is_finite());
        debug!(
            near = self.requested_near,
            far = ?self.requested_far,
            "clipping planes requested"
        );
    }

    pub fn set_device_limits(&mut self, min_clip: f32, max_clip: f32) {
        self.device_limits = Some(DeviceClipLimits { min_clip, max_clip });
    }

    pub fn clear_device_limits(&mut self) {
        self.device_limits = None;
    }

    pub fn device_limits(&self) -> Option<DeviceClipLimits> {
        self.device_limits
    }

    pub fn requested_near(&self) -> f32 {
        self.requested_near
    }

    pub fn requested_far(&self) -> Option<f32> {
        self.requested_far
    }

    /// Device far limit scaled to world units, or the engine ceiling when no
    /// device limits are known yet.
    pub fn recommended_far(&self, world_scale: f32) -> f32 {
        match self.device_limits {
            Some(limits) => finite_or(limits.max_clip * world_scale, FALLBACK_FAR_CLIP),
            None => self.requested_far.unwrap_or(FALLBACK_FAR_CLIP),
        }
    }

    pub fn negotiate(
        &self,
        device_min_clip: f32,
        device_max_clip: f32,
        world_scale: f32,
        focus_distance: Option<f32>,
        stabilization_distance: Option<f32>,
    ) -> ClipChain {
        let ceiling = self.requested_far.unwrap_or(f32::INFINITY);
        let mut far = (device_max_clip * world_scale).min(ceiling);
        if !far.is_finite() {
            far = self.requested_far.unwrap_or(FALLBACK_FAR_CLIP);
        }

        let device_near = device_min_clip * world_scale;
        let near = if device_near.is_finite() {
            self.requested_near.max(device_near)
        } else {
            self.requested_near
        };
        if far < near {
            far = near;
        }

        self.order_targets(near, far, focus_distance, stabilization_distance)
    }

    /// Negotiate against the recorded device limits, or the engine planes
    /// alone before the session is ready.
    pub fn negotiate_current(
        &self,
        world_scale: f32,
        focus_distance: Option<f32>,
        stabilization_distance: Option<f32>,
    ) -> ClipChain {
        match self.device_limits {
            Some(limits) => self.negotiate(
                limits.min_clip,
                limits.max_clip,
                world_scale,
                focus_distance,
                stabilization_distance,
            ),
            None => {
                let near = self.requested_near;
                let far = self.requested_far.unwrap_or(FALLBACK_FAR_CLIP).max(near);
                self.order_targets(near, far, focus_distance, stabilization_distance)
            }
        }
    }

    // Clamp order matters: focus first, then stabilization against focus.
    fn order_targets(
        &self,
        near: f32,
        far: f32,
        focus_distance: Option<f32>,
        stabilization_distance: Option<f32>,
    ) -> ClipChain {
        let focus_target = focus_distance.filter(|d| d.is_finite());
        let stabilization_target = stabilization_distance.filter(|d| d.is_finite());

        let focus = focus_target
            .or(stabilization_target)
            .map_or(far, |d| d.clamp(near, far));
        let stabilization = stabilization_target
            .or(focus_target)
            .map_or(far, |d| d.clamp(focus, far));

        let chain = ClipChain {
            near,
            focus,
            stabilization,
            far,
        };
        debug_assert!(chain.is_ordered(), "clip chain out of order: {chain:?}");
        chain
    }
}

impl Default for ClipRangeNegotiator {
    fn default() -> Self {
        Self::new(DEFAULT_NEAR_CLIP, None)
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_limits_without_targets() {
        let negotiator = ClipRangeNegotiator::default();
        let chain = negotiator.negotiate(10.0, 1000.0, 100.0, None, None);
        assert_eq!(chain.near, 1000.0);
        assert_eq!(chain.far, 100_000.0);
        assert_eq!(chain.focus, chain.far);
        assert_eq!(chain.stabilization, chain.far);
    }

    #[test]
    fn test_engine_near_wins_when_larger() {
        let negotiator = ClipRangeNegotiator::new(2000.0, None);
        let chain = negotiator.negotiate(10.0, 1000.0, 100.0, None, None);
        assert_eq!(chain.near, 2000.0);
    }

    #[test]
    fn test_stabilization_clamped_to_focus() {
        let negotiator = ClipRangeNegotiator::default();
        let chain = negotiator.negotiate(0.05, 10.0, 100.0, Some(50.0), Some(5.0));
        assert_eq!(chain.near, 10.0);
        assert_eq!(chain.far, 1000.0);
        assert_eq!(chain.focus, 50.0);
        assert_eq!(chain.stabilization, 50.0);
    }

    #[test]
    fn test_engine_far_is_ceiling() {
        let negotiator = ClipRangeNegotiator::new(10.0, Some(5000.0));
        let chain = negotiator.negotiate(0.05, 1000.0, 100.0, None, None);
        assert_eq!(chain.far, 5000.0);
    }

    #[test]
    fn test_missing_target_falls_back_to_other() {
        let negotiator = ClipRangeNegotiator::default();
        let only_focus = negotiator.negotiate(0.05, 100.0, 100.0, Some(300.0), None);
        assert_eq!(only_focus.stabilization, 300.0);
        let only_stab = negotiator.negotiate(0.05, 100.0, 100.0, None, Some(400.0));
        assert_eq!(only_stab.focus, 400.0);
        assert_eq!(only_stab.stabilization, 400.0);
    }

    #[test]
    fn test_non_finite_targets_ignored() {
        let negotiator = ClipRangeNegotiator::default();
        let chain = negotiator.negotiate(0.05, 100.0, 100.0, Some(f32::NAN), Some(f32::INFINITY));
        assert_eq!(chain, ClipChain::uniform(10.0, 10_000.0));
    }

    #[test]
    fn test_device_min_above_ceiling_stays_ordered() {
        let negotiator = ClipRangeNegotiator::new(10.0, Some(50.0));
        let chain = negotiator.negotiate(1.0, 10.0, 100.0, Some(20.0), None);
        assert!(chain.is_ordered());
        assert_eq!(chain.near, 100.0);
        assert_eq!(chain.far, 100.0);
    }

    #[test]
    fn test_negotiate_current_without_device() {
        let mut negotiator = ClipRangeNegotiator::default();
        assert_eq!(
            negotiator.negotiate_current(100.0, None, None),
            ClipChain::uniform(10.0, FALLBACK_FAR_CLIP)
        );
        negotiator.set_clipping_planes(15.0, Some(800.0));
        let chain = negotiator.negotiate_current(100.0, Some(5.0), None);
        assert_eq!(chain.near, 15.0);
        assert_eq!(chain.focus, 15.0);
        assert_eq!(chain.far, 800.0);
        assert_eq!(negotiator.recommended_far(100.0), 800.0);

        negotiator.set_device_limits(0.5, 4.0);
        assert_eq!(negotiator.recommended_far(100.0), 400.0);
        let chain = negotiator.negotiate_current(100.0, None, None);
        assert_eq!(chain.near, 50.0);
        assert_eq!(chain.far, 400.0);
    }

    #[test]
    fn test_chain_always_ordered_over_sweep() {
        let planes = [(1.0, None), (10.0, Some(500.0)), (250.0, Some(300.0))];
        let limits = [(0.0, 0.5), (0.1, 10.0), (0.37, 1000.0), (5.0, 2.0)];
        let scales = [0.5, 1.0, 100.0];
        let targets = [
            None,
            Some(-10.0),
            Some(0.0),
            Some(12.5),
            Some(333.0),
            Some(1.0e9),
            Some(f32::NAN),
        ];
        for (near, far) in planes {
            let negotiator = ClipRangeNegotiator::new(near, far);
            for (min_clip, max_clip) in limits {
                for scale in scales {
                    for focus in targets {
                        for stab in targets {
                            let chain = negotiator.negotiate(min_clip, max_clip, scale, focus, stab);
                            assert!(chain.is_ordered(), "{chain:?}");
                        }
                    }
                }
            }
        }
    }
}
