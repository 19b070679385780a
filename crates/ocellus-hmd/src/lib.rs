//! Ocellus HMD stage core.
//!
//! Three cooperating stages (application, render, submission) share head
//! tracking state through value-copied [`FrameStateRecord`]s. The device
//! session and capability records are the only state shared across stages.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocellus_hmd::{mock::MockDevice, HmdConfig, NullBackend, StageScheduler, WorldContext};
//!
//! let device = Arc::new(MockDevice::new());
//! let mut scheduler = StageScheduler::new(device, HmdConfig::default());
//! scheduler.startup();
//! let world = WorldContext::game(1, 100.0);
//! for _ in 0..3 {
//!     scheduler.run_frame(Some(&world), &mut NullBackend);
//! }
//! scheduler.shutdown();
//! ```

#![forbid(unsafe_code)]

pub mod backend;
pub mod clip;
pub mod config;
pub mod events;
pub mod frame;
pub mod mock;
pub mod permission;
pub mod scheduler;
pub mod session;
pub mod stats;

pub use backend::{NullBackend, RenderBackend};
pub use clip::{ClipChain, ClipRangeNegotiator, DeviceClipLimits};
pub use config::HmdConfig;
pub use events::{EventRegistry, HmdEvent, HmdEventListener, ListenerId};
pub use frame::{
    FrameStateBuffer, FrameStateRecord, PoseSource, RefreshContext, RefreshOutcome, Stage,
    WorldContext, WorldContextId,
};
pub use permission::{PendingRequest, PermissionGate, PermissionRecord, PermissionState};
pub use scheduler::StageScheduler;
pub use session::{
    DeviceSessionManager, InitOutcome, InitRequest, RenderSessionTasks, SessionLease, SessionState,
};
pub use stats::{SchedulerStats, StatsSnapshot};
