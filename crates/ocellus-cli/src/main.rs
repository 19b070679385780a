//! Ocellus CLI: run the HMD stage pipeline against the mock device.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glam::{Quat, Vec3};
use ocellus_hmd::mock::{MockDevice, RecordingBackend};
use ocellus_hmd::{
    FrameStateRecord, HmdConfig, HmdEvent, PermissionState, SessionState, Stage, StageScheduler,
    StatsSnapshot, WorldContext,
};
use ocellus_xr::{CapabilityId, Pose};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ocellus")]
#[command(about = "Ocellus HMD stage pipeline tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive frames through all three stages against the mock device
    Run {
        /// Number of frames to run
        #[arg(short, long, default_value_t = 120)]
        frames: u64,

        /// JSON config file (defaults apply when omitted)
        #[arg(short, long, env = "OCELLUS_CONFIG")]
        config: Option<PathBuf>,

        /// Capability required before head tracking is used (repeatable)
        #[arg(long = "require")]
        require: Vec<String>,

        /// Capability the device denies (repeatable)
        #[arg(long = "deny")]
        deny: Vec<String>,

        /// Polls answered "pending" before an async capability request resolves
        #[arg(long, default_value_t = 2)]
        pending_polls: u32,

        /// Report the device as unreachable
        #[arg(long)]
        unreachable: bool,

        /// Fail the session-creation call
        #[arg(long)]
        fail_session: bool,

        /// Inject a NaN head pose every N frames
        #[arg(long)]
        nan_pose_every: Option<u64>,

        /// Pause rendering at this frame and resume ten frames later
        #[arg(long)]
        pause_at: Option<u64>,

        /// Print the final per-stage frame records as JSON
        #[arg(long)]
        dump: bool,
    },

    /// Print the default configuration as JSON
    Config,

    /// Show version information
    Version,
}

#[derive(Serialize)]
struct RunSummary {
    session: SessionState,
    render_target_size: (u32, u32),
    submitted_frames: usize,
    observer_samples: u64,
    capabilities: Vec<(CapabilityId, PermissionState)>,
    stats: StatsSnapshot,
}

#[derive(Serialize)]
struct StageDump {
    stage: Stage,
    record: FrameStateRecord,
}

const PAUSE_FRAMES: u64 = 10;

/// Last capability state the observer saw, per capability.
#[derive(Debug, Default)]
struct CapabilityWatch {
    last: HashMap<CapabilityId, PermissionState>,
}

impl CapabilityWatch {
    fn changed(&mut self, capability: &CapabilityId, state: PermissionState) -> bool {
        self.last.insert(capability.clone(), state) != Some(state)
    }
}

fn main() -> Result<()> {
    ocellus_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Run {
            frames,
            config,
            require,
            deny,
            pending_polls,
            unreachable,
            fail_session,
            nan_pose_every,
            pause_at,
            dump,
        } => {
            let mut config = match config {
                Some(path) => HmdConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => HmdConfig::default(),
            };
            config
                .required_capabilities
                .extend(require.iter().map(|name| CapabilityId::from(name.as_str())));
            config.validate()?;

            let device = Arc::new(MockDevice::new());
            device.with_state(|state| {
                state.reachable = !unreachable;
                state.fail_session_create = fail_session;
                state.polls_until_resolved = pending_polls;
                for name in &deny {
                    state.deny(name);
                }
            });

            run(device, config, frames, nan_pose_every, pause_at, dump)?;
        }
        Command::Config => {
            println!(
                "{}",
                ocellus_common::config::to_pretty_json(&HmdConfig::default())?
            );
        }
        Command::Version => {
            println!("ocellus {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn run(
    device: Arc<MockDevice>,
    config: HmdConfig,
    frames: u64,
    nan_pose_every: Option<u64>,
    pause_at: Option<u64>,
    dump: bool,
) -> Result<()> {
    let required = config.required_capabilities.clone();
    let mut scheduler = StageScheduler::new(device.clone(), config);
    scheduler.events_mut().add(Arc::new(|event: &HmdEvent| {
        info!(?event, "hmd event");
    }));
    scheduler.startup();

    // Reads the shared session and capability state while the stages run.
    let stop = Arc::new(AtomicBool::new(false));
    let samples = Arc::new(AtomicU64::new(0));
    let observer = {
        let stop = stop.clone();
        let samples = samples.clone();
        let session = scheduler.session();
        let permissions = scheduler.permissions();
        let required = required.clone();
        thread::Builder::new()
            .name("ocellus-observer".into())
            .spawn(move || {
                let mut last = None;
                let mut capabilities = CapabilityWatch::default();
                while !stop.load(Ordering::Acquire) {
                    let state = session.state();
                    if last != Some(state) {
                        info!(?state, "observer: session state");
                        last = Some(state);
                    }
                    for capability in &required {
                        let state = permissions.state(capability);
                        if capabilities.changed(capability, state) {
                            info!(%capability, ?state, "observer: capability state");
                        }
                    }
                    samples.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .context("spawning observer thread")?
    };

    let world = WorldContext::game(1, 100.0);
    let mut backend = RecordingBackend::default();
    for frame in 1..=frames {
        if nan_pose_every.is_some_and(|every| every > 0 && frame % every == 0) {
            device.with_state(|state| {
                state
                    .pose_script
                    .push_back(Ok(Pose::new(Vec3::splat(f32::NAN), Quat::IDENTITY)))
            });
        }
        if pause_at == Some(frame) {
            scheduler.pause();
        }
        if pause_at.is_some_and(|at| frame == at + PAUSE_FRAMES) {
            scheduler.resume();
        }
        scheduler.run_frame(Some(&world), &mut backend);
    }

    let summary = RunSummary {
        session: scheduler.session_state(),
        render_target_size: scheduler.render_target_size(),
        submitted_frames: backend.submitted.len(),
        observer_samples: 0,
        capabilities: required
            .iter()
            .map(|id| (id.clone(), scheduler.capability_state(id)))
            .collect(),
        stats: scheduler.stats().snapshot(),
    };
    let records: Vec<StageDump> = Stage::ALL
        .iter()
        .map(|&stage| StageDump {
            stage,
            record: *scheduler.frame_state(stage),
        })
        .collect();

    scheduler.shutdown();
    stop.store(true, Ordering::Release);
    if observer.join().is_err() {
        anyhow::bail!("observer thread panicked");
    }

    let summary = RunSummary {
        observer_samples: samples.load(Ordering::Relaxed),
        ..summary
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if dump {
        println!("{}", serde_json::to_string_pretty(&records)?);
    }
    Ok(())
}
