// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Trace manager
//!
//! The frame-counting state machine that decides when a capture starts
//! and stops. It runs inside the target application: the rendering
//! pipeline reports every presented frame via
//! [`TraceManager::on_new_frame`], the capture service injects trigger
//! intent via [`TraceManager::trigger_trace`], and the injected helper
//! primitives do the actual recording.
//!
//! One state lock guards the state, the frame counters and the output
//! path; every decision and its transition happen under that lock, and
//! the capture primitive call is made inside the same critical section
//! so no observer can see the state and the recording disagree.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use rdcap_protocol::message::CAPTURE_DIR_ON_DEVICE;

use crate::capture::CapturePrimitives;
use crate::{AgentError, Result};

/// Capture lifecycle states.
///
/// ```text
/// Idle -> Triggered -> Tracing -> Finished -> (Triggered ...)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    /// No capture requested
    Idle,
    /// Host requested a capture; waiting for the next frame boundary
    Triggered,
    /// Recording is active
    Tracing,
    /// The capture completed; terminal until the next trigger
    Finished,
}

/// Trace manager configuration, fixed at init.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Directory trace artifacts are written into.
    pub trace_dir: PathBuf,
    /// Frame ordinal used to name frame-mode captures; 0 selects
    /// duration mode.
    pub trigger_frame_num: u32,
    /// Number of frames a frame-mode capture spans. Must be positive in
    /// frame mode.
    pub num_frames_to_trace: u32,
    /// Wall-clock length of a duration-mode capture.
    pub trace_duration: Duration,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            trace_dir: PathBuf::from(CAPTURE_DIR_ON_DEVICE),
            trigger_frame_num: 0,
            num_frames_to_trace: 1,
            trace_duration: Duration::from_millis(5000),
        }
    }
}

struct TraceInner {
    state: TraceState,
    frame_num: u32,
    trace_start_frame: u32,
    trace_num: u32,
    output_path: Option<PathBuf>,
    /// Whether the in-flight capture stops on a frame count. Duration
    /// and manual captures end on the timer or an explicit stop.
    frame_bounded: bool,
}

/// Process-wide coordinator for capture state.
pub struct TraceManager {
    config: TraceConfig,
    primitives: Arc<dyn CapturePrimitives>,
    inner: Mutex<TraceInner>,
    state_changed: Condvar,
}

impl TraceManager {
    pub fn new(config: TraceConfig, primitives: Arc<dyn CapturePrimitives>) -> Self {
        Self {
            config,
            primitives,
            inner: Mutex::new(TraceInner {
                state: TraceState::Idle,
                frame_num: 0,
                trace_start_frame: 0,
                trace_num: 0,
                output_path: None,
                frame_bounded: false,
            }),
            state_changed: Condvar::new(),
        }
    }

    /// Called by the rendering pipeline once per presented frame.
    ///
    /// Increments the frame counter and performs at most one state
    /// transition: a pending trigger starts recording, a frame-bounded
    /// capture that has run its span stops.
    pub fn on_new_frame(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.frame_num += 1;
        if inner.state == TraceState::Triggered {
            match self.primitives.set_state(true) {
                Ok(()) => {
                    inner.state = TraceState::Tracing;
                    inner.trace_start_frame = inner.frame_num;
                    self.state_changed.notify_all();
                    info!("capture started at frame {}", inner.frame_num);
                }
                Err(e) => warn!("capture start skipped: {}", e),
            }
        } else if inner.state == TraceState::Tracing
            && inner.frame_bounded
            && inner.frame_num - inner.trace_start_frame > self.config.num_frames_to_trace
        {
            if let Err(e) = self.primitives.set_state(false) {
                warn!("capture stop reported: {}", e);
            }
            inner.state = TraceState::Finished;
            self.state_changed.notify_all();
            info!("capture finished at frame {}", inner.frame_num);
        }
    }

    /// Host-requested trigger. Frame mode arms the state machine for
    /// the next frame boundary; duration mode starts recording
    /// immediately and schedules the stop on a timer thread.
    pub fn trigger_trace(self: &Arc<Self>) -> Result<()> {
        if !self.primitives.is_available() {
            warn!("trigger refused, capture helper unavailable");
            return Err(AgentError::HelperUnavailable(
                "capture helper not loaded".to_string(),
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, TraceState::Triggered | TraceState::Tracing) {
            return Err(AgentError::CaptureInFlight);
        }

        if self.config.trigger_frame_num > 0 {
            self.trace_by_frame(&mut inner)
        } else {
            self.trace_by_duration(&mut inner)
        }
    }

    fn trace_by_frame(&self, inner: &mut TraceInner) -> Result<()> {
        let ordinal = self.config.trigger_frame_num;
        let stem = self.config.trace_dir.join("trace-frame");
        let stem_str = stem.display().to_string();
        self.primitives.set_name(&stem_str, &ordinal.to_string())?;

        inner.output_path = Some(PathBuf::from(format!("{}-{:04}.rd", stem_str, ordinal)));
        inner.frame_bounded = true;
        inner.state = TraceState::Triggered;
        self.state_changed.notify_all();
        info!(
            "capture triggered, armed for frame boundary as trace-frame-{:04}.rd",
            ordinal
        );
        Ok(())
    }

    fn trace_by_duration(self: &Arc<Self>, inner: &mut TraceInner) -> Result<()> {
        inner.trace_num += 1;
        let ordinal = inner.trace_num;
        let stem = self.config.trace_dir.join("trace");
        let stem_str = stem.display().to_string();
        self.primitives.set_name(&stem_str, &ordinal.to_string())?;

        inner.output_path = Some(PathBuf::from(format!("{}-{:04}.rd", stem_str, ordinal)));
        inner.frame_bounded = false;
        inner.state = TraceState::Triggered;

        if let Err(e) = self.primitives.set_state(true) {
            warn!("capture start skipped: {}", e);
            return Err(AgentError::CaptureFailed(e.to_string()));
        }
        inner.state = TraceState::Tracing;
        self.state_changed.notify_all();
        info!(
            "duration capture {} started for {:?}",
            ordinal, self.config.trace_duration
        );

        let mgr = Arc::clone(self);
        let duration = self.config.trace_duration;
        thread::spawn(move || {
            thread::sleep(duration);
            mgr.finish_duration_capture();
        });
        Ok(())
    }

    fn finish_duration_capture(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != TraceState::Tracing {
            return;
        }
        if let Err(e) = self.primitives.set_state(false) {
            warn!("capture stop reported: {}", e);
        }
        inner.state = TraceState::Finished;
        self.state_changed.notify_all();
        info!("duration capture finished");
    }

    /// Manual capture start with an explicit output path.
    pub fn start_capture(&self, target_path: &str) -> Result<()> {
        if !self.primitives.is_available() {
            return Err(AgentError::HelperUnavailable(
                "capture helper not loaded".to_string(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, TraceState::Triggered | TraceState::Tracing) {
            return Err(AgentError::CaptureInFlight);
        }

        let (stem, tag) = split_capture_path(target_path);
        self.primitives.set_name(&stem, &tag)?;
        inner.output_path = Some(PathBuf::from(target_path));
        inner.frame_bounded = false;
        inner.state = TraceState::Triggered;

        if let Err(e) = self.primitives.set_state(true) {
            warn!("capture start skipped: {}", e);
            return Err(AgentError::CaptureFailed(e.to_string()));
        }
        inner.state = TraceState::Tracing;
        inner.trace_start_frame = inner.frame_num;
        self.state_changed.notify_all();
        info!("manual capture started into {}", target_path);
        Ok(())
    }

    /// Manual capture stop.
    pub fn stop_capture(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != TraceState::Tracing {
            warn!("stop requested with no active capture");
            return;
        }
        if let Err(e) = self.primitives.set_state(false) {
            warn!("capture stop reported: {}", e);
        }
        inner.state = TraceState::Finished;
        self.state_changed.notify_all();
        info!("manual capture stopped");
    }

    /// Block until the in-flight capture reaches `Finished`.
    pub fn wait_for_trace_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.state != TraceState::Finished {
            inner = self.state_changed.wait(inner).unwrap();
        }
    }

    /// Deadline-bounded wait; returns whether the capture finished.
    pub fn wait_for_trace_done_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.state != TraceState::Finished {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .state_changed
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
        true
    }

    /// Path of the current capture artifact, once a trigger has
    /// published one.
    pub fn trace_file_path(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().output_path.clone()
    }

    pub fn state(&self) -> TraceState {
        self.inner.lock().unwrap().state
    }

    pub fn frame_num(&self) -> u32 {
        self.inner.lock().unwrap().frame_num
    }
}

/// Derive the `(stem, frame_tag)` pair the helper expects from an
/// explicit capture path: `/x/manual-0007.rd` becomes `(/x/manual, 7)`,
/// a plain `/x/manual.rd` becomes `(/x/manual, 0)`.
fn split_capture_path(path: &str) -> (String, String) {
    let without_ext = path.strip_suffix(".rd").unwrap_or(path);
    if let Some((stem, ordinal)) = without_ext.rsplit_once('-') {
        if !ordinal.is_empty() && ordinal.chars().all(|c| c.is_ascii_digit()) {
            let ordinal = ordinal.trim_start_matches('0');
            let ordinal = if ordinal.is_empty() { "0" } else { ordinal };
            return (stem.to_string(), ordinal.to_string());
        }
    }
    (without_ext.to_string(), "0".to_string())
}

static GLOBAL_TRACE_MGR: OnceLock<Arc<TraceManager>> = OnceLock::new();

/// Install the process-wide trace manager. Frame callbacks arrive on
/// arbitrary driver threads with no user context, so the layer routes
/// them through this singleton. Returns `false` when one was already
/// installed.
pub fn set_global(mgr: Arc<TraceManager>) -> bool {
    GLOBAL_TRACE_MGR.set(mgr).is_ok()
}

/// The installed process-wide trace manager, if any.
pub fn global() -> Option<Arc<TraceManager>> {
    GLOBAL_TRACE_MGR.get().cloned()
}
