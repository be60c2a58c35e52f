// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture primitive backends
//!
//! The actual trace recording is done by a helper library injected next
//! to the graphics driver. It exports two C functions the trace manager
//! drives:
//!
//! - `SetCaptureState(int)`: 1 starts recording, 0 stops it
//! - `SetCaptureName(const char* stem, const char* frame_tag)`:
//!   configures where the next capture will be written
//!
//! The binding is resolved once at startup and cached behind the
//! [`CapturePrimitives`] trait. When the helper cannot be loaded the
//! trait is backed by a no-op that reports "unavailable", so a trigger
//! fails loudly instead of producing an empty capture.

#[cfg(unix)]
use std::ffi::CString;
#[cfg(unix)]
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

#[cfg(unix)]
use libloading::Library;
use log::{debug, warn};

use crate::{AgentError, Result};

/// Default location of the injected helper library on the device.
pub const HELPER_LIBRARY_PATH: &str = "/data/local/tmp/libwrap.so";

/// The capture primitives exposed by the injected helper.
///
/// Implementations must be callable from the rendering thread and from
/// the service thread; the trace manager serializes calls under its
/// state lock.
pub trait CapturePrimitives: Send + Sync {
    /// Whether a real backend is bound. A trigger against an
    /// unavailable backend fails instead of silently no-oping.
    fn is_available(&self) -> bool {
        true
    }

    /// Start (`true`) or stop (`false`) recording.
    fn set_state(&self, enabled: bool) -> Result<()>;

    /// Configure the output location for the next capture. `stem` is
    /// the path prefix and `frame_tag` the decimal frame ordinal; the
    /// helper derives `<stem>-<nnnn>.rd` from them.
    fn set_name(&self, stem: &str, frame_tag: &str) -> Result<()>;
}

#[cfg(unix)]
type SetCaptureStateFn = unsafe extern "C" fn(c_int);
#[cfg(unix)]
type SetCaptureNameFn = unsafe extern "C" fn(*const c_char, *const c_char);

/// Binding to the real helper library, resolved with `dlopen`/`dlsym`
/// semantics once at load time.
#[cfg(unix)]
pub struct HelperCapture {
    set_capture_state: libloading::os::unix::Symbol<SetCaptureStateFn>,
    set_capture_name: libloading::os::unix::Symbol<SetCaptureNameFn>,
    // Keeps the mapping alive for the cached symbols above.
    _library: Library,
}

#[cfg(unix)]
impl HelperCapture {
    /// Load the helper library and resolve both exports.
    pub fn load(path: &str) -> Result<Self> {
        unsafe {
            let library =
                Library::new(path).map_err(|e| AgentError::HelperBinding(e.to_string()))?;
            let set_capture_state = library
                .get::<SetCaptureStateFn>(b"SetCaptureState\0")
                .map_err(|e| AgentError::HelperBinding(e.to_string()))?
                .into_raw();
            let set_capture_name = library
                .get::<SetCaptureNameFn>(b"SetCaptureName\0")
                .map_err(|e| AgentError::HelperBinding(e.to_string()))?
                .into_raw();
            log::info!("capture helper bound from {}", path);
            Ok(Self {
                set_capture_state,
                set_capture_name,
                _library: library,
            })
        }
    }
}

#[cfg(unix)]
impl CapturePrimitives for HelperCapture {
    fn set_state(&self, enabled: bool) -> Result<()> {
        unsafe { (self.set_capture_state)(if enabled { 1 } else { 0 }) };
        Ok(())
    }

    fn set_name(&self, stem: &str, frame_tag: &str) -> Result<()> {
        let stem = CString::new(stem).map_err(|e| AgentError::CaptureFailed(e.to_string()))?;
        let tag = CString::new(frame_tag).map_err(|e| AgentError::CaptureFailed(e.to_string()))?;
        unsafe { (self.set_capture_name)(stem.as_ptr(), tag.as_ptr()) };
        Ok(())
    }
}

/// Fallback backend used when the helper library is absent. Every call
/// reports the unavailability so the state machine never advances past
/// `Triggered` on a phantom capture.
pub struct UnavailableCapture {
    reason: String,
}

impl UnavailableCapture {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl CapturePrimitives for UnavailableCapture {
    fn is_available(&self) -> bool {
        false
    }

    fn set_state(&self, enabled: bool) -> Result<()> {
        warn!(
            "SetCaptureState({}) skipped, helper unavailable: {}",
            enabled as i32, self.reason
        );
        Err(AgentError::HelperUnavailable(self.reason.clone()))
    }

    fn set_name(&self, _stem: &str, _frame_tag: &str) -> Result<()> {
        warn!("SetCaptureName skipped, helper unavailable: {}", self.reason);
        Err(AgentError::HelperUnavailable(self.reason.clone()))
    }
}

/// Bind the capture primitives, preferring the real helper and falling
/// back to [`UnavailableCapture`]. The binding happens once; call sites
/// share the returned handle.
pub fn bind_primitives(helper_path: &str) -> Arc<dyn CapturePrimitives> {
    #[cfg(unix)]
    match HelperCapture::load(helper_path) {
        Ok(helper) => return Arc::new(helper),
        Err(e) => warn!("capture helper not loaded: {}", e),
    }
    #[cfg(not(unix))]
    warn!("capture helper not supported on this platform");
    Arc::new(UnavailableCapture::new(format!(
        "helper library {} not loaded",
        helper_path
    )))
}

/// Stand-in backend for development hosts without the injected helper.
///
/// It mimics the helper's observable behavior: on stop it writes a
/// placeholder artifact at the path derived from the configured stem
/// and frame tag.
pub mod stub {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct StubInner {
        stem: Option<String>,
        frame_tag: Option<String>,
        recording: bool,
        files_written: Vec<PathBuf>,
    }

    /// Simulated capture backend.
    #[derive(Default)]
    pub struct StubCapture {
        inner: Mutex<StubInner>,
    }

    impl StubCapture {
        pub fn new() -> Self {
            Self::default()
        }

        /// Paths of the placeholder artifacts written so far.
        pub fn files_written(&self) -> Vec<PathBuf> {
            self.inner.lock().unwrap().files_written.clone()
        }

        fn derived_path(stem: &str, frame_tag: &str) -> PathBuf {
            let ordinal: u32 = frame_tag.parse().unwrap_or(0);
            PathBuf::from(format!("{}-{:04}.rd", stem, ordinal))
        }
    }

    impl CapturePrimitives for StubCapture {
        fn set_state(&self, enabled: bool) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if enabled {
                inner.recording = true;
                debug!("stub capture started");
                return Ok(());
            }
            if !inner.recording {
                return Ok(());
            }
            inner.recording = false;
            let (stem, tag) = match (&inner.stem, &inner.frame_tag) {
                (Some(s), Some(t)) => (s.clone(), t.clone()),
                _ => {
                    warn!("stub capture stopped with no configured name");
                    return Ok(());
                }
            };
            let path = Self::derived_path(&stem, &tag);
            let content: Vec<u8> = (0..256u32).map(|i| (i % 256) as u8).collect();
            std::fs::write(&path, content).map_err(AgentError::Io)?;
            debug!("stub capture wrote {}", path.display());
            inner.files_written.push(path);
            Ok(())
        }

        fn set_name(&self, stem: &str, frame_tag: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.stem = Some(stem.to_string());
            inner.frame_tag = Some(frame_tag.to_string());
            Ok(())
        }
    }
}
