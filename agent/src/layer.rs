// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture layer glue
//!
//! Init-time wiring for the in-process capture layer: reads the trigger
//! configuration, binds the capture primitives, installs the
//! process-wide trace manager and brings up both servers.
//!
//! Initialization is an explicit call from the interceptor's entry
//! point, never a link-time constructor; load-order side effects are
//! exactly what this avoids.

use std::sync::Arc;

use log::{info, warn};

use crate::capture::{bind_primitives, HELPER_LIBRARY_PATH};
use crate::facade::{FacadeConfig, FacadeServer};
use crate::service::{CaptureService, ServiceConfig};
use crate::trace_mgr::{self, TraceConfig, TraceManager};
use crate::Result;

/// Environment override for the frame the next capture is named after,
/// set on the device before the target application launches. 0 (the
/// default) selects duration mode.
pub const TRIGGER_FRAME_ENV: &str = "RDCAP_TRIGGER_FRAME_NUM";

/// Read the configured trigger frame number, defaulting to 0.
pub fn trigger_frame_num_from_env() -> u32 {
    match std::env::var(TRIGGER_FRAME_ENV) {
        Ok(value) => match value.trim().parse() {
            Ok(n) => {
                info!("trigger frame configured as {}", n);
                n
            }
            Err(_) => {
                warn!("ignoring malformed {}={}", TRIGGER_FRAME_ENV, value);
                0
            }
        },
        Err(_) => 0,
    }
}

/// Whether the helper library is mapped into this process.
pub fn is_helper_loaded() -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        match std::fs::read_to_string("/proc/self/maps") {
            Ok(maps) => maps.lines().any(|line| line.contains("libwrap.so")),
            Err(_) => false,
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        false
    }
}

/// Running layer state: the trace manager plus both servers. Dropping
/// it shuts the servers down.
pub struct LayerRuntime {
    trace_mgr: Arc<TraceManager>,
    service: CaptureService,
    facade: FacadeServer,
}

impl LayerRuntime {
    /// Frame-presented hook for the interceptor.
    pub fn on_new_frame(&self) {
        self.trace_mgr.on_new_frame();
    }

    pub fn trace_mgr(&self) -> &Arc<TraceManager> {
        &self.trace_mgr
    }

    pub fn shutdown(&mut self) {
        self.service.stop();
        self.facade.stop();
    }
}

/// Bring the capture layer up with default endpoints. Called once from
/// the interceptor's init path.
pub fn init_layer() -> Result<LayerRuntime> {
    init_layer_with(TraceConfig {
        trigger_frame_num: trigger_frame_num_from_env(),
        ..Default::default()
    })
}

/// Bring the capture layer up with an explicit trace configuration.
pub fn init_layer_with(trace_config: TraceConfig) -> Result<LayerRuntime> {
    if !is_helper_loaded() {
        warn!("helper library not mapped; captures will fail until it is");
    }
    let primitives = bind_primitives(HELPER_LIBRARY_PATH);
    let trace_mgr = Arc::new(TraceManager::new(trace_config, primitives));
    if !trace_mgr::set_global(trace_mgr.clone()) {
        warn!("trace manager already installed, reusing existing servers");
    }

    let mut service = CaptureService::new(ServiceConfig::default(), trace_mgr.clone());
    service.start()?;
    let mut facade = FacadeServer::new(FacadeConfig::default(), trace_mgr.clone());
    facade.start()?;

    info!("capture layer initialized");
    Ok(LayerRuntime {
        trace_mgr,
        service,
        facade,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_frame_env_parsing() {
        std::env::remove_var(TRIGGER_FRAME_ENV);
        assert_eq!(trigger_frame_num_from_env(), 0);

        std::env::set_var(TRIGGER_FRAME_ENV, "120");
        assert_eq!(trigger_frame_num_from_env(), 120);

        std::env::set_var(TRIGGER_FRAME_ENV, "not-a-number");
        assert_eq!(trigger_frame_num_from_env(), 0);

        std::env::remove_var(TRIGGER_FRAME_ENV);
    }
}
