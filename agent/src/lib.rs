// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! rdcap capture agent
//!
//! The target-side half of rdcap. It lives inside the graphics
//! application, decides when to start and stop capturing relative to the
//! frame cadence, and serves the capture protocol to host tools:
//!
//! - [`trace_mgr`]: the frame-counting state machine driving captures
//! - [`capture`]: the binding to the injected helper library's capture
//!   primitives
//! - [`service`]: the capture protocol server
//! - [`facade`]: the higher-level RPC surface for host tooling
//! - [`layer`]: init-time glue for the in-process capture layer

pub mod capture;
pub mod facade;
pub mod layer;
pub mod service;
pub mod trace_mgr;

pub use capture::CapturePrimitives;
pub use service::{CaptureService, ServiceConfig};
pub use trace_mgr::{TraceConfig, TraceManager, TraceState};

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Capture helper unavailable: {0}")]
    HelperUnavailable(String),

    #[error("Failed to bind capture helper: {0}")]
    HelperBinding(String),

    #[error("A capture is already in flight")]
    CaptureInFlight,

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Service is already running")]
    AlreadyRunning,

    #[error("Protocol error: {0}")]
    Protocol(#[from] rdcap_protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
