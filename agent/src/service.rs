// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture service
//!
//! The long-lived protocol server embedded in the target process. It
//! accepts one host connection at a time, dispatches capture messages
//! until the client disconnects, and forwards trigger intent to the
//! trace manager.
//!
//! Any framing or I/O error drops the current session and returns the
//! service to the accept loop; the next client starts the exchange from
//! the beginning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use rdcap_protocol::message::{
    CaptureConfigDone, CaptureConfigMessage, CaptureConfigStatus, GetCaptureFileRequest,
    GetCaptureFileResponse, HandShake, IcdVersion, LayerCapabilities, MessageType, StartCapture,
    TriggerCaptureDone, DEFAULT_HOST, DEFAULT_PORT,
};
use rdcap_protocol::{CaptureConfig, Connection, IcdCaps, LayerCaps, Listener, ProtocolError};

use crate::trace_mgr::{TraceManager, TraceState};
use crate::{AgentError, Result};

/// Window the accept loop waits before re-checking the shutdown flag.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest legacy counter set a single GPA measurement pass covers.
/// Bigger requests would need multiple passes, which the layer rejects.
pub const MAX_LEGACY_COUNTERS_PER_PASS: usize = 8;

/// Capture service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    /// Listen port; 0 requests an ephemeral port.
    pub port: u16,
    /// Capabilities advertised to the host.
    pub capabilities: LayerCapabilities,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            capabilities: build_capabilities(),
        }
    }
}

/// Capabilities of this build of the layer.
pub fn build_capabilities() -> LayerCapabilities {
    LayerCapabilities {
        icd_caps: IcdCaps::SUPPORT_TRIGGER_CAPTURE | IcdCaps::SUPPORT_CAPTURE_SQTT_COUNTERS,
        icd_version: IcdVersion::new(0, 4, 1),
        layer_caps: LayerCaps::SUPPORT_LAYER_CAPABILITIES
            | LayerCaps::DEVICE_EXT_ENABLED
            | LayerCaps::SUPPORT_ICD_CAPTURE_VERSION
            | LayerCaps::SUPPORT_TRIGGER_CAPTURE
            | LayerCaps::SUPPORT_CAPTURE_SQTT_COUNTERS
            | LayerCaps::SUPPORT_CAPTURE_LEGACY_COUNTERS
            | LayerCaps::SUPPORT_GPA_LIB,
    }
}

/// The embedded capture protocol server.
pub struct CaptureService {
    config: ServiceConfig,
    trace_mgr: Arc<TraceManager>,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureService {
    pub fn new(config: ServiceConfig, trace_mgr: Arc<TraceManager>) -> Self {
        Self {
            config,
            trace_mgr,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Bind the listening socket and start the service thread. Returns
    /// the bound port.
    pub fn start(&mut self) -> Result<u16> {
        if self.thread.is_some() {
            return Err(AgentError::AlreadyRunning);
        }
        let listener = Listener::bind(&self.config.host, self.config.port)?;
        let port = listener.local_port();
        info!("capture service listening on {}:{}", self.config.host, port);

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let trace_mgr = self.trace_mgr.clone();
        let capabilities = self.config.capabilities;
        self.thread = Some(thread::spawn(move || {
            serve(listener, running, trace_mgr, capabilities);
        }));
        Ok(port)
    }

    /// Signal shutdown and join the service thread. The accept loop
    /// observes the flag within its poll window.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle.join().ok();
        }
        info!("capture service stopped");
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(
    listener: Listener,
    running: Arc<AtomicBool>,
    trace_mgr: Arc<TraceManager>,
    capabilities: LayerCapabilities,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept(ACCEPT_TIMEOUT) {
            Ok(Some(client)) => {
                debug!("host connected");
                let mut session = ClientSession {
                    conn: client,
                    trace_mgr: &trace_mgr,
                    capabilities,
                    peer_version: None,
                    pending_config: None,
                };
                if let Err(e) = session.run() {
                    debug!("session ended: {}", e);
                }
                debug!("host disconnected");
            }
            Ok(None) => {}
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_TIMEOUT);
            }
        }
    }
}

/// One accepted host connection and its negotiated state.
struct ClientSession<'a> {
    conn: Connection,
    trace_mgr: &'a Arc<TraceManager>,
    capabilities: LayerCapabilities,
    /// Client protocol version from the handshake.
    peer_version: Option<(u32, u32)>,
    /// Capture configuration stored for the next trigger.
    pending_config: Option<CaptureConfig>,
}

impl ClientSession<'_> {
    fn run(&mut self) -> Result<()> {
        loop {
            let tag = match self.conn.recv_message_type()? {
                Some(tag) => tag,
                None => return Ok(()),
            };
            match tag {
                MessageType::HandShake => self.handle_handshake()?,
                MessageType::LayerCapabilities => self.handle_get_capabilities()?,
                MessageType::CaptureConfig => self.handle_capture_config()?,
                MessageType::TriggerCapture => self.handle_trigger_capture()?,
                MessageType::StartCapture => self.handle_start_capture()?,
                MessageType::StopCapture => self.handle_stop_capture()?,
                MessageType::GetCaptureFileReq => self.handle_get_capture_file()?,
                other => {
                    warn!("unexpected message {:?}, dropping session", other);
                    return Err(ProtocolError::UnexpectedMessageType {
                        expected: MessageType::Unknown,
                        got: other,
                    }
                    .into());
                }
            }
        }
    }

    fn peer_at_least(&self, major: u32, minor: u32) -> bool {
        match self.peer_version {
            Some((peer_major, peer_minor)) => {
                peer_major > major || (peer_major == major && peer_minor >= minor)
            }
            None => false,
        }
    }

    fn handle_handshake(&mut self) -> Result<()> {
        let peer = HandShake::recv(&mut self.conn)?;
        info!(
            "handshake from host {}.{}",
            peer.major_version, peer.minor_version
        );
        self.peer_version = Some((peer.major_version, peer.minor_version));
        HandShake::current().send(&mut self.conn)?;
        Ok(())
    }

    fn handle_get_capabilities(&mut self) -> Result<()> {
        self.capabilities.send(&mut self.conn)?;
        Ok(())
    }

    fn handle_capture_config(&mut self) -> Result<()> {
        let msg = CaptureConfigMessage::recv(&mut self.conn)?;
        debug!("capture config received: {:?}", msg.config.mode);

        // The acknowledgement joined the protocol in 2.3 and is only
        // sent for legacy counter requests, which are the ones a GPA
        // pass limit can reject.
        if self.peer_at_least(2, 3) && msg.config.is_capturing_legacy_counters() {
            let status = if msg.config.legacy_counters.len() > MAX_LEGACY_COUNTERS_PER_PASS {
                warn!(
                    "legacy counter set of {} needs multiple GPA passes",
                    msg.config.legacy_counters.len()
                );
                CaptureConfigStatus::FailMultipleGpaPasses
            } else {
                CaptureConfigStatus::Success
            };
            CaptureConfigDone { status }.send(&mut self.conn)?;
        }
        self.pending_config = Some(msg.config);
        Ok(())
    }

    fn handle_trigger_capture(&mut self) -> Result<()> {
        // One trigger in flight per connection; the state machine has
        // no lane for a second one, so it ends the session.
        if matches!(
            self.trace_mgr.state(),
            TraceState::Triggered | TraceState::Tracing
        ) {
            warn!("trigger received while a capture is in flight");
            return Err(AgentError::CaptureInFlight);
        }
        if let Some(config) = &self.pending_config {
            debug!("triggering with capture mode {:?}", config.mode);
        }

        self.trace_mgr.trigger_trace()?;
        self.trace_mgr.wait_for_trace_done();

        let path = self
            .trace_mgr
            .trace_file_path()
            .ok_or_else(|| AgentError::CaptureFailed("no capture path published".to_string()))?;
        TriggerCaptureDone {
            saved_capture_path: path.display().to_string(),
        }
        .send(&mut self.conn)?;
        Ok(())
    }

    fn handle_start_capture(&mut self) -> Result<()> {
        let msg = StartCapture::recv(&mut self.conn)?;
        self.trace_mgr.start_capture(&msg.target_path)?;
        Ok(())
    }

    fn handle_stop_capture(&mut self) -> Result<()> {
        self.trace_mgr.stop_capture();
        Ok(())
    }

    fn handle_get_capture_file(&mut self) -> Result<()> {
        let req = GetCaptureFileRequest::recv(&mut self.conn)?;
        debug!("capture file requested: {}", req.file_path);
        GetCaptureFileResponse::send(&mut self.conn, &req.file_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_capabilities_pass_their_own_gate() {
        let caps = build_capabilities();
        assert!(caps
            .layer_caps
            .contains(LayerCaps::SUPPORT_LAYER_CAPABILITIES));
        assert!(caps.layer_caps.contains(LayerCaps::DEVICE_EXT_ENABLED));
        assert!(caps
            .layer_caps
            .contains(LayerCaps::SUPPORT_CAPTURE_SQTT_COUNTERS));
        // ICD 0.4.1 is the minimum version the host accepts.
        assert_eq!(caps.icd_version.minor(), 4);
        assert_eq!(caps.icd_version.revision(), 1);
    }

    #[test]
    fn service_rejects_double_start() {
        let mgr = Arc::new(TraceManager::new(
            crate::trace_mgr::TraceConfig::default(),
            Arc::new(crate::capture::stub::StubCapture::new()),
        ));
        let mut service = CaptureService::new(
            ServiceConfig {
                port: 0,
                ..Default::default()
            },
            mgr,
        );
        let port = service.start().unwrap();
        assert_ne!(port, 0);
        assert!(matches!(service.start(), Err(AgentError::AlreadyRunning)));
        service.stop();
    }
}
