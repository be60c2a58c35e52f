// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture client
//!
//! Drives the in-process capture service: versioned handshake,
//! capability negotiation, capture configuration, trigger, and
//! retrieval of the produced artifact.
//!
//! Transport errors are reported and never retried here; callers decide
//! whether to reconnect and start the exchange over.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use rdcap_protocol::message::{
    expect_tag, GetCaptureFileRequest, GetCaptureFileResponse, GetLayerCapabilities, HandShake,
    LayerCapabilities, MessageType, StartCapture, StopCapture, TriggerCapture, TriggerCaptureDone,
    CAPTURE_DIR_ON_DEVICE, DEFAULT_HOST, DEFAULT_PORT, PROTOCOL_MAJOR_VERSION,
};
use rdcap_protocol::{Connection, IcdCaps, IcdVersion, LayerCaps, ProtocolError};

#[cfg(feature = "perf-counters")]
use rdcap_protocol::message::CaptureConfigMessage;
#[cfg(feature = "perf-counters")]
use rdcap_protocol::message::{CaptureConfigDone, CaptureConfigStatus};
#[cfg(feature = "perf-counters")]
use rdcap_protocol::CaptureMode;

use rdcap_protocol::CaptureConfig;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors the capture client surfaces.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Socket(#[from] ProtocolError),

    #[error("Host tool is too old for layer protocol {layer_version}")]
    HostTooOld { layer_version: String },

    #[error("Capture layer on the instance is too old")]
    InstanceTooOld,

    #[error("Requested legacy counter set needs multiple GPA passes")]
    LegacyCounterNeedsMultiplePasses,

    #[error("Layer is too old for the requested capture mode")]
    UnsupportedCaptureMode,

    #[error("Capture was triggered but did not complete")]
    CaptureFailed,
}

/// Host-side driver for one capture service connection.
pub struct CaptureClient {
    host: String,
    port: u16,
    conn: Option<Connection>,
    layer_major_version: u32,
    layer_minor_version: u32,
    icd_caps: IcdCaps,
    icd_version: IcdVersion,
    layer_caps: LayerCaps,
    /// Where retrieved captures land; defaults to the temp directory.
    download_dir: PathBuf,
    /// Path prefix marking artifacts that still live on the device.
    remote_capture_prefix: String,
}

impl CaptureClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            conn: None,
            layer_major_version: 0,
            layer_minor_version: 0,
            icd_caps: IcdCaps::empty(),
            icd_version: IcdVersion::default(),
            layer_caps: LayerCaps::empty(),
            download_dir: std::env::temp_dir(),
            remote_capture_prefix: CAPTURE_DIR_ON_DEVICE.to_string(),
        }
    }

    /// A client against the default local endpoint.
    pub fn local() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }

    /// Override where retrieved captures are written.
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Override the on-device path prefix that forces retrieval.
    pub fn with_remote_capture_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.remote_capture_prefix = prefix.into();
        self
    }

    /// Connect if not already connected.
    pub fn init(&mut self) -> Result<()> {
        if self.conn.is_none() {
            self.conn = Some(Connection::connect(&self.host, self.port)?);
            debug!("connected to {}:{}", self.host, self.port);
        }
        Ok(())
    }

    fn conn(&mut self) -> Result<&mut Connection> {
        self.init()?;
        Ok(self.conn.as_mut().expect("connection just initialized"))
    }

    fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.shutdown();
        }
    }

    /// Exchange handshakes and, on protocol 2.2+, negotiate
    /// capabilities.
    pub fn handshake(&mut self) -> Result<()> {
        let conn = self.conn()?;
        HandShake::current().send(conn)?;
        expect_tag(conn, MessageType::HandShake)?;
        let reply = HandShake::recv(conn)?;
        self.layer_major_version = reply.major_version;
        self.layer_minor_version = reply.minor_version;
        info!(
            "layer speaks protocol {}.{}",
            reply.major_version, reply.minor_version
        );

        if reply.major_version > PROTOCOL_MAJOR_VERSION {
            warn!("version mismatch: this host tool is too old");
            return Err(ClientError::HostTooOld {
                layer_version: self.layer_version_string(),
            });
        }
        if reply.major_version < PROTOCOL_MAJOR_VERSION {
            // An older layer may still work; capability checks below
            // narrow it down.
            debug!("layer is older than this host tool, proceeding");
        }

        if self.peer_at_least(2, 2) {
            let conn = self.conn()?;
            GetLayerCapabilities::send(conn)?;
            expect_tag(conn, MessageType::LayerCapabilities)?;
            let caps = LayerCapabilities::recv(conn)?;
            self.icd_caps = caps.icd_caps;
            self.icd_version = caps.icd_version;
            self.layer_caps = caps.layer_caps;
            debug!("ICD capture spec version {}", self.icd_version);
            self.check_capabilities()?;
        }
        Ok(())
    }

    /// Capability gating: only meaningful when the layer reports
    /// capabilities at all. An ancient ICD without the capture
    /// extension never sets the device-ext flag.
    fn check_capabilities(&self) -> Result<()> {
        if !self
            .layer_caps
            .contains(LayerCaps::SUPPORT_LAYER_CAPABILITIES)
        {
            return Ok(());
        }
        if !self.layer_caps.contains(LayerCaps::DEVICE_EXT_ENABLED)
            || !self
                .layer_caps
                .contains(LayerCaps::SUPPORT_CAPTURE_SQTT_COUNTERS)
        {
            return Err(ClientError::InstanceTooOld);
        }
        // Minimum ICD capture spec version is 0.4.1 where reported.
        if self
            .layer_caps
            .contains(LayerCaps::SUPPORT_ICD_CAPTURE_VERSION)
            && self.icd_version.minor() < 4
            && self.icd_version.revision() < 1
        {
            return Err(ClientError::InstanceTooOld);
        }
        Ok(())
    }

    fn peer_at_least(&self, major: u32, minor: u32) -> bool {
        self.layer_major_version > major
            || (self.layer_major_version == major && self.layer_minor_version >= minor)
    }

    /// Trigger a capture and wait for the produced artifact. When the
    /// returned path still lives on the device, the file is retrieved
    /// into the download directory and the local path is returned.
    pub fn trigger_capture(&mut self, config: Option<&CaptureConfig>) -> Result<PathBuf> {
        self.init()?;

        #[cfg(feature = "perf-counters")]
        {
            if self.peer_at_least(2, 1) {
                self.send_capture_config(config)?;
                if self.peer_at_least(2, 3)
                    && config.is_some_and(|c| c.is_capturing_legacy_counters())
                {
                    let conn = self.conn()?;
                    expect_tag(conn, MessageType::CaptureConfigDone)?;
                    let ack = CaptureConfigDone::recv(conn)?;
                    if ack.status == CaptureConfigStatus::FailMultipleGpaPasses {
                        return Err(ClientError::LegacyCounterNeedsMultiplePasses);
                    }
                }
            } else if config.is_some_and(|c| c.mode != CaptureMode::Pm4AndSqtt) {
                return Err(ClientError::UnsupportedCaptureMode);
            }
        }
        #[cfg(not(feature = "perf-counters"))]
        let _ = config;

        let conn = self.conn()?;
        TriggerCapture::send(conn)?;

        debug!("waiting for capture to complete");
        let tag = match conn.recv_message_type() {
            // A session dropped while the trigger was in flight means
            // the capture itself failed, not the transport as such.
            Ok(None) => return Err(ClientError::CaptureFailed),
            Ok(Some(tag)) => tag,
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ClientError::CaptureFailed)
            }
            Err(e) => return Err(e.into()),
        };
        if tag != MessageType::TriggerCaptureDone {
            warn!("unexpected reply {:?} to trigger", tag);
            return Err(ClientError::CaptureFailed);
        }
        let done = TriggerCaptureDone::recv(conn)?;
        let mut capture_path = done.saved_capture_path;
        info!("capture ready at {}", capture_path);

        if capture_path.starts_with(&self.remote_capture_prefix) {
            capture_path = self.retrieve_capture(&capture_path)?;
        }
        Ok(PathBuf::from(capture_path))
    }

    #[cfg(feature = "perf-counters")]
    fn send_capture_config(&mut self, config: Option<&CaptureConfig>) -> Result<()> {
        let conn = self.conn()?;
        let msg = match config {
            Some(config) => CaptureConfigMessage::new(config.clone()),
            None => CaptureConfigMessage::default(),
        };
        debug!("sending capture config {:?}", msg.config.mode);
        msg.send(conn)?;
        Ok(())
    }

    /// Pull a device-resident capture down to the host.
    fn retrieve_capture(&mut self, device_path: &str) -> Result<String> {
        debug!("retrieving {} from the device", device_path);
        let download_dir = self.download_dir.clone();
        let conn = self.conn()?;
        GetCaptureFileRequest {
            file_path: device_path.to_string(),
        }
        .send(conn)?;
        expect_tag(conn, MessageType::GetCaptureFileRsp)?;
        let resp = GetCaptureFileResponse::recv(conn, &download_dir)?;
        info!(
            "capture copied to {} ({} bytes)",
            resp.file_path, resp.file_size
        );
        Ok(resp.file_path)
    }

    /// Manually start a capture into `path` on the device.
    pub fn start_capture(&mut self, path: &str) -> Result<()> {
        let conn = self.conn()?;
        StartCapture {
            target_path: path.to_string(),
        }
        .send(conn)?;
        Ok(())
    }

    /// Stop a manual capture. The connection is closed afterwards.
    pub fn stop_capture(&mut self) -> Result<()> {
        let conn = self.conn()?;
        StopCapture::send(conn)?;
        self.drop_connection();
        Ok(())
    }

    // ========================================================================
    // Negotiated peer state
    // ========================================================================

    pub fn layer_version_string(&self) -> String {
        format!("{}.{}", self.layer_major_version, self.layer_minor_version)
    }

    pub fn icd_version_string(&self) -> String {
        self.icd_version.to_string()
    }

    pub fn layer_caps(&self) -> LayerCaps {
        self.layer_caps
    }

    pub fn icd_caps(&self) -> IcdCaps {
        self.icd_caps
    }

    /// Perf counter support arrived with protocol 2.4.
    pub fn is_perf_counter_enabled(&self) -> bool {
        self.layer_minor_version >= 4
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }
}
