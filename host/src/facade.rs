// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Facade RPC client
//!
//! Host-side driver for the agent's convenience RPC surface:
//! trigger-and-wait, connectivity checks, device commands, file
//! metadata and chunked downloads.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};

use rdcap_protocol::facade::{
    self, FacadeRequest, FacadeResponse, FacadeStatus, DEFAULT_FACADE_PORT,
};
use rdcap_protocol::message::DEFAULT_HOST;
use rdcap_protocol::{Connection, ProtocolError};

/// Default polling budget while waiting for a capture artifact to
/// appear on the device.
pub const FILE_WAIT_ATTEMPTS: u32 = 100;
pub const FILE_WAIT_INTERVAL: Duration = Duration::from_secs(2);

/// Result type for facade client operations
pub type Result<T> = std::result::Result<T, FacadeError>;

/// Errors the facade client surfaces.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error("Transport error: {0}")]
    Transport(#[from] ProtocolError),

    #[error("Facade reported {code:?}: {message}")]
    Remote { code: FacadeStatus, message: String },

    #[error("Unexpected facade response")]
    UnexpectedResponse,

    #[error("Download size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected facade client.
pub struct FacadeClient {
    conn: Connection,
}

impl FacadeClient {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let conn = Connection::connect(host, port)?;
        debug!("facade client connected to {}:{}", host, port);
        Ok(Self { conn })
    }

    /// A client against the default local endpoint.
    pub fn local() -> Result<Self> {
        Self::connect(DEFAULT_HOST, DEFAULT_FACADE_PORT)
    }

    fn call(&mut self, request: &FacadeRequest) -> Result<FacadeResponse> {
        facade::send_request(&mut self.conn, request)?;
        let response = facade::recv_response(&mut self.conn)?;
        match response {
            FacadeResponse::Error { code, message } => Err(FacadeError::Remote { code, message }),
            other => Ok(other),
        }
    }

    /// Trigger a capture and block until the facade reports the
    /// produced artifact path.
    pub fn start_trace(&mut self) -> Result<String> {
        match self.call(&FacadeRequest::StartTrace)? {
            FacadeResponse::TraceStarted { trace_file_path } => {
                info!("trace saved at {}", trace_file_path);
                Ok(trace_file_path)
            }
            _ => Err(FacadeError::UnexpectedResponse),
        }
    }

    /// Round-trip a message for connectivity checks.
    pub fn test_connection(&mut self, message: &str) -> Result<String> {
        match self.call(&FacadeRequest::TestConnection {
            message: message.to_string(),
        })? {
            FacadeResponse::Echo { message } => Ok(message),
            _ => Err(FacadeError::UnexpectedResponse),
        }
    }

    /// Run an allowlisted command on the device, returning its stdout.
    pub fn run_command(&mut self, command: &str) -> Result<String> {
        match self.call(&FacadeRequest::RunCommand {
            command: command.to_string(),
        })? {
            FacadeResponse::CommandOutput { output } => Ok(output),
            _ => Err(FacadeError::UnexpectedResponse),
        }
    }

    /// Size of a file on the device.
    pub fn file_metadata(&mut self, name: &str) -> Result<u64> {
        match self.call(&FacadeRequest::GetTraceFileMetaData {
            name: name.to_string(),
        })? {
            FacadeResponse::FileMetaData { size, .. } => Ok(size),
            _ => Err(FacadeError::UnexpectedResponse),
        }
    }

    /// Download a device file into `dest_dir`, returning the local path
    /// and byte count. The chunk total must match the announced size.
    pub fn download_file(&mut self, name: &str, dest_dir: &Path) -> Result<(PathBuf, u64)> {
        let (remote_name, size) = match self.call(&FacadeRequest::DownloadFile {
            name: name.to_string(),
        })? {
            FacadeResponse::DownloadBegin { name, size } => (name, size),
            _ => return Err(FacadeError::UnexpectedResponse),
        };

        let file_name = Path::new(&remote_name)
            .file_name()
            .ok_or(FacadeError::UnexpectedResponse)?;
        let local_path = dest_dir.join(file_name);
        let mut file = File::create(&local_path)?;

        let mut total: u64 = 0;
        loop {
            let chunk = facade::read_frame(&mut self.conn)?.ok_or_else(|| {
                FacadeError::Transport(ProtocolError::Io(
                    std::io::ErrorKind::UnexpectedEof.into(),
                ))
            })?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk)?;
            total += chunk.len() as u64;
        }

        if total != size {
            return Err(FacadeError::SizeMismatch {
                expected: size,
                got: total,
            });
        }
        info!("downloaded {} ({} bytes)", local_path.display(), total);
        Ok((local_path, total))
    }

    /// Poll until `name` exists on the device, with the default budget
    /// of 100 attempts 2 s apart.
    pub fn wait_for_file(&mut self, name: &str) -> Result<u64> {
        self.wait_for_file_with(name, FILE_WAIT_ATTEMPTS, FILE_WAIT_INTERVAL)
    }

    /// Poll until `name` exists, with an explicit budget.
    pub fn wait_for_file_with(
        &mut self,
        name: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<u64> {
        for attempt in 0..attempts {
            match self.file_metadata(name) {
                Ok(size) => return Ok(size),
                Err(FacadeError::Remote {
                    code: FacadeStatus::NotFound,
                    ..
                }) => {
                    debug!("waiting for {} (attempt {})", name, attempt + 1);
                    std::thread::sleep(interval);
                }
                Err(e) => return Err(e),
            }
        }
        Err(FacadeError::Timeout(name.to_string()))
    }
}
