// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Facade RPC wire format
//!
//! The higher-level RPC surface host tools use as a convenience layer
//! over the core capture protocol. Requests and responses are JSON
//! documents carried in 4-byte big-endian length-prefixed frames:
//!
//! ```text
//! [u32 BE: len][payload bytes of len]
//! ```
//!
//! File downloads interleave raw binary frames after the
//! [`FacadeResponse::DownloadBegin`] header: each frame is one chunk of
//! file content, the last chunk may be short, and a zero-length frame
//! terminates the stream.

use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::{ProtocolError, Result};

/// Default facade endpoint on the target device.
pub const DEFAULT_FACADE_PORT: u16 = 19998;

/// Chunk size for facade file downloads.
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a single facade frame. JSON payloads are tiny and
/// binary chunks are bounded by [`DOWNLOAD_CHUNK_SIZE`].
const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Facade request, one per exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FacadeRequest {
    /// Trigger a capture and wait for it to finish.
    StartTrace,
    /// Echo a message back, for connectivity checks.
    TestConnection { message: String },
    /// Run an allowlisted command on the device and return its stdout.
    RunCommand { command: String },
    /// Return the size of a file on the device.
    GetTraceFileMetaData { name: String },
    /// Stream a file's contents in chunked binary frames.
    DownloadFile { name: String },
}

/// Facade response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FacadeResponse {
    TraceStarted { trace_file_path: String },
    Echo { message: String },
    CommandOutput { output: String },
    FileMetaData { name: String, size: u64 },
    /// Header preceding the binary chunk frames of a download.
    DownloadBegin { name: String, size: u64 },
    Error { code: FacadeStatus, message: String },
}

/// Error codes the facade reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacadeStatus {
    NotFound,
    Internal,
    InvalidRequest,
    DeadlineExceeded,
    PermissionDenied,
}

/// Write one length-prefixed frame.
pub fn write_frame(c: &mut Connection, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLong(payload.len()));
    }
    c.send_u32(payload.len() as u32)?;
    c.send_bytes(payload)
}

/// Read one length-prefixed frame.
///
/// Returns `None` on a clean peer close at a frame boundary.
pub fn read_frame(c: &mut Connection) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match c.recv_bytes(&mut len_buf) {
        Ok(()) => {}
        Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLong(len));
    }
    let mut payload = vec![0u8; len];
    c.recv_bytes(&mut payload)?;
    Ok(Some(payload))
}

/// Send a request as a JSON frame.
pub fn send_request(c: &mut Connection, request: &FacadeRequest) -> Result<()> {
    write_frame(c, &serde_json::to_vec(request)?)
}

/// Receive the next request; `None` when the client is done.
pub fn recv_request(c: &mut Connection) -> Result<Option<FacadeRequest>> {
    match read_frame(c)? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}

/// Send a response as a JSON frame.
pub fn send_response(c: &mut Connection, response: &FacadeResponse) -> Result<()> {
    write_frame(c, &serde_json::to_vec(response)?)
}

/// Receive a response to an in-flight request.
pub fn recv_response(c: &mut Connection) -> Result<FacadeResponse> {
    let payload = read_frame(c)?
        .ok_or_else(|| ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::pair;

    #[test]
    fn request_round_trip() {
        let (mut a, mut b) = pair();
        let requests = [
            FacadeRequest::StartTrace,
            FacadeRequest::TestConnection {
                message: "ping".to_string(),
            },
            FacadeRequest::RunCommand {
                command: "ls /data/local/tmp".to_string(),
            },
            FacadeRequest::GetTraceFileMetaData {
                name: "/data/local/tmp/trace-0001.rd".to_string(),
            },
            FacadeRequest::DownloadFile {
                name: "/data/local/tmp/trace-0001.rd".to_string(),
            },
        ];
        for request in &requests {
            send_request(&mut a, request).unwrap();
            assert_eq!(recv_request(&mut b).unwrap().as_ref(), Some(request));
        }
        drop(a);
        assert!(recv_request(&mut b).unwrap().is_none());
    }

    #[test]
    fn response_round_trip() {
        let (mut a, mut b) = pair();
        let responses = [
            FacadeResponse::TraceStarted {
                trace_file_path: "/data/local/tmp/trace-0001.rd".to_string(),
            },
            FacadeResponse::FileMetaData {
                name: "t.rd".to_string(),
                size: 131_073,
            },
            FacadeResponse::Error {
                code: FacadeStatus::NotFound,
                message: "no such file".to_string(),
            },
        ];
        for response in &responses {
            send_response(&mut a, response).unwrap();
            assert_eq!(&recv_response(&mut b).unwrap(), response);
        }
    }

    #[test]
    fn binary_frames_round_trip() {
        let (mut a, mut b) = pair();
        let chunk: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        write_frame(&mut a, &chunk).unwrap();
        write_frame(&mut a, &[]).unwrap();
        assert_eq!(read_frame(&mut b).unwrap().unwrap(), chunk);
        assert_eq!(read_frame(&mut b).unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (mut a, mut b) = pair();
        a.send_u32((MAX_FRAME_SIZE as u32) + 1).unwrap();
        assert!(matches!(
            read_frame(&mut b),
            Err(ProtocolError::FrameTooLong(_))
        ));
    }
}
