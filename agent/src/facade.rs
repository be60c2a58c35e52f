// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Facade RPC server
//!
//! A secondary server exposing a convenience surface to host tooling on
//! top of the core capture protocol: trigger-and-wait, connectivity
//! checks, allowlisted device commands, and chunked file download.
//!
//! Each accepted connection gets its own handler thread; requests on a
//! connection are served in order.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use rdcap_protocol::facade::{
    self, FacadeRequest, FacadeResponse, FacadeStatus, DEFAULT_FACADE_PORT, DOWNLOAD_CHUNK_SIZE,
};
use rdcap_protocol::message::DEFAULT_HOST;
use rdcap_protocol::{Connection, Listener};

use crate::trace_mgr::TraceManager;
use crate::{AgentError, Result};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Commands [`FacadeRequest::RunCommand`] is allowed to execute.
const COMMAND_ALLOWLIST: &[&str] = &["ls", "echo", "getprop", "setprop", "rm", "mkdir"];

/// Facade server configuration.
#[derive(Debug, Clone)]
pub struct FacadeConfig {
    pub host: String,
    /// Listen port; 0 requests an ephemeral port.
    pub port: u16,
    /// How long `StartTrace` waits for the capture to finish before
    /// reporting a deadline error.
    pub start_trace_deadline: Duration,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_FACADE_PORT,
            start_trace_deadline: Duration::from_secs(200),
        }
    }
}

/// The facade RPC server.
pub struct FacadeServer {
    config: FacadeConfig,
    trace_mgr: Arc<TraceManager>,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FacadeServer {
    pub fn new(config: FacadeConfig, trace_mgr: Arc<TraceManager>) -> Self {
        Self {
            config,
            trace_mgr,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Bind and start the accept thread. Returns the bound port.
    pub fn start(&mut self) -> Result<u16> {
        if self.thread.is_some() {
            return Err(AgentError::AlreadyRunning);
        }
        let listener = Listener::bind(&self.config.host, self.config.port)?;
        let port = listener.local_port();
        info!("facade listening on {}:{}", self.config.host, port);

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let trace_mgr = self.trace_mgr.clone();
        let deadline = self.config.start_trace_deadline;
        self.thread = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match listener.accept(ACCEPT_TIMEOUT) {
                    Ok(Some(client)) => {
                        let trace_mgr = trace_mgr.clone();
                        thread::spawn(move || {
                            if let Err(e) = handle_connection(client, trace_mgr, deadline) {
                                debug!("facade session ended: {}", e);
                            }
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("facade accept failed: {}", e);
                        thread::sleep(ACCEPT_TIMEOUT);
                    }
                }
            }
        }));
        Ok(port)
    }

    /// Signal shutdown and join the accept thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle.join().ok();
        }
        info!("facade stopped");
    }
}

impl Drop for FacadeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(
    mut conn: Connection,
    trace_mgr: Arc<TraceManager>,
    start_trace_deadline: Duration,
) -> Result<()> {
    while let Some(request) = facade::recv_request(&mut conn)? {
        debug!("facade request: {:?}", request);
        match request {
            FacadeRequest::StartTrace => {
                let response = start_trace(&trace_mgr, start_trace_deadline);
                facade::send_response(&mut conn, &response)?;
            }
            FacadeRequest::TestConnection { message } => {
                facade::send_response(
                    &mut conn,
                    &FacadeResponse::Echo {
                        message: format!("{} received.", message),
                    },
                )?;
            }
            FacadeRequest::RunCommand { command } => {
                let response = run_command(&command);
                facade::send_response(&mut conn, &response)?;
            }
            FacadeRequest::GetTraceFileMetaData { name } => {
                let response = match std::fs::metadata(&name) {
                    Ok(meta) if meta.is_file() => FacadeResponse::FileMetaData {
                        name,
                        size: meta.len(),
                    },
                    _ => not_found(&name),
                };
                facade::send_response(&mut conn, &response)?;
            }
            FacadeRequest::DownloadFile { name } => {
                download_file(&mut conn, &name)?;
            }
        }
    }
    Ok(())
}

fn start_trace(trace_mgr: &Arc<TraceManager>, deadline: Duration) -> FacadeResponse {
    if let Err(e) = trace_mgr.trigger_trace() {
        return FacadeResponse::Error {
            code: FacadeStatus::Internal,
            message: e.to_string(),
        };
    }
    if !trace_mgr.wait_for_trace_done_timeout(deadline) {
        return FacadeResponse::Error {
            code: FacadeStatus::DeadlineExceeded,
            message: format!("capture did not finish within {:?}", deadline),
        };
    }
    match trace_mgr.trace_file_path() {
        Some(path) => FacadeResponse::TraceStarted {
            trace_file_path: path.display().to_string(),
        },
        None => FacadeResponse::Error {
            code: FacadeStatus::Internal,
            message: "no capture path published".to_string(),
        },
    }
}

fn run_command(command: &str) -> FacadeResponse {
    let mut parts = command.split_whitespace();
    let program = match parts.next() {
        Some(p) => p,
        None => {
            return FacadeResponse::Error {
                code: FacadeStatus::InvalidRequest,
                message: "empty command".to_string(),
            }
        }
    };
    if !COMMAND_ALLOWLIST.contains(&program) {
        warn!("command {} rejected by allowlist", program);
        return FacadeResponse::Error {
            code: FacadeStatus::PermissionDenied,
            message: format!("command not allowlisted: {}", program),
        };
    }
    match Command::new(program).args(parts).output() {
        Ok(output) if output.status.success() => FacadeResponse::CommandOutput {
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        },
        Ok(output) => FacadeResponse::Error {
            code: FacadeStatus::Internal,
            message: format!(
                "command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        },
        Err(e) => FacadeResponse::Error {
            code: FacadeStatus::Internal,
            message: e.to_string(),
        },
    }
}

/// Stream a file as a `DownloadBegin` header followed by chunk frames
/// and a zero-length terminator. The last chunk may be short; the
/// client verifies the chunk total against the announced size.
fn download_file(conn: &mut Connection, name: &str) -> Result<()> {
    let size = match std::fs::metadata(name) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            facade::send_response(conn, &not_found(name))?;
            return Ok(());
        }
    };
    facade::send_response(
        conn,
        &FacadeResponse::DownloadBegin {
            name: name.to_string(),
            size,
        },
    )?;

    use std::io::Read;
    let mut file = std::fs::File::open(name)?;
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        facade::write_frame(conn, &buf[..n])?;
        total += n as u64;
    }
    facade::write_frame(conn, &[])?;
    if total != size {
        warn!(
            "download of {} sent {} bytes, expected {}",
            name, total, size
        );
    } else {
        debug!("download of {} complete, {} bytes", name, total);
    }
    Ok(())
}

fn not_found(name: &str) -> FacadeResponse {
    FacadeResponse::Error {
        code: FacadeStatus::NotFound,
        message: format!("no such file: {}", name),
    }
}
