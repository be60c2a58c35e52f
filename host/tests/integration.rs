// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for the host-side clients
//!
//! Runs the real agent (capture service and facade) with the simulated
//! capture backend and drives it with the host clients; version and
//! capability rejections are exercised against scripted servers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rdcap_agent::capture::stub::StubCapture;
use rdcap_agent::facade::{FacadeConfig, FacadeServer};
use rdcap_agent::{CaptureService, ServiceConfig, TraceConfig, TraceManager};
use rdcap_host::facade::FacadeError;
use rdcap_host::{CaptureClient, ClientError, FacadeClient};
use rdcap_protocol::facade::FacadeStatus;
use rdcap_protocol::message::{
    HandShake, IcdVersion, LayerCapabilities, MessageType,
};
use rdcap_protocol::{
    CaptureConfig, CaptureMode, Connection, CounterPreset, IcdCaps, LayerCaps, Listener,
};

// ============================================================================
// Helpers
// ============================================================================

/// A capture service backed by the simulated capture helper.
struct TestAgent {
    service: CaptureService,
    port: u16,
    trace_dir: tempfile::TempDir,
}

impl TestAgent {
    fn start(duration_ms: u64) -> Self {
        let trace_dir = tempfile::tempdir().unwrap();
        let trace_mgr = Arc::new(TraceManager::new(
            TraceConfig {
                trace_dir: trace_dir.path().to_path_buf(),
                trigger_frame_num: 0,
                num_frames_to_trace: 1,
                trace_duration: Duration::from_millis(duration_ms),
            },
            Arc::new(StubCapture::new()),
        ));
        let mut service = CaptureService::new(
            ServiceConfig {
                port: 0,
                ..Default::default()
            },
            trace_mgr,
        );
        let port = service.start().unwrap();
        Self {
            service,
            port,
            trace_dir,
        }
    }

    fn client(&self) -> CaptureClient {
        CaptureClient::new("127.0.0.1", self.port)
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.service.stop();
    }
}

/// Run a one-connection scripted peer for rejection scenarios.
fn scripted_server<F>(script: F) -> (u16, thread::JoinHandle<()>)
where
    F: FnOnce(Connection) + Send + 'static,
{
    let listener = Listener::bind("127.0.0.1", 0).unwrap();
    let port = listener.local_port();
    let handle = thread::spawn(move || {
        if let Some(conn) = listener.accept(Duration::from_secs(5)).unwrap() {
            script(conn);
        }
    });
    (port, handle)
}

fn serve_handshake(conn: &mut Connection, major: u32, minor: u32) {
    conn.recv_message_type().unwrap();
    HandShake::recv(conn).unwrap();
    HandShake {
        major_version: major,
        minor_version: minor,
    }
    .send(conn)
    .unwrap();
}

// ============================================================================
// Handshake compatibility
// ============================================================================

#[test]
fn matching_versions_shake_hands() {
    let agent = TestAgent::start(20);
    let mut client = agent.client();
    client.init().unwrap();
    client.handshake().unwrap();
    assert_eq!(client.layer_version_string(), "2.4");
    assert!(client.is_perf_counter_enabled());
    assert_eq!(client.icd_version_string(), "0.4.1");
    assert!(client
        .layer_caps()
        .contains(LayerCaps::SUPPORT_CAPTURE_LEGACY_COUNTERS));
    assert!(client.icd_caps().contains(IcdCaps::SUPPORT_TRIGGER_CAPTURE));
}

#[test]
fn newer_layer_rejects_old_host() {
    let (port, handle) = scripted_server(|mut conn| {
        serve_handshake(&mut conn, 3, 0);
    });
    let mut client = CaptureClient::new("127.0.0.1", port);
    client.init().unwrap();
    assert!(matches!(
        client.handshake(),
        Err(ClientError::HostTooOld { .. })
    ));
    handle.join().unwrap();
}

#[test]
fn older_layer_without_capabilities_is_accepted() {
    let (port, handle) = scripted_server(|mut conn| {
        // 2.1 predates capability negotiation; the exchange ends after
        // the handshake.
        serve_handshake(&mut conn, 2, 1);
    });
    let mut client = CaptureClient::new("127.0.0.1", port);
    client.init().unwrap();
    client.handshake().unwrap();
    assert_eq!(client.layer_version_string(), "2.1");
    assert!(!client.is_perf_counter_enabled());
    handle.join().unwrap();
}

// ============================================================================
// Capability gating
// ============================================================================

fn capability_server(caps: LayerCapabilities) -> (u16, thread::JoinHandle<()>) {
    scripted_server(move |mut conn| {
        serve_handshake(&mut conn, 2, 4);
        assert_eq!(
            conn.recv_message_type().unwrap(),
            Some(MessageType::LayerCapabilities)
        );
        caps.send(&mut conn).unwrap();
    })
}

#[test]
fn missing_device_extension_rejects_the_instance() {
    let (port, handle) = capability_server(LayerCapabilities {
        icd_caps: IcdCaps::empty(),
        icd_version: IcdVersion::default(),
        layer_caps: LayerCaps::SUPPORT_LAYER_CAPABILITIES,
    });
    let mut client = CaptureClient::new("127.0.0.1", port);
    client.init().unwrap();
    assert!(matches!(
        client.handshake(),
        Err(ClientError::InstanceTooOld)
    ));
    handle.join().unwrap();
}

#[test]
fn ancient_icd_spec_version_rejects_the_instance() {
    let (port, handle) = capability_server(LayerCapabilities {
        icd_caps: IcdCaps::all(),
        icd_version: IcdVersion::new(0, 3, 0),
        layer_caps: LayerCaps::SUPPORT_LAYER_CAPABILITIES
            | LayerCaps::DEVICE_EXT_ENABLED
            | LayerCaps::SUPPORT_CAPTURE_SQTT_COUNTERS
            | LayerCaps::SUPPORT_ICD_CAPTURE_VERSION,
    });
    let mut client = CaptureClient::new("127.0.0.1", port);
    client.init().unwrap();
    assert!(matches!(
        client.handshake(),
        Err(ClientError::InstanceTooOld)
    ));
    handle.join().unwrap();
}

#[test]
fn unreported_capabilities_skip_the_gate() {
    let (port, handle) = capability_server(LayerCapabilities {
        icd_caps: IcdCaps::empty(),
        icd_version: IcdVersion::default(),
        layer_caps: LayerCaps::empty(),
    });
    let mut client = CaptureClient::new("127.0.0.1", port);
    client.init().unwrap();
    client.handshake().unwrap();
    handle.join().unwrap();
}

#[test]
fn old_layer_refuses_non_default_capture_mode() {
    let (port, handle) = scripted_server(|mut conn| {
        serve_handshake(&mut conn, 2, 0);
    });
    let mut client = CaptureClient::new("127.0.0.1", port);
    client.init().unwrap();
    client.handshake().unwrap();

    let config = CaptureConfig {
        mode: CaptureMode::SqttCounter,
        ..Default::default()
    };
    assert!(matches!(
        client.trigger_capture(Some(&config)),
        Err(ClientError::UnsupportedCaptureMode)
    ));
    handle.join().unwrap();
}

// ============================================================================
// Triggered captures end to end
// ============================================================================

#[test]
fn capture_is_retrieved_from_the_device() {
    let agent = TestAgent::start(30);
    let download_dir = tempfile::tempdir().unwrap();
    let mut client = agent
        .client()
        .with_download_dir(download_dir.path())
        .with_remote_capture_prefix(agent.trace_dir.path().display().to_string());
    client.init().unwrap();
    client.handshake().unwrap();

    let path = client.trigger_capture(None).unwrap();
    assert!(path.starts_with(download_dir.path()));
    assert!(path.ends_with("trace-0001.rd"));
    let content = std::fs::read(&path).unwrap();
    assert!(!content.is_empty());
}

#[test]
fn local_capture_path_is_returned_as_is() {
    let agent = TestAgent::start(30);
    // The default device prefix never matches the temp trace dir, so
    // no retrieval happens and the device-side path comes back.
    let mut client = agent.client();
    client.init().unwrap();
    client.handshake().unwrap();

    let path = client.trigger_capture(None).unwrap();
    assert!(path.starts_with(agent.trace_dir.path()));
    assert!(path.exists());
}

#[test]
fn legacy_preset_capture_succeeds() {
    let agent = TestAgent::start(30);
    let mut client = agent.client();
    client.init().unwrap();
    client.handshake().unwrap();

    let config = CaptureConfig {
        mode: CaptureMode::LegacyCounterPerDraw,
        legacy_counters: CounterPreset::Culling.counter_names(),
        ..Default::default()
    };
    let path = client.trigger_capture(Some(&config)).unwrap();
    assert!(path.ends_with("trace-0001.rd"));
}

#[test]
fn oversized_legacy_request_needs_multiple_passes() {
    let agent = TestAgent::start(30);
    let mut client = agent.client();
    client.init().unwrap();
    client.handshake().unwrap();

    let config = CaptureConfig {
        mode: CaptureMode::LegacyCounterPerRenderPass,
        legacy_counters: (0..12).map(|i| format!("Counter{}", i)).collect(),
        ..Default::default()
    };
    assert!(matches!(
        client.trigger_capture(Some(&config)),
        Err(ClientError::LegacyCounterNeedsMultiplePasses)
    ));
}

#[test]
fn manual_start_stop_closes_the_connection() {
    let agent = TestAgent::start(30);
    let target = agent
        .trace_dir
        .path()
        .join("manual-0001.rd")
        .display()
        .to_string();

    let mut client = agent.client();
    client.init().unwrap();
    client.handshake().unwrap();
    client.start_capture(&target).unwrap();
    client.stop_capture().unwrap();

    // The artifact was written by the time stop returned on the wire;
    // poll briefly since the stop message is one-way.
    for _ in 0..50 {
        if std::path::Path::new(&target).exists() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("manual capture artifact never appeared");
}

// ============================================================================
// Facade RPC
// ============================================================================

struct TestFacade {
    server: FacadeServer,
    port: u16,
    trace_dir: tempfile::TempDir,
}

impl TestFacade {
    fn start(duration_ms: u64) -> Self {
        let trace_dir = tempfile::tempdir().unwrap();
        let trace_mgr = Arc::new(TraceManager::new(
            TraceConfig {
                trace_dir: trace_dir.path().to_path_buf(),
                trigger_frame_num: 0,
                num_frames_to_trace: 1,
                trace_duration: Duration::from_millis(duration_ms),
            },
            Arc::new(StubCapture::new()),
        ));
        let mut server = FacadeServer::new(
            FacadeConfig {
                port: 0,
                ..Default::default()
            },
            trace_mgr,
        );
        let port = server.start().unwrap();
        Self {
            server,
            port,
            trace_dir,
        }
    }

    fn client(&self) -> FacadeClient {
        FacadeClient::connect("127.0.0.1", self.port).unwrap()
    }
}

impl Drop for TestFacade {
    fn drop(&mut self) {
        self.server.stop();
    }
}

#[test]
fn facade_start_trace_returns_the_artifact_path() {
    let facade = TestFacade::start(30);
    let mut client = facade.client();
    let path = client.start_trace().unwrap();
    assert!(path.ends_with("trace-0001.rd"));
    assert!(std::path::Path::new(&path).exists());
}

#[test]
fn facade_echoes_test_messages() {
    let facade = TestFacade::start(30);
    let mut client = facade.client();
    let reply = client.test_connection("ping").unwrap();
    assert_eq!(reply, "ping received.");
}

#[test]
fn facade_rejects_unlisted_commands() {
    let facade = TestFacade::start(30);
    let mut client = facade.client();
    assert!(matches!(
        client.run_command("reboot now"),
        Err(FacadeError::Remote {
            code: FacadeStatus::PermissionDenied,
            ..
        })
    ));

    // The connection stays usable after a rejected request.
    let output = client.run_command("echo still here").unwrap();
    assert_eq!(output.trim(), "still here");
}

#[test]
fn facade_download_round_trips_byte_for_byte() {
    let facade = TestFacade::start(30);
    let content: Vec<u8> = (0..131_073u32).map(|i| (i * 13 % 253) as u8).collect();
    let remote = facade.trace_dir.path().join("trace-0077.rd");
    std::fs::write(&remote, &content).unwrap();

    let mut client = facade.client();
    let size = client
        .file_metadata(&remote.display().to_string())
        .unwrap();
    assert_eq!(size as usize, content.len());

    let dest = tempfile::tempdir().unwrap();
    let (local, got) = client
        .download_file(&remote.display().to_string(), dest.path())
        .unwrap();
    assert_eq!(got as usize, content.len());
    assert!(local.ends_with("trace-0077.rd"));
    assert_eq!(std::fs::read(&local).unwrap(), content);
}

#[test]
fn facade_reports_missing_files() {
    let facade = TestFacade::start(30);
    let mut client = facade.client();
    assert!(matches!(
        client.file_metadata("/nonexistent/trace.rd"),
        Err(FacadeError::Remote {
            code: FacadeStatus::NotFound,
            ..
        })
    ));
}

#[test]
fn facade_waits_for_a_file_to_appear() {
    let facade = TestFacade::start(30);
    let target = facade.trace_dir.path().join("trace-0099.rd");
    let writer_path = target.clone();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(80));
        std::fs::write(&writer_path, b"late artifact").unwrap();
    });

    let mut client = facade.client();
    let size = client
        .wait_for_file_with(
            &target.display().to_string(),
            50,
            Duration::from_millis(10),
        )
        .unwrap();
    assert_eq!(size, 13);
    writer.join().unwrap();
}

#[test]
fn facade_wait_times_out() {
    let facade = TestFacade::start(30);
    let mut client = facade.client();
    assert!(matches!(
        client.wait_for_file_with("/nonexistent/trace.rd", 3, Duration::from_millis(5)),
        Err(FacadeError::Timeout(_))
    ));
}
