// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Standalone capture agent
//!
//! Runs the capture service and facade outside a real graphics
//! application, for development and testing. With `--stub` the injected
//! helper is replaced by the simulated backend, and `--simulate-fps`
//! drives the frame callback so frame-mode captures complete.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Arg, Command};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use rdcap_agent::capture::{bind_primitives, stub::StubCapture, HELPER_LIBRARY_PATH};
use rdcap_agent::facade::{FacadeConfig, FacadeServer};
use rdcap_agent::layer::trigger_frame_num_from_env;
use rdcap_agent::{CaptureService, ServiceConfig, TraceConfig, TraceManager};
use rdcap_protocol::message::DEFAULT_HOST;

fn main() -> anyhow::Result<()> {
    let matches = Command::new("rdcap-agent")
        .version(env!("CARGO_PKG_VERSION"))
        .about("rdcap capture agent: capture service and facade RPC")
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("ADDR")
                .default_value(DEFAULT_HOST)
                .help("Address to listen on"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .default_value("19999")
                .help("Capture service port"),
        )
        .arg(
            Arg::new("facade-port")
                .long("facade-port")
                .value_name("PORT")
                .default_value("19998")
                .help("Facade RPC port"),
        )
        .arg(
            Arg::new("trace-dir")
                .long("trace-dir")
                .value_name("DIR")
                .default_value("/data/local/tmp")
                .help("Directory trace artifacts are written into"),
        )
        .arg(
            Arg::new("trigger-frame-num")
                .long("trigger-frame-num")
                .value_name("N")
                .help("Frame ordinal for frame-mode captures; 0 selects duration mode"),
        )
        .arg(
            Arg::new("frames")
                .long("frames")
                .value_name("N")
                .default_value("1")
                .help("Frames a frame-mode capture spans"),
        )
        .arg(
            Arg::new("duration-ms")
                .long("duration-ms")
                .value_name("MS")
                .default_value("5000")
                .help("Length of a duration-mode capture"),
        )
        .arg(
            Arg::new("helper-path")
                .long("helper-path")
                .value_name("PATH")
                .default_value(HELPER_LIBRARY_PATH)
                .help("Path to the injected capture helper library"),
        )
        .arg(
            Arg::new("stub")
                .long("stub")
                .action(clap::ArgAction::SetTrue)
                .help("Use the simulated capture backend instead of the helper library"),
        )
        .arg(
            Arg::new("simulate-fps")
                .long("simulate-fps")
                .value_name("FPS")
                .default_value("0")
                .help("Drive the frame callback at this rate (0 disables)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("logger init failed")?;

    let host = matches.get_one::<String>("host").unwrap().clone();
    let port: u16 = matches.get_one::<String>("port").unwrap().parse()?;
    let facade_port: u16 = matches.get_one::<String>("facade-port").unwrap().parse()?;
    let trace_dir = PathBuf::from(matches.get_one::<String>("trace-dir").unwrap());
    let trigger_frame_num: u32 = match matches.get_one::<String>("trigger-frame-num") {
        Some(raw) => raw.parse()?,
        None => trigger_frame_num_from_env(),
    };
    let frames: u32 = matches.get_one::<String>("frames").unwrap().parse()?;
    let duration_ms: u64 = matches.get_one::<String>("duration-ms").unwrap().parse()?;
    let simulate_fps: u32 = matches.get_one::<String>("simulate-fps").unwrap().parse()?;

    let primitives = if matches.get_flag("stub") {
        info!("using simulated capture backend");
        Arc::new(StubCapture::new()) as Arc<dyn rdcap_agent::CapturePrimitives>
    } else {
        bind_primitives(matches.get_one::<String>("helper-path").unwrap())
    };

    let trace_mgr = Arc::new(TraceManager::new(
        TraceConfig {
            trace_dir,
            trigger_frame_num,
            num_frames_to_trace: frames,
            trace_duration: Duration::from_millis(duration_ms),
        },
        primitives,
    ));

    let mut service = CaptureService::new(
        ServiceConfig {
            host: host.clone(),
            port,
            ..Default::default()
        },
        trace_mgr.clone(),
    );
    service.start().context("capture service failed to start")?;

    let mut facade = FacadeServer::new(
        FacadeConfig {
            host,
            port: facade_port,
            ..Default::default()
        },
        trace_mgr.clone(),
    );
    facade.start().context("facade failed to start")?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("signal handler install failed")?;

    info!("agent running, press Ctrl+C to stop");
    if simulate_fps > 0 {
        let frame_interval = Duration::from_micros(1_000_000 / simulate_fps as u64);
        info!("simulating frame cadence at {} fps", simulate_fps);
        while running.load(Ordering::SeqCst) {
            trace_mgr.on_new_frame();
            std::thread::sleep(frame_interval);
        }
    } else {
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    info!("stopping agent...");
    service.stop();
    facade.stop();
    if let Some(path) = trace_mgr.trace_file_path() {
        info!("last capture artifact: {}", path.display());
    }
    Ok(())
}
