// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! rdcap CLI
//!
//! Host-side command line for driving captures: `capture` triggers a
//! capture on a running target and downloads the artifact, `cleanup`
//! removes previously downloaded artifacts. Device discovery and
//! package installation are handled by outer tooling; this CLI talks to
//! an already-running capture service.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Arg, Command};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use rdcap_host::CaptureClient;
use rdcap_protocol::message::DEFAULT_HOST;
use rdcap_protocol::{CaptureConfig, CaptureMode, CounterPreset};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("rdcap")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Capture GPU render-pipeline traces from a running application")
        .subcommand_required(true)
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("ADDR")
                .default_value(DEFAULT_HOST)
                .global(true)
                .help("Capture service address"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .default_value("19999")
                .global(true)
                .help("Capture service port"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .global(true)
                .help("Enable verbose logging"),
        )
        .subcommand(
            Command::new("capture")
                .about("Trigger a capture and download the artifact")
                .arg(
                    Arg::new("download-path")
                        .long("download-path")
                        .value_name("DIR")
                        .default_value(".")
                        .help("Directory the capture is downloaded into"),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .value_name("MODE")
                        .default_value("pm4-sqtt")
                        .help("pm4, pm4-sqtt, sqtt-counter, legacy-per-draw or legacy-per-renderpass"),
                )
                .arg(
                    Arg::new("preset")
                        .long("preset")
                        .value_name("PRESET")
                        .help("Legacy counter preset: culling, all-shader, vertex, pixel or compute"),
                ),
        )
        .subcommand(
            Command::new("cleanup")
                .about("Remove downloaded capture artifacts")
                .arg(
                    Arg::new("download-path")
                        .long("download-path")
                        .value_name("DIR")
                        .default_value(".")
                        .help("Directory to clean"),
                ),
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
    let port: u16 = matches
        .get_one::<String>("port")
        .unwrap()
        .parse()
        .context("invalid port")?;

    match matches.subcommand() {
        Some(("capture", sub)) => run_capture(&host, port, sub),
        Some(("cleanup", sub)) => run_cleanup(sub),
        _ => unreachable!("subcommand is required"),
    }
}

fn run_capture(host: &str, port: u16, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let download_path = PathBuf::from(matches.get_one::<String>("download-path").unwrap());
    if !download_path.exists() {
        std::fs::create_dir_all(&download_path).context("creating download directory")?;
    }

    let config = build_config(
        matches.get_one::<String>("mode").unwrap(),
        matches.get_one::<String>("preset").map(String::as_str),
    )?;

    let mut client = CaptureClient::new(host, port).with_download_dir(download_path);
    client.init().context("connecting to the capture service")?;
    client.handshake().context("handshake failed")?;
    info!(
        "connected, layer protocol {} (perf counters {})",
        client.layer_version_string(),
        if client.is_perf_counter_enabled() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let path = client
        .trigger_capture(Some(&config))
        .context("capture failed")?;
    println!("Capture saved at {}", path.display());
    Ok(())
}

fn run_cleanup(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let download_path = PathBuf::from(matches.get_one::<String>("download-path").unwrap());
    let mut removed = 0usize;
    for entry in std::fs::read_dir(&download_path).context("reading download directory")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("trace") && name.ends_with(".rd") {
            std::fs::remove_file(entry.path())
                .with_context(|| format!("removing {}", entry.path().display()))?;
            removed += 1;
        }
    }
    println!("Removed {} capture artifact(s)", removed);
    Ok(())
}

fn build_config(mode: &str, preset: Option<&str>) -> anyhow::Result<CaptureConfig> {
    let mode = match mode {
        "pm4" => CaptureMode::Pm4Only,
        "pm4-sqtt" => CaptureMode::Pm4AndSqtt,
        "sqtt-counter" => CaptureMode::SqttCounter,
        "legacy-per-draw" => CaptureMode::LegacyCounterPerDraw,
        "legacy-per-renderpass" => CaptureMode::LegacyCounterPerRenderPass,
        other => bail!("unknown capture mode: {}", other),
    };

    let mut config = CaptureConfig {
        mode,
        ..Default::default()
    };
    if config.is_capturing_legacy_counters() {
        let preset = match preset.unwrap_or("all-shader") {
            "culling" => CounterPreset::Culling,
            "all-shader" => CounterPreset::AllShaderStages,
            "vertex" => CounterPreset::VertexShaderStage,
            "pixel" => CounterPreset::PixelShaderStage,
            "compute" => CounterPreset::ComputeShaderStage,
            other => bail!("unknown counter preset: {}", other),
        };
        config.legacy_counters = preset.counter_names();
    } else if preset.is_some() {
        bail!("--preset only applies to the legacy counter modes");
    }
    Ok(config)
}
