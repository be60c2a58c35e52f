// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture configuration
//!
//! What the host asks the capture layer to record: the capture mode plus
//! the counter selection that goes with it. Sent ahead of a trigger as a
//! `CaptureConfig` message.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Number of fixed counter slots carried on the wire for SQTT counter
/// captures. All slots are always serialized; only
/// [`SqttCounterConfig::count`] of them are semantically valid.
pub const SQTT_COUNTER_SLOTS: usize = 16;

/// Capture mode requested by the host.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    /// PM4 command stream only
    Pm4Only = 0,
    /// PM4 command stream plus SQTT thread trace
    Pm4AndSqtt = 1,
    /// SQTT thread trace with per-counter sampling
    SqttCounter = 2,
    /// Legacy named counters, one sample per draw
    LegacyCounterPerDraw = 3,
    /// Legacy named counters, one sample per render pass
    LegacyCounterPerRenderPass = 4,
}

impl Default for CaptureMode {
    fn default() -> Self {
        CaptureMode::Pm4AndSqtt
    }
}

impl TryFrom<u8> for CaptureMode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CaptureMode::Pm4Only),
            1 => Ok(CaptureMode::Pm4AndSqtt),
            2 => Ok(CaptureMode::SqttCounter),
            3 => Ok(CaptureMode::LegacyCounterPerDraw),
            4 => Ok(CaptureMode::LegacyCounterPerRenderPass),
            other => Err(ProtocolError::InvalidCaptureMode(other)),
        }
    }
}

/// SQTT counter selection: up to [`SQTT_COUNTER_SLOTS`] pairs of
/// `(counter index, shader engine index)` with an explicit valid count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqttCounterConfig {
    /// Number of valid entries in the slot arrays.
    pub count: u32,
    /// Hardware counter indices.
    pub counter_indices: [u32; SQTT_COUNTER_SLOTS],
    /// Shader engine index per counter.
    pub se_indices: [u32; SQTT_COUNTER_SLOTS],
}

impl Default for SqttCounterConfig {
    fn default() -> Self {
        Self {
            count: 0,
            counter_indices: [0; SQTT_COUNTER_SLOTS],
            se_indices: [0; SQTT_COUNTER_SLOTS],
        }
    }
}

impl SqttCounterConfig {
    /// Build a config from `(counter_index, se_index)` pairs. Pairs past
    /// the fixed slot count are ignored.
    pub fn from_pairs(pairs: &[(u32, u32)]) -> Self {
        let mut config = Self::default();
        for (slot, &(counter, se)) in pairs.iter().take(SQTT_COUNTER_SLOTS).enumerate() {
            config.counter_indices[slot] = counter;
            config.se_indices[slot] = se;
        }
        config.count = pairs.len().min(SQTT_COUNTER_SLOTS) as u32;
        config
    }
}

/// Full capture configuration for one trigger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureConfig {
    /// Capture mode; defaults to [`CaptureMode::Pm4AndSqtt`].
    pub mode: CaptureMode,
    /// Counter selection for [`CaptureMode::SqttCounter`].
    pub sqtt_counters: SqttCounterConfig,
    /// Preset counter names for the legacy counter modes.
    pub legacy_counters: Vec<String>,
}

impl CaptureConfig {
    /// Whether this config records legacy named counters.
    pub fn is_capturing_legacy_counters(&self) -> bool {
        matches!(
            self.mode,
            CaptureMode::LegacyCounterPerDraw | CaptureMode::LegacyCounterPerRenderPass
        )
    }
}

/// Named legacy counter presets.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterPreset {
    Culling = 0,
    AllShaderStages,
    VertexShaderStage,
    PixelShaderStage,
    ComputeShaderStage,
}

impl CounterPreset {
    /// The counter names this preset selects.
    pub fn counters(&self) -> &'static [&'static str] {
        match self {
            CounterPreset::Culling => &[
                "PrimitivesIn",
                "PrimitivesOut",
                "CulledZeroAreaPrims",
                "CulledMicroPrims",
                "OutputPrimsRatio",
                "CulledZeroAreaAndMicroPrimsRatio",
            ],
            CounterPreset::AllShaderStages => &[
                "VSBusyCycles",
                "PSBusyCycles",
                "VALUBusyPercentage",
                "SALUBusyPercentage",
                "WaitCntVMPercentage",
                "WaitCntExpPercentage",
                "WaitExpAllocPercentage",
            ],
            CounterPreset::VertexShaderStage => &[
                "VSBusyCycles",
                "VSVALUBusyPercentage",
                "VSSALUBusyPercentage",
                "VSWaitCntVMPercentage",
                "VSWaitCntExpPercentage",
                "VSWaitExpAllocPercentage",
            ],
            CounterPreset::PixelShaderStage => &[
                "PSBusyCycles",
                "PSVALUBusyPercentage",
                "PSSALUBusyPercentage",
                "PSWaitCntVMPercentage",
                "PSWaitCntExpPercentage",
                "PSWaitExpAllocPercentage",
            ],
            CounterPreset::ComputeShaderStage => &[
                "CSBusyCycles",
                "CSVALUBusyPercentage",
                "CSSALUBusyPercentage",
                "CSWaitCntVMPercentage",
                "CSWaitCntExpPercentage",
                "CSWaitExpAllocPercentage",
            ],
        }
    }

    /// The preset as an owned counter-name list, ready for a
    /// [`CaptureConfig`].
    pub fn counter_names(&self) -> Vec<String> {
        self.counters().iter().map(|s| s.to_string()).collect()
    }
}
