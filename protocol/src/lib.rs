// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! rdcap wire protocol
//!
//! Shared definitions for the capture coordination protocol spoken between
//! the in-process capture agent on the target device and the host-side
//! tools. The protocol is a length-framed, big-endian binary protocol over
//! TCP with a versioned handshake, capability negotiation, capture
//! configuration, and trace-file transfer.
//!
//! Both sides of the connection use the same message types; see
//! [`message`] for the exact layouts and [`connection`] for the framing
//! primitives.

pub mod config;
pub mod connection;
pub mod facade;
pub mod message;

pub use config::{CaptureConfig, CaptureMode, CounterPreset, SqttCounterConfig};
pub use connection::{Connection, Listener};
pub use message::{
    CaptureConfigStatus, IcdCaps, IcdVersion, LayerCaps, MessageType, PROTOCOL_MAJOR_VERSION,
    PROTOCOL_MINOR_VERSION,
};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Unexpected message type: expected {expected:?}, got {got:?}")]
    UnexpectedMessageType {
        expected: MessageType,
        got: MessageType,
    },

    #[error("Invalid capture mode value: {0}")]
    InvalidCaptureMode(u8),

    #[error("Invalid capture config status value: {0}")]
    InvalidConfigStatus(u32),

    #[error("String field of {0} bytes exceeds the wire limit")]
    StringTooLong(usize),

    #[error("Facade frame of {0} bytes exceeds the frame limit")]
    FrameTooLong(usize),

    #[error("String field is not valid UTF-8")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("Capture file {0} is empty or inaccessible")]
    BadCaptureFile(String),

    #[error("Facade frame could not be decoded: {0}")]
    FacadeDecode(#[from] serde_json::Error),
}
