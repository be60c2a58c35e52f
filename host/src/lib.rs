// Copyright 2025 rdcap Authors
// SPDX-License-Identifier: Apache-2.0

//! rdcap host tools
//!
//! The host-side half of rdcap: the capture client that drives the
//! in-process service over the wire protocol, and the facade client for
//! the higher-level RPC surface.

pub mod client;
pub mod facade;

pub use client::{CaptureClient, ClientError};
pub use facade::{FacadeClient, FacadeError};
