//! IPC bridge for host-worker communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the supervising host and the worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message envelope, kind classification, ids, error codes
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
