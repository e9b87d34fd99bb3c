//! Core module containing the main functionality of hdlcd
//!
//! This module provides:
//! - HDLC framing and the go-back-N link state machine
//! - Serial device ownership, locking and recovery
//! - Flow control and link statistics
//! - The TCP client access protocol

pub mod access;
pub mod flow;
pub mod hdlc;
pub mod serial;
pub mod stats;
