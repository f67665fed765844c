// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Userspace network stack behind a WireGuard tunnel.
//!
//! This crate connects a WireGuard transport to a smoltcp interface so that
//! applications can open TCP connections over the tunnel without a kernel
//! TUN device.
//!
//! # Overview
//!
//! - The transport calls [`SourceSink::read`] to collect packets the stack
//!   wants to send, each tagged with the peer that owns its destination.
//! - The transport calls [`SourceSink::write`] with decrypted packets, which
//!   the stack receives as inbound traffic.
//! - Applications use the [`Netstack`] handle to listen and connect.
//!
//! # Example
//!
//! ```ignore
//! use loom_wgtunnel_netstack::{NetstackBridge, SourceSink};
//!
//! let (bridge, stack) = NetstackBridge::with_addresses("a", public_key, vec![local_ip])?;
//! bridge.add_peer(Some("b"), peer_key, &[peer_ip]);
//!
//! let stream = stack.connect("b", 80).await?;
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod queue;
pub mod registry;
pub mod source_sink;
pub mod stack;
mod sync;
pub mod tcp;

pub use config::NetstackConfig;
pub use endpoint::{LinkEndpoint, LinkNotify, LinkStats};
pub use error::{BatchError, BatchResult, ConfigError, NetstackError, Result};
pub use packet::OutboundPacket;
pub use queue::{DeliveryNotifier, DeliveryQueue};
pub use registry::PeerRegistry;
pub use source_sink::{NetstackBridge, SourceSink};
pub use stack::Netstack;
pub use tcp::{TcpListener, TcpStream};
