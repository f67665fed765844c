// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetstackError {
	#[error("stack configuration failed: {0}")]
	StackConfiguration(String),

	#[error("malformed packet: {0}")]
	MalformedPacket(&'static str),

	#[error("unknown destination address: {0}")]
	UnresolvedDestination(IpAddr),

	#[error("address family not supported: IP version {0}")]
	UnsupportedAddressFamily(u8),

	#[error("buffer too small: packet needs {needed} bytes, {available} available")]
	BufferTooSmall { needed: usize, available: usize },

	#[error("netstack closed")]
	Closed,

	#[error("unknown host: {0}")]
	UnknownHost(String),

	#[error("TCP connect failed: {0}")]
	TcpConnect(String),

	#[error("TCP listen failed: {0}")]
	TcpListen(String),

	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("teardown failed: {0}")]
	Teardown(String),
}

impl NetstackError {
	pub fn is_closed(&self) -> bool {
		matches!(self, NetstackError::Closed)
	}
}

/// Failure of a batch read or write, carrying how many entries of the batch
/// were handled before the failing one.
#[derive(Debug, Error)]
#[error("{source} (after {count} packets)")]
pub struct BatchError {
	pub count: usize,
	#[source]
	pub source: NetstackError,
}

impl BatchError {
	pub fn new(count: usize, source: NetstackError) -> Self {
		Self { count, source }
	}

	pub fn is_closed(&self) -> bool {
		self.source.is_closed()
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("missing environment variable: {0}")]
	MissingEnv(String),

	#[error("parse error: {0}")]
	Parse(String),

	#[error("invalid value: {0}")]
	Invalid(String),
}

pub type Result<T> = std::result::Result<T, NetstackError>;

pub type BatchResult = std::result::Result<usize, BatchError>;
