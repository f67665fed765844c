// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::ConfigError;
use loom_wgtunnel_common::WgPublicKey;
use std::net::IpAddr;
use std::time::Duration;

/// MTU of the tunnel interface; leaves room for the outer IP/UDP and
/// transport headers inside a 1500 byte frame.
pub const DEFAULT_MTU: u16 = 1420;

/// Capacity of the link endpoint's outbound queue.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

/// Number of packets the transport should move per read/write call.
pub const DEFAULT_BATCH_SIZE: usize = 128;

pub const DEFAULT_TCP_BUFFER_SIZE: usize = 65536;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const MIN_IPV4_MTU: u16 = 576;
const MIN_IPV6_MTU: u16 = 1280;

#[derive(Debug, Clone)]
pub struct NetstackConfig {
	pub local_name: String,
	pub public_key: WgPublicKey,
	pub addresses: Vec<IpAddr>,
	pub mtu: u16,
	pub queue_size: usize,
	pub batch_size: usize,
	pub tcp_rx_buffer_size: usize,
	pub tcp_tx_buffer_size: usize,
	pub tcp_nagle: bool,
	pub tcp_keep_alive: Option<Duration>,
	pub connect_timeout: Duration,
}

impl NetstackConfig {
	pub fn new(
		local_name: impl Into<String>,
		public_key: WgPublicKey,
		addresses: Vec<IpAddr>,
	) -> Self {
		Self {
			local_name: local_name.into(),
			public_key,
			addresses,
			mtu: DEFAULT_MTU,
			queue_size: DEFAULT_QUEUE_SIZE,
			batch_size: DEFAULT_BATCH_SIZE,
			tcp_rx_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
			tcp_tx_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
			tcp_nagle: false,
			tcp_keep_alive: None,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
		}
	}

	pub fn from_env(public_key: WgPublicKey) -> Result<Self, ConfigError> {
		Self::from_lookup(public_key, |name| std::env::var(name).ok())
	}

	fn from_lookup<F>(public_key: WgPublicKey, lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let local_name = lookup("LOOM_WG_NAME").unwrap_or_default();

		let addresses = lookup("LOOM_WG_ADDRESSES")
			.ok_or_else(|| ConfigError::MissingEnv("LOOM_WG_ADDRESSES".to_string()))?
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(|s| {
				s.parse::<IpAddr>()
					.map_err(|e| ConfigError::Parse(format!("invalid LOOM_WG_ADDRESSES entry {s:?}: {e}")))
			})
			.collect::<Result<Vec<_>, _>>()?;

		let mut config = Self::new(local_name, public_key, addresses);

		if let Some(mtu) = parse_var(&lookup, "LOOM_WG_MTU")? {
			config.mtu = mtu;
		}
		if let Some(queue_size) = parse_var(&lookup, "LOOM_WG_QUEUE_SIZE")? {
			config.queue_size = queue_size;
		}
		if let Some(batch_size) = parse_var(&lookup, "LOOM_WG_BATCH_SIZE")? {
			config.batch_size = batch_size;
		}

		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.queue_size == 0 {
			return Err(ConfigError::Invalid("queue size must be non-zero".to_string()));
		}
		if self.batch_size == 0 {
			return Err(ConfigError::Invalid("batch size must be non-zero".to_string()));
		}
		if self.tcp_rx_buffer_size == 0 || self.tcp_tx_buffer_size == 0 {
			return Err(ConfigError::Invalid(
				"TCP buffer sizes must be non-zero".to_string(),
			));
		}
		if self.mtu < MIN_IPV4_MTU {
			return Err(ConfigError::Invalid(format!(
				"MTU {} is below the IPv4 minimum of {MIN_IPV4_MTU}",
				self.mtu
			)));
		}
		if self.addresses.iter().any(IpAddr::is_ipv6) && self.mtu < MIN_IPV6_MTU {
			return Err(ConfigError::Invalid(format!(
				"MTU {} is below the IPv6 minimum of {MIN_IPV6_MTU}",
				self.mtu
			)));
		}
		Ok(())
	}
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
	F: Fn(&str) -> Option<String>,
	T: std::str::FromStr,
	T::Err: std::fmt::Display,
{
	lookup(name)
		.map(|value| {
			value
				.trim()
				.parse()
				.map_err(|e| ConfigError::Parse(format!("invalid {name}: {e}")))
		})
		.transpose()
}
