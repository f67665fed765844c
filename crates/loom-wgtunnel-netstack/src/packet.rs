// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{NetstackError, Result};
use smoltcp::wire::{IpVersion, Ipv4Packet, Ipv6Packet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An IP packet emitted by the stack, tagged with the network protocol that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
	pub version: Option<IpVersion>,
	pub data: Vec<u8>,
}

impl OutboundPacket {
	pub fn new(data: Vec<u8>) -> Self {
		Self {
			version: ip_version(&data),
			data,
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.data.len()
	}

	/// Destination address from the network header, after checking the
	/// header against the packet length.
	pub fn destination(&self) -> Result<IpAddr> {
		match self.version {
			Some(IpVersion::Ipv4) => {
				let hdr = Ipv4Packet::new_checked(self.data.as_slice())
					.map_err(|_| NetstackError::MalformedPacket("invalid IPv4 header"))?;
				Ok(IpAddr::V4(Ipv4Addr::from(hdr.dst_addr().0)))
			}
			Some(IpVersion::Ipv6) => {
				let hdr = Ipv6Packet::new_checked(self.data.as_slice())
					.map_err(|_| NetstackError::MalformedPacket("invalid IPv6 header"))?;
				Ok(IpAddr::V6(Ipv6Addr::from(hdr.dst_addr().0)))
			}
			None => Err(NetstackError::MalformedPacket("unknown network protocol")),
		}
	}
}

/// Leading nibble of the first byte, if there is one.
pub fn version_nibble(data: &[u8]) -> Option<u8> {
	data.first().map(|b| b >> 4)
}

pub fn ip_version(data: &[u8]) -> Option<IpVersion> {
	match version_nibble(data)? {
		4 => Some(IpVersion::Ipv4),
		6 => Some(IpVersion::Ipv6),
		_ => None,
	}
}
