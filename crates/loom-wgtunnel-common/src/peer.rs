// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A remote peer as registered with a netstack: its key, an optional
/// display name and the addresses it owns inside the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub public_key: WgPublicKey,
	#[serde(default)]
	pub addresses: Vec<IpAddr>,
}

impl PeerConfig {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			name: None,
			public_key,
			addresses: Vec::new(),
		}
	}

	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn with_address(mut self, address: IpAddr) -> Self {
		self.addresses.push(address);
		self
	}

	/// The display name, treating an empty string as no name.
	pub fn display_name(&self) -> Option<&str> {
		self.name.as_deref().filter(|n| !n.is_empty())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::keys::WgKeyPair;

	#[test]
	fn peer_config_serialization() {
		let keypair = WgKeyPair::generate();
		let peer = PeerConfig::new(*keypair.public_key())
			.with_name("b")
			.with_address("10.0.0.2".parse().unwrap())
			.with_address("fd7a:115c:a1e0::2".parse().unwrap());

		let json = serde_json::to_string(&peer).unwrap();
		let deserialized: PeerConfig = serde_json::from_str(&json).unwrap();

		assert_eq!(peer, deserialized);
	}

	#[test]
	fn peer_config_defaults_when_fields_missing() {
		let keypair = WgKeyPair::generate();
		let json = format!(r#"{{"public_key":"{}"}}"#, keypair.public_key());

		let peer: PeerConfig = serde_json::from_str(&json).unwrap();

		assert!(peer.name.is_none());
		assert!(peer.addresses.is_empty());
	}

	#[test]
	fn empty_name_is_not_a_display_name() {
		let keypair = WgKeyPair::generate();
		let peer = PeerConfig::new(*keypair.public_key()).with_name("");
		assert_eq!(peer.display_name(), None);

		let named = PeerConfig::new(*keypair.public_key()).with_name("b");
		assert_eq!(named.display_name(), Some("b"));
	}
}
