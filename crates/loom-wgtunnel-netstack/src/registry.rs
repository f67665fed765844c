// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_wgtunnel_common::WgPublicKey;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, instrument, warn};

/// Maps peer names and tunnel addresses to peer keys.
///
/// `by_address` is kept as an exact reverse view of `addresses`: an address
/// appears in at most one peer's list and always resolves to that peer.
#[derive(Debug, Default)]
pub struct PeerRegistry {
	names: HashMap<String, WgPublicKey>,
	addresses: HashMap<WgPublicKey, Vec<IpAddr>>,
	by_address: HashMap<IpAddr, WgPublicKey>,
}

impl PeerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	#[instrument(skip_all, fields(peer = %peer, name = name.unwrap_or("")))]
	pub fn add_peer(&mut self, name: Option<&str>, peer: WgPublicKey, addresses: &[IpAddr]) {
		if let Some(name) = name.filter(|n| !n.is_empty()) {
			if let Some(previous) = self.names.insert(name.to_string(), peer) {
				if previous != peer {
					warn!(old_peer = %previous, "peer name reassigned to different peer");
				}
			}
		}

		// Peers without addresses are still known by key.
		self.addresses.entry(peer).or_default();

		for &addr in addresses {
			if let Some(existing) = self.by_address.insert(addr, peer) {
				if existing == peer {
					continue;
				}
				warn!(
					%addr,
					old_peer = %existing,
					"address reassigned to different peer"
				);
				if let Some(owned) = self.addresses.get_mut(&existing) {
					owned.retain(|a| *a != addr);
				}
			}
			self.addresses.entry(peer).or_default().push(addr);
		}

		debug!(count = addresses.len(), "registered peer addresses");
	}

	pub fn resolve(&self, addr: &IpAddr) -> Option<WgPublicKey> {
		self.by_address.get(addr).copied()
	}

	pub fn peer_by_name(&self, name: &str) -> Option<WgPublicKey> {
		self.names.get(name).copied()
	}

	pub fn addresses_of(&self, peer: &WgPublicKey) -> &[IpAddr] {
		self.addresses.get(peer).map(Vec::as_slice).unwrap_or(&[])
	}

	pub fn peer_count(&self) -> usize {
		self.addresses.len()
	}

	pub fn address_count(&self) -> usize {
		self.by_address.len()
	}
}
