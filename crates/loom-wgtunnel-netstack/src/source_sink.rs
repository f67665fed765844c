// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The packet source and sink the WireGuard transport drives.
//!
//! Packets the stack emits are read in batches and tagged with the peer that
//! owns their destination address. Decrypted packets handed to `write` are
//! injected into the stack as inbound traffic.

use crate::config::NetstackConfig;
use crate::endpoint::{LinkEndpoint, LinkStats};
use crate::error::{BatchError, BatchResult, NetstackError, Result};
use crate::packet::{ip_version, version_nibble, OutboundPacket};
use crate::queue::{DeliveryNotifier, DeliveryQueue};
use crate::registry::PeerRegistry;
use crate::stack::Netstack;
use crate::sync::{lock, read, write};
use async_trait::async_trait;
use loom_wgtunnel_common::{PeerConfig, WgPublicKey};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use tracing::{debug, info, instrument, trace};

/// Batched packet exchange between a tunnel transport and a network stack.
#[async_trait]
pub trait SourceSink: Send + Sync {
	/// Waits for at least one outbound packet, then fills as many of the
	/// given slots as are ready without waiting again. Each packet is copied
	/// into `bufs[i][offset..]` with its length in `sizes[i]` and its peer in
	/// `destinations[i]`.
	async fn read(
		&self,
		bufs: &mut [&mut [u8]],
		sizes: &mut [usize],
		destinations: &mut [WgPublicKey],
		offset: usize,
	) -> BatchResult;

	/// Hands decrypted packets, starting at `offset` in each buffer, to the
	/// stack. `destinations` names the sending peers and is not consulted.
	fn write(&self, bufs: &[&[u8]], destinations: &[WgPublicKey], offset: usize) -> BatchResult;

	fn batch_size(&self) -> usize;

	fn close(&self) -> Result<()>;
}

pub struct NetstackBridge {
	public_key: WgPublicKey,
	stack: Netstack,
	endpoint: Arc<LinkEndpoint>,
	delivery: Arc<DeliveryQueue>,
	registry: Arc<RwLock<PeerRegistry>>,
	worker: Mutex<Option<JoinHandle<()>>>,
	batch_size: usize,
	closed: AtomicBool,
}

impl NetstackBridge {
	/// Builds the stack and starts its worker. Returns the bridge for the
	/// transport and a [`Netstack`] handle for application sockets.
	#[instrument(skip_all, fields(name = %config.local_name, peer = %config.public_key))]
	pub fn new(config: NetstackConfig) -> Result<(Self, Netstack)> {
		let public_key = config.public_key;
		let batch_size = config.batch_size;

		let endpoint = Arc::new(LinkEndpoint::new(config.queue_size, config.mtu));
		let delivery = Arc::new(DeliveryQueue::new());
		let registry = Arc::new(RwLock::new(PeerRegistry::new()));

		let stack = Netstack::build(config, Arc::clone(&endpoint), Arc::clone(&registry))?;
		endpoint.add_notify(Arc::new(DeliveryNotifier::new(
			&endpoint,
			Arc::clone(&delivery),
		)));
		let worker = stack.start()?;

		info!(
			addresses = ?stack.local_addrs(),
			mtu = stack.mtu(),
			"created netstack bridge"
		);

		let bridge = Self {
			public_key,
			stack: stack.clone(),
			endpoint,
			delivery,
			registry,
			worker: Mutex::new(Some(worker)),
			batch_size,
			closed: AtomicBool::new(false),
		};
		Ok((bridge, stack))
	}

	pub fn with_addresses(
		local_name: impl Into<String>,
		public_key: WgPublicKey,
		addresses: Vec<IpAddr>,
	) -> Result<(Self, Netstack)> {
		Self::new(NetstackConfig::new(local_name, public_key, addresses))
	}

	pub fn add_peer(&self, name: Option<&str>, peer: WgPublicKey, addresses: &[IpAddr]) {
		write(&self.registry).add_peer(name, peer, addresses);
	}

	pub fn add_peer_config(&self, peer: &PeerConfig) {
		self.add_peer(peer.display_name(), peer.public_key, &peer.addresses);
	}

	pub fn resolve_peer(&self, addr: &IpAddr) -> Option<WgPublicKey> {
		read(&self.registry).resolve(addr)
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public_key
	}

	pub fn netstack(&self) -> &Netstack {
		&self.stack
	}

	pub fn link_stats(&self) -> LinkStats {
		self.endpoint.stats()
	}

	fn fill(
		&self,
		packet: OutboundPacket,
		buf: &mut [u8],
		size: &mut usize,
		destination: &mut WgPublicKey,
		offset: usize,
	) -> Result<()> {
		let dst = packet.destination()?;
		let Some(peer) = self.resolve_peer(&dst) else {
			debug!(%dst, len = packet.len(), "no peer for destination, dropping packet");
			return Err(NetstackError::UnresolvedDestination(dst));
		};

		let available = buf.len().saturating_sub(offset);
		if packet.len() > available {
			return Err(NetstackError::BufferTooSmall {
				needed: packet.len(),
				available,
			});
		}

		buf[offset..offset + packet.len()].copy_from_slice(&packet.data);
		*size = packet.len();
		*destination = peer;
		trace!(%dst, %peer, len = packet.len(), "read outbound packet");
		Ok(())
	}

	/// Fills slots starting with `first`, pulling further packets from `next`
	/// until it yields nothing or every slot is used.
	fn fill_batch<F>(
		&self,
		first: OutboundPacket,
		mut next: F,
		bufs: &mut [&mut [u8]],
		sizes: &mut [usize],
		destinations: &mut [WgPublicKey],
		offset: usize,
	) -> BatchResult
	where
		F: FnMut() -> Result<Option<OutboundPacket>>,
	{
		let capacity = bufs.len().min(sizes.len()).min(destinations.len());
		let mut packet = first;
		let mut count = 0;

		while count < capacity {
			self
				.fill(
					packet,
					&mut *bufs[count],
					&mut sizes[count],
					&mut destinations[count],
					offset,
				)
				.map_err(|e| BatchError::new(count, e))?;
			count += 1;
			if count == capacity {
				break;
			}

			packet = match next() {
				Ok(Some(packet)) => packet,
				Ok(None) => break,
				Err(e) => return Err(BatchError::new(count, e)),
			};
		}

		Ok(count)
	}

	fn inject(&self, bufs: &[&[u8]], offset: usize) -> BatchResult {
		if self.endpoint.is_closed() {
			return Err(BatchError::new(0, NetstackError::Closed));
		}

		for (i, buf) in bufs.iter().enumerate() {
			let Some(payload) = buf.get(offset..).filter(|p| !p.is_empty()) else {
				continue;
			};
			let Some(version) = ip_version(payload) else {
				let nibble = version_nibble(payload).unwrap_or_default();
				return Err(BatchError::new(
					i,
					NetstackError::UnsupportedAddressFamily(nibble),
				));
			};
			self
				.endpoint
				.inject_inbound(version, payload.to_vec())
				.map_err(|e| BatchError::new(i, e))?;
		}

		Ok(bufs.len())
	}
}

#[async_trait]
impl SourceSink for NetstackBridge {
	async fn read(
		&self,
		bufs: &mut [&mut [u8]],
		sizes: &mut [usize],
		destinations: &mut [WgPublicKey],
		offset: usize,
	) -> BatchResult {
		let capacity = bufs.len().min(sizes.len()).min(destinations.len());
		if capacity == 0 {
			return Ok(0);
		}

		let mut rx = self.delivery.receiver().await;
		let Some(first) = rx.recv().await else {
			return Err(BatchError::new(0, NetstackError::Closed));
		};
		self.fill_batch(first, || rx.try_recv(), bufs, sizes, destinations, offset)
	}

	fn write(&self, bufs: &[&[u8]], _destinations: &[WgPublicKey], offset: usize) -> BatchResult {
		let result = self.inject(bufs, offset);
		self.stack.shared.kick();
		result
	}

	fn batch_size(&self) -> usize {
		self.batch_size
	}

	#[instrument(skip_all, fields(peer = %self.public_key))]
	fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}

		self.stack.shared.remove_nic();
		self.stack.shared.shutdown();
		self.endpoint.close();
		self.delivery.close();

		let worker = lock(&self.worker).take();
		if let Some(worker) = worker {
			worker
				.join()
				.map_err(|_| NetstackError::Teardown("netstack worker panicked".to_string()))?;
		}

		info!("closed netstack bridge");
		Ok(())
	}
}

impl Drop for NetstackBridge {
	fn drop(&mut self) {
		if let Err(e) = self.close() {
			tracing::warn!(error = %e, "failed to close netstack bridge");
		}
	}
}

impl std::fmt::Debug for NetstackBridge {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NetstackBridge")
			.field("public_key", &self.public_key)
			.field("stack", &self.stack)
			.field("batch_size", &self.batch_size)
			.field("closed", &self.closed.load(Ordering::Relaxed))
			.finish()
	}
}
