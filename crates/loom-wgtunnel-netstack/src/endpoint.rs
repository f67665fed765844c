// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The link endpoint the stack uses as its only network card.
//!
//! Outbound packets land in a bounded queue and are announced to a registered
//! [`LinkNotify`] listener; inbound packets are queued by [`LinkEndpoint::inject_inbound`]
//! and consumed by the stack on its next poll.

use crate::error::{NetstackError, Result};
use crate::packet::OutboundPacket;
use crate::sync::lock;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::IpVersion;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Listener fired once for every packet the stack enqueues for transmission.
pub trait LinkNotify: Send + Sync {
	fn write_notify(&self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
	pub outbound_queued: u64,
	pub outbound_dropped: u64,
	pub inbound_injected: u64,
	pub inbound_dropped: u64,
}

#[derive(Default)]
struct Counters {
	outbound_queued: AtomicU64,
	outbound_dropped: AtomicU64,
	inbound_injected: AtomicU64,
	inbound_dropped: AtomicU64,
}

struct InboundPacket {
	version: IpVersion,
	data: Vec<u8>,
}

#[derive(Default)]
struct Queues {
	outbound: VecDeque<OutboundPacket>,
	inbound: VecDeque<InboundPacket>,
	pending_notifies: usize,
}

pub struct LinkEndpoint {
	mtu: usize,
	capacity: usize,
	queues: Mutex<Queues>,
	notify: Mutex<Option<Arc<dyn LinkNotify>>>,
	closed: AtomicBool,
	counters: Counters,
}

impl LinkEndpoint {
	pub fn new(capacity: usize, mtu: u16) -> Self {
		Self {
			mtu: mtu as usize,
			capacity,
			queues: Mutex::new(Queues::default()),
			notify: Mutex::new(None),
			closed: AtomicBool::new(false),
			counters: Counters::default(),
		}
	}

	pub fn mtu(&self) -> usize {
		self.mtu
	}

	pub fn add_notify(&self, notify: Arc<dyn LinkNotify>) {
		*lock(&self.notify) = Some(notify);
	}

	/// Takes the oldest outbound packet, if any.
	pub fn read(&self) -> Option<OutboundPacket> {
		lock(&self.queues).outbound.pop_front()
	}

	pub fn outbound_len(&self) -> usize {
		lock(&self.queues).outbound.len()
	}

	fn outbound_full(&self) -> bool {
		lock(&self.queues).outbound.len() >= self.capacity
	}

	pub(crate) fn enqueue_outbound(&self, data: Vec<u8>) {
		if self.is_closed() {
			trace!(len = data.len(), "endpoint closed, discarding outbound packet");
			return;
		}

		let mut queues = lock(&self.queues);
		if queues.outbound.len() >= self.capacity {
			warn!(queue = "outbound", "packet queue full, dropping oldest packet");
			queues.outbound.pop_front();
			self.counters.outbound_dropped.fetch_add(1, Ordering::Relaxed);
		}
		queues.outbound.push_back(OutboundPacket::new(data));
		queues.pending_notifies += 1;
		self.counters.outbound_queued.fetch_add(1, Ordering::Relaxed);
	}

	/// Fires the listener once per packet enqueued since the last call.
	///
	/// Runs outside the stack lock; a listener that blocks stalls the caller
	/// until it returns.
	pub fn dispatch_notifications(&self) {
		let pending = std::mem::take(&mut lock(&self.queues).pending_notifies);
		if pending == 0 {
			return;
		}

		let Some(notify) = lock(&self.notify).clone() else {
			return;
		};
		for _ in 0..pending {
			if self.is_closed() {
				break;
			}
			notify.write_notify();
		}
	}

	/// Queues a packet as if it had arrived on the wire.
	pub fn inject_inbound(&self, version: IpVersion, data: Vec<u8>) -> Result<()> {
		if self.is_closed() {
			return Err(NetstackError::Closed);
		}

		let mut queues = lock(&self.queues);
		if queues.inbound.len() >= self.capacity {
			warn!(queue = "inbound", "packet queue full, dropping oldest packet");
			queues.inbound.pop_front();
			self.counters.inbound_dropped.fetch_add(1, Ordering::Relaxed);
		}
		trace!(len = data.len(), ?version, "injecting inbound packet");
		queues.inbound.push_back(InboundPacket { version, data });
		self.counters.inbound_injected.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	fn take_inbound(&self) -> Option<InboundPacket> {
		lock(&self.queues).inbound.pop_front()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Drops every queued packet and detaches the listener.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		let dropped = {
			let mut queues = lock(&self.queues);
			let dropped = queues.outbound.len() + queues.inbound.len();
			queues.outbound.clear();
			queues.inbound.clear();
			queues.pending_notifies = 0;
			dropped
		};
		lock(&self.notify).take();
		debug!(dropped, "closed link endpoint");
	}

	pub fn stats(&self) -> LinkStats {
		LinkStats {
			outbound_queued: self.counters.outbound_queued.load(Ordering::Relaxed),
			outbound_dropped: self.counters.outbound_dropped.load(Ordering::Relaxed),
			inbound_injected: self.counters.inbound_injected.load(Ordering::Relaxed),
			inbound_dropped: self.counters.inbound_dropped.load(Ordering::Relaxed),
		}
	}
}

/// smoltcp view of a [`LinkEndpoint`].
pub(crate) struct LinkDevice {
	endpoint: Arc<LinkEndpoint>,
}

impl LinkDevice {
	pub(crate) fn new(endpoint: Arc<LinkEndpoint>) -> Self {
		Self { endpoint }
	}
}

pub(crate) struct LinkRxToken {
	packet: InboundPacket,
}

impl RxToken for LinkRxToken {
	fn consume<R, F>(mut self, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		trace!(len = self.packet.data.len(), version = ?self.packet.version, "stack consuming inbound packet");
		f(&mut self.packet.data)
	}
}

pub(crate) struct LinkTxToken<'a> {
	endpoint: &'a LinkEndpoint,
}

impl<'a> TxToken for LinkTxToken<'a> {
	fn consume<R, F>(self, len: usize, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		let mut buffer = vec![0u8; len];
		let result = f(&mut buffer);
		self.endpoint.enqueue_outbound(buffer);
		result
	}
}

impl Device for LinkDevice {
	type RxToken<'a> = LinkRxToken;
	type TxToken<'a> = LinkTxToken<'a>;

	fn receive(
		&mut self,
		_timestamp: SmoltcpInstant,
	) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
		let packet = self.endpoint.take_inbound()?;
		Some((
			LinkRxToken { packet },
			LinkTxToken {
				endpoint: &self.endpoint,
			},
		))
	}

	fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
		// A full queue defers transmission to a later poll instead of dropping.
		if self.endpoint.outbound_full() {
			return None;
		}
		Some(LinkTxToken {
			endpoint: &self.endpoint,
		})
	}

	fn capabilities(&self) -> DeviceCapabilities {
		let mut caps = DeviceCapabilities::default();
		caps.max_transmission_unit = self.endpoint.mtu;
		caps.medium = Medium::Ip;
		caps
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packet::tests::ipv4_packet;
	use std::sync::atomic::AtomicUsize;

	struct CountingNotify {
		calls: AtomicUsize,
	}

	impl LinkNotify for CountingNotify {
		fn write_notify(&self) {
			self.calls.fetch_add(1, Ordering::SeqCst);
		}
	}

	fn v4() -> Vec<u8> {
		ipv4_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap())
	}

	#[test]
	fn test_outbound_fifo_and_notify() {
		let endpoint = LinkEndpoint::new(8, 1420);
		let notify = Arc::new(CountingNotify {
			calls: AtomicUsize::new(0),
		});
		endpoint.add_notify(notify.clone());

		let mut first = v4();
		first[8] = 1;
		let second = v4();
		endpoint.enqueue_outbound(first.clone());
		endpoint.enqueue_outbound(second.clone());
		endpoint.dispatch_notifications();

		assert_eq!(notify.calls.load(Ordering::SeqCst), 2);
		assert_eq!(endpoint.read().unwrap().data, first);
		assert_eq!(endpoint.read().unwrap().data, second);
		assert!(endpoint.read().is_none());

		endpoint.dispatch_notifications();
		assert_eq!(notify.calls.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn test_outbound_tagged_with_version() {
		let endpoint = LinkEndpoint::new(8, 1420);
		endpoint.enqueue_outbound(v4());
		assert_eq!(endpoint.read().unwrap().version, Some(IpVersion::Ipv4));
	}

	#[test]
	fn test_outbound_overflow_drops_oldest() {
		let endpoint = LinkEndpoint::new(2, 1420);
		for i in 0..3u8 {
			endpoint.enqueue_outbound(vec![0x45, i]);
		}

		assert_eq!(endpoint.outbound_len(), 2);
		assert_eq!(endpoint.read().unwrap().data, vec![0x45, 1]);
		assert_eq!(endpoint.stats().outbound_dropped, 1);
		assert_eq!(endpoint.stats().outbound_queued, 3);
	}

	#[test]
	fn test_transmit_refused_when_full() {
		let endpoint = Arc::new(LinkEndpoint::new(1, 1420));
		let mut device = LinkDevice::new(endpoint.clone());
		let now = SmoltcpInstant::from_millis(0);

		assert!(device.transmit(now).is_some());
		endpoint.enqueue_outbound(v4());
		assert!(device.transmit(now).is_none());
	}

	#[test]
	fn test_inject_inbound_feeds_device() {
		let endpoint = Arc::new(LinkEndpoint::new(8, 1420));
		let mut device = LinkDevice::new(endpoint.clone());
		let now = SmoltcpInstant::from_millis(0);

		assert!(device.receive(now).is_none());

		endpoint.inject_inbound(IpVersion::Ipv4, v4()).unwrap();
		let (rx, _tx) = device.receive(now).unwrap();
		let len = rx.consume(|buf| buf.len());

		assert_eq!(len, 20);
		assert_eq!(endpoint.stats().inbound_injected, 1);
	}

	#[test]
	fn test_close_rejects_and_discards() {
		let endpoint = LinkEndpoint::new(8, 1420);
		let notify = Arc::new(CountingNotify {
			calls: AtomicUsize::new(0),
		});
		endpoint.add_notify(notify.clone());
		endpoint.enqueue_outbound(v4());

		endpoint.close();

		assert!(endpoint.is_closed());
		assert!(endpoint.read().is_none());
		assert!(matches!(
			endpoint.inject_inbound(IpVersion::Ipv4, v4()),
			Err(NetstackError::Closed)
		));
		endpoint.enqueue_outbound(v4());
		endpoint.dispatch_notifications();
		assert_eq!(notify.calls.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn test_device_capabilities() {
		let device = LinkDevice::new(Arc::new(LinkEndpoint::new(8, 1280)));
		let caps = device.capabilities();
		assert_eq!(caps.medium, Medium::Ip);
		assert_eq!(caps.max_transmission_unit, 1280);
	}
}
