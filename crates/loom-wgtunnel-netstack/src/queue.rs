// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::endpoint::{LinkEndpoint, LinkNotify};
use crate::error::{NetstackError, Result};
use crate::packet::OutboundPacket;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Handoff between the link notifier and the packet source.
///
/// The channel holds a single packet, so a sender waits until the reader has
/// taken the previous one. Closing wakes both sides.
pub struct DeliveryQueue {
	tx: mpsc::Sender<OutboundPacket>,
	rx: Mutex<mpsc::Receiver<OutboundPacket>>,
	closed: CancellationToken,
}

impl DeliveryQueue {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Self {
			tx,
			rx: Mutex::new(rx),
			closed: CancellationToken::new(),
		}
	}

	/// Sends from a thread outside the async runtime, waiting for room.
	pub fn send_blocking(&self, packet: OutboundPacket) -> Result<()> {
		futures::executor::block_on(self.send(packet))
	}

	pub async fn send(&self, packet: OutboundPacket) -> Result<()> {
		tokio::select! {
			biased;

			_ = self.closed.cancelled() => Err(NetstackError::Closed),
			result = self.tx.send(packet) => result.map_err(|_| NetstackError::Closed),
		}
	}

	/// Exclusive access to the receiving side for the duration of one batch.
	pub async fn receiver(&self) -> DeliveryReceiver<'_> {
		DeliveryReceiver {
			rx: self.rx.lock().await,
			closed: &self.closed,
		}
	}

	pub fn close(&self) {
		self.closed.cancel();
	}
}

impl Default for DeliveryQueue {
	fn default() -> Self {
		Self::new()
	}
}

pub struct DeliveryReceiver<'a> {
	rx: MutexGuard<'a, mpsc::Receiver<OutboundPacket>>,
	closed: &'a CancellationToken,
}

impl DeliveryReceiver<'_> {
	/// Waits for the next packet; `None` once the queue is closed.
	pub async fn recv(&mut self) -> Option<OutboundPacket> {
		tokio::select! {
			biased;

			_ = self.closed.cancelled() => None,
			packet = self.rx.recv() => packet,
		}
	}

	/// Takes a packet only if one is already waiting.
	pub fn try_recv(&mut self) -> Result<Option<OutboundPacket>> {
		if self.closed.is_cancelled() {
			return Err(NetstackError::Closed);
		}
		match self.rx.try_recv() {
			Ok(packet) => Ok(Some(packet)),
			Err(TryRecvError::Empty) => Ok(None),
			Err(TryRecvError::Disconnected) => Err(NetstackError::Closed),
		}
	}
}

/// Moves one packet from the link endpoint into the delivery queue per
/// notification.
pub struct DeliveryNotifier {
	endpoint: Weak<LinkEndpoint>,
	queue: Arc<DeliveryQueue>,
}

impl DeliveryNotifier {
	pub fn new(endpoint: &Arc<LinkEndpoint>, queue: Arc<DeliveryQueue>) -> Self {
		Self {
			endpoint: Arc::downgrade(endpoint),
			queue,
		}
	}
}

impl LinkNotify for DeliveryNotifier {
	fn write_notify(&self) {
		let Some(endpoint) = self.endpoint.upgrade() else {
			return;
		};
		let Some(packet) = endpoint.read() else {
			return;
		};

		let len = packet.len();
		if self.queue.send_blocking(packet).is_err() {
			trace!(len, "delivery queue closed, dropping outbound packet");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn packet(tag: u8) -> OutboundPacket {
		OutboundPacket::new(vec![0x45, tag])
	}

	#[tokio::test]
	async fn test_send_then_recv() {
		let queue = DeliveryQueue::new();
		queue.send(packet(1)).await.unwrap();

		let mut rx = queue.receiver().await;
		assert_eq!(rx.recv().await.unwrap().data, vec![0x45, 1]);
		assert!(rx.try_recv().unwrap().is_none());
	}

	#[tokio::test]
	async fn test_recv_after_close_is_none() {
		let queue = DeliveryQueue::new();
		queue.send(packet(1)).await.unwrap();
		queue.close();

		let mut rx = queue.receiver().await;
		assert!(rx.recv().await.is_none());
		assert!(matches!(rx.try_recv(), Err(NetstackError::Closed)));
	}

	#[tokio::test]
	async fn test_close_wakes_blocked_receiver() {
		let queue = Arc::new(DeliveryQueue::new());
		let reader = {
			let queue = Arc::clone(&queue);
			tokio::spawn(async move { queue.receiver().await.recv().await })
		};

		tokio::time::sleep(Duration::from_millis(20)).await;
		queue.close();

		let result = tokio::time::timeout(Duration::from_secs(5), reader)
			.await
			.unwrap()
			.unwrap();
		assert!(result.is_none());
	}

	#[test]
	fn test_close_unblocks_waiting_sender() {
		let queue = Arc::new(DeliveryQueue::new());
		queue.send_blocking(packet(1)).unwrap();

		let sender = {
			let queue = Arc::clone(&queue);
			std::thread::spawn(move || queue.send_blocking(packet(2)))
		};

		std::thread::sleep(Duration::from_millis(20));
		queue.close();

		assert!(matches!(sender.join().unwrap(), Err(NetstackError::Closed)));
	}

	#[test]
	fn test_blocking_handoff_preserves_order() {
		let queue = Arc::new(DeliveryQueue::new());
		let sender = {
			let queue = Arc::clone(&queue);
			std::thread::spawn(move || {
				for tag in 0..16u8 {
					queue.send_blocking(packet(tag)).unwrap();
				}
			})
		};

		let received: Vec<u8> = futures::executor::block_on(async {
			let mut rx = queue.receiver().await;
			let mut out = Vec::new();
			while out.len() < 16 {
				out.push(rx.recv().await.unwrap().data[1]);
			}
			out
		});
		sender.join().unwrap();

		assert_eq!(received, (0..16u8).collect::<Vec<_>>());
	}

	#[test]
	fn test_notifier_moves_one_packet_per_call() {
		let endpoint = Arc::new(LinkEndpoint::new(8, 1420));
		let queue = Arc::new(DeliveryQueue::new());
		endpoint.enqueue_outbound(vec![0x45, 1]);
		endpoint.enqueue_outbound(vec![0x45, 2]);

		let notifier = DeliveryNotifier::new(&endpoint, Arc::clone(&queue));
		notifier.write_notify();

		assert_eq!(endpoint.outbound_len(), 1);
		let mut rx = tokio_test::block_on(queue.receiver());
		assert_eq!(rx.try_recv().unwrap().unwrap().data, vec![0x45, 1]);
		assert!(rx.try_recv().unwrap().is_none());
	}

	#[test]
	fn test_notifier_drops_packet_after_close() {
		let endpoint = Arc::new(LinkEndpoint::new(8, 1420));
		let queue = Arc::new(DeliveryQueue::new());
		endpoint.enqueue_outbound(vec![0x45, 1]);
		queue.close();

		DeliveryNotifier::new(&endpoint, Arc::clone(&queue)).write_notify();

		assert_eq!(endpoint.outbound_len(), 0);
	}
}
