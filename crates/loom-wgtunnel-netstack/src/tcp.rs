// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{NetstackError, Result};
use crate::stack::{from_smoltcp, StackShared};
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::{Socket as TcpSocket, State as TcpState};
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

pub struct TcpListener {
	shared: Arc<StackShared>,
	handle: SocketHandle,
	port: u16,
}

impl TcpListener {
	pub(crate) fn new(shared: Arc<StackShared>, handle: SocketHandle, port: u16) -> Self {
		Self {
			shared,
			handle,
			port,
		}
	}

	/// Waits for an inbound connection. The listening socket becomes the
	/// returned stream and a fresh socket takes over listening.
	pub async fn accept(&mut self) -> Result<(TcpStream, SocketAddr)> {
		let (handle, remote) = poll_fn(|cx| self.poll_accept(cx)).await?;
		debug!(port = self.port, %remote, "accepted connection");
		Ok((TcpStream::new(Arc::clone(&self.shared), handle), remote))
	}

	fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<(SocketHandle, SocketAddr)>> {
		if self.shared.is_closed() {
			return Poll::Ready(Err(NetstackError::Closed));
		}

		let mut guard = self.shared.lock_inner();
		let inner = &mut *guard;
		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		match socket.state() {
			TcpState::Listen | TcpState::SynReceived => {
				inner.register_waker(cx.waker());
				Poll::Pending
			}
			TcpState::Closed => {
				if let Err(e) = socket.listen(self.port) {
					return Poll::Ready(Err(NetstackError::TcpListen(format!("listen failed: {}", e))));
				}
				inner.register_waker(cx.waker());
				Poll::Pending
			}
			_ => {
				let Some(remote) = socket.remote_endpoint() else {
					inner.register_waker(cx.waker());
					return Poll::Pending;
				};
				let remote = SocketAddr::new(from_smoltcp(remote.addr), remote.port);

				let mut replacement = self.shared.new_tcp_socket();
				if let Err(e) = replacement.listen(self.port) {
					return Poll::Ready(Err(NetstackError::TcpListen(format!("listen failed: {}", e))));
				}
				let accepted = std::mem::replace(&mut self.handle, inner.sockets.add(replacement));
				Poll::Ready(Ok((accepted, remote)))
			}
		}
	}

	pub fn local_port(&self) -> u16 {
		self.port
	}
}

impl std::fmt::Debug for TcpListener {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TcpListener").field("port", &self.port).finish()
	}
}

impl Drop for TcpListener {
	fn drop(&mut self) {
		let mut inner = self.shared.lock_inner();
		inner.sockets.get_mut::<TcpSocket>(self.handle).abort();
		inner.release(self.handle);
	}
}

pub struct TcpStream {
	shared: Arc<StackShared>,
	handle: SocketHandle,
}

impl TcpStream {
	pub(crate) fn new(shared: Arc<StackShared>, handle: SocketHandle) -> Self {
		Self { shared, handle }
	}

	pub(crate) async fn wait_connected(&self) -> Result<()> {
		poll_fn(|cx| {
			let mut inner = self.shared.lock_inner();
			let state = inner.sockets.get::<TcpSocket>(self.handle).state();
			match state {
				TcpState::Established | TcpState::CloseWait => Poll::Ready(Ok(())),
				TcpState::SynSent | TcpState::SynReceived => {
					inner.register_waker(cx.waker());
					Poll::Pending
				}
				state => Poll::Ready(Err(NetstackError::TcpConnect(format!(
					"connection failed in state {}",
					state
				)))),
			}
		})
		.await
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		let inner = self.shared.lock_inner();
		inner
			.sockets
			.get::<TcpSocket>(self.handle)
			.remote_endpoint()
			.map(|ep| SocketAddr::new(from_smoltcp(ep.addr), ep.port))
	}

	pub fn local_addr(&self) -> Option<SocketAddr> {
		let inner = self.shared.lock_inner();
		inner
			.sockets
			.get::<TcpSocket>(self.handle)
			.local_endpoint()
			.map(|ep| SocketAddr::new(from_smoltcp(ep.addr), ep.port))
	}
}

impl AsyncRead for TcpStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let mut guard = self.shared.lock_inner();
		let inner = &mut *guard;
		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_recv() {
			let n = socket
				.recv_slice(buf.initialize_unfilled())
				.map_err(|e| io::Error::other(format!("{}", e)))?;
			buf.advance(n);
			drop(guard);
			trace!(len = n, "read from virtual socket");
			// Window update.
			self.shared.kick();
			return Poll::Ready(Ok(()));
		}

		if socket.may_recv() {
			inner.register_waker(cx.waker());
			return Poll::Pending;
		}

		Poll::Ready(Ok(()))
	}
}

impl AsyncWrite for TcpStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let mut guard = self.shared.lock_inner();
		let inner = &mut *guard;
		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_send() {
			let n = socket
				.send_slice(buf)
				.map_err(|e| io::Error::other(format!("{}", e)))?;
			drop(guard);
			trace!(len = n, "wrote to virtual socket");
			self.shared.kick();
			return Poll::Ready(Ok(n));
		}

		if socket.may_send() {
			inner.register_waker(cx.waker());
			return Poll::Pending;
		}

		Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "not connected")))
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.shared.kick();
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self
			.shared
			.lock_inner()
			.sockets
			.get_mut::<TcpSocket>(self.handle)
			.close();
		self.shared.kick();
		Poll::Ready(Ok(()))
	}
}

impl std::fmt::Debug for TcpStream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TcpStream")
			.field("local_addr", &self.local_addr())
			.field("peer_addr", &self.peer_addr())
			.finish()
	}
}

impl Drop for TcpStream {
	fn drop(&mut self) {
		{
			let mut inner = self.shared.lock_inner();
			inner.sockets.get_mut::<TcpSocket>(self.handle).close();
			inner.release(self.handle);
		}
		self.shared.kick();
	}
}
