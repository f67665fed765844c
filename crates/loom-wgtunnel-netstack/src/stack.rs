// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::NetstackConfig;
use crate::endpoint::{LinkDevice, LinkEndpoint};
use crate::error::{NetstackError, Result};
use crate::registry::PeerRegistry;
use crate::sync::{lock, read};
use crate::tcp::{TcpListener, TcpStream};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::socket::AnySocket;
use smoltcp::time::{Duration as SmoltcpDuration, Instant as SmoltcpInstant};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address, Ipv6Address};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::task::Waker;
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant as StdInstant};
use tracing::{debug, instrument, warn};

/// Upper bound on how long the worker sleeps when no timer is pending.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(100);

const EPHEMERAL_PORT_START: u16 = 49152;
const EPHEMERAL_PORT_COUNT: u16 = 16383;

/// Picks a free ephemeral port, scanning the range from a random start.
fn pick_ephemeral_port(in_use: &HashSet<u16>) -> Option<u16> {
	let start = fastrand::u16(..EPHEMERAL_PORT_COUNT);
	(0..EPHEMERAL_PORT_COUNT)
		.map(|i| EPHEMERAL_PORT_START + (start + i) % EPHEMERAL_PORT_COUNT)
		.find(|port| !in_use.contains(port))
}

fn smoltcp_now() -> SmoltcpInstant {
	static START: std::sync::OnceLock<StdInstant> = std::sync::OnceLock::new();
	let start = START.get_or_init(StdInstant::now);
	SmoltcpInstant::from_micros(start.elapsed().as_micros() as i64)
}

pub(crate) fn to_smoltcp(addr: IpAddr) -> IpAddress {
	match addr {
		IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
		IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
	}
}

pub(crate) fn from_smoltcp(addr: IpAddress) -> IpAddr {
	match addr {
		IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4.0)),
		IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6.0)),
	}
}

pub(crate) struct StackInner {
	pub(crate) iface: Interface,
	device: LinkDevice,
	pub(crate) sockets: SocketSet<'static>,
	wakers: Vec<Waker>,
	released: Vec<SocketHandle>,
}

impl StackInner {
	pub(crate) fn register_waker(&mut self, waker: &Waker) {
		if !self.wakers.iter().any(|w| w.will_wake(waker)) {
			self.wakers.push(waker.clone());
		}
	}

	/// Hands a socket back to the stack; it is removed once fully closed.
	pub(crate) fn release(&mut self, handle: SocketHandle) {
		self.released.push(handle);
	}

	fn reap_released(&mut self) {
		let sockets = &mut self.sockets;
		self.released.retain(|&handle| {
			let state = sockets.get::<TcpSocket>(handle).state();
			if state == TcpState::Closed {
				sockets.remove(handle);
				false
			} else {
				true
			}
		});
	}

	/// Local ports held by TCP sockets, listening or connected.
	fn ports_in_use(&self) -> HashSet<u16> {
		self
			.sockets
			.iter()
			.filter_map(|(_, socket)| TcpSocket::downcast(socket))
			.filter_map(|tcp| {
				tcp.local_endpoint()
					.map(|ep| ep.port)
					.or(Some(tcp.listen_endpoint().port))
					.filter(|&port| port != 0)
			})
			.collect()
	}

	fn wake_all(&mut self) {
		for waker in self.wakers.drain(..) {
			waker.wake();
		}
	}
}

pub(crate) struct StackShared {
	inner: Mutex<StackInner>,
	endpoint: Arc<LinkEndpoint>,
	registry: Arc<RwLock<PeerRegistry>>,
	config: NetstackConfig,
	worker: Mutex<Option<Thread>>,
	shutdown: AtomicBool,
}

impl StackShared {
	pub(crate) fn lock_inner(&self) -> MutexGuard<'_, StackInner> {
		lock(&self.inner)
	}

	/// Wakes the worker so it polls the stack without waiting for its timer.
	pub(crate) fn kick(&self) {
		if let Some(worker) = lock(&self.worker).as_ref() {
			worker.unpark();
		}
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.shutdown.load(Ordering::Acquire)
	}

	pub(crate) fn new_tcp_socket(&self) -> TcpSocket<'static> {
		let rx_buffer = SocketBuffer::new(vec![0u8; self.config.tcp_rx_buffer_size]);
		let tx_buffer = SocketBuffer::new(vec![0u8; self.config.tcp_tx_buffer_size]);
		let mut socket = TcpSocket::new(rx_buffer, tx_buffer);
		socket.set_nagle_enabled(self.config.tcp_nagle);
		socket.set_keep_alive(
			self
				.config
				.tcp_keep_alive
				.map(|d| SmoltcpDuration::from_millis(d.as_millis() as u64)),
		);
		socket
	}

	/// One pass over the interface. Returns how long the worker may sleep.
	fn poll(&self) -> Duration {
		let mut guard = self.lock_inner();
		let inner = &mut *guard;
		let now = smoltcp_now();

		inner.iface.poll(now, &mut inner.device, &mut inner.sockets);
		inner.reap_released();
		inner.wake_all();

		inner
			.iface
			.poll_delay(now, &inner.sockets)
			.map(|d| Duration::from_micros(d.total_micros()))
			.unwrap_or(MAX_IDLE_WAIT)
			.min(MAX_IDLE_WAIT)
	}

	/// Drops the interface's addresses and routes.
	pub(crate) fn remove_nic(&self) {
		let mut inner = self.lock_inner();
		inner.iface.update_ip_addrs(|addrs| addrs.clear());
		inner.iface.routes_mut().remove_default_ipv4_route();
		inner.iface.routes_mut().remove_default_ipv6_route();
		debug!("removed NIC");
	}

	/// Stops the worker and aborts every socket.
	pub(crate) fn shutdown(&self) {
		if self.shutdown.swap(true, Ordering::AcqRel) {
			return;
		}
		{
			let mut inner = self.lock_inner();
			for (_, socket) in inner.sockets.iter_mut() {
				if let Some(tcp) = TcpSocket::downcast_mut(socket) {
					tcp.abort();
				}
			}
			inner.wake_all();
		}
		self.kick();
		debug!("closed stack");
	}
}

fn run(shared: Arc<StackShared>) {
	debug!("netstack worker started");
	while !shared.is_closed() {
		let wait = shared.poll();
		shared.endpoint.dispatch_notifications();
		if shared.is_closed() {
			break;
		}
		thread::park_timeout(wait);
	}
	debug!("netstack worker stopped");
}

/// Handle to the userspace TCP/IP stack, used by application code to open
/// and accept connections over the tunnel.
#[derive(Clone)]
pub struct Netstack {
	pub(crate) shared: Arc<StackShared>,
}

impl Netstack {
	#[instrument(skip_all, fields(name = %config.local_name, mtu = config.mtu))]
	pub(crate) fn build(
		config: NetstackConfig,
		endpoint: Arc<LinkEndpoint>,
		registry: Arc<RwLock<PeerRegistry>>,
	) -> Result<Self> {
		config
			.validate()
			.map_err(|e| NetstackError::StackConfiguration(format!("invalid options: {e}")))?;

		let mut device = LinkDevice::new(Arc::clone(&endpoint));

		let mut iface_config = Config::new(HardwareAddress::Ip);
		iface_config.random_seed = fastrand::u64(..);
		let mut iface = Interface::new(iface_config, &mut device, smoltcp_now());

		let mut rejected = None;
		iface.update_ip_addrs(|addrs| {
			for addr in &config.addresses {
				let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
				if addrs.push(IpCidr::new(to_smoltcp(*addr), prefix_len)).is_err() {
					rejected = Some(*addr);
					break;
				}
			}
		});
		if let Some(addr) = rejected {
			return Err(NetstackError::StackConfiguration(format!(
				"could not add protocol address {addr}: address table full"
			)));
		}

		let first_v4 = config.addresses.iter().find_map(|a| match a {
			IpAddr::V4(v4) => Some(*v4),
			IpAddr::V6(_) => None,
		});
		if let Some(v4) = first_v4 {
			iface
				.routes_mut()
				.add_default_ipv4_route(Ipv4Address::from_bytes(&v4.octets()))
				.map_err(|_| {
					NetstackError::StackConfiguration("could not add IPv4 default route".to_string())
				})?;
		}

		let first_v6 = config.addresses.iter().find_map(|a| match a {
			IpAddr::V6(v6) => Some(*v6),
			IpAddr::V4(_) => None,
		});
		if let Some(v6) = first_v6 {
			iface
				.routes_mut()
				.add_default_ipv6_route(Ipv6Address::from_bytes(&v6.octets()))
				.map_err(|_| {
					NetstackError::StackConfiguration("could not add IPv6 default route".to_string())
				})?;
		}

		debug!(addresses = config.addresses.len(), "configured stack");

		Ok(Self {
			shared: Arc::new(StackShared {
				inner: Mutex::new(StackInner {
					iface,
					device,
					sockets: SocketSet::new(vec![]),
					wakers: Vec::new(),
					released: Vec::new(),
				}),
				endpoint,
				registry,
				config,
				worker: Mutex::new(None),
				shutdown: AtomicBool::new(false),
			}),
		})
	}

	/// Spawns the thread that drives the stack.
	pub(crate) fn start(&self) -> Result<JoinHandle<()>> {
		let shared = Arc::clone(&self.shared);
		let handle = thread::Builder::new()
			.name("loom-netstack".to_string())
			.spawn(move || run(shared))
			.map_err(|e| NetstackError::StackConfiguration(format!("could not spawn worker: {e}")))?;
		*lock(&self.shared.worker) = Some(handle.thread().clone());
		Ok(handle)
	}

	pub fn local_name(&self) -> &str {
		&self.shared.config.local_name
	}

	pub fn local_addrs(&self) -> &[IpAddr] {
		&self.shared.config.addresses
	}

	pub fn mtu(&self) -> u16 {
		self.shared.config.mtu
	}

	pub fn is_closed(&self) -> bool {
		self.shared.is_closed()
	}

	/// Resolves an IP literal, the local name, or a registered peer name.
	pub fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
		if let Ok(ip) = host.parse::<IpAddr>() {
			return Ok(vec![ip]);
		}

		let config = &self.shared.config;
		if !config.local_name.is_empty() && host == config.local_name {
			return Ok(config.addresses.clone());
		}

		let registry = read(&self.shared.registry);
		let addrs = registry
			.peer_by_name(host)
			.map(|peer| registry.addresses_of(&peer).to_vec())
			.unwrap_or_default();
		if addrs.is_empty() {
			return Err(NetstackError::UnknownHost(host.to_string()));
		}
		Ok(addrs)
	}

	#[instrument(skip(self))]
	pub fn tcp_listen(&self, port: u16) -> Result<TcpListener> {
		if self.is_closed() {
			return Err(NetstackError::Closed);
		}

		let mut socket = self.shared.new_tcp_socket();
		socket
			.listen(port)
			.map_err(|e| NetstackError::TcpListen(format!("listen failed: {}", e)))?;

		let handle = self.shared.lock_inner().sockets.add(socket);
		debug!("listening on port");
		Ok(TcpListener::new(Arc::clone(&self.shared), handle, port))
	}

	#[instrument(skip(self), fields(%addr))]
	pub async fn tcp_connect(&self, addr: SocketAddr) -> Result<TcpStream> {
		if self.is_closed() {
			return Err(NetstackError::Closed);
		}

		let handle = {
			let mut guard = self.shared.lock_inner();
			let inner = &mut *guard;

			let mut socket = self.shared.new_tcp_socket();
			let local_port = pick_ephemeral_port(&inner.ports_in_use()).ok_or_else(|| {
				NetstackError::TcpConnect("no free ephemeral port".to_string())
			})?;
			let remote = IpEndpoint::new(to_smoltcp(addr.ip()), addr.port());

			socket
				.connect(inner.iface.context(), remote, local_port)
				.map_err(|e| NetstackError::TcpConnect(format!("connect failed: {}", e)))?;

			inner.sockets.add(socket)
		};
		self.shared.kick();
		debug!("connecting to remote");

		let stream = TcpStream::new(Arc::clone(&self.shared), handle);
		match tokio::time::timeout(self.shared.config.connect_timeout, stream.wait_connected()).await
		{
			Ok(Ok(())) => Ok(stream),
			Ok(Err(e)) => Err(e),
			Err(_) => Err(NetstackError::TcpConnect("connection timed out".to_string())),
		}
	}

	/// Connects to `host`, trying each of its addresses in turn.
	#[instrument(skip(self))]
	pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
		let mut last_error = None;
		for ip in self.lookup_host(host)? {
			match self.tcp_connect(SocketAddr::new(ip, port)).await {
				Ok(stream) => return Ok(stream),
				Err(e) => {
					warn!(%ip, error = %e, "connect attempt failed");
					last_error = Some(e);
				}
			}
		}
		Err(last_error.unwrap_or_else(|| NetstackError::UnknownHost(host.to_string())))
	}
}

impl std::fmt::Debug for Netstack {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Netstack")
			.field("local_name", &self.local_name())
			.field("local_addrs", &self.local_addrs())
			.field("closed", &self.is_closed())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_wgtunnel_common::WgKeyPair;

	fn build(addresses: Vec<IpAddr>) -> Result<Netstack> {
		let config = NetstackConfig::new("a", *WgKeyPair::generate().public_key(), addresses);
		let endpoint = Arc::new(LinkEndpoint::new(config.queue_size, config.mtu));
		Netstack::build(config, endpoint, Arc::new(RwLock::new(PeerRegistry::new())))
	}

	#[test]
	fn test_build_dual_stack() {
		let stack = build(vec![
			"10.0.0.1".parse().unwrap(),
			"fd7a:115c:a1e0::1".parse().unwrap(),
		])
		.unwrap();

		let inner = stack.shared.lock_inner();
		assert_eq!(inner.iface.ip_addrs().len(), 2);
		assert!(inner.iface.has_ip_addr(to_smoltcp("10.0.0.1".parse().unwrap())));
	}

	#[test]
	fn test_build_three_mixed_family_addresses() {
		let stack = build(vec![
			"10.0.0.1".parse().unwrap(),
			"10.0.0.5".parse().unwrap(),
			"fd00::1".parse().unwrap(),
		])
		.unwrap();

		let inner = stack.shared.lock_inner();
		assert_eq!(inner.iface.ip_addrs().len(), 3);
		assert!(inner.iface.has_ip_addr(to_smoltcp("10.0.0.5".parse().unwrap())));
		assert!(inner.iface.has_ip_addr(to_smoltcp("fd00::1".parse().unwrap())));
	}

	#[test]
	fn test_build_rejects_too_many_addresses() {
		let addresses = (1..=9u8)
			.map(|i| IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)))
			.collect();
		let err = build(addresses).unwrap_err();
		assert!(matches!(err, NetstackError::StackConfiguration(_)));
	}

	#[test]
	fn test_build_rejects_invalid_options() {
		let mut config = NetstackConfig::new(
			"a",
			*WgKeyPair::generate().public_key(),
			vec!["10.0.0.1".parse().unwrap()],
		);
		config.tcp_tx_buffer_size = 0;
		let endpoint = Arc::new(LinkEndpoint::new(8, config.mtu));

		let err =
			Netstack::build(config, endpoint, Arc::new(RwLock::new(PeerRegistry::new()))).unwrap_err();
		assert!(matches!(err, NetstackError::StackConfiguration(_)));
	}

	#[test]
	fn test_address_conversion() {
		let v4: IpAddr = "10.0.0.1".parse().unwrap();
		let v6: IpAddr = "fd7a:115c:a1e0::1".parse().unwrap();
		assert_eq!(from_smoltcp(to_smoltcp(v4)), v4);
		assert_eq!(from_smoltcp(to_smoltcp(v6)), v6);
	}

	#[test]
	fn test_lookup_host() {
		let stack = build(vec!["10.0.0.1".parse().unwrap()]).unwrap();
		let peer = *WgKeyPair::generate().public_key();
		let peer_ip: IpAddr = "10.0.0.2".parse().unwrap();
		crate::sync::write(&stack.shared.registry).add_peer(Some("b"), peer, &[peer_ip]);

		assert_eq!(stack.lookup_host("b").unwrap(), vec![peer_ip]);
		assert_eq!(
			stack.lookup_host("a").unwrap(),
			vec!["10.0.0.1".parse::<IpAddr>().unwrap()]
		);
		assert_eq!(
			stack.lookup_host("10.9.9.9").unwrap(),
			vec!["10.9.9.9".parse::<IpAddr>().unwrap()]
		);
		assert!(matches!(
			stack.lookup_host("nowhere"),
			Err(NetstackError::UnknownHost(_))
		));
	}

	#[test]
	fn test_listen_after_shutdown_fails() {
		let stack = build(vec!["10.0.0.1".parse().unwrap()]).unwrap();
		stack.shared.shutdown();
		assert!(matches!(stack.tcp_listen(80), Err(NetstackError::Closed)));
	}

	#[test]
	fn test_remove_nic_clears_addresses() {
		let stack = build(vec!["10.0.0.1".parse().unwrap()]).unwrap();
		stack.shared.remove_nic();
		assert!(stack.shared.lock_inner().iface.ip_addrs().is_empty());
	}

	#[test]
	fn test_pick_ephemeral_port_skips_ports_in_use() {
		let free = EPHEMERAL_PORT_START + 100;
		let in_use: HashSet<u16> = (0..EPHEMERAL_PORT_COUNT)
			.map(|i| EPHEMERAL_PORT_START + i)
			.filter(|&port| port != free)
			.collect();

		assert_eq!(pick_ephemeral_port(&in_use), Some(free));
	}

	#[test]
	fn test_pick_ephemeral_port_exhausted() {
		let in_use: HashSet<u16> = (0..EPHEMERAL_PORT_COUNT)
			.map(|i| EPHEMERAL_PORT_START + i)
			.collect();

		assert_eq!(pick_ephemeral_port(&in_use), None);
	}

	#[tokio::test]
	async fn test_ports_in_use_tracks_listeners_and_connections() {
		let stack = build(vec!["10.0.0.1".parse().unwrap()]).unwrap();
		let _listener = stack.tcp_listen(8080).unwrap();

		let connect = {
			let stack = stack.clone();
			tokio::spawn(async move {
				let _ = stack
					.tcp_connect(SocketAddr::new("10.0.0.2".parse().unwrap(), 80))
					.await;
			})
		};
		tokio::time::sleep(Duration::from_millis(20)).await;

		let ports = stack.shared.lock_inner().ports_in_use();
		assert!(ports.contains(&8080));
		assert_eq!(ports.len(), 2);
		assert!(ports
			.iter()
			.any(|port| (EPHEMERAL_PORT_START..EPHEMERAL_PORT_START + EPHEMERAL_PORT_COUNT).contains(port)));

		connect.abort();
	}
}
