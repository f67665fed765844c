// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
	#[error("invalid base64: {0}")]
	Base64(String),

	#[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
	Length(usize),
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
	let bytes = STANDARD
		.decode(encoded.trim())
		.map_err(|e| KeyError::Base64(e.to_string()))?;
	let len = bytes.len();
	bytes.try_into().map_err(|_| KeyError::Length(len))
}

/// A Curve25519 public key identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WgPublicKey([u8; KEY_LEN]);

impl WgPublicKey {
	pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.0
	}

	pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
		decode_key(encoded).map(Self)
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.0)
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPublicKey({})", self.to_base64())
	}
}

impl std::str::FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let encoded = String::deserialize(deserializer)?;
		Self::from_base64(&encoded).map_err(serde::de::Error::custom)
	}
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WgPrivateKey([u8; KEY_LEN]);

impl WgPrivateKey {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
		Self(secret.to_bytes())
	}

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self(bytes)
	}

	pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
		decode_key(encoded).map(Self)
	}

	pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
		&self.0
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.0);
		WgPublicKey(PublicKey::from(&secret).to_bytes())
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("WgPrivateKey([REDACTED])")
	}
}

#[derive(Clone, Debug)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		Self::from_private_key(WgPrivateKey::generate())
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn public_key_base64_roundtrip() {
		let keypair = WgKeyPair::generate();
		let encoded = keypair.public_key().to_base64();
		let parsed: WgPublicKey = encoded.parse().unwrap();
		assert_eq!(&parsed, keypair.public_key());
	}

	#[test]
	fn rejects_wrong_length() {
		let encoded = STANDARD.encode([0u8; 16]);
		assert_eq!(WgPublicKey::from_base64(&encoded), Err(KeyError::Length(16)));
	}

	#[test]
	fn rejects_garbage() {
		assert!(matches!(
			WgPublicKey::from_base64("not base64!!"),
			Err(KeyError::Base64(_))
		));
	}

	#[test]
	fn public_key_is_derived_from_private() {
		let private = WgPrivateKey::generate();
		let restored = WgPrivateKey::from_bytes(*private.expose_bytes());
		assert_eq!(private.public_key(), restored.public_key());
	}

	#[test]
	fn generated_keys_differ() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		assert_ne!(a.public_key(), b.public_key());
	}

	#[test]
	fn private_key_debug_is_redacted() {
		let private = WgPrivateKey::generate();
		assert_eq!(format!("{:?}", private), "WgPrivateKey([REDACTED])");
	}

	#[test]
	fn public_key_serializes_as_base64_string() {
		let key = WgPublicKey::from_bytes([7u8; KEY_LEN]);
		let json = serde_json::to_string(&key).unwrap();
		assert_eq!(json, format!("\"{}\"", key.to_base64()));
		let back: WgPublicKey = serde_json::from_str(&json).unwrap();
		assert_eq!(back, key);
	}
}
