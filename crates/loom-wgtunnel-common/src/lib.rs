// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod keys;
pub mod peer;

pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey, KEY_LEN};
pub use peer::PeerConfig;
