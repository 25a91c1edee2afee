//! Machine key material.
//!
//! Every identity the proxy handles is a Curve25519 keypair. The same key is
//! used as the Noise static key on the current protocol and as the box key on
//! the legacy protocol.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{self, Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

const PRIVATE_PREFIX: &str = "privkey:";
const PUBLIC_PREFIX: &str = "mkey:";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("missing {0:?} prefix")]
    MissingPrefix(&'static str),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

fn decode_key(hex_str: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = hex::decode(hex_str)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| KeyError::Length(len))
}

/// Private half of a machine identity.
#[derive(Clone)]
pub struct MachinePrivate(SecretKey);

impl MachinePrivate {
    pub fn generate() -> Self {
        Self(SecretKey::generate(&mut OsRng))
    }

    pub fn public(&self) -> MachinePublic {
        MachinePublic(*self.0.public_key().as_bytes())
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    /// Encrypt and authenticate `plaintext` for `peer`.
    ///
    /// Output layout is `nonce(24) || box(plaintext)`.
    pub fn seal_to(
        &self,
        peer: &MachinePublic,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, aead::Error> {
        let sbox = SalsaBox::new(&peer.box_key(), &self.0);
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let sealed = sbox.encrypt(&nonce, plaintext)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Reverse [`MachinePrivate::seal_to`]. Returns `None` when the input is
    /// too short or fails authentication.
    pub fn open_from(&self, peer: &MachinePublic, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let sbox = SalsaBox::new(&peer.box_key(), &self.0);
        sbox.decrypt(GenericArray::from_slice(nonce), ciphertext).ok()
    }
}

impl From<[u8; KEY_LEN]> for MachinePrivate {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(SecretKey::from(bytes))
    }
}

impl fmt::Display for MachinePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PRIVATE_PREFIX}{}", hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for MachinePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachinePrivate({})", self.public().short_string())
    }
}

impl FromStr for MachinePrivate {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_str = s
            .strip_prefix(PRIVATE_PREFIX)
            .ok_or(KeyError::MissingPrefix(PRIVATE_PREFIX))?;
        Ok(Self::from(decode_key(hex_str)?))
    }
}

impl PartialEq for MachinePrivate {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for MachinePrivate {}

/// Public half of a machine identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachinePublic([u8; KEY_LEN]);

impl MachinePublic {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Bare hex encoding without the type prefix.
    pub fn untyped_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_untyped_hex(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self)
    }

    /// Compact form for log prefixes, e.g. `[AbCdE]`.
    pub fn short_string(&self) -> String {
        let b64 = STANDARD.encode(self.0);
        format!("[{}]", &b64[..5])
    }

    fn box_key(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Display for MachinePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PUBLIC_PREFIX}{}", self.untyped_hex())
    }
}

impl fmt::Debug for MachinePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachinePublic({})", self.short_string())
    }
}

impl FromStr for MachinePublic {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_str = s
            .strip_prefix(PUBLIC_PREFIX)
            .ok_or(KeyError::MissingPrefix(PUBLIC_PREFIX))?;
        Self::from_untyped_hex(hex_str)
    }
}

impl Serialize for MachinePublic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MachinePublic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
