//! Cipher-suite abstraction.
//!
//! A [`Suite`] fixes the prime-order group every cryptographic component of
//! a session operates in, together with the fixed-width canonical byte
//! encodings of its elements and scalars. The suite is an explicit type
//! parameter on every component; there is no process-global suite value.
//!
//! Two families are provided: Schnorr groups of quadratic residues modulo a
//! safe prime ([`crate::qr`]) and the Ristretto group over curve25519
//! ([`crate::ec25519`]). All suites pair the group with AES-128 and SHA-256
//! for their symmetric operations.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::errors::Result;
use rand::{CryptoRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

/// A group element, written multiplicatively.
pub trait ElementOps:
    'static + Clone + Debug + Send + Sync + Eq + PartialEq + Serialize + DeserializeOwned
{
    /// The scalar type acting on this element.
    type Scalar: ScalarOps;

    /// Raise `self` to a scalar power.
    fn exp(&self, exponent: &Self::Scalar) -> Self;

    /// The group operation applied to `self` and `other`.
    fn mul(&self, other: &Self) -> Self;

    /// Serialize to the suite's canonical fixed-width encoding.
    fn to_bytes(&self) -> Vec<u8>;

    /// Parse a canonical encoding. Rejects values outside the group's
    /// representable range.
    fn try_from_bytes(bytes: &[u8]) -> Result<Self>;
}

/// A scalar of the group's prime order.
pub trait ScalarOps:
    'static + Clone + Debug + Send + Sync + Eq + PartialEq + Serialize + DeserializeOwned
{
    /// The additive identity.
    fn zero() -> Self;

    /// The multiplicative identity.
    fn one() -> Self;

    /// Sum of two scalars.
    fn add(&self, other: &Self) -> Self;

    /// Difference of two scalars.
    fn sub(&self, other: &Self) -> Self;

    /// Product of two scalars.
    fn mul(&self, other: &Self) -> Self;

    /// Sample a scalar uniformly at random.
    fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self;

    /// Map arbitrary bytes to a scalar by reduction modulo the group order.
    ///
    /// Deterministic and agreed upon by every participant; no preimage
    /// structure is required. Used to hash shared secrets and transcripts
    /// into the group.
    fn from_hash_bytes(bytes: &[u8]) -> Self;

    /// Serialize to the suite's canonical fixed-width encoding.
    fn to_bytes(&self) -> Vec<u8>;

    /// Parse a canonical encoding. Rejects values at or above the group
    /// order.
    fn try_from_bytes(bytes: &[u8]) -> Result<Self>;
}

/// A cipher suite: a prime-order group with canonical encodings.
pub trait Suite: 'static + Clone + Debug + PartialEq + Send + Sync {
    /// Group elements.
    type Element: ElementOps<Scalar = Self::Scalar>;

    /// Group scalars.
    type Scalar: ScalarOps;

    /// Human-readable suite name, used in logs and transcripts.
    const NAME: &'static str;

    /// The group generator `g`.
    fn generator() -> Self::Element;

    /// Width in bytes of a canonical element encoding.
    fn element_len() -> usize;

    /// Width in bytes of a canonical scalar encoding.
    fn scalar_len() -> usize;

    /// Generate a keypair `(priv, g^priv)`.
    fn keypair<R: RngCore + CryptoRng>(rng: &mut R) -> (Self::Scalar, Self::Element) {
        let private = Self::Scalar::random(rng);
        let public = Self::generator().exp(&private);
        (private, public)
    }

    /// Derive the pairwise Diffie-Hellman secret `other_pub ^ own_priv`.
    ///
    /// For any two keypairs `(a, g^a)` and `(b, g^b)`, both sides derive
    /// the same element `g^(ab)`.
    fn shared_secret(own_private: &Self::Scalar, other_public: &Self::Element) -> Self::Element {
        other_public.exp(own_private)
    }
}
