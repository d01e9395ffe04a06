//! Ristretto255 suite backend.
//!
//! Group over the Ristretto prime-order group on curve25519, with 32-byte
//! canonical encodings for both elements and scalars.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    suite::{ElementOps, ScalarOps, Suite},
};
use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::error;

/// AES-128/SHA-256 over the Ristretto group on curve25519.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EC25519;

/// A Ristretto group element.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EcElement(RistrettoPoint);

/// A scalar modulo the Ristretto group order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EcScalar(Scalar);

impl ElementOps for EcElement {
    type Scalar = EcScalar;

    fn exp(&self, exponent: &Self::Scalar) -> Self {
        EcElement(self.0 * exponent.0)
    }

    fn mul(&self, other: &Self) -> Self {
        EcElement(self.0 + other.0)
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.0.compress().to_bytes().to_vec()
    }

    fn try_from_bytes(bytes: &[u8]) -> Result<Self> {
        let compressed = CompressedRistretto::from_slice(bytes).map_err(|_| {
            error!("Ristretto element encoding has the wrong length");
            CallerError::DeserializationFailed
        })?;
        match compressed.decompress() {
            Some(point) => Ok(EcElement(point)),
            None => {
                error!("failed to decode bytes as a Ristretto element");
                Err(CallerError::DeserializationFailed)?
            }
        }
    }
}

impl ScalarOps for EcScalar {
    fn zero() -> Self {
        EcScalar(Scalar::ZERO)
    }

    fn one() -> Self {
        EcScalar(Scalar::ONE)
    }

    fn add(&self, other: &Self) -> Self {
        EcScalar(self.0 + other.0)
    }

    fn sub(&self, other: &Self) -> Self {
        EcScalar(self.0 - other.0)
    }

    fn mul(&self, other: &Self) -> Self {
        EcScalar(self.0 * other.0)
    }

    fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        EcScalar(Scalar::random(rng))
    }

    fn from_hash_bytes(bytes: &[u8]) -> Self {
        // Interpret short inputs directly as a little-endian integer reduced
        // modulo the group order; inputs wider than 64 bytes go through
        // Sha512 first.
        let mut wide = [0u8; 64];
        if bytes.len() <= 64 {
            wide[..bytes.len()].copy_from_slice(bytes);
        } else {
            wide.copy_from_slice(&Sha512::digest(bytes));
        }
        EcScalar(Scalar::from_bytes_mod_order_wide(&wide))
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    fn try_from_bytes(bytes: &[u8]) -> Result<Self> {
        let fixed: [u8; 32] = bytes.try_into().map_err(|_| {
            error!("Ristretto scalar encoding has the wrong length");
            CallerError::DeserializationFailed
        })?;
        match Option::<Scalar>::from(Scalar::from_canonical_bytes(fixed)) {
            Some(scalar) => Ok(EcScalar(scalar)),
            None => {
                error!("Ristretto scalar encoding is not canonical");
                Err(CallerError::DeserializationFailed)?
            }
        }
    }
}

impl Suite for EC25519 {
    type Element = EcElement;
    type Scalar = EcScalar;

    const NAME: &'static str = "EC25519";

    fn generator() -> Self::Element {
        EcElement(RISTRETTO_BASEPOINT_POINT)
    }

    fn element_len() -> usize {
        32
    }

    fn scalar_len() -> usize {
        32
    }
}
