//! Schnorr groups of quadratic residues modulo a safe prime.
//!
//! Each suite fixes a published safe prime `p = 2q + 1` and uses the
//! subgroup of quadratic residues, which has prime order `q` and generator
//! `g = 4` (the square of 2). Elements and scalars are encoded big-endian,
//! left-padded to the byte width of `p`.
//!
//! `QR512` exists for tests and experiments only; 512-bit discrete-log
//! groups are far below current security margins. `QR1024` and `QR2048`
//! use the well-known 1024-bit and 2048-bit MODP safe primes so that every
//! participant derives the same group without any parameter exchange.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    suite::{ElementOps, ScalarOps, Suite},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt::Debug, marker::PhantomData};
use unknown_order::BigNumber;

/// Fixed parameters of one quadratic-residue group.
pub trait QrParams: 'static + Clone + Copy + Debug + PartialEq + Send + Sync {
    /// Suite name for logs and transcripts.
    const NAME: &'static str;

    /// Byte width of the canonical element and scalar encodings.
    const WIDTH: usize;

    /// The safe prime `p`.
    fn modulus() -> BigNumber;

    /// The subgroup order `q = (p - 1) / 2`.
    fn subgroup_order() -> BigNumber;
}

/// An element of the quadratic-residue subgroup, as a residue modulo `p`.
#[derive(Clone, Debug)]
pub struct QrElement<P: QrParams>(BigNumber, PhantomData<P>);

impl<P: QrParams> PartialEq for QrElement<P> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<P: QrParams> Eq for QrElement<P> {}

/// A scalar modulo the subgroup order `q`.
#[derive(Clone, Debug)]
pub struct QrScalar<P: QrParams>(BigNumber, PhantomData<P>);

impl<P: QrParams> PartialEq for QrScalar<P> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<P: QrParams> Eq for QrScalar<P> {}

/// Left-pad a big-endian encoding to `width` bytes.
fn pad_to_width(bytes: Vec<u8>, width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

impl<P: QrParams> ElementOps for QrElement<P> {
    type Scalar = QrScalar<P>;

    fn exp(&self, exponent: &Self::Scalar) -> Self {
        Self(self.0.modpow(&exponent.0, &P::modulus()), PhantomData)
    }

    fn mul(&self, other: &Self) -> Self {
        Self((&self.0 * &other.0) % P::modulus(), PhantomData)
    }

    fn to_bytes(&self) -> Vec<u8> {
        pad_to_width(self.0.to_bytes(), P::WIDTH)
    }

    fn try_from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != P::WIDTH {
            Err(CallerError::DeserializationFailed)?;
        }
        let value = BigNumber::from_slice(bytes);
        if value == BigNumber::zero() || value >= P::modulus() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self(value, PhantomData))
    }
}

impl<P: QrParams> ScalarOps for QrScalar<P> {
    fn zero() -> Self {
        Self(BigNumber::zero(), PhantomData)
    }

    fn one() -> Self {
        Self(BigNumber::one(), PhantomData)
    }

    fn add(&self, other: &Self) -> Self {
        Self((&self.0 + &other.0) % P::subgroup_order(), PhantomData)
    }

    fn sub(&self, other: &Self) -> Self {
        // Both operands are reduced, so adding `q` keeps the difference
        // positive before the final reduction.
        let q = P::subgroup_order();
        Self(((&self.0 + &q) - &other.0) % q, PhantomData)
    }

    fn mul(&self, other: &Self) -> Self {
        Self((&self.0 * &other.0) % P::subgroup_order(), PhantomData)
    }

    fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(BigNumber::from_rng(&P::subgroup_order(), rng), PhantomData)
    }

    fn from_hash_bytes(bytes: &[u8]) -> Self {
        Self(
            BigNumber::from_slice(bytes) % P::subgroup_order(),
            PhantomData,
        )
    }

    fn to_bytes(&self) -> Vec<u8> {
        pad_to_width(self.0.to_bytes(), P::WIDTH)
    }

    fn try_from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != P::WIDTH {
            Err(CallerError::DeserializationFailed)?;
        }
        let value = BigNumber::from_slice(bytes);
        if value >= P::subgroup_order() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self(value, PhantomData))
    }
}

impl<P: QrParams> Serialize for QrElement<P> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de, P: QrParams> Deserialize<'de> for QrElement<P> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Self::try_from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl<P: QrParams> Serialize for QrScalar<P> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de, P: QrParams> Deserialize<'de> for QrScalar<P> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Self::try_from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

macro_rules! qr_suite {
    ($(#[$doc:meta])* $name:ident, $width:expr, $p:ident, $q:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl QrParams for $name {
            const NAME: &'static str = stringify!($name);
            const WIDTH: usize = $width;

            fn modulus() -> BigNumber {
                BigNumber::from_slice($p)
            }

            fn subgroup_order() -> BigNumber {
                BigNumber::from_slice($q)
            }
        }

        impl Suite for $name {
            type Element = QrElement<$name>;
            type Scalar = QrScalar<$name>;

            const NAME: &'static str = <$name as QrParams>::NAME;

            fn generator() -> Self::Element {
                QrElement(BigNumber::from(4u32), PhantomData)
            }

            fn element_len() -> usize {
                $width
            }

            fn scalar_len() -> usize {
                $width
            }
        }
    };
}

qr_suite!(
    /// AES-128/SHA-256 over quadratic residues modulo a 512-bit safe prime.
    ///
    /// Testing and experimentation only; 512-bit discrete-log groups are no
    /// longer considered secure.
    QR512,
    64,
    QR512_P,
    QR512_Q
);

qr_suite!(
    /// AES-128/SHA-256 over quadratic residues modulo the 1024-bit MODP
    /// safe prime. 1024-bit discrete-log groups may no longer be secure.
    QR1024,
    128,
    QR1024_P,
    QR1024_Q
);

qr_suite!(
    /// AES-128/SHA-256 over quadratic residues modulo the 2048-bit MODP
    /// safe prime.
    QR2048,
    256,
    QR2048_P,
    QR2048_Q
);

/// 512-bit safe prime for the test group.
const QR512_P: &[u8; 64] = &[
    0xc2, 0xb8, 0x18, 0x21, 0x22, 0x1f, 0xe5, 0x65, 0xc6, 0x6a, 0x71, 0xf6, 0x9b, 0xe7, 0x1f, 0x4d,
    0x71, 0x30, 0xf8, 0xca, 0x59, 0x42, 0x82, 0xad, 0x6d, 0x05, 0x1a, 0x71, 0x98, 0x11, 0x74, 0x90,
    0x57, 0x85, 0x80, 0xb5, 0x14, 0x52, 0xb5, 0x82, 0x57, 0x43, 0xf4, 0x21, 0x81, 0x8f, 0x2a, 0xeb,
    0x73, 0x6d, 0xf0, 0xf6, 0x4c, 0x14, 0x5f, 0x61, 0x47, 0x56, 0xda, 0x28, 0xef, 0xbe, 0xcc, 0x57,
];

const QR512_Q: &[u8; 64] = &[
    0x61, 0x5c, 0x0c, 0x10, 0x91, 0x0f, 0xf2, 0xb2, 0xe3, 0x35, 0x38, 0xfb, 0x4d, 0xf3, 0x8f, 0xa6,
    0xb8, 0x98, 0x7c, 0x65, 0x2c, 0xa1, 0x41, 0x56, 0xb6, 0x82, 0x8d, 0x38, 0xcc, 0x08, 0xba, 0x48,
    0x2b, 0xc2, 0xc0, 0x5a, 0x8a, 0x29, 0x5a, 0xc1, 0x2b, 0xa1, 0xfa, 0x10, 0xc0, 0xc7, 0x95, 0x75,
    0xb9, 0xb6, 0xf8, 0x7b, 0x26, 0x0a, 0x2f, 0xb0, 0xa3, 0xab, 0x6d, 0x14, 0x77, 0xdf, 0x66, 0x2b,
];

/// 1024-bit MODP safe prime (Oakley group 2).
const QR1024_P: &[u8; 128] = &[
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2, 0x34,
    0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74,
    0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d, 0xf2, 0x5f, 0x14, 0x37,
    0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6,
    0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11, 0x7c, 0x4b, 0x1f, 0xe6,
    0x49, 0x28, 0x66, 0x51, 0xec, 0xe6, 0x53, 0x81, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

const QR1024_Q: &[u8; 128] = &[
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xe4, 0x87, 0xed, 0x51, 0x10, 0xb4, 0x61, 0x1a,
    0x62, 0x63, 0x31, 0x45, 0xc0, 0x6e, 0x0e, 0x68, 0x94, 0x81, 0x27, 0x04, 0x45, 0x33, 0xe6, 0x3a,
    0x01, 0x05, 0xdf, 0x53, 0x1d, 0x89, 0xcd, 0x91, 0x28, 0xa5, 0x04, 0x3c, 0xc7, 0x1a, 0x02, 0x6e,
    0xf7, 0xca, 0x8c, 0xd9, 0xe6, 0x9d, 0x21, 0x8d, 0x98, 0x15, 0x85, 0x36, 0xf9, 0x2f, 0x8a, 0x1b,
    0xa7, 0xf0, 0x9a, 0xb6, 0xb6, 0xa8, 0xe1, 0x22, 0xf2, 0x42, 0xda, 0xbb, 0x31, 0x2f, 0x3f, 0x63,
    0x7a, 0x26, 0x21, 0x74, 0xd3, 0x1b, 0xf6, 0xb5, 0x85, 0xff, 0xae, 0x5b, 0x7a, 0x03, 0x5b, 0xf6,
    0xf7, 0x1c, 0x35, 0xfd, 0xad, 0x44, 0xcf, 0xd2, 0xd7, 0x4f, 0x92, 0x08, 0xbe, 0x25, 0x8f, 0xf3,
    0x24, 0x94, 0x33, 0x28, 0xf6, 0x73, 0x29, 0xc0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// 2048-bit MODP safe prime (group 14).
const QR2048_P: &[u8; 256] = &[
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2, 0x34,
    0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74,
    0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d, 0xf2, 0x5f, 0x14, 0x37,
    0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6,
    0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11, 0x7c, 0x4b, 0x1f, 0xe6,
    0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d, 0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05,
    0x98, 0xda, 0x48, 0x36, 0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56, 0x20, 0x85, 0x52, 0xbb,
    0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d, 0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04,
    0xf1, 0x74, 0x6c, 0x08, 0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
    0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2, 0xec, 0x07, 0xa2, 0x8f,
    0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9, 0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18,
    0x39, 0x95, 0x49, 0x7c, 0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

const QR2048_Q: &[u8; 256] = &[
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xe4, 0x87, 0xed, 0x51, 0x10, 0xb4, 0x61, 0x1a,
    0x62, 0x63, 0x31, 0x45, 0xc0, 0x6e, 0x0e, 0x68, 0x94, 0x81, 0x27, 0x04, 0x45, 0x33, 0xe6, 0x3a,
    0x01, 0x05, 0xdf, 0x53, 0x1d, 0x89, 0xcd, 0x91, 0x28, 0xa5, 0x04, 0x3c, 0xc7, 0x1a, 0x02, 0x6e,
    0xf7, 0xca, 0x8c, 0xd9, 0xe6, 0x9d, 0x21, 0x8d, 0x98, 0x15, 0x85, 0x36, 0xf9, 0x2f, 0x8a, 0x1b,
    0xa7, 0xf0, 0x9a, 0xb6, 0xb6, 0xa8, 0xe1, 0x22, 0xf2, 0x42, 0xda, 0xbb, 0x31, 0x2f, 0x3f, 0x63,
    0x7a, 0x26, 0x21, 0x74, 0xd3, 0x1b, 0xf6, 0xb5, 0x85, 0xff, 0xae, 0x5b, 0x7a, 0x03, 0x5b, 0xf6,
    0xf7, 0x1c, 0x35, 0xfd, 0xad, 0x44, 0xcf, 0xd2, 0xd7, 0x4f, 0x92, 0x08, 0xbe, 0x25, 0x8f, 0xf3,
    0x24, 0x94, 0x33, 0x28, 0xf6, 0x72, 0x2d, 0x9e, 0xe1, 0x00, 0x3e, 0x5c, 0x50, 0xb1, 0xdf, 0x82,
    0xcc, 0x6d, 0x24, 0x1b, 0x0e, 0x2a, 0xe9, 0xcd, 0x34, 0x8b, 0x1f, 0xd4, 0x7e, 0x92, 0x67, 0xaf,
    0xc1, 0xb2, 0xae, 0x91, 0xee, 0x51, 0xd6, 0xcb, 0x0e, 0x31, 0x79, 0xab, 0x10, 0x42, 0xa9, 0x5d,
    0xcf, 0x6a, 0x94, 0x83, 0xb8, 0x4b, 0x4b, 0x36, 0xb3, 0x86, 0x1a, 0xa7, 0x25, 0x5e, 0x4c, 0x02,
    0x78, 0xba, 0x36, 0x04, 0x65, 0x0c, 0x10, 0xbe, 0x19, 0x48, 0x2f, 0x23, 0x17, 0x1b, 0x67, 0x1d,
    0xf1, 0xcf, 0x3b, 0x96, 0x0c, 0x07, 0x43, 0x01, 0xcd, 0x93, 0xc1, 0xd1, 0x76, 0x03, 0xd1, 0x47,
    0xda, 0xe2, 0xae, 0xf8, 0x37, 0xa6, 0x29, 0x64, 0xef, 0x15, 0xe5, 0xfb, 0x4a, 0xac, 0x0b, 0x8c,
    0x1c, 0xca, 0xa4, 0xbe, 0x75, 0x4a, 0xb5, 0x72, 0x8a, 0xe9, 0x13, 0x0c, 0x4c, 0x7d, 0x02, 0x88,
    0x0a, 0xb9, 0x47, 0x2d, 0x45, 0x56, 0x55, 0x34, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];
