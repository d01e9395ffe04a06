//! Equivocation protection.
//!
//! A malicious relay could show different downstream transcripts to
//! different clients. To make that unprofitable, every participant keeps a
//! history scalar `h`, a running hash chain over all round transcripts, and
//! the slot owner's payload is encrypted under a key that can only be
//! recovered through `h`:
//!
//! - every client i derives `q_ij = H_group(S_ij)` for each trustee j and
//!   sums them into `sigma_i`; the owner picks a fresh `k`, AES-GCM-wraps
//!   its payload under `k`, and sends `kappa_i = k + h * sigma_i`, while
//!   every other client sends `kappa_i = h * sigma_i`;
//! - every trustee j sends `sigma_j`, the sum of its `q_ji`;
//! - the relay recovers `k = SUM_i kappa_i - h * SUM_j sigma_j` and
//!   decrypts.
//!
//! The pairwise `q` values cancel between the client and trustee sums, so
//! the recovery works exactly when the relay's `h` matches the clients'.
//! A client fed a divergent history would make the relay derive a wrong
//! key and fail authentication, turning equivocation into a visible
//! disruption.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{InternalError, Result},
    suite::{ElementOps, ScalarOps, Suite},
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Nonce,
};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Bytes AES-GCM appends to a wrapped payload.
pub const GCM_TAG_LEN: usize = 16;

/// The payload wrap key is used for exactly one round (a fresh `k` is drawn
/// every time the owner speaks), so a fixed zero nonce cannot repeat under
/// the same key.
const ZERO_NONCE: [u8; 12] = [0u8; 12];

/// Per-participant equivocation state: the history hash chain.
#[derive(Debug, Clone)]
pub struct EquivocationGuard<S: Suite> {
    history: S::Scalar,
}

impl<S: Suite> Default for EquivocationGuard<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Suite> EquivocationGuard<S> {
    /// Create a guard with the history at its round-zero value, the
    /// multiplicative identity.
    pub fn new() -> Self {
        Self {
            history: S::Scalar::one(),
        }
    }

    /// Canonical encoding of the current history scalar. Honest
    /// participants agree on this after every resolved round.
    pub fn history_bytes(&self) -> Vec<u8> {
        self.history.to_bytes()
    }

    /// Fold a round transcript into the history chain:
    /// `h <- H_group(SHA-256(h || transcript))`.
    pub fn update_history(&mut self, transcript: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.history.to_bytes());
        hasher.update(transcript);
        self.history = S::Scalar::from_hash_bytes(&hasher.finalize());
    }

    /// Sum the hashes of a participant's pairwise shared secrets.
    ///
    /// Round-independent: a client computes this over its per-trustee
    /// secrets, a trustee over its per-client secrets.
    pub fn sigma(pairwise_secrets: &[S::Element]) -> S::Scalar {
        pairwise_secrets
            .iter()
            .map(|secret| S::Scalar::from_hash_bytes(&secret.to_bytes()))
            .fold(S::Scalar::zero(), |sum, q| sum.add(&q))
    }

    /// Produce a client's per-round contribution.
    ///
    /// With `payload` set (this client owns the open slot), returns the
    /// AES-GCM-wrapped payload and `kappa = k + h * sigma`; otherwise
    /// returns no payload and `kappa = h * sigma`.
    pub fn client_contribution<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        payload: Option<&[u8]>,
        sigma: &S::Scalar,
    ) -> Result<(Option<Vec<u8>>, S::Scalar)> {
        let masked = self.history.mul(sigma);

        let Some(payload) = payload else {
            return Ok((None, masked));
        };

        let k = S::Scalar::random(rng);
        let cipher = wrap_cipher(&k)?;
        let wrapped = cipher
            .encrypt(Nonce::from_slice(&ZERO_NONCE), payload)
            .map_err(|_| InternalError::InternalInvariantFailed)?;

        Ok((Some(wrapped), k.add(&masked)))
    }

    /// Recover and decrypt the owner's payload from a round's
    /// contributions.
    ///
    /// Computes `k = SUM kappa_i - h * SUM sigma_j` and opens the wrapped
    /// payload under it. An authentication failure means some participant
    /// contributed inconsistently (or the relay's history diverged); the
    /// payload is discarded and the round must be flagged as disrupted.
    pub fn relay_decode(
        &self,
        wrapped_payload: &[u8],
        client_kappas: &[S::Scalar],
        trustee_sigmas: &[S::Scalar],
    ) -> Result<Vec<u8>> {
        let kappa_sum = client_kappas
            .iter()
            .fold(S::Scalar::zero(), |sum, kappa| sum.add(kappa));
        let sigma_sum = trustee_sigmas
            .iter()
            .fold(S::Scalar::zero(), |sum, sigma| sum.add(sigma));

        let k = kappa_sum.sub(&self.history.mul(&sigma_sum));

        let cipher = wrap_cipher(&k)?;
        cipher
            .decrypt(Nonce::from_slice(&ZERO_NONCE), wrapped_payload)
            .map_err(|_| {
                warn!("round payload failed authentication");
                InternalError::PayloadAuthenticationFailed
            })
    }
}

/// Build the AES-128-GCM payload cipher for a round key.
///
/// The suite scalars are wider than an AES-128 key, so the key is the
/// truncated digest of the scalar's canonical encoding; both the owner and
/// the relay derive it from the same scalar value.
fn wrap_cipher<T: ScalarOps>(k: &T) -> Result<Aes128Gcm> {
    let digest = Sha256::digest(k.to_bytes());
    Aes128Gcm::new_from_slice(&digest[..16]).map_err(|_| InternalError::InternalInvariantFailed)
}
