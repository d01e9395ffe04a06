//! The DC-net cell codec.
//!
//! Every client/trustee pair shares a Diffie-Hellman secret. Each side
//! derives an AES-128 key from the secret's canonical encoding and, per
//! round, generates a pseudorandom pad with AES-128-CTR keyed by it. A
//! participant's cell for a round is the XOR of all of its pads; the slot
//! owner additionally XORs its payload in. Because each pad appears in
//! exactly one client cell and one trustee cell, XORing every cell of a
//! round cancels all pads and leaves only the owner's payload.
//!
//! Pads are derived from the round number alone (the CTR counter block
//! embeds it), so encoding is deterministic per round and never advances
//! hidden state: a participant that re-encodes a round after a loss stays
//! in sync with everyone else.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    suite::{ElementOps, Suite},
};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Byte width of the derived AES-128 stream keys.
const STREAM_KEY_LEN: usize = 16;

/// One participant's set of pairwise pad streams.
///
/// A client holds one stream per trustee; a trustee holds one stream per
/// client. Both sides of a pair derive the identical stream from the
/// identical shared secret.
pub struct CellCodec {
    cell_len: usize,
    stream_keys: Vec<Zeroizing<[u8; STREAM_KEY_LEN]>>,
}

// Custom Debug so the derived stream keys never reach a log line.
impl std::fmt::Debug for CellCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellCodec")
            .field("cell_len", &self.cell_len)
            .field("streams", &self.stream_keys.len())
            .finish()
    }
}

impl CellCodec {
    /// Initialize one keyed pad stream per pairwise shared secret.
    ///
    /// `cell_len` is the wire cell width in bytes; both sides of every
    /// pair must agree on it.
    pub fn setup<S: Suite>(pairwise_secrets: &[S::Element], cell_len: usize) -> Self {
        let stream_keys = pairwise_secrets
            .iter()
            .map(|secret| {
                let digest = Sha256::digest(secret.to_bytes());
                let mut key = Zeroizing::new([0u8; STREAM_KEY_LEN]);
                key.copy_from_slice(&digest[..STREAM_KEY_LEN]);
                key
            })
            .collect();
        Self {
            cell_len,
            stream_keys,
        }
    }

    /// The wire cell width in bytes.
    pub fn cell_len(&self) -> usize {
        self.cell_len
    }

    /// The XOR of this participant's pads for `round`.
    ///
    /// This is the complete cell for a trustee, and the non-owner cell for
    /// a client.
    pub fn encode(&self, round: u32) -> Vec<u8> {
        let mut cell = vec![0u8; self.cell_len];
        for key in &self.stream_keys {
            // Zero IV per round: the counter block embeds the round number,
            // so every round reads the stream from a fresh block offset.
            let mut iv = [0u8; 16];
            iv[8..].copy_from_slice(&u64::from(round).to_be_bytes());
            let mut cipher = Aes128Ctr::new((&**key).into(), (&iv).into());
            let mut pad = vec![0u8; self.cell_len];
            cipher.apply_keystream(&mut pad);
            xor_into(&mut cell, &pad);
        }
        cell
    }

    /// The cell for `round` with `slot_payload` XORed in when this client
    /// owns the open slot.
    ///
    /// The payload must already be padded to the cell width (the
    /// equivocation wrap produces exactly cell-width ciphertexts).
    pub fn encode_with_payload(&self, round: u32, slot_payload: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut cell = self.encode(round);
        if let Some(payload) = slot_payload {
            if payload.len() != self.cell_len {
                Err(CallerError::BadInput)?;
            }
            xor_into(&mut cell, payload);
        }
        Ok(cell)
    }
}

/// XOR-combine a round's cells.
///
/// With every client and trustee cell of a round present, the pads cancel
/// pairwise and the result is the slot owner's payload. Decoding never
/// fails; a missing or out-of-sync contribution yields uniform-looking
/// garbage that downstream authentication rejects.
pub fn decode<'a>(cells: impl IntoIterator<Item = &'a [u8]>, cell_len: usize) -> Vec<u8> {
    let mut combined = vec![0u8; cell_len];
    for cell in cells {
        xor_into(&mut combined, cell);
    }
    combined
}

fn xor_into(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other.iter()) {
        *a ^= b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec25519::EC25519;
    use crate::utils::testing::init_testing;
    use rand::{CryptoRng, RngCore};

    /// Derive the full matrix of pairwise secrets for `n_clients` clients
    /// and `n_trustees` trustees, returning per-client and per-trustee
    /// codecs built from each side's own view of the secrets.
    fn build_codecs<R: RngCore + CryptoRng>(
        rng: &mut R,
        n_clients: usize,
        n_trustees: usize,
        cell_len: usize,
    ) -> (Vec<CellCodec>, Vec<CellCodec>) {
        let clients: Vec<_> = (0..n_clients).map(|_| EC25519::keypair(rng)).collect();
        let trustees: Vec<_> = (0..n_trustees).map(|_| EC25519::keypair(rng)).collect();

        let client_codecs = clients
            .iter()
            .map(|(private, _)| {
                let secrets: Vec<_> = trustees
                    .iter()
                    .map(|(_, public)| EC25519::shared_secret(private, public))
                    .collect();
                CellCodec::setup::<EC25519>(&secrets, cell_len)
            })
            .collect();

        let trustee_codecs = trustees
            .iter()
            .map(|(private, _)| {
                let secrets: Vec<_> = clients
                    .iter()
                    .map(|(_, public)| EC25519::shared_secret(private, public))
                    .collect();
                CellCodec::setup::<EC25519>(&secrets, cell_len)
            })
            .collect();

        (client_codecs, trustee_codecs)
    }

    fn run_round(
        client_codecs: &[CellCodec],
        trustee_codecs: &[CellCodec],
        round: u32,
        owner: usize,
        payload: &[u8],
        cell_len: usize,
    ) -> Vec<u8> {
        let mut cells = Vec::new();
        for (i, codec) in client_codecs.iter().enumerate() {
            let slot_payload = (i == owner).then_some(payload);
            cells.push(codec.encode_with_payload(round, slot_payload).unwrap());
        }
        for codec in trustee_codecs {
            cells.push(codec.encode(round));
        }
        decode(cells.iter().map(Vec::as_slice), cell_len)
    }

    #[test]
    fn pads_cancel_and_reveal_the_owner_payload() {
        let mut rng = init_testing();
        for (n_clients, n_trustees) in [(1, 1), (2, 1), (1, 3), (3, 2), (5, 3)] {
            let cell_len = 16;
            let (client_codecs, trustee_codecs) =
                build_codecs(&mut rng, n_clients, n_trustees, cell_len);

            let payload = b"anonymous words!";
            for owner in 0..n_clients {
                let decoded = run_round(
                    &client_codecs,
                    &trustee_codecs,
                    owner as u32,
                    owner,
                    payload,
                    cell_len,
                );
                assert_eq!(decoded, payload);
            }
        }
    }

    #[test]
    fn no_payload_decodes_to_zeros() {
        let mut rng = init_testing();
        let cell_len = 8;
        let (client_codecs, trustee_codecs) = build_codecs(&mut rng, 2, 2, cell_len);

        let mut cells = Vec::new();
        for codec in client_codecs.iter().chain(trustee_codecs.iter()) {
            cells.push(codec.encode(4));
        }
        let decoded = decode(cells.iter().map(Vec::as_slice), cell_len);
        assert_eq!(decoded, vec![0u8; cell_len]);
    }

    #[test]
    fn encoding_a_round_is_deterministic() {
        let mut rng = init_testing();
        let (client_codecs, _) = build_codecs(&mut rng, 1, 2, 32);
        let first = client_codecs[0].encode(9);
        let again = client_codecs[0].encode(9);
        assert_eq!(first, again);

        // Distinct rounds read distinct pads.
        assert_ne!(client_codecs[0].encode(9), client_codecs[0].encode(10));
    }

    #[test]
    fn zero_length_cells_are_supported() {
        let mut rng = init_testing();
        let (client_codecs, trustee_codecs) = build_codecs(&mut rng, 2, 1, 0);
        let decoded = run_round(&client_codecs, &trustee_codecs, 0, 0, b"", 0);
        assert!(decoded.is_empty());
    }

    #[test]
    fn mismatched_payload_width_is_rejected() {
        let mut rng = init_testing();
        let (client_codecs, _) = build_codecs(&mut rng, 1, 1, 16);
        assert!(client_codecs[0]
            .encode_with_payload(0, Some(b"short"))
            .is_err());
    }

    #[test]
    fn desync_produces_garbage_not_panics() {
        let mut rng = init_testing();
        let cell_len = 16;
        let (client_codecs, trustee_codecs) = build_codecs(&mut rng, 2, 1, cell_len);

        // The trustee encodes a different round than the clients.
        let cells = vec![
            client_codecs[0].encode(3),
            client_codecs[1].encode(3),
            trustee_codecs[0].encode(4),
        ];
        let decoded = decode(cells.iter().map(Vec::as_slice), cell_len);
        assert_ne!(decoded, vec![0u8; cell_len]);
    }
}
