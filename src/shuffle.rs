//! The trustee shuffle of client ephemeral keys.
//!
//! Each trustee in turn takes the running state `(base, [E_1 .. E_N])`,
//! draws a private exponent `beta` and a private permutation `pi`, and
//! outputs `(base^beta, [E_pi(1)^beta .. E_pi(N)^beta])` together with a
//! proof. After the last trustee, position `k` of the output belongs to
//! the client whose ephemeral private key `e` satisfies
//! `keys[k] = base^e`; only that client can make the connection, and as
//! long as one trustee kept its permutation private, nobody else can.
//!
//! The proof is a Fiat-Shamir Schnorr argument of knowledge of the common
//! re-encryption exponent, with the challenge transcript bound over every
//! byte of the input and output states. Altering any of them invalidates
//! the proof. The permutation itself stays out of the argument; a full
//! shuffle argument (Neff/Terelius-Wikstrom) can replace [`prove`] and
//! [`verify`] behind the same byte-level interface.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    suite::{ElementOps, ScalarOps, Suite},
};
use merlin::Transcript;
use rand::{seq::SliceRandom, CryptoRng, RngCore};

/// One decoded link of the shuffle chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleState<S: Suite> {
    /// The running base this link's keys are encrypted to.
    pub base: S::Element,
    /// The (re-encrypted, permuted) ephemeral keys.
    pub keys: Vec<S::Element>,
}

impl<S: Suite> ShuffleState<S> {
    /// The chain's initial state: the group generator and the clients'
    /// submitted ephemeral keys in client-index order.
    pub fn initial(keys: Vec<S::Element>) -> Self {
        Self {
            base: S::generator(),
            keys,
        }
    }
}

/// Perform one trustee's shuffle step.
///
/// Returns the new state and the proof to attach.
pub fn shuffle<S: Suite, R: RngCore + CryptoRng>(
    rng: &mut R,
    input: &ShuffleState<S>,
) -> Result<(ShuffleState<S>, Vec<u8>)> {
    if input.keys.is_empty() {
        Err(CallerError::BadInput)?;
    }

    let beta = S::Scalar::random(rng);
    let base = input.base.exp(&beta);

    let mut order: Vec<usize> = (0..input.keys.len()).collect();
    order.shuffle(rng);
    let keys: Vec<S::Element> = order
        .iter()
        .map(|&from| input.keys[from].exp(&beta))
        .collect();

    let output = ShuffleState { base, keys };
    let proof = prove(rng, &beta, input, &output);
    Ok((output, proof))
}

/// Produce the proof for one shuffle step.
///
/// Interface per the shuffle contract: the caller supplies the private
/// re-encryption exponent and both states; the result is an opaque byte
/// string checked by [`verify`].
pub fn prove<S: Suite, R: RngCore + CryptoRng>(
    rng: &mut R,
    beta: &S::Scalar,
    input: &ShuffleState<S>,
    output: &ShuffleState<S>,
) -> Vec<u8> {
    let r = S::Scalar::random(rng);
    let commitment = input.base.exp(&r);

    let c = challenge::<S>(input, output, &commitment);
    let z = r.add(&c.mul(beta));

    let mut proof = commitment.to_bytes();
    proof.extend_from_slice(&z.to_bytes());
    proof
}

/// Verify the proof of one shuffle step.
///
/// Returns `false` on any mismatch, including malformed proof bytes and a
/// key-count change between input and output.
pub fn verify<S: Suite>(input: &ShuffleState<S>, output: &ShuffleState<S>, proof: &[u8]) -> bool {
    if input.keys.len() != output.keys.len() || input.keys.is_empty() {
        return false;
    }

    let element_len = S::element_len();
    let scalar_len = S::scalar_len();
    if proof.len() != element_len + scalar_len {
        return false;
    }
    let Ok(commitment) = S::Element::try_from_bytes(&proof[..element_len]) else {
        return false;
    };
    let Ok(z) = S::Scalar::try_from_bytes(&proof[element_len..]) else {
        return false;
    };

    let c = challenge::<S>(input, output, &commitment);

    // base_in^z == commitment * base_out^c
    input.base.exp(&z) == commitment.mul(&output.base.exp(&c))
}

/// Verify a full shuffle chain link by link.
///
/// `initial` is the pre-shuffle state; `steps` carries one state-and-proof
/// pair per trustee in shuffle order. Performed by the relay before it
/// broadcasts the schedule, and again by every client on receipt.
pub fn verify_chain<S: Suite>(
    initial: &ShuffleState<S>,
    steps: &[(ShuffleState<S>, Vec<u8>)],
) -> bool {
    if steps.is_empty() {
        return false;
    }
    let mut previous = initial;
    for (state, proof) in steps {
        if !verify(previous, state, proof) {
            return false;
        }
        previous = state;
    }
    true
}

/// Locate this client's slot in the final shuffle state.
///
/// Returns the unique position `k` with `keys[k] = base^e`, or `None`
/// when the position is missing or ambiguous (either means the shuffle
/// output is unusable).
pub fn find_slot<S: Suite>(state: &ShuffleState<S>, ephemeral_private: &S::Scalar) -> Option<usize> {
    let expected = state.base.exp(ephemeral_private);
    let mut found = None;
    for (position, key) in state.keys.iter().enumerate() {
        if *key == expected {
            if found.is_some() {
                return None;
            }
            found = Some(position);
        }
    }
    found
}

fn challenge<S: Suite>(
    input: &ShuffleState<S>,
    output: &ShuffleState<S>,
    commitment: &S::Element,
) -> S::Scalar {
    let mut transcript = Transcript::new(b"dcnet shuffle step");
    transcript.append_message(b"suite", S::NAME.as_bytes());
    transcript.append_message(b"base in", &input.base.to_bytes());
    for key in &input.keys {
        transcript.append_message(b"key in", &key.to_bytes());
    }
    transcript.append_message(b"base out", &output.base.to_bytes());
    for key in &output.keys {
        transcript.append_message(b"key out", &key.to_bytes());
    }
    transcript.append_message(b"commitment", &commitment.to_bytes());

    let mut challenge_bytes = [0u8; 64];
    transcript.challenge_bytes(b"challenge", &mut challenge_bytes);
    S::Scalar::from_hash_bytes(&challenge_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec25519::EC25519;
    use crate::qr::QR512;
    use crate::utils::testing::init_testing;
    use rand::{CryptoRng, RngCore};

    fn ephemeral_setup<S: Suite, R: RngCore + CryptoRng>(
        rng: &mut R,
        n: usize,
    ) -> (Vec<S::Scalar>, ShuffleState<S>) {
        let privates: Vec<S::Scalar> = (0..n).map(|_| S::Scalar::random(rng)).collect();
        let keys = privates
            .iter()
            .map(|e| S::generator().exp(e))
            .collect::<Vec<_>>();
        (privates, ShuffleState::<S>::initial(keys))
    }

    fn shuffle_round_trips<S: Suite>() {
        let mut rng = init_testing();
        let (privates, initial) = ephemeral_setup::<S, _>(&mut rng, 4);

        let (output, proof) = shuffle(&mut rng, &initial).unwrap();
        assert!(verify(&initial, &output, &proof));

        // The output is a permutation of re-encryptions: every client can
        // still find exactly one slot.
        let mut slots: Vec<usize> = privates
            .iter()
            .map(|e| find_slot(&output, e).unwrap())
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, (0..4).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_round_trips_ec() {
        shuffle_round_trips::<EC25519>();
    }

    #[test]
    fn shuffle_round_trips_qr() {
        shuffle_round_trips::<QR512>();
    }

    #[test]
    fn tampering_any_input_invalidates_the_proof() {
        let mut rng = init_testing();
        let (_, initial) = ephemeral_setup::<EC25519, _>(&mut rng, 3);
        let (output, proof) = shuffle(&mut rng, &initial).unwrap();

        // Tamper with the proof bytes.
        for position in [0, proof.len() / 2, proof.len() - 1] {
            let mut bad = proof.clone();
            bad[position] ^= 0x01;
            assert!(!verify(&initial, &output, &bad));
        }
        assert!(!verify(&initial, &output, &proof[1..]));

        // Swap states: the challenge binds both directions.
        assert!(!verify(&output, &initial, &proof));

        // Replace an output key with a fresh element.
        let mut altered = output.clone();
        altered.keys[1] = EC25519::generator();
        assert!(!verify(&initial, &altered, &proof));

        // Replace the output base.
        let mut altered = output;
        altered.base = EC25519::generator();
        assert!(!verify(&initial, &altered, &proof));
    }

    #[test]
    fn chains_verify_link_by_link() {
        let mut rng = init_testing();
        let (privates, initial) = ephemeral_setup::<EC25519, _>(&mut rng, 3);

        // Three trustees shuffle in sequence.
        let mut steps = Vec::new();
        let mut state = initial.clone();
        for _ in 0..3 {
            let (next, proof) = shuffle(&mut rng, &state).unwrap();
            steps.push((next.clone(), proof));
            state = next;
        }
        assert!(verify_chain(&initial, &steps));

        // Every client finds its slot in the final state.
        for e in &privates {
            assert!(find_slot(&state, e).is_some());
        }

        // A tampered middle link breaks the chain.
        steps[1].1[0] ^= 0x01;
        assert!(!verify_chain(&initial, &steps));
    }

    #[test]
    fn single_trustee_chain_is_sufficient() {
        let mut rng = init_testing();
        let (privates, initial) = ephemeral_setup::<EC25519, _>(&mut rng, 1);
        let (output, proof) = shuffle(&mut rng, &initial).unwrap();
        assert!(verify_chain(&initial, &[(output.clone(), proof)]));
        assert_eq!(find_slot(&output, &privates[0]), Some(0));
    }

    #[test]
    fn empty_shuffle_is_rejected() {
        let mut rng = init_testing();
        let initial = ShuffleState::<EC25519>::initial(Vec::new());
        assert!(shuffle(&mut rng, &initial).is_err());
    }

    #[test]
    fn foreign_ephemeral_key_finds_no_slot() {
        let mut rng = init_testing();
        let (_, initial) = ephemeral_setup::<EC25519, _>(&mut rng, 2);
        let (output, _) = shuffle(&mut rng, &initial).unwrap();
        let stranger = crate::ec25519::EcScalar::random(&mut rng);
        assert_eq!(find_slot::<EC25519>(&output, &stranger), None);
    }
}
