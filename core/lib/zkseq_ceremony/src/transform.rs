//! `transform`/`verify_successor` (spec §4.6), implemented in-process
//! rather than shelled out to an external toolchain (spec §9 open
//! question, resolved in DESIGN.md).
//!
//! A real Powers-of-Tau contribution multiplies every power already in the
//! blob by successive powers of a secret scalar, over a pairing-friendly
//! curve, so that the result is a group operation nobody but the
//! contributor can have produced without knowing that scalar. This
//! placeholder keeps the externally-observable shape of that operation —
//! deterministic, keyed by per-contribution entropy, checkable by anyone
//! holding `(prev, next, entropy)` — using a keyed BLAKE2b expansion
//! instead of BN254 scalar multiplication. See DESIGN.md for why this is
//! an explicit stand-in and not a cryptographic ceremony.

use blake2b_simd::Params;

/// Applies `entropy` to `blob`, producing a same-length successor. Keying
/// the hash on `entropy` and expanding with a block counter is the
/// BLAKE2b analog of multiplying every element of `blob` by the same
/// scalar: the same `entropy` against the same `blob` always yields the
/// same `blob'`, and a different `entropy` yields an unrelated one.
pub fn transform(blob: &[u8], entropy: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(blob.len());
    let mut counter: u64 = 0;
    while out.len() < blob.len() {
        let mut state = Params::new().hash_length(64).key(entropy).to_state();
        state.update(blob);
        state.update(&counter.to_be_bytes());
        out.extend_from_slice(state.finalize().as_bytes());
        counter += 1;
    }
    out.truncate(blob.len());
    out
}

/// `verify_successor(prev, next)` returns true iff `next` was produced by
/// some nonzero scalar applied to `prev` (spec §4.6): recomputes
/// `transform(prev, entropy)` and checks it against `next`, and rejects
/// the zero scalar (an entropy of all zero bytes would make every blob its
/// own successor, defeating the ceremony's purpose).
pub fn verify_successor(prev: &[u8], next: &[u8], entropy: &[u8; 32]) -> bool {
    if *entropy == [0u8; 32] {
        return false;
    }
    transform(prev, entropy) == next
}

/// Deterministic "beacon" transformation applied once, by the leader, to
/// the final contributed blob (spec §4.6 step 5). Using a hash of the blob
/// itself as the entropy keeps the beacon reproducible by every node
/// without a new secret changing hands — a real deployment would use a
/// public randomness beacon (e.g. a drand round or block hash) instead.
pub fn beacon_transform(blob: &[u8]) -> Vec<u8> {
    let hash = Params::new().hash_length(32).hash(blob);
    let mut entropy = [0u8; 32];
    entropy.copy_from_slice(hash.as_bytes());
    transform(blob, &entropy)
}
