use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};

use crate::mask::MaskObject;

const DOMAIN: &[u8] = b"xaynet-coordinator/pairwise-mask/v1";

/// The seed of a pairwise mask.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaskSeed([u8; 32]);

impl MaskSeed {
    pub const BYTES: usize = 32;

    /// Derives the seed of a pair of participants from their shared secret.
    ///
    /// The round number is part of the derivation, so a seed is never reused across rounds even
    /// if a participant reuses its key pair.
    pub fn derive(round_id: u64, shared_secret: &[u8]) -> Self {
        let digest = Sha256::new()
            .chain_update(DOMAIN)
            .chain_update(round_id.to_le_bytes())
            .chain_update(shared_secret)
            .finalize();
        let mut seed = [0_u8; Self::BYTES];
        seed.copy_from_slice(&digest);
        Self(seed)
    }

    pub fn as_array(&self) -> [u8; Self::BYTES] {
        self.0
    }

    /// Derives a mask of the given length from the seed.
    pub fn derive_mask(&self, len: usize) -> MaskObject {
        let mut prng = ChaCha20Rng::from_seed(self.as_array());
        MaskObject::new((0..len).map(|_| prng.next_u64()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_mask_is_deterministic() {
        let seed = MaskSeed::derive(1, &[7; 32]);
        assert_eq!(seed.derive_mask(8), seed.derive_mask(8));
        assert_eq!(seed.derive_mask(8).data[..4], seed.derive_mask(4).data[..]);
    }

    #[test]
    fn test_seed_depends_on_round() {
        assert_ne!(MaskSeed::derive(1, &[7; 32]), MaskSeed::derive(2, &[7; 32]));
    }
}
