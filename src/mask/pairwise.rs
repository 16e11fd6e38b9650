use rand::RngCore;
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};

use crate::{
    mask::{
        shamir,
        KeyPair,
        MaskError,
        MaskObject,
        MaskSeed,
        MaskingScheme,
        PublicKey,
        SecretKey,
        SecretShare,
    },
    registry::ParticipantId,
};

/// Pairwise additive masking.
///
/// Every pair of participants agrees on a shared secret by X25519 key agreement and expands it
/// into a mask. The participant with the smaller id adds the mask to its update, the other one
/// subtracts it, so the masks of any two contributors cancel in the sum. Secret keys are shared
/// with Shamir's scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairwiseMasking;

impl PairwiseMasking {
    fn seed(round_id: u64, secret: &SecretKey, public: &PublicKey) -> MaskSeed {
        let secret = StaticSecret::from(*secret.as_bytes());
        let shared = secret.diffie_hellman(&DhPublicKey::from(public.0));
        MaskSeed::derive(round_id, shared.as_bytes())
    }
}

impl MaskingScheme for PairwiseMasking {
    fn generate_keypair(&self, rng: &mut dyn RngCore) -> KeyPair {
        let mut bytes = [0_u8; 32];
        rng.fill_bytes(&mut bytes);
        let secret = SecretKey::from_bytes(bytes);
        KeyPair {
            public: self.public_key(&secret),
            secret,
        }
    }

    fn public_key(&self, secret: &SecretKey) -> PublicKey {
        let secret = StaticSecret::from(*secret.as_bytes());
        PublicKey(DhPublicKey::from(&secret).to_bytes())
    }

    fn generate_shares(
        &self,
        secret: &SecretKey,
        threshold: usize,
        indices: &[u32],
        rng: &mut dyn RngCore,
    ) -> Result<Vec<SecretShare>, MaskError> {
        shamir::split(secret.as_bytes(), threshold, indices, rng)
    }

    fn combine_shares(
        &self,
        shares: &[SecretShare],
        threshold: usize,
    ) -> Result<SecretKey, MaskError> {
        let bytes = shamir::combine(shares, threshold, 32)?;
        let mut secret = [0_u8; 32];
        secret.copy_from_slice(&bytes);
        Ok(SecretKey::from_bytes(secret))
    }

    fn apply_mask(
        &self,
        round_id: u64,
        (own_id, own_secret): (&ParticipantId, &SecretKey),
        peers: &[(ParticipantId, PublicKey)],
        object: &mut MaskObject,
    ) {
        for (peer_id, peer_key) in peers.iter().filter(|(id, _)| id != own_id) {
            let mask = Self::seed(round_id, own_secret, peer_key).derive_mask(object.len());
            if own_id < peer_id {
                object.add_assign(&mask);
            } else {
                object.sub_assign(&mask);
            }
        }
    }

    fn remove_mask(
        &self,
        round_id: u64,
        (dropped_id, dropped_secret): (&ParticipantId, &SecretKey),
        contributors: &[(ParticipantId, PublicKey)],
        sum: &mut MaskObject,
    ) {
        for (contributor_id, contributor_key) in contributors
            .iter()
            .filter(|(id, _)| id != dropped_id)
        {
            let mask = Self::seed(round_id, dropped_secret, contributor_key).derive_mask(sum.len());
            // undo what the contributor did against the dropped participant
            if contributor_id < dropped_id {
                sum.sub_assign(&mask);
            } else {
                sum.add_assign(&mask);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::mask::FixedPoint;

    struct Member {
        id: ParticipantId,
        keys: KeyPair,
    }

    fn members(n: u128, rng: &mut ChaCha20Rng) -> Vec<Member> {
        (1..=n)
            .map(|i| Member {
                id: ParticipantId::from_u128(i),
                keys: PairwiseMasking.generate_keypair(rng),
            })
            .collect()
    }

    fn public_keys(members: &[Member]) -> Vec<(ParticipantId, PublicKey)> {
        members.iter().map(|m| (m.id, m.keys.public)).collect()
    }

    fn masked(
        round_id: u64,
        member: &Member,
        peers: &[(ParticipantId, PublicKey)],
        update: &[f64],
    ) -> MaskObject {
        let mut object = FixedPoint::new(24).encode_all(update);
        PairwiseMasking.apply_mask(round_id, (&member.id, &member.keys.secret), peers, &mut object);
        object
    }

    #[test]
    fn test_masks_cancel_in_the_full_sum() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let members = members(4, &mut rng);
        let peers = public_keys(&members);

        let mut sum = MaskObject::zeroed(2);
        for (i, member) in members.iter().enumerate() {
            let object = masked(3, member, &peers, &[i as f64, -1.5]);
            assert_ne!(object, FixedPoint::new(24).encode_all(&[i as f64, -1.5]));
            sum.add_assign(&object);
        }
        assert_eq!(FixedPoint::new(24).decode_all(&sum), vec![6., -6.]);
    }

    #[test]
    fn test_remove_mask_of_dropped_member() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let members = members(4, &mut rng);
        let peers = public_keys(&members);
        let dropped = &members[1];
        let contributors = members
            .iter()
            .filter(|m| m.id != dropped.id)
            .collect::<Vec<_>>();

        let indices = [1, 2, 3, 4];
        let shares = PairwiseMasking
            .generate_shares(&dropped.keys.secret, 3, &indices, &mut rng)
            .unwrap();

        let mut sum = MaskObject::zeroed(1);
        for member in contributors.iter() {
            sum.add_assign(&masked(5, member, &peers, &[2.25]));
        }

        let survivors_shares = vec![shares[0].clone(), shares[2].clone(), shares[3].clone()];
        let secret = PairwiseMasking.combine_shares(&survivors_shares, 3).unwrap();
        assert_eq!(secret, dropped.keys.secret);
        assert_eq!(PairwiseMasking.public_key(&secret), dropped.keys.public);

        let contributor_keys = contributors
            .iter()
            .map(|m| (m.id, m.keys.public))
            .collect::<Vec<_>>();
        PairwiseMasking.remove_mask(5, (&dropped.id, &secret), &contributor_keys, &mut sum);
        assert_eq!(FixedPoint::new(24).decode_all(&sum), vec![6.75]);
    }
}
