//! The client side of the masking protocol, as performed by the participants in the tests.

use std::collections::{BTreeMap, HashMap};

use derive_more::Deref;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    mask::{FixedPoint, KeyPair, MaskObject, MaskingScheme, PairwiseMasking, SecretShare},
    notifier::Notification,
    protocol::{DropoutShare, KeyMaterial, KeyRelay, RoundSession},
    registry::{ParticipantId, ParticipantRegistry, ParticipantState},
    selector::Cohort,
    state_machine::{
        requests::{
            DropoutSharesRequest,
            KeyMaterialRequest,
            MaskedUpdateRequest,
            StateMachineRequest,
        },
        tests::utils,
    },
};

/// A participant which follows the protocol.
///
/// The sealed shares are the plain serialized shares, the coordinator never opens them anyway.
pub struct SimulatedParticipant {
    pub id: ParticipantId,
    pub keys: KeyPair,
    /// The shares of the secret key, keyed by the cohort member they are meant for.
    shares: BTreeMap<ParticipantId, SecretShare>,
    fixed_point: FixedPoint,
}

impl SimulatedParticipant {
    /// Creates a member of the given cohort with deterministic keys.
    pub fn new(id: ParticipantId, cohort: &Cohort, threshold: usize, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let keys = PairwiseMasking.generate_keypair(&mut rng);
        let indices = (1..=cohort.len() as u32).collect::<Vec<_>>();
        let shares = PairwiseMasking
            .generate_shares(&keys.secret, threshold, &indices, &mut rng)
            .unwrap();
        let fixed_point = utils::coordinator_state().round_params.fixed_point;
        Self {
            id,
            keys,
            shares: cohort.iter().copied().zip(shares).collect(),
            fixed_point,
        }
    }

    pub fn key_material(&self) -> KeyMaterial {
        KeyMaterial {
            public_key: self.keys.public,
            sealed_shares: self
                .shares
                .iter()
                .filter(|(peer, _)| **peer != self.id)
                .map(|(peer, share)| (*peer, bincode::serialize(share).unwrap()))
                .collect(),
        }
    }

    pub fn key_material_request(&self, round_id: u64) -> StateMachineRequest {
        KeyMaterialRequest {
            participant_id: self.id,
            round_id,
            material: self.key_material(),
        }
        .into()
    }

    pub fn masked_update(&self, round_id: u64, relay: &KeyRelay, update: &[f64]) -> MaskObject {
        let mut object = self.fixed_point.encode_all(update);
        PairwiseMasking.apply_mask(
            round_id,
            (&self.id, &self.keys.secret),
            &relay.peers,
            &mut object,
        );
        object
    }

    pub fn masked_update_request(
        &self,
        round_id: u64,
        relay: &KeyRelay,
        update: &[f64],
    ) -> StateMachineRequest {
        MaskedUpdateRequest {
            participant_id: self.id,
            round_id,
            masked: self.masked_update(round_id, relay, update),
        }
        .into()
    }

    /// Opens the shares which the dropped members sealed for this participant.
    pub fn dropout_shares(&self, relay: &KeyRelay, dropped: &[ParticipantId]) -> Vec<DropoutShare> {
        dropped
            .iter()
            .map(|dropped| DropoutShare {
                dropped: *dropped,
                share: bincode::deserialize(&relay.sealed_shares[dropped]).unwrap(),
            })
            .collect()
    }

    pub fn dropout_shares_request(
        &self,
        round_id: u64,
        relay: &KeyRelay,
        dropped: &[ParticipantId],
    ) -> StateMachineRequest {
        DropoutSharesRequest {
            participant_id: self.id,
            round_id,
            shares: self.dropout_shares(relay, dropped),
        }
        .into()
    }
}

/// The members of a cohort, ordered by id.
#[derive(Deref)]
pub struct Participants(Vec<SimulatedParticipant>);

impl Participants {
    /// Creates a cohort of `n` participants with the ids `1..=n`.
    pub fn new(n: u128, threshold: usize) -> Self {
        let cohort = Cohort::new((1..=n).map(ParticipantId::from_u128));
        Self(
            cohort
                .iter()
                .enumerate()
                .map(|(i, id)| SimulatedParticipant::new(*id, &cohort, threshold, i as u64))
                .collect(),
        )
    }

    pub fn cohort(&self) -> Cohort {
        Cohort::new(self.0.iter().map(|participant| participant.id))
    }

    /// Registers every participant in the given state.
    pub fn register(&self, registry: &ParticipantRegistry, state: ParticipantState) {
        for participant in self.0.iter() {
            utils::register_in_state(registry, &participant.id, state);
        }
    }

    /// A session in which every member exchanged its keys and the first `submitters` members
    /// submitted an update of zeros.
    pub fn session_after_key_exchange(&self, round_id: u64, submitters: usize) -> RoundSession {
        let mut session = self.session_with_keys(round_id);
        let zeros = vec![0.; session.params().object_length];
        self.submit(&mut session, submitters, &zeros);
        session
    }

    /// A session in which every member exchanged its keys, the first `submitters` members
    /// submitted the given update and the submission is closed.
    pub fn session_after_submission(
        &self,
        round_id: u64,
        submitters: usize,
        update: &[f64],
    ) -> RoundSession {
        let mut session = self.session_with_keys(round_id);
        self.submit(&mut session, submitters, update);
        session.close_submission();
        session
    }

    fn session_with_keys(&self, round_id: u64) -> RoundSession {
        let params = utils::coordinator_state().round_params.session_params();
        let mut session = RoundSession::new(round_id, self.cohort(), params);
        for participant in self.0.iter() {
            session
                .add_key_material(&participant.id, participant.key_material())
                .unwrap();
        }
        assert!(session.close_key_exchange().is_empty());
        session
    }

    fn submit(&self, session: &mut RoundSession, submitters: usize, update: &[f64]) {
        let round_id = session.round_id();
        for participant in self.0.iter().take(submitters) {
            let relay = session.relay_for(&participant.id).unwrap();
            let masked = participant.masked_update(round_id, &relay, update);
            session.add_masked_update(&participant.id, &masked).unwrap();
        }
    }
}

/// Waits until `n` participants were sent their relayed keys.
pub async fn keys_available(
    notifications: &mut UnboundedReceiver<(ParticipantId, Notification)>,
    n: usize,
) -> HashMap<ParticipantId, KeyRelay> {
    let mut relays = HashMap::new();
    while relays.len() < n {
        let (id, notification) = notifications.recv().await.unwrap();
        if let Notification::KeysAvailable { relay, .. } = notification {
            relays.insert(id, relay);
        }
    }
    relays
}
