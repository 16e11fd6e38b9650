use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    mask::{Aggregation, FixedPoint, MaskObject, MaskingScheme, PublicKey, SecretShare},
    protocol::{
        Aggregate,
        Combiner,
        DropoutShare,
        KeyMaterial,
        KeyRelay,
        ProtocolError,
        Stage,
    },
    registry::ParticipantId,
    selector::Cohort,
};

/// The parameters of a masking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    /// The number of shares needed to rebuild a secret key.
    pub threshold: usize,
    /// The number of elements of a masked update.
    pub object_length: usize,
    pub fixed_point: FixedPoint,
}

/// The protocol progress of a cohort member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub public_key: Option<PublicKey>,
    pub sealed_shares: BTreeMap<ParticipantId, Vec<u8>>,
    pub submitted: bool,
    pub dropped: bool,
    pub provided_dropout_shares: bool,
}

/// The masking session of a round.
///
/// The session is plain data: it can be checkpointed as a whole and restored after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSession {
    round_id: u64,
    cohort: Cohort,
    params: SessionParams,
    stage: Stage,
    members: BTreeMap<ParticipantId, MemberRecord>,
    aggregation: Aggregation,
    recovery: BTreeMap<ParticipantId, Vec<SecretShare>>,
}

impl RoundSession {
    /// Opens the session of a round in the key exchange stage.
    pub fn new(round_id: u64, cohort: Cohort, params: SessionParams) -> Self {
        let members = cohort
            .iter()
            .map(|id| (*id, MemberRecord::default()))
            .collect();
        Self {
            round_id,
            cohort,
            params,
            stage: Stage::KeyExchange,
            members,
            aggregation: Aggregation::new(params.object_length),
            recovery: BTreeMap::new(),
        }
    }

    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn cohort(&self) -> &Cohort {
        &self.cohort
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Gets the progress of a member.
    pub fn member(&self, id: &ParticipantId) -> Option<&MemberRecord> {
        self.members.get(id)
    }

    fn ids_where(&self, predicate: impl Fn(&MemberRecord) -> bool) -> Vec<ParticipantId> {
        self.members
            .iter()
            .filter(|(_, member)| predicate(member))
            .map(|(id, _)| *id)
            .collect()
    }

    fn expect_stage(&self, stage: Stage) -> Result<(), ProtocolError> {
        if self.stage == stage {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedMessage(self.stage))
        }
    }

    fn active_member(&self, id: &ParticipantId) -> Result<&MemberRecord, ProtocolError> {
        match self.members.get(id) {
            Some(member) if !member.dropped => Ok(member),
            _ => Err(ProtocolError::NotInCohort(*id)),
        }
    }

    /// Accepts the key material of a member.
    ///
    /// # Errors
    /// Fails if the key exchange is over, if the participant is not an active member, if it
    /// already submitted key material or if its sealed shares are not addressed to exactly all
    /// other members.
    pub fn add_key_material(
        &mut self,
        id: &ParticipantId,
        material: KeyMaterial,
    ) -> Result<(), ProtocolError> {
        self.expect_stage(Stage::KeyExchange)?;
        if self.active_member(id)?.public_key.is_some() {
            return Err(ProtocolError::AlreadySubmitted(*id));
        }

        let recipients = material.sealed_shares.keys().collect::<BTreeSet<_>>();
        let peers = self.cohort.iter().filter(|peer| *peer != id).collect::<BTreeSet<_>>();
        if recipients != peers {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected {} sealed share(s) addressed to the other cohort members",
                peers.len()
            )));
        }

        if let Some(member) = self.members.get_mut(id) {
            member.public_key = Some(material.public_key);
            member.sealed_shares = material.sealed_shares;
        }
        debug!("accepted key material of participant {}", id);
        Ok(())
    }

    /// Checks whether every active member submitted its key material.
    pub fn key_exchange_complete(&self) -> bool {
        self.members
            .values()
            .all(|member| member.dropped || member.public_key.is_some())
    }

    /// Ends the key exchange. Active members without key material are dropped and returned.
    pub fn close_key_exchange(&mut self) -> Vec<ParticipantId> {
        let missing = self.ids_where(|member| !member.dropped && member.public_key.is_none());
        for id in missing.iter() {
            self.mark_dropped(id);
        }
        self.stage = Stage::Submission;
        info!(
            "key exchange of round {} closed with {} key holder(s)",
            self.round_id,
            self.key_holders().len()
        );
        missing
    }

    /// The public keys of all members which completed the key exchange, sorted by id.
    ///
    /// Every update is masked against these keys, including the keys of members which dropped
    /// later on.
    pub fn key_holders(&self) -> Vec<(ParticipantId, PublicKey)> {
        self.members
            .iter()
            .filter_map(|(id, member)| member.public_key.map(|key| (*id, key)))
            .collect()
    }

    /// The key material of its peers which is relayed to a key holder.
    pub fn relay_for(&self, id: &ParticipantId) -> Option<KeyRelay> {
        self.members.get(id)?.public_key?;
        let peers = self
            .key_holders()
            .into_iter()
            .filter(|(peer, _)| peer != id)
            .collect::<Vec<_>>();
        let sealed_shares = peers
            .iter()
            .filter_map(|(peer, _)| {
                let sealed = self.members.get(peer)?.sealed_shares.get(id)?;
                Some((*peer, sealed.clone()))
            })
            .collect();
        Some(KeyRelay {
            peers,
            sealed_shares,
        })
    }

    /// Marks a member as dropped. Returns whether it was active before.
    pub fn mark_dropped(&mut self, id: &ParticipantId) -> bool {
        match self.members.get_mut(id) {
            Some(member) if !member.dropped => {
                member.dropped = true;
                debug!("participant {} dropped from round {}", id, self.round_id);
                true
            }
            _ => false,
        }
    }

    /// Checks whether a masked update would be accepted, without accepting it.
    pub fn validate_masked_update(
        &self,
        id: &ParticipantId,
        masked: &MaskObject,
    ) -> Result<(), ProtocolError> {
        self.expect_stage(Stage::Submission)?;
        let member = self.active_member(id)?;
        if member.public_key.is_none() {
            return Err(ProtocolError::NotInCohort(*id));
        }
        if member.submitted {
            return Err(ProtocolError::AlreadySubmitted(*id));
        }
        self.aggregation
            .validate_aggregation(masked)
            .map_err(|err| ProtocolError::InvalidMessage(err.to_string()))
    }

    /// Adds a masked update to the running sum.
    ///
    /// # Errors
    /// See [`validate_masked_update()`](Self::validate_masked_update). A rejected update leaves
    /// the sum unchanged.
    pub fn add_masked_update(
        &mut self,
        id: &ParticipantId,
        masked: &MaskObject,
    ) -> Result<(), ProtocolError> {
        self.validate_masked_update(id, masked)?;
        self.aggregation.aggregate(masked);
        if let Some(member) = self.members.get_mut(id) {
            member.submitted = true;
        }
        debug!("accepted masked update of participant {}", id);
        Ok(())
    }

    /// The members whose updates are in the sum.
    pub fn contributors(&self) -> Vec<ParticipantId> {
        self.ids_where(|member| member.submitted)
    }

    /// The active key holders which did not submit yet.
    pub fn pending_submitters(&self) -> Vec<ParticipantId> {
        self.ids_where(|member| {
            member.public_key.is_some() && !member.dropped && !member.submitted
        })
    }

    /// The largest number of contributors the round can still reach.
    pub fn max_contributors(&self) -> usize {
        match self.stage {
            Stage::KeyExchange => self.members.values().filter(|member| !member.dropped).count(),
            Stage::Submission => self.contributors().len() + self.pending_submitters().len(),
            Stage::Recovery => self.contributors().len(),
        }
    }

    pub fn submission_complete(&self) -> bool {
        self.pending_submitters().is_empty()
    }

    /// Ends the submission stage. Pending submitters are dropped and returned.
    pub fn close_submission(&mut self) -> Vec<ParticipantId> {
        let pending = self.pending_submitters();
        for id in pending.iter() {
            self.mark_dropped(id);
        }
        self.stage = Stage::Recovery;
        info!(
            "submission of round {} closed with {} contributor(s)",
            self.round_id,
            self.aggregation.nb_objects()
        );
        pending
    }

    /// The key holders whose masks must be removed from the sum.
    pub fn to_recover(&self) -> Vec<ParticipantId> {
        self.ids_where(|member| member.public_key.is_some() && !member.submitted)
    }

    /// The contributors which can still open the shares of the dropped members.
    pub fn share_providers(&self) -> Vec<ParticipantId> {
        self.ids_where(|member| member.submitted && !member.dropped)
    }

    /// Accepts the opened shares of a surviving contributor.
    ///
    /// # Errors
    /// Fails unless the session is recovering, the sender is an active contributor which did not
    /// answer yet and the shares concern exactly the members to recover and carry the sender's
    /// share index.
    pub fn add_dropout_shares(
        &mut self,
        id: &ParticipantId,
        shares: Vec<DropoutShare>,
    ) -> Result<(), ProtocolError> {
        self.expect_stage(Stage::Recovery)?;
        let member = self.active_member(id)?;
        if !member.submitted {
            return Err(ProtocolError::NotInCohort(*id));
        }
        if member.provided_dropout_shares {
            return Err(ProtocolError::AlreadySubmitted(*id));
        }

        let index = self
            .cohort
            .index_of(id)
            .ok_or(ProtocolError::NotInCohort(*id))?;
        let to_recover = self.to_recover().into_iter().collect::<BTreeSet<_>>();
        let concerned = shares
            .iter()
            .map(|share| share.dropped)
            .collect::<BTreeSet<_>>();
        if concerned != to_recover || shares.len() != to_recover.len() {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected one share for each of the {} dropped member(s)",
                to_recover.len()
            )));
        }
        if let Some(share) = shares.iter().find(|share| share.share.index != index) {
            return Err(ProtocolError::InvalidMessage(format!(
                "share index {} does not match the sender's index {}",
                share.share.index, index
            )));
        }

        for DropoutShare { dropped, share } in shares {
            self.recovery.entry(dropped).or_default().push(share);
        }
        if let Some(member) = self.members.get_mut(id) {
            member.provided_dropout_shares = true;
        }
        debug!("accepted dropout shares of participant {}", id);
        Ok(())
    }

    /// Checks whether enough shares are available to rebuild every dropped member's key, or no
    /// more shares can arrive.
    pub fn recovery_complete(&self) -> bool {
        let threshold = self.params.threshold;
        let enough = self.to_recover().iter().all(|id| {
            self.recovery
                .get(id)
                .map_or(false, |shares| shares.len() >= threshold)
        });
        let all_answered = self
            .members
            .values()
            .filter(|member| member.submitted && !member.dropped)
            .all(|member| member.provided_dropout_shares);
        enough || all_answered
    }

    /// Unmasks the sum and combines it into the aggregate of the round.
    ///
    /// # Errors
    /// Fails with [`ProtocolError::AggregationFailed`] if there are no contributions, if the key
    /// of a dropped member can't be rebuilt or doesn't match its public key, or if the combiner
    /// rejects the sum.
    pub fn finalize(
        &self,
        scheme: &dyn MaskingScheme,
        combiner: &dyn Combiner,
    ) -> Result<Aggregate, ProtocolError> {
        let contributors = self
            .members
            .iter()
            .filter(|(_, member)| member.submitted)
            .filter_map(|(id, member)| member.public_key.map(|key| (*id, key)))
            .collect::<Vec<_>>();
        if contributors.is_empty() {
            return Err(ProtocolError::AggregationFailed(
                "no masked updates were submitted".into(),
            ));
        }

        let to_recover = self.to_recover();
        let mut sum = MaskObject::from(self.aggregation.clone());
        for dropped in to_recover.iter() {
            let shares = self.recovery.get(dropped).map(Vec::as_slice).unwrap_or(&[]);
            let secret = scheme
                .combine_shares(shares, self.params.threshold)
                .map_err(|err| {
                    warn!("can't rebuild the key of participant {}: {}", dropped, err);
                    ProtocolError::AggregationFailed(format!(
                        "key of participant {} not recoverable: {}",
                        dropped, err
                    ))
                })?;
            let registered = self
                .members
                .get(dropped)
                .and_then(|member| member.public_key);
            if registered != Some(scheme.public_key(&secret)) {
                return Err(ProtocolError::AggregationFailed(format!(
                    "the rebuilt key of participant {} does not match its public key",
                    dropped
                )));
            }
            scheme.remove_mask(self.round_id, (dropped, &secret), &contributors, &mut sum);
        }

        let decoded = self.params.fixed_point.decode_all(&sum);
        let values = combiner
            .combine(decoded, contributors.len())
            .map_err(|err| ProtocolError::AggregationFailed(err.to_string()))?;
        info!(
            "round {} aggregated {} update(s), {} dropped member(s) unmasked",
            self.round_id,
            contributors.len(),
            to_recover.len()
        );
        Ok(Aggregate {
            round_id: self.round_id,
            values,
            contributors: contributors.len(),
        })
    }
}
