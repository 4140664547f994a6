use std::collections::{BTreeMap, BTreeSet};

use huddle_protocol::{ParticipantId, RosterEntry};
use tracing::debug;

use crate::coordinator::is_initiator;
use crate::session::PeerSession;

/// Owns every live peer session, keyed by participant. Map keying plus
/// remove-before-recreate on inbound offers keeps the invariant of at most
/// one session per participant.
pub struct SessionRegistry {
    sessions: BTreeMap<ParticipantId, PeerSession>,
    next_epoch: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_epoch: 0,
        }
    }

    pub fn get_mut(&mut self, id: ParticipantId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(&id)
    }

    /// Epoch for the next session toward any participant. Monotonic across
    /// the registry so a recreated session never repeats an epoch.
    pub fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    pub fn insert(&mut self, session: PeerSession) {
        debug_assert!(!self.sessions.contains_key(&session.id));
        self.sessions.insert(session.id, session);
    }

    /// True when a session for `id` exists and was created under `epoch`.
    /// Callbacks resolved after a teardown or re-creation fail this check.
    pub fn epoch_matches(&self, id: ParticipantId, epoch: u64) -> bool {
        self.sessions.get(&id).is_some_and(|s| s.epoch == epoch)
    }

    /// Forced teardown. Returns whether a session existed.
    pub async fn remove(&mut self, id: ParticipantId) -> bool {
        match self.sessions.remove(&id) {
            Some(mut session) => {
                session.close().await;
                debug!(peer = %id, "Peer session removed");
                true
            }
            None => false,
        }
    }

    /// Close every session; used on leaving the room or transport loss.
    pub async fn teardown_all(&mut self) {
        for (_, mut session) in std::mem::take(&mut self.sessions) {
            session.close().await;
        }
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ParticipantId, &mut PeerSession)> {
        self.sessions.iter_mut()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Compute the creation and teardown sets for an authoritative roster.
///
/// Pure so idempotence is directly testable: applying the same roster twice
/// yields empty sets the second time. Creation is restricted to pairs where
/// the local side initiates; the responder side of a pair builds its session
/// when the offer arrives instead.
pub fn roster_diff(
    self_id: ParticipantId,
    roster: &[RosterEntry],
    existing: &[ParticipantId],
) -> (Vec<ParticipantId>, Vec<ParticipantId>) {
    let members: BTreeSet<ParticipantId> = roster.iter().map(|e| e.id).collect();
    let to_create = members
        .iter()
        .copied()
        .filter(|&m| m != self_id && is_initiator(self_id, m) && !existing.contains(&m))
        .collect();
    let to_remove = existing
        .iter()
        .copied()
        .filter(|e| !members.contains(e))
        .collect();
    (to_create, to_remove)
}
