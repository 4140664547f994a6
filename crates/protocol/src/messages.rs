use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a room member, assigned by the relay at join time.
///
/// The total order on ids is load-bearing: for any pair of participants the
/// lower id is the offering side, so both ends of a pair compute the same
/// initiator without a round trip.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ParticipantId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// One roster member as broadcast by the relay.
///
/// The relay has shipped two roster shapes over time: bare ids (`[1, 2]`)
/// and id/name pairs (`[[1, "ann"], [2, "ben"]]`). Both parse into this one
/// type; the display name is simply absent in the older shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RosterEntryWire", into = "RosterEntryWire")]
pub struct RosterEntry {
    pub id: ParticipantId,
    pub name: Option<String>,
}

impl RosterEntry {
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn named(id: impl Into<ParticipantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}

/// Wire shape for a roster entry. `Named` must come first: a JSON number
/// never matches a tuple, while untagged matching tries variants in order.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RosterEntryWire {
    Named(ParticipantId, String),
    Plain(ParticipantId),
}

impl From<RosterEntryWire> for RosterEntry {
    fn from(wire: RosterEntryWire) -> Self {
        match wire {
            RosterEntryWire::Named(id, name) => Self {
                id,
                name: Some(name),
            },
            RosterEntryWire::Plain(id) => Self { id, name: None },
        }
    }
}

impl From<RosterEntry> for RosterEntryWire {
    fn from(entry: RosterEntry) -> Self {
        match entry.name {
            Some(name) => Self::Named(entry.id, name),
            None => Self::Plain(entry.id),
        }
    }
}

/// Messages sent from the client to the relay.
///
/// Tags are snake_case on this direction, including `ice_candidate` —
/// the relay rejects kebab-case here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announce membership after the room socket opens
    Join {
        room_id: String,
        user_id: ParticipantId,
    },
    /// Graceful departure; the relay broadcasts the updated roster
    Leave { room_id: String },
    /// SDP offer toward one roommate
    Offer {
        target_user_id: ParticipantId,
        sdp: String,
    },
    /// SDP answer toward one roommate
    Answer {
        target_user_id: ParticipantId,
        sdp: String,
    },
    /// Locally discovered network-path candidate
    IceCandidate {
        target_user_id: ParticipantId,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
}

/// Messages delivered by the relay.
///
/// The relay tags roster and candidate events kebab-case; the
/// `ice_candidate` alias tolerates deployments that echo the client tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Somebody joined; `users` is the full authoritative roster
    #[serde(rename = "user-joined")]
    UserJoined {
        user_id: ParticipantId,
        users: Vec<RosterEntry>,
    },
    /// Somebody left. Older relays send only the departed id and name;
    /// newer ones include the updated roster as well.
    #[serde(rename = "user-left")]
    UserLeft {
        user_id: ParticipantId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        users: Option<Vec<RosterEntry>>,
    },
    #[serde(rename = "offer")]
    Offer { from: ParticipantId, sdp: String },
    #[serde(rename = "answer")]
    Answer { from: ParticipantId, sdp: String },
    #[serde(rename = "ice-candidate", alias = "ice_candidate")]
    IceCandidate {
        from: ParticipantId,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
    /// Human-readable relay-side failure; surfaced, never acted on
    #[serde(rename = "error")]
    Error { message: String },
}

/// Short-lived relay credentials returned by the credential service.
///
/// Merged with the configured STUN urls into the ICE server list. Fetch
/// failure degrades path discovery but never blocks joining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
    #[serde(default)]
    pub urls: Vec<String>,
}
