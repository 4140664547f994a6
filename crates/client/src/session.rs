use std::sync::Arc;

use anyhow::Context;
use huddle_protocol::ParticipantId;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::coordinator::Event;
use crate::media::CurrentTracks;

/// Which side of a pair produces the first offer. Fixed at creation and
/// never flips; a role change means a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Per-session negotiation state.
///
/// `Negotiating` doubles as the in-flight guard: a negotiation trigger that
/// lands while an offer is already out is ignored, so two concurrent local
/// descriptions cannot exist for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    Negotiating,
    Stable,
    Restarting,
    Closed,
}

/// One negotiated connection toward one remote participant: the connection
/// handle, its description state, the outbound track bindings, and the
/// queue of candidates that arrived before the remote description did.
pub struct PeerSession {
    pub id: ParticipantId,
    /// Bumped on every re-creation for the same participant. Callbacks and
    /// timers carry the epoch they were armed under; a mismatch on delivery
    /// means the session they targeted is gone.
    pub epoch: u64,
    pub role: Role,
    pub state: NegotiationState,
    pub recovery_pending: bool,
    pc: Arc<RTCPeerConnection>,
    audio_sender: Arc<RTCRtpSender>,
    video_sender: Arc<RTCRtpSender>,
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_set: bool,
}

impl PeerSession {
    /// Build the connection, bind the current local tracks, and wire the
    /// connection's callbacks into the coordinator's event queue.
    pub async fn connect(
        id: ParticipantId,
        epoch: u64,
        role: Role,
        ice_servers: Vec<RTCIceServer>,
        tracks: &CurrentTracks,
        events: mpsc::Sender<Event>,
    ) -> anyhow::Result<Self> {
        let pc = build_peer_connection(ice_servers).await?;

        let audio_sender = pc
            .add_track(Arc::clone(&tracks.audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add audio track")?;
        let video_sender = pc
            .add_track(Arc::clone(&tracks.video) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(c) = candidate else { return };
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(Event::LocalCandidate {
                                peer: id,
                                epoch,
                                candidate: init,
                            })
                            .await;
                    }
                    Err(e) => warn!(peer = %id, "Failed to serialize ICE candidate: {e}"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx
                    .send(Event::Connectivity {
                        peer: id,
                        epoch,
                        state,
                    })
                    .await;
            })
        }));

        let tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let kind = track.kind().to_string();
            Box::pin(async move {
                let _ = tx
                    .send(Event::RemoteTrack {
                        peer: id,
                        epoch,
                        kind,
                    })
                    .await;
            })
        }));

        debug!(peer = %id, epoch, ?role, "Peer session created");
        Ok(Self {
            id,
            epoch,
            role,
            state: NegotiationState::New,
            recovery_pending: false,
            pc,
            audio_sender,
            video_sender,
            pending_candidates: Vec::new(),
            remote_set: false,
        })
    }

    /// Produce and install a local offer; `restart` flags it for path
    /// renegotiation. Sending it is the coordinator's job.
    pub async fn create_offer_sdp(&mut self, restart: bool) -> anyhow::Result<String> {
        let options = restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .context("Failed to create offer")?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .context("Failed to set local description")?;
        Ok(sdp)
    }

    /// Apply a remote offer and produce the local answer.
    pub async fn accept_offer(&mut self, sdp: &str) -> anyhow::Result<String> {
        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("Failed to parse SDP offer")?;
        self.pc
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;
        self.remote_set = true;
        self.flush_pending_candidates().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .context("Failed to set local description")?;
        Ok(sdp)
    }

    /// Apply a remote answer to our outstanding offer.
    pub async fn accept_answer(&mut self, sdp: &str) -> anyhow::Result<()> {
        let answer =
            RTCSessionDescription::answer(sdp.to_string()).context("Failed to parse SDP answer")?;
        self.pc
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;
        self.remote_set = true;
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Apply a remote network-path candidate, or queue it until the remote
    /// description lands. A candidate that fails to apply is logged and
    /// dropped; it never aborts the session.
    pub async fn add_remote_candidate(&mut self, init: RTCIceCandidateInit) {
        if !self.remote_set {
            debug!(peer = %self.id, "Queueing candidate until remote description is applied");
            self.pending_candidates.push(init);
            return;
        }
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            warn!(peer = %self.id, "Failed to apply ICE candidate: {e}");
        }
    }

    async fn flush_pending_candidates(&mut self) {
        for init in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(peer = %self.id, "Failed to apply queued ICE candidate: {e}");
            }
        }
    }

    pub(crate) fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn ice_connection_state(&self) -> RTCIceConnectionState {
        self.pc.ice_connection_state()
    }

    /// Swap the outbound media source in place. Negotiation state is
    /// untouched: the session shape did not change, only the sample source.
    pub async fn replace_tracks(&self, tracks: &CurrentTracks) -> anyhow::Result<()> {
        self.audio_sender
            .replace_track(Some(
                Arc::clone(&tracks.audio) as Arc<dyn TrackLocal + Send + Sync>
            ))
            .await
            .context("Failed to replace audio track")?;
        self.video_sender
            .replace_track(Some(
                Arc::clone(&tracks.video) as Arc<dyn TrackLocal + Send + Sync>
            ))
            .await
            .context("Failed to replace video track")?;
        Ok(())
    }

    /// Terminal: release the connection and all track bindings. Messages for
    /// this participant are dropped by the coordinator from here on.
    pub async fn close(&mut self) {
        self.state = NegotiationState::Closed;
        if let Err(e) = self.pc.close().await {
            warn!(peer = %self.id, "Error closing peer connection: {e}");
        }
    }
}

async fn build_peer_connection(
    ice_servers: Vec<RTCIceServer>,
) -> anyhow::Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .context("Failed to register codecs")?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .context("Failed to register interceptors")?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    Ok(Arc::new(
        api.new_peer_connection(config)
            .await
            .context("Failed to create peer connection")?,
    ))
}
