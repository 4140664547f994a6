use std::time::Duration;

use huddle_protocol::{ClientMessage, ParticipantId, RosterEntry, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::media::MediaManager;
use crate::registry::{SessionRegistry, roster_diff};
use crate::session::{NegotiationState, PeerSession, Role};

/// Everything that can advance a peer's state machine, funneled through one
/// queue so no two transitions for the same session ever interleave.
#[derive(Debug)]
pub enum Event {
    /// Parsed message from the relay
    Signal(ServerMessage),
    /// Locally gathered network-path candidate
    LocalCandidate {
        peer: ParticipantId,
        epoch: u64,
        candidate: RTCIceCandidateInit,
    },
    /// ICE connectivity transition on one session
    Connectivity {
        peer: ParticipantId,
        epoch: u64,
        state: RTCIceConnectionState,
    },
    /// Remote media arrived on one session
    RemoteTrack {
        peer: ParticipantId,
        epoch: u64,
        kind: String,
    },
    /// The recovery window elapsed after a connectivity drop
    RecoveryTimer { peer: ParticipantId, epoch: u64 },
    /// Page-level control
    Command(AppCommand),
    /// The relay socket closed underneath us
    TransportClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCommand {
    ToggleAudio,
    ToggleVideo,
    SwitchCamera,
    Leave,
}

/// UI-facing room changes, consumed by whatever renders the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    RosterUpdated(Vec<RosterEntry>),
    PeerRemoved(ParticipantId),
    RemoteTrack { peer: ParticipantId, kind: String },
    ConnectivityChanged { peer: ParticipantId, connected: bool },
}

/// Why the coordinator stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The user left the room
    Left,
    /// The relay connection dropped; every session was torn down
    TransportLost,
}

/// The initiator rule: for any pair, the lower id offers. Symmetric and
/// deterministic, so both ends agree without a round trip.
pub fn is_initiator(self_id: ParticipantId, remote: ParticipantId) -> bool {
    self_id < remote
}

/// Drives the per-peer offer/answer/restart state machines. Owns the session
/// registry; borrows the media manager (which alone mutates capture state).
pub struct Coordinator<'a> {
    self_id: ParticipantId,
    room_id: String,
    ice_servers: Vec<RTCIceServer>,
    registry: SessionRegistry,
    media: &'a mut MediaManager,
    /// Handed to session callbacks and recovery timers; feeds back into `run`
    events_tx: mpsc::Sender<Event>,
    outbound: mpsc::Sender<ClientMessage>,
    room_events: mpsc::Sender<RoomEvent>,
    restart_window: Duration,
}

impl<'a> Coordinator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: ParticipantId,
        room_id: String,
        ice_servers: Vec<RTCIceServer>,
        media: &'a mut MediaManager,
        events_tx: mpsc::Sender<Event>,
        outbound: mpsc::Sender<ClientMessage>,
        room_events: mpsc::Sender<RoomEvent>,
        restart_window: Duration,
    ) -> Self {
        Self {
            self_id,
            room_id,
            ice_servers,
            registry: SessionRegistry::new(),
            media,
            events_tx,
            outbound,
            room_events,
            restart_window,
        }
    }

    /// Process events one at a time until the room is left or the transport
    /// dies. All teardown has happened by the time this returns.
    pub async fn run(&mut self, events: &mut mpsc::Receiver<Event>) -> RunOutcome {
        while let Some(event) = events.recv().await {
            if let Some(outcome) = self.handle_event(event).await {
                return outcome;
            }
        }
        // Every sender dropped; treat as transport loss
        self.registry.teardown_all().await;
        RunOutcome::TransportLost
    }

    pub(crate) async fn handle_event(&mut self, event: Event) -> Option<RunOutcome> {
        match event {
            Event::Signal(msg) => self.handle_signal(msg).await,
            Event::LocalCandidate {
                peer,
                epoch,
                candidate,
            } => self.handle_local_candidate(peer, epoch, candidate).await,
            Event::Connectivity { peer, epoch, state } => {
                self.handle_connectivity(peer, epoch, state).await;
            }
            Event::RemoteTrack { peer, epoch, kind } => {
                if self.registry.epoch_matches(peer, epoch) {
                    info!(peer = %peer, kind = %kind, "Remote media arrived");
                    self.emit(RoomEvent::RemoteTrack { peer, kind }).await;
                }
            }
            Event::RecoveryTimer { peer, epoch } => {
                self.handle_recovery_timer(peer, epoch).await;
            }
            Event::Command(AppCommand::Leave) => {
                info!("Leaving room");
                self.send(ClientMessage::Leave {
                    room_id: self.room_id.clone(),
                })
                .await;
                self.registry.teardown_all().await;
                return Some(RunOutcome::Left);
            }
            Event::Command(cmd) => self.handle_command(cmd).await,
            Event::TransportClosed => {
                warn!("Relay connection lost, tearing down all sessions");
                self.registry.teardown_all().await;
                return Some(RunOutcome::TransportLost);
            }
        }
        None
    }

    async fn handle_signal(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::UserJoined { user_id, users } => {
                debug!(joined = %user_id, roster = users.len(), "Roster broadcast");
                self.apply_roster(users).await;
            }
            ServerMessage::UserLeft {
                user_id,
                user_name,
                users,
            } => {
                info!(peer = %user_id, name = ?user_name, "Participant left");
                if self.registry.remove(user_id).await {
                    self.emit(RoomEvent::PeerRemoved(user_id)).await;
                }
                if let Some(roster) = users {
                    self.apply_roster(roster).await;
                }
            }
            ServerMessage::Offer { from, sdp } => self.handle_offer(from, sdp).await,
            ServerMessage::Answer { from, sdp } => self.handle_answer(from, &sdp).await,
            ServerMessage::IceCandidate {
                from,
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index: sdp_m_line_index,
                    ..Default::default()
                };
                match self.registry.get_mut(from) {
                    Some(session) => session.add_remote_candidate(init).await,
                    None => warn!(peer = %from, "Candidate for unknown session, dropping"),
                }
            }
            ServerMessage::Error { message } => {
                warn!("Relay error: {message}");
            }
        }
    }

    /// Reconcile sessions against the relay's authoritative member list.
    /// Re-applying an unchanged roster creates and tears down nothing.
    async fn apply_roster(&mut self, roster: Vec<RosterEntry>) {
        let existing = self.registry.ids();
        let (to_create, to_remove) = roster_diff(self.self_id, &roster, &existing);

        for id in to_remove {
            if self.registry.remove(id).await {
                self.emit(RoomEvent::PeerRemoved(id)).await;
            }
        }
        for id in to_create {
            self.open_initiator_session(id).await;
        }
        self.emit(RoomEvent::RosterUpdated(roster)).await;
    }

    /// We are the lower id of the pair: open the session and start the first
    /// negotiation round.
    async fn open_initiator_session(&mut self, peer: ParticipantId) {
        let Some(tracks) = self.media.current_tracks() else {
            warn!(peer = %peer, "No local media, cannot open session");
            return;
        };
        let epoch = self.registry.next_epoch();
        match PeerSession::connect(
            peer,
            epoch,
            Role::Initiator,
            self.ice_servers.clone(),
            &tracks,
            self.events_tx.clone(),
        )
        .await
        {
            Ok(session) => {
                self.registry.insert(session);
                self.kick_negotiation(peer).await;
            }
            Err(e) => warn!(peer = %peer, "Failed to open peer session: {e:#}"),
        }
    }

    /// Produce and send an offer, unless a negotiation is already in flight
    /// for this session. The state enum is the re-entrancy guard: triggers
    /// landing during `Negotiating`/`Restarting` are dropped here.
    async fn kick_negotiation(&mut self, peer: ParticipantId) {
        let sdp = {
            let Some(session) = self.registry.get_mut(peer) else {
                return;
            };
            match session.state {
                NegotiationState::New | NegotiationState::Stable => {}
                state => {
                    debug!(peer = %peer, ?state, "Negotiation already in flight, ignoring trigger");
                    return;
                }
            }
            match session.create_offer_sdp(false).await {
                Ok(sdp) => {
                    session.state = NegotiationState::Negotiating;
                    sdp
                }
                Err(e) => {
                    warn!(peer = %peer, "Failed to create offer: {e:#}");
                    return;
                }
            }
        };
        debug!(peer = %peer, "Sending offer");
        self.send(ClientMessage::Offer {
            target_user_id: peer,
            sdp,
        })
        .await;
    }

    /// Responder path. An inbound offer always wins: any existing session
    /// for the sender is stale by definition and is destroyed, in-flight
    /// state and all, before the fresh one is negotiated.
    async fn handle_offer(&mut self, from: ParticipantId, sdp: String) {
        if self.registry.remove(from).await {
            info!(peer = %from, "Inbound offer replaces existing session");
            self.emit(RoomEvent::PeerRemoved(from)).await;
        }
        let Some(tracks) = self.media.current_tracks() else {
            warn!(peer = %from, "No local media, dropping offer");
            return;
        };
        let epoch = self.registry.next_epoch();
        let mut session = match PeerSession::connect(
            from,
            epoch,
            Role::Responder,
            self.ice_servers.clone(),
            &tracks,
            self.events_tx.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %from, "Failed to open responder session: {e:#}");
                return;
            }
        };
        match session.accept_offer(&sdp).await {
            Ok(answer) => {
                session.state = NegotiationState::Stable;
                self.registry.insert(session);
                debug!(peer = %from, "Sending answer");
                self.send(ClientMessage::Answer {
                    target_user_id: from,
                    sdp: answer,
                })
                .await;
            }
            Err(e) => {
                warn!(peer = %from, "Failed to apply offer: {e:#}");
                session.close().await;
            }
        }
    }

    /// An answer is only meaningful while our offer is outstanding. A late
    /// or duplicate answer is a protocol violation to tolerate, not a crash.
    async fn handle_answer(&mut self, from: ParticipantId, sdp: &str) {
        let Some(session) = self.registry.get_mut(from) else {
            warn!(peer = %from, "Answer for unknown session, dropping");
            return;
        };
        match session.state {
            NegotiationState::Negotiating | NegotiationState::Restarting => {
                match session.accept_answer(sdp).await {
                    Ok(()) => {
                        session.state = NegotiationState::Stable;
                        debug!(peer = %from, "Session stable");
                    }
                    Err(e) => warn!(peer = %from, "Failed to apply answer: {e:#}"),
                }
            }
            state => {
                warn!(peer = %from, ?state, "Answer outside negotiation, discarding");
            }
        }
    }

    async fn handle_local_candidate(
        &mut self,
        peer: ParticipantId,
        epoch: u64,
        candidate: RTCIceCandidateInit,
    ) {
        if !self.registry.epoch_matches(peer, epoch) {
            debug!(peer = %peer, "Candidate from torn-down session, dropping");
            return;
        }
        self.send(ClientMessage::IceCandidate {
            target_user_id: peer,
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_m_line_index: candidate.sdp_mline_index,
        })
        .await;
    }

    /// Connectivity dips arm a recovery timer on the initiator side only.
    /// Dips that heal before the window elapses send nothing.
    async fn handle_connectivity(
        &mut self,
        peer: ParticipantId,
        epoch: u64,
        state: RTCIceConnectionState,
    ) {
        if !self.registry.epoch_matches(peer, epoch) {
            return;
        }
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                if let Some(session) = self.registry.get_mut(peer) {
                    session.recovery_pending = false;
                }
                self.emit(RoomEvent::ConnectivityChanged {
                    peer,
                    connected: true,
                })
                .await;
            }
            RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
                warn!(peer = %peer, ?state, "Connectivity degraded");
                self.emit(RoomEvent::ConnectivityChanged {
                    peer,
                    connected: false,
                })
                .await;
                let arm = {
                    let Some(session) = self.registry.get_mut(peer) else {
                        return;
                    };
                    if session.role != Role::Initiator {
                        debug!(peer = %peer, "Waiting for the initiator side to restart");
                        false
                    } else if session.recovery_pending {
                        false
                    } else {
                        session.recovery_pending = true;
                        true
                    }
                };
                if arm {
                    let tx = self.events_tx.clone();
                    let window = self.restart_window;
                    tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        let _ = tx.send(Event::RecoveryTimer { peer, epoch }).await;
                    });
                }
            }
            _ => {}
        }
    }

    /// The recovery window elapsed. Re-check the live connectivity first:
    /// the dip may have healed while the timer was pending.
    async fn handle_recovery_timer(&mut self, peer: ParticipantId, epoch: u64) {
        let sdp = {
            let Some(session) = self.registry.get_mut(peer) else {
                return;
            };
            if session.epoch != epoch || !session.recovery_pending {
                return;
            }
            session.recovery_pending = false;
            let live = session.ice_connection_state();
            if matches!(
                live,
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
            ) {
                debug!(peer = %peer, "Connectivity recovered within the window, no restart");
                return;
            }
            match session.state {
                NegotiationState::Stable | NegotiationState::Restarting => {}
                state => {
                    debug!(peer = %peer, ?state, "Negotiation in flight, skipping restart");
                    return;
                }
            }
            match session.create_offer_sdp(true).await {
                Ok(sdp) => {
                    session.state = NegotiationState::Restarting;
                    sdp
                }
                Err(e) => {
                    warn!(peer = %peer, "Failed to create restart offer: {e:#}");
                    return;
                }
            }
        };
        info!(peer = %peer, "Issuing ICE restart offer");
        self.send(ClientMessage::Offer {
            target_user_id: peer,
            sdp,
        })
        .await;
    }

    async fn handle_command(&mut self, cmd: AppCommand) {
        match cmd {
            AppCommand::ToggleAudio => {
                let on = !self.media.audio_enabled();
                self.media.set_audio_enabled(on);
                info!(audio = on, "Microphone toggled");
            }
            AppCommand::ToggleVideo => {
                let on = !self.media.video_enabled();
                self.media.set_video_enabled(on);
                info!(video = on, "Camera toggled");
            }
            AppCommand::SwitchCamera => self.switch_camera().await,
            AppCommand::Leave => unreachable!("handled in handle_event"),
        }
    }

    /// Swap the capture source and rebind every live session's outbound
    /// tracks in place. Not a negotiation: the session shape is unchanged,
    /// so no offer goes out and no state moves. Failure mutates nothing.
    async fn switch_camera(&mut self) {
        let tracks = match self.media.switch_facing() {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("Camera switch failed, keeping current capture: {e}");
                return;
            }
        };
        for (id, session) in self.registry.iter_mut() {
            if let Err(e) = session.replace_tracks(&tracks).await {
                warn!(peer = %id, "Track redistribution failed: {e:#}");
            }
        }
    }

    async fn send(&self, msg: ClientMessage) {
        if self.outbound.send(msg).await.is_err() {
            warn!("Outbound signaling channel closed");
        }
    }

    async fn emit(&self, event: RoomEvent) {
        let _ = self.room_events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::media::{Facing, SyntheticCapture};

    const HOST_CANDIDATE: &str = "candidate:1 1 UDP 2130706431 192.168.1.7 50000 typ host";

    struct Channels {
        events_rx: mpsc::Receiver<Event>,
        out_rx: mpsc::Receiver<ClientMessage>,
        room_rx: mpsc::Receiver<RoomEvent>,
    }

    fn media() -> MediaManager {
        let mut media = MediaManager::new(Arc::new(SyntheticCapture), 30);
        media.acquire(Facing::User).unwrap();
        media
    }

    fn coordinator(self_id: u64, media: &mut MediaManager) -> (Coordinator<'_>, Channels) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel(64);
        let (room_tx, room_rx) = mpsc::channel(64);
        let coordinator = Coordinator::new(
            ParticipantId(self_id),
            "room".to_string(),
            Vec::new(),
            media,
            events_tx,
            out_tx,
            room_tx,
            Duration::from_secs(3),
        );
        (
            coordinator,
            Channels {
                events_rx,
                out_rx,
                room_rx,
            },
        )
    }

    fn drain_out(rx: &mut mpsc::Receiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    fn drain_room(rx: &mut mpsc::Receiver<RoomEvent>) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn roster(ids: &[u64]) -> Vec<RosterEntry> {
        ids.iter().map(|&id| RosterEntry::new(id)).collect()
    }

    fn joined(user_id: u64, ids: &[u64]) -> Event {
        Event::Signal(ServerMessage::UserJoined {
            user_id: ParticipantId(user_id),
            users: roster(ids),
        })
    }

    fn offer_from(msgs: &[ClientMessage], target: u64) -> Option<String> {
        msgs.iter().find_map(|m| match m {
            ClientMessage::Offer {
                target_user_id,
                sdp,
            } if *target_user_id == ParticipantId(target) => Some(sdp.clone()),
            _ => None,
        })
    }

    fn answer_from(msgs: &[ClientMessage], target: u64) -> Option<String> {
        msgs.iter().find_map(|m| match m {
            ClientMessage::Answer {
                target_user_id,
                sdp,
            } if *target_user_id == ParticipantId(target) => Some(sdp.clone()),
            _ => None,
        })
    }

    #[test]
    fn initiator_rule_is_symmetric() {
        for (a, b) in [(1u64, 2u64), (2, 1), (7, 100), (100, 7)] {
            let a = ParticipantId(a);
            let b = ParticipantId(b);
            // Exactly one side of every pair initiates
            assert_ne!(is_initiator(a, b), is_initiator(b, a));
        }
        assert!(is_initiator(ParticipantId(1), ParticipantId(2)));
        assert!(!is_initiator(ParticipantId(2), ParticipantId(1)));
    }

    #[tokio::test]
    async fn roster_broadcast_drives_initiator_offers() {
        let mut m1 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);

        c1.handle_event(joined(2, &[1, 2])).await;
        let msgs = drain_out(&mut ch1.out_rx);
        assert!(offer_from(&msgs, 2).is_some());
        assert_eq!(c1.registry.len(), 1);

        // 3 joins: one new offer, the session toward 2 untouched
        c1.handle_event(joined(3, &[1, 2, 3])).await;
        let msgs = drain_out(&mut ch1.out_rx);
        assert!(offer_from(&msgs, 3).is_some());
        assert!(offer_from(&msgs, 2).is_none());
        assert_eq!(c1.registry.len(), 2);

        // Same roster again: idempotent, nothing sent
        c1.handle_event(joined(3, &[1, 2, 3])).await;
        assert!(drain_out(&mut ch1.out_rx).is_empty());
        assert_eq!(c1.registry.len(), 2);
        drop(ch1.events_rx);
    }

    #[tokio::test]
    async fn higher_id_waits_for_the_offer() {
        let mut m2 = media();
        let (mut c2, mut ch2) = coordinator(2, &mut m2);

        c2.handle_event(joined(2, &[1, 2])).await;
        assert!(drain_out(&mut ch2.out_rx).is_empty());
        assert!(c2.registry.is_empty());
        drop(ch2.events_rx);
    }

    #[tokio::test]
    async fn full_offer_answer_round_reaches_stable_on_both_sides() {
        let mut m1 = media();
        let mut m2 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        let (mut c2, mut ch2) = coordinator(2, &mut m2);

        c1.handle_event(joined(2, &[1, 2])).await;
        let offer = offer_from(&drain_out(&mut ch1.out_rx), 2).unwrap();

        c2.handle_event(Event::Signal(ServerMessage::Offer {
            from: ParticipantId(1),
            sdp: offer,
        }))
        .await;
        let answer = answer_from(&drain_out(&mut ch2.out_rx), 1).unwrap();
        {
            let session = c2.registry.get_mut(ParticipantId(1)).unwrap();
            assert_eq!(session.role, Role::Responder);
            assert_eq!(session.state, NegotiationState::Stable);
        }

        c1.handle_event(Event::Signal(ServerMessage::Answer {
            from: ParticipantId(2),
            sdp: answer.clone(),
        }))
        .await;
        {
            let session = c1.registry.get_mut(ParticipantId(2)).unwrap();
            assert_eq!(session.state, NegotiationState::Stable);
        }

        // Duplicate answer: discarded, state untouched, no panic
        c1.handle_event(Event::Signal(ServerMessage::Answer {
            from: ParticipantId(2),
            sdp: answer,
        }))
        .await;
        let session = c1.registry.get_mut(ParticipantId(2)).unwrap();
        assert_eq!(session.state, NegotiationState::Stable);
        drop((ch1.events_rx, ch2.events_rx));
    }

    #[tokio::test]
    async fn inbound_offer_replaces_stale_session() {
        let mut m1 = media();
        let mut m2 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        let (mut c2, mut ch2) = coordinator(2, &mut m2);

        c1.handle_event(joined(2, &[1, 2])).await;
        let first_offer = offer_from(&drain_out(&mut ch1.out_rx), 2).unwrap();
        c2.handle_event(Event::Signal(ServerMessage::Offer {
            from: ParticipantId(1),
            sdp: first_offer,
        }))
        .await;
        let first_epoch = c2.registry.get_mut(ParticipantId(1)).unwrap().epoch;
        drain_out(&mut ch2.out_rx);
        drain_room(&mut ch2.room_rx);

        // Initiator renegotiates from scratch; the responder must discard
        // its old session rather than reconcile
        c1.registry.get_mut(ParticipantId(2)).unwrap().state = NegotiationState::Stable;
        c1.kick_negotiation(ParticipantId(2)).await;
        let second_offer = offer_from(&drain_out(&mut ch1.out_rx), 2).unwrap();
        c2.handle_event(Event::Signal(ServerMessage::Offer {
            from: ParticipantId(1),
            sdp: second_offer,
        }))
        .await;

        let events = drain_room(&mut ch2.room_rx);
        assert!(events.contains(&RoomEvent::PeerRemoved(ParticipantId(1))));
        let session = c2.registry.get_mut(ParticipantId(1)).unwrap();
        assert_ne!(session.epoch, first_epoch);
        assert_eq!(session.state, NegotiationState::Stable);
        drop((ch1.events_rx, ch2.events_rx));
    }

    #[tokio::test]
    async fn early_candidate_is_queued_then_flushed() {
        let mut m1 = media();
        let mut m2 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        let (mut c2, mut ch2) = coordinator(2, &mut m2);

        c1.handle_event(joined(2, &[1, 2])).await;
        let offer = offer_from(&drain_out(&mut ch1.out_rx), 2).unwrap();

        // Candidate lands before the answer: queued, not dropped
        c1.handle_event(Event::Signal(ServerMessage::IceCandidate {
            from: ParticipantId(2),
            candidate: HOST_CANDIDATE.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }))
        .await;
        assert_eq!(
            c1.registry
                .get_mut(ParticipantId(2))
                .unwrap()
                .pending_candidate_count(),
            1
        );

        c2.handle_event(Event::Signal(ServerMessage::Offer {
            from: ParticipantId(1),
            sdp: offer,
        }))
        .await;
        let answer = answer_from(&drain_out(&mut ch2.out_rx), 1).unwrap();
        c1.handle_event(Event::Signal(ServerMessage::Answer {
            from: ParticipantId(2),
            sdp: answer,
        }))
        .await;

        let session = c1.registry.get_mut(ParticipantId(2)).unwrap();
        assert_eq!(session.pending_candidate_count(), 0);
        assert_eq!(session.state, NegotiationState::Stable);
        drop((ch1.events_rx, ch2.events_rx));
    }

    #[tokio::test]
    async fn messages_for_unknown_sessions_are_dropped() {
        let mut m2 = media();
        let (mut c2, mut ch2) = coordinator(2, &mut m2);

        c2.handle_event(Event::Signal(ServerMessage::Answer {
            from: ParticipantId(9),
            sdp: "v=0".to_string(),
        }))
        .await;
        c2.handle_event(Event::Signal(ServerMessage::IceCandidate {
            from: ParticipantId(9),
            candidate: HOST_CANDIDATE.to_string(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }))
        .await;
        assert!(c2.registry.is_empty());
        assert!(drain_out(&mut ch2.out_rx).is_empty());
        drop(ch2.events_rx);
    }

    #[tokio::test]
    async fn dip_that_heals_within_the_window_sends_no_restart() {
        let mut m1 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        c1.handle_event(joined(2, &[1, 2])).await;
        drain_out(&mut ch1.out_rx);
        let epoch = c1.registry.get_mut(ParticipantId(2)).unwrap().epoch;

        c1.handle_event(Event::Connectivity {
            peer: ParticipantId(2),
            epoch,
            state: RTCIceConnectionState::Disconnected,
        })
        .await;
        assert!(c1.registry.get_mut(ParticipantId(2)).unwrap().recovery_pending);

        c1.handle_event(Event::Connectivity {
            peer: ParticipantId(2),
            epoch,
            state: RTCIceConnectionState::Connected,
        })
        .await;
        c1.handle_event(Event::RecoveryTimer {
            peer: ParticipantId(2),
            epoch,
        })
        .await;
        assert!(drain_out(&mut ch1.out_rx).is_empty());
        drop(ch1.events_rx);
    }

    #[tokio::test]
    async fn persistent_dip_triggers_restart_offer_from_initiator() {
        let mut m1 = media();
        let mut m2 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        let (mut c2, mut ch2) = coordinator(2, &mut m2);

        // Reach stable first
        c1.handle_event(joined(2, &[1, 2])).await;
        let offer = offer_from(&drain_out(&mut ch1.out_rx), 2).unwrap();
        c2.handle_event(Event::Signal(ServerMessage::Offer {
            from: ParticipantId(1),
            sdp: offer,
        }))
        .await;
        let answer = answer_from(&drain_out(&mut ch2.out_rx), 1).unwrap();
        c1.handle_event(Event::Signal(ServerMessage::Answer {
            from: ParticipantId(2),
            sdp: answer,
        }))
        .await;
        let epoch = c1.registry.get_mut(ParticipantId(2)).unwrap().epoch;

        c1.handle_event(Event::Connectivity {
            peer: ParticipantId(2),
            epoch,
            state: RTCIceConnectionState::Disconnected,
        })
        .await;
        // Window elapses without recovery (the live state is not connected)
        c1.handle_event(Event::RecoveryTimer {
            peer: ParticipantId(2),
            epoch,
        })
        .await;

        let msgs = drain_out(&mut ch1.out_rx);
        let restart = offer_from(&msgs, 2);
        assert!(restart.is_some());
        let session = c1.registry.get_mut(ParticipantId(2)).unwrap();
        assert_eq!(session.state, NegotiationState::Restarting);

        // The responder treats the restart offer as a normal offer,
        // replacing its session
        c2.handle_event(Event::Signal(ServerMessage::Offer {
            from: ParticipantId(1),
            sdp: restart.unwrap(),
        }))
        .await;
        let events = drain_room(&mut ch2.room_rx);
        assert!(events.contains(&RoomEvent::PeerRemoved(ParticipantId(1))));
        assert_eq!(
            c2.registry.get_mut(ParticipantId(1)).unwrap().state,
            NegotiationState::Stable
        );
        drop((ch1.events_rx, ch2.events_rx));
    }

    #[tokio::test]
    async fn responder_never_arms_the_recovery_timer() {
        let mut m1 = media();
        let mut m2 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        let (mut c2, mut ch2) = coordinator(2, &mut m2);

        c1.handle_event(joined(2, &[1, 2])).await;
        let offer = offer_from(&drain_out(&mut ch1.out_rx), 2).unwrap();
        c2.handle_event(Event::Signal(ServerMessage::Offer {
            from: ParticipantId(1),
            sdp: offer,
        }))
        .await;
        let epoch = c2.registry.get_mut(ParticipantId(1)).unwrap().epoch;

        c2.handle_event(Event::Connectivity {
            peer: ParticipantId(1),
            epoch,
            state: RTCIceConnectionState::Failed,
        })
        .await;
        assert!(!c2.registry.get_mut(ParticipantId(1)).unwrap().recovery_pending);
        drop((ch1.events_rx, ch2.events_rx));
    }

    #[tokio::test]
    async fn stale_epoch_events_are_ignored() {
        let mut m1 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        c1.handle_event(joined(2, &[1, 2])).await;
        drain_out(&mut ch1.out_rx);
        let epoch = c1.registry.get_mut(ParticipantId(2)).unwrap().epoch;

        c1.handle_event(Event::LocalCandidate {
            peer: ParticipantId(2),
            epoch: epoch + 1,
            candidate: RTCIceCandidateInit {
                candidate: HOST_CANDIDATE.to_string(),
                ..Default::default()
            },
        })
        .await;
        assert!(drain_out(&mut ch1.out_rx).is_empty());

        // Matching epoch forwards the candidate
        c1.handle_event(Event::LocalCandidate {
            peer: ParticipantId(2),
            epoch,
            candidate: RTCIceCandidateInit {
                candidate: HOST_CANDIDATE.to_string(),
                ..Default::default()
            },
        })
        .await;
        let msgs = drain_out(&mut ch1.out_rx);
        assert!(matches!(
            msgs.as_slice(),
            [ClientMessage::IceCandidate { target_user_id, .. }]
                if *target_user_id == ParticipantId(2)
        ));
        drop(ch1.events_rx);
    }

    #[tokio::test]
    async fn camera_switch_leaves_negotiation_state_alone() {
        let mut m1 = media();
        let mut m2 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        let (mut c2, mut ch2) = coordinator(2, &mut m2);

        c1.handle_event(joined(2, &[1, 2])).await;
        let offer = offer_from(&drain_out(&mut ch1.out_rx), 2).unwrap();
        c2.handle_event(Event::Signal(ServerMessage::Offer {
            from: ParticipantId(1),
            sdp: offer,
        }))
        .await;
        let answer = answer_from(&drain_out(&mut ch2.out_rx), 1).unwrap();
        c1.handle_event(Event::Signal(ServerMessage::Answer {
            from: ParticipantId(2),
            sdp: answer,
        }))
        .await;

        c1.handle_event(Event::Command(AppCommand::SwitchCamera)).await;

        let session = c1.registry.get_mut(ParticipantId(2)).unwrap();
        assert_eq!(session.state, NegotiationState::Stable);
        // No renegotiation: a track swap is not a session-shape change
        assert!(drain_out(&mut ch1.out_rx).is_empty());
        drop((ch1.events_rx, ch2.events_rx));
    }

    #[tokio::test]
    async fn user_left_destroys_only_that_session() {
        let mut m1 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        c1.handle_event(joined(2, &[1, 2])).await;
        c1.handle_event(joined(3, &[1, 2, 3])).await;
        drain_out(&mut ch1.out_rx);
        drain_room(&mut ch1.room_rx);

        c1.handle_event(Event::Signal(ServerMessage::UserLeft {
            user_id: ParticipantId(2),
            user_name: None,
            users: Some(roster(&[1, 3])),
        }))
        .await;

        assert_eq!(c1.registry.len(), 1);
        assert!(c1.registry.get_mut(ParticipantId(3)).is_some());
        let events = drain_room(&mut ch1.room_rx);
        assert!(events.contains(&RoomEvent::PeerRemoved(ParticipantId(2))));
        // No replacement offers for the survivors
        assert!(drain_out(&mut ch1.out_rx).is_empty());
        drop(ch1.events_rx);
    }

    #[tokio::test]
    async fn leaving_tears_down_every_session() {
        let mut m1 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        c1.handle_event(joined(2, &[1, 2])).await;
        c1.handle_event(joined(3, &[1, 2, 3])).await;
        drain_out(&mut ch1.out_rx);
        assert_eq!(c1.registry.len(), 2);

        let outcome = c1.handle_event(Event::Command(AppCommand::Leave)).await;
        assert_eq!(outcome, Some(RunOutcome::Left));
        assert!(c1.registry.is_empty());
        let msgs = drain_out(&mut ch1.out_rx);
        assert!(matches!(msgs.last(), Some(ClientMessage::Leave { .. })));
        drop(ch1.events_rx);
    }

    #[tokio::test]
    async fn transport_loss_tears_down_every_session() {
        let mut m1 = media();
        let (mut c1, mut ch1) = coordinator(1, &mut m1);
        c1.handle_event(joined(2, &[1, 2])).await;
        drain_out(&mut ch1.out_rx);

        let outcome = c1.handle_event(Event::TransportClosed).await;
        assert_eq!(outcome, Some(RunOutcome::TransportLost));
        assert!(c1.registry.is_empty());
        drop(ch1.events_rx);
    }
}
