use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::errors::CaptureError;

const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Camera facing preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

impl Facing {
    pub fn flipped(self) -> Self {
        match self {
            Facing::User => Facing::Environment,
            Facing::Environment => Facing::User,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Facing::User),
            "environment" => Some(Facing::Environment),
            _ => None,
        }
    }
}

/// Mute flags shared between the manager and the capture sample loops.
///
/// Toggling stops the loop from producing real samples without stopping or
/// replacing the track, so every bound session keeps its senders and no
/// renegotiation happens.
#[derive(Debug)]
pub struct TrackGates {
    audio_on: AtomicBool,
    video_on: AtomicBool,
}

impl TrackGates {
    fn new() -> Self {
        Self {
            audio_on: AtomicBool::new(true),
            video_on: AtomicBool::new(true),
        }
    }

    pub fn audio_on(&self) -> bool {
        self.audio_on.load(Ordering::Relaxed)
    }

    pub fn video_on(&self) -> bool {
        self.video_on.load(Ordering::Relaxed)
    }
}

/// One live capture: an audio and a video track plus whatever background
/// work feeds them. Dropping the handle stops the feed.
pub struct CaptureHandle {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
    tasks: Vec<JoinHandle<()>>,
}

impl CaptureHandle {
    fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Where real device capture plugs in. Implementations hand back tracks that
/// are already producing samples and honor the gates; the negotiation layer
/// never touches the device directly.
pub trait CaptureDevice: Send + Sync {
    fn open(
        &self,
        facing: Facing,
        framerate: u32,
        gates: Arc<TrackGates>,
    ) -> Result<CaptureHandle, CaptureError>;
}

/// Stand-in capture for hosts without a camera pipeline: an Opus-capability
/// audio track and a VP8-capability video track fed placeholder payloads at
/// the configured rate. A gated-off track simply stops producing samples
/// while staying bound to every session.
pub struct SyntheticCapture;

impl CaptureDevice for SyntheticCapture {
    fn open(
        &self,
        facing: Facing,
        framerate: u32,
        gates: Arc<TrackGates>,
    ) -> Result<CaptureHandle, CaptureError> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "huddle".to_string(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_string(),
            "huddle".to_string(),
        ));

        let audio_task = {
            let track = Arc::clone(&audio);
            let gates = Arc::clone(&gates);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(AUDIO_FRAME);
                // Opus comfort-noise-sized frame; a real device feeds encoded capture here
                let payload = Bytes::from_static(&[0xf8, 0xff, 0xfe]);
                loop {
                    ticker.tick().await;
                    if !gates.audio_on() {
                        continue;
                    }
                    let sample = Sample {
                        data: payload.clone(),
                        duration: AUDIO_FRAME,
                        ..Default::default()
                    };
                    if track.write_sample(&sample).await.is_err() {
                        break;
                    }
                }
            })
        };

        let video_task = {
            let track = Arc::clone(&video);
            let gates = Arc::clone(&gates);
            let frame = Duration::from_secs(1) / framerate.max(1);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(frame);
                let payload = Bytes::from_static(&[0u8; 128]);
                loop {
                    ticker.tick().await;
                    if !gates.video_on() {
                        continue;
                    }
                    let sample = Sample {
                        data: payload.clone(),
                        duration: frame,
                        ..Default::default()
                    };
                    if track.write_sample(&sample).await.is_err() {
                        break;
                    }
                }
            })
        };

        debug!(?facing, framerate, "Synthetic capture opened");
        Ok(CaptureHandle {
            audio,
            video,
            tasks: vec![audio_task, video_task],
        })
    }
}

/// The track handles sessions bind to. Borrowed views of the manager's
/// current source; refreshed on every device switch.
#[derive(Clone)]
pub struct CurrentTracks {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
}

/// Owns the local capture device state: at most one live source, its mute
/// gates, and the current facing. Sessions only ever borrow the tracks.
pub struct MediaManager {
    device: Arc<dyn CaptureDevice>,
    framerate: u32,
    gates: Arc<TrackGates>,
    current: Option<CaptureHandle>,
    facing: Facing,
}

impl MediaManager {
    pub fn new(device: Arc<dyn CaptureDevice>, framerate: u32) -> Self {
        Self {
            device,
            framerate,
            gates: Arc::new(TrackGates::new()),
            current: None,
            facing: Facing::User,
        }
    }

    /// Request local capture with the given facing, replacing any prior
    /// source. The new source is opened before the old one is stopped, so
    /// the blacked-out window stays as short as the device allows.
    pub fn acquire(&mut self, facing: Facing) -> Result<(), CaptureError> {
        let handle = self
            .device
            .open(facing, self.framerate, Arc::clone(&self.gates))?;
        if let Some(mut old) = self.current.replace(handle) {
            old.stop();
        }
        self.facing = facing;
        Ok(())
    }

    /// Mute/unmute the microphone. No-op without a source, no error path.
    pub fn set_audio_enabled(&self, on: bool) {
        if self.current.is_some() {
            self.gates.audio_on.store(on, Ordering::Relaxed);
        }
    }

    /// Blank/unblank the camera. No-op without a source, no error path.
    pub fn set_video_enabled(&self, on: bool) {
        if self.current.is_some() {
            self.gates.video_on.store(on, Ordering::Relaxed);
        }
    }

    pub fn audio_enabled(&self) -> bool {
        self.gates.audio_on()
    }

    pub fn video_enabled(&self) -> bool {
        self.gates.video_on()
    }

    /// Acquire capture with the opposite facing and hand back the new tracks
    /// for redistribution. Mute state carries over (the gates are shared with
    /// the new sample loops). On failure the prior source is untouched.
    pub fn switch_facing(&mut self) -> Result<CurrentTracks, CaptureError> {
        let target = self.facing.flipped();
        let handle = self
            .device
            .open(target, self.framerate, Arc::clone(&self.gates))?;
        let tracks = CurrentTracks {
            audio: Arc::clone(&handle.audio),
            video: Arc::clone(&handle.video),
        };
        if let Some(mut old) = self.current.replace(handle) {
            old.stop();
        }
        self.facing = target;
        info!(facing = ?target, "Capture source switched");
        Ok(tracks)
    }

    /// Current track handles for new session creation.
    pub fn current_tracks(&self) -> Option<CurrentTracks> {
        self.current.as_ref().map(|h| CurrentTracks {
            audio: Arc::clone(&h.audio),
            video: Arc::clone(&h.video),
        })
    }

    #[cfg(test)]
    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn stop(&mut self) {
        if let Some(mut handle) = self.current.take() {
            handle.stop();
        }
    }
}
