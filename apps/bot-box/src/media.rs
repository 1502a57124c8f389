//! Media plumbing at the edge of the negotiation engine.
//!
//! Capture and encoding happen elsewhere; this module only decides which local
//! tracks every peer connection carries and where inbound audio goes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// WebRTC API with the default codecs and interceptors, shared by every slot.
pub fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Clone)]
pub struct LocalTrack {
    pub kind: TrackKind,
    pub track: Arc<dyn TrackLocal + Send + Sync>,
}

/// Supplies the outbound tracks attached to each new peer connection.
pub trait MediaSource: Send + Sync {
    fn tracks(&self) -> Vec<LocalTrack>;
}

/// Tracks for the capture pipeline to write samples into; each one fans out to every peer.
pub struct StaticTracks {
    video: Arc<TrackLocalStaticSample>,
    audio: Arc<TrackLocalStaticSample>,
}

impl StaticTracks {
    pub fn new(stream_id: &str) -> Self {
        let video = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.to_owned(),
        );
        let audio = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.to_owned(),
        );
        Self {
            video: Arc::new(video),
            audio: Arc::new(audio),
        }
    }
}

impl MediaSource for StaticTracks {
    fn tracks(&self) -> Vec<LocalTrack> {
        vec![
            LocalTrack {
                kind: TrackKind::Video,
                track: Arc::clone(&self.video) as Arc<dyn TrackLocal + Send + Sync>,
            },
            LocalTrack {
                kind: TrackKind::Audio,
                track: Arc::clone(&self.audio) as Arc<dyn TrackLocal + Send + Sync>,
            },
        ]
    }
}

/// Tracks a peer connection should carry given the audio input switch.
pub fn select_tracks(source: &dyn MediaSource, audio_input_enabled: bool) -> Vec<LocalTrack> {
    source
        .tracks()
        .into_iter()
        .filter(|track| track.kind == TrackKind::Video || audio_input_enabled)
        .collect()
}

/// Consumer of inbound operator audio.
pub trait AudioSink: Send + Sync {
    fn accept(&self, packet: Packet);
}

/// Sink that drops operator audio, noting progress at trace level.
#[derive(Default)]
pub struct DiscardAudio {
    packets: AtomicU64,
}

impl DiscardAudio {
    #[cfg(test)]
    fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

impl AudioSink for DiscardAudio {
    fn accept(&self, _packet: Packet) {
        let seen = self.packets.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % 1000 == 0 {
            trace!(target: "bot_box::media", packets = seen, "discarding operator audio");
        }
    }
}
