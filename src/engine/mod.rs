//! WebRTC engine collaborators
//!
//! The session drives negotiation and stream setup through these traits. The
//! production implementation lives in [`rtc`] and is backed by str0m; tests
//! plug in a recording double.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::media::{Frame, MediaInfo, StreamInfo, TrackKind};

pub mod capabilities;
pub mod offer;
pub mod rtc;

pub use capabilities::{Capabilities, Capability, RtcpFeedback};
pub use offer::Offer;

/// Invoked for every frame a track receives, on a thread owned by the engine.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport is not negotiated yet")]
    NotNegotiated,
    #[error("stream {0} is stopped")]
    StreamStopped(String),
    #[error("stream {0} is not part of this transport")]
    UnknownStream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The local answer to an [`Offer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    sdp: String,
}

impl Answer {
    pub fn new(sdp: impl Into<String>) -> Answer {
        Answer { sdp: sdp.into() }
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn into_sdp(self) -> String {
        self.sdp
    }
}

/// The process-wide engine. It outlives every transport it creates.
pub trait WebRtcEngine: Send + Sync {
    fn parse_offer(&self, sdp: &str) -> Result<Offer, EngineError>;

    fn create_transport(&self, offer: &Offer) -> Result<Box<dyn Transport>, EngineError>;
}

/// One negotiated ICE/DTLS transport, owned by exactly one session.
pub trait Transport: Send {
    fn set_remote_properties(
        &mut self,
        audio: Option<&MediaInfo>,
        video: Option<&MediaInfo>,
    ) -> Result<(), EngineError>;

    /// Computes the local answer restricted to `capabilities`.
    fn build_answer(
        &mut self,
        offer: &Offer,
        capabilities: &Capabilities,
    ) -> Result<Answer, EngineError>;

    fn set_local_properties(&mut self, answer: &Answer) -> Result<(), EngineError>;

    fn set_bandwidth_probing(&mut self, enabled: bool, max_kbps: u32);

    fn create_incoming_stream(
        &mut self,
        info: &StreamInfo,
    ) -> Result<Box<dyn IncomingStream>, EngineError>;

    fn create_outgoing_stream(
        &mut self,
        info: StreamInfo,
    ) -> Result<Box<dyn OutgoingStream>, EngineError>;

    /// Cancelled once the transport can no longer carry media, whether it
    /// was stopped or died on its own.
    fn closed(&self) -> CancellationToken;

    /// Releases the transport. Does not wait for engine threads to wind down.
    fn stop(&mut self);
}

/// Media received from the peer for one offered stream.
pub trait IncomingStream: Send {
    fn id(&self) -> &str;

    fn tracks(&self, kind: TrackKind) -> Vec<Arc<dyn Track>>;

    /// Stops frame delivery for every track of the stream.
    fn stop(&mut self);
}

/// The server side path relaying what an incoming stream receives.
pub trait OutgoingStream: Send {
    fn id(&self) -> &str;

    fn attach_to(&mut self, incoming: &dyn IncomingStream) -> Result<(), EngineError>;
}

/// A received audio or video track.
pub trait Track: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    /// Replaces the frame callback of this track.
    fn on_frame(&self, callback: FrameCallback);
}
