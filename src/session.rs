//! Session lifecycle
//!
//! A session owns everything one publisher connection creates: the transport,
//! one [`StreamPair`] per offered stream and the push adapters feeding RTMP.
//!
//! ```text
//! Idle -> Negotiating -> Active -> Closing -> Closed
//!   ^          |
//!   +----------+  (negotiation failed, nothing kept)
//! ```
//!
//! Teardown always runs adapters first, then incoming streams, then the
//! transport, so no frame reaches a pipeline that was already released.

use std::fmt;
use std::ops::Deref;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{
    Answer, Capabilities, EngineError, IncomingStream, Offer, OutgoingStream, Transport,
    WebRtcEngine,
};
use crate::model::media::{StreamInfo, TrackKind};
use crate::relay::FrameRelay;
use crate::rtmp::{PipelineBackend, PipelineConfig, PushAdapter};

pub const DEFAULT_RTMP_BASE: &str = "rtmp://127.0.0.1/live/";
pub const DEFAULT_MAX_PROBING_KBPS: u32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> SessionId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        SessionId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Deref for SessionId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only settings shared by every session of the process.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Prefix the stream key is appended to
    pub rtmp_base: String,
    pub capabilities: Capabilities,
    pub max_probing_kbps: u32,
    pub pipeline: PipelineConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            rtmp_base: DEFAULT_RTMP_BASE.to_string(),
            capabilities: Capabilities::default(),
            max_probing_kbps: DEFAULT_MAX_PROBING_KBPS,
            pipeline: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("start is not allowed while the session is {0:?}")]
    InvalidState(SessionState),
    #[error("stream key is empty")]
    MissingKey,
    #[error("none of the offered streams could be set up")]
    NoStreams,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// An incoming stream, the outgoing stream attached to it and its RTMP output.
struct StreamPair {
    incoming: Box<dyn IncomingStream>,
    outgoing: Box<dyn OutgoingStream>,
    adapter: Option<Arc<PushAdapter>>,
    relays: Vec<Arc<FrameRelay>>,
}

pub struct Session {
    id: SessionId,
    state: SessionState,
    engine: Arc<dyn WebRtcEngine>,
    pipelines: Arc<dyn PipelineBackend>,
    settings: Arc<SessionSettings>,
    transport: Option<Box<dyn Transport>>,
    streams: Vec<StreamPair>,
}

impl Session {
    pub fn new(
        engine: Arc<dyn WebRtcEngine>,
        pipelines: Arc<dyn PipelineBackend>,
        settings: Arc<SessionSettings>,
    ) -> Session {
        Session {
            id: SessionId::next(),
            state: SessionState::Idle,
            engine,
            pipelines,
            settings,
            transport: None,
            streams: vec![],
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Ids of the streams currently owned, in offer order.
    pub fn stream_ids(&self) -> Vec<String> {
        self.streams
            .iter()
            .map(|p| p.incoming.id().to_string())
            .collect()
    }

    /// Cancelled when the transport of a started session dies. `None` while
    /// no transport is owned.
    pub fn transport_closed(&self) -> Option<CancellationToken> {
        self.transport.as_ref().map(|t| t.closed())
    }

    /// Negotiates `offer` and starts pushing every offered stream to
    /// `rtmp_base + key`.
    ///
    /// On error nothing is kept and the session is back to `Idle`, so the
    /// peer may try again.
    pub fn start(&mut self, offer: &str, key: &str) -> Result<Answer, SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState(self.state));
        }
        if key.is_empty() {
            return Err(SessionError::MissingKey);
        }

        let offer = self.engine.parse_offer(offer)?;

        self.state = SessionState::Negotiating;
        match self.negotiate(&offer, key) {
            Ok(answer) => {
                self.state = SessionState::Active;
                info!(
                    "Session({}) active with {} stream(s)",
                    *self.id,
                    self.streams.len()
                );
                Ok(answer)
            }
            Err(e) => {
                self.release();
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    fn negotiate(&mut self, offer: &Offer, key: &str) -> Result<Answer, SessionError> {
        let transport = self
            .transport
            .insert(self.engine.create_transport(offer)?);

        transport.set_remote_properties(
            offer.media(TrackKind::Audio),
            offer.media(TrackKind::Video),
        )?;
        let answer = transport.build_answer(offer, &self.settings.capabilities)?;
        transport.set_local_properties(&answer)?;
        transport.set_bandwidth_probing(true, self.settings.max_probing_kbps);

        let target = format!("{}{}", self.settings.rtmp_base, key);

        for info in offer.streams() {
            let Some(transport) = self.transport.as_deref_mut() else {
                break;
            };

            match activate_stream(transport, &self.pipelines, &self.settings, info, &target) {
                Ok(pair) => self.streams.push(pair),
                Err(e) => warn!(
                    "Session({}) abandoning stream {}: {}",
                    *self.id, info.id, e
                ),
            }
        }

        if self.streams.is_empty() {
            return Err(SessionError::NoStreams);
        }

        Ok(answer)
    }

    /// Tears the session down. Later calls are no-ops.
    pub fn close(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }

        self.state = SessionState::Closing;
        self.release();
        self.state = SessionState::Closed;
        info!("Session({}) closed", *self.id);
    }

    fn release(&mut self) {
        for pair in &self.streams {
            if let Some(adapter) = &pair.adapter {
                adapter.stop();
            }
        }

        for mut pair in self.streams.drain(..) {
            pair.incoming.stop();
            for relay in &pair.relays {
                let stats = relay.stats();
                debug!(
                    "Session({}) stream {} {}: {} forwarded, {} dropped",
                    *self.id,
                    pair.outgoing.id(),
                    relay.kind(),
                    stats.forwarded,
                    stats.dropped
                );
            }
        }

        if let Some(mut transport) = self.transport.take() {
            transport.stop();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates, attaches and wires up one offered stream.
///
/// A pipeline that can't be built leaves the pair without an adapter; only
/// engine failures abandon the stream.
fn activate_stream(
    transport: &mut dyn Transport,
    pipelines: &Arc<dyn PipelineBackend>,
    settings: &SessionSettings,
    info: &StreamInfo,
    target: &str,
) -> Result<StreamPair, EngineError> {
    let mut incoming = transport.create_incoming_stream(info)?;

    let attached = transport
        .create_outgoing_stream(info.clone())
        .and_then(|mut outgoing| {
            outgoing.attach_to(incoming.as_ref())?;
            Ok(outgoing)
        });
    let outgoing = match attached {
        Ok(outgoing) => outgoing,
        Err(e) => {
            incoming.stop();
            return Err(e);
        }
    };

    let mut pair = StreamPair {
        incoming,
        outgoing,
        adapter: None,
        relays: vec![],
    };

    let adapter = Arc::new(PushAdapter::new(pipelines.clone(), settings.pipeline));
    if let Err(e) = adapter.start(target) {
        warn!("Stream {} has no RTMP output: {}", info.id, e);
        return Ok(pair);
    }

    // Only the first track of each kind is consumed.
    for kind in [TrackKind::Video, TrackKind::Audio] {
        let declared = info.tracks_of(kind).count();
        if declared > 1 {
            debug!(
                "Stream {} declares {} {} tracks, relaying the first",
                info.id, declared, kind
            );
        }
        if let Some(track) = pair.incoming.tracks(kind).first() {
            debug!("Relaying {} track {} of stream {}", kind, track.id(), info.id);
            pair.relays
                .push(FrameRelay::attach(track.as_ref(), adapter.clone()));
        }
    }
    pair.adapter = Some(adapter);

    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::media::Frame;
    use crate::rtmp::{AUDIO_SRC, VIDEO_SRC};
    use crate::testing::{
        CallLog, FakeEngine, RecordingBackend, AUDIO_VIDEO_OFFER, TWO_STREAM_OFFER,
    };

    struct Fixture {
        log: CallLog,
        engine: Arc<FakeEngine>,
        backend: Arc<RecordingBackend>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let log = CallLog::default();
            Fixture {
                engine: Arc::new(FakeEngine::new(log.clone())),
                backend: Arc::new(RecordingBackend::new(log.clone())),
                log,
            }
        }

        fn session(&self) -> Session {
            Session::new(
                self.engine.clone(),
                self.backend.clone(),
                Arc::new(SessionSettings::default()),
            )
        }
    }

    #[test]
    fn start_negotiates_then_activates_streams() {
        let fx = Fixture::new();
        let mut session = fx.session();

        let answer = session.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.stream_ids(), vec!["stream0"]);
        assert!(answer.sdp().contains("opus/48000"));
        assert!(answer.sdp().contains("H264/90000"));

        let entries = fx.log.entries();
        assert_eq!(
            &entries[..9],
            &[
                "engine.parse_offer",
                "transport.create",
                "transport.set_remote audio=true video=true",
                "transport.build_answer",
                "transport.set_local",
                "transport.probing true 5000",
                "incoming.create stream0",
                "outgoing.create stream0",
                "outgoing.attach stream0",
            ]
        );
        assert!(entries[9].starts_with("pipeline.build"));
        assert!(entries[9].ends_with("location='rtmp://127.0.0.1/live/abc123'"));
        assert_eq!(entries[10], "pipeline.playing");
    }

    #[test]
    fn relays_first_track_of_each_kind() {
        let fx = Fixture::new();
        let mut session = fx.session();
        session.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();

        let video = fx.engine.track("video0").unwrap();
        let audio = fx.engine.track("audio0").unwrap();
        video.emit(Frame::new(vec![0, 0, 0, 1, 0x65, 0x88], 1));
        audio.emit(Frame::new(vec![0xfc; 20], 2));
        video.emit(Frame::new(vec![0; 4], 3));

        assert_eq!(
            fx.log.pushes(),
            vec![
                (VIDEO_SRC.to_string(), vec![0, 0, 0, 1, 0x65, 0x88]),
                (AUDIO_SRC.to_string(), vec![0xfc; 20]),
            ]
        );
    }

    #[test]
    fn teardown_runs_adapter_then_stream_then_transport() {
        let fx = Fixture::new();
        let mut session = fx.session();
        session.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();

        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        let adapter = fx.log.position("pipeline.null").unwrap();
        let stream = fx.log.position("incoming.stop stream0").unwrap();
        let transport = fx.log.position("transport.stop").unwrap();
        assert!(adapter < stream);
        assert!(stream < transport);

        // Straggling frames are absorbed.
        let pushes = fx.log.pushes().len();
        fx.engine
            .track("video0")
            .unwrap()
            .emit(Frame::new(vec![1; 32], 9));
        assert_eq!(fx.log.pushes().len(), pushes);
    }

    #[test]
    fn close_is_idempotent_and_runs_on_drop() {
        let fx = Fixture::new();
        {
            let mut session = fx.session();
            session.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();
            session.close();
            session.close();
        }
        let stops = fx
            .log
            .entries()
            .iter()
            .filter(|e| e.as_str() == "transport.stop")
            .count();
        assert_eq!(stops, 1);

        let fx = Fixture::new();
        {
            let mut session = fx.session();
            session.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();
        }
        assert!(fx.log.contains("transport.stop"));
    }

    #[test]
    fn transport_closed_follows_the_transport() {
        let fx = Fixture::new();
        let mut session = fx.session();
        assert!(session.transport_closed().is_none());

        session.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();
        let closed = session.transport_closed().unwrap();
        assert!(!closed.is_cancelled());

        fx.engine.lose_transports();
        assert!(closed.is_cancelled());

        session.close();
        assert!(session.transport_closed().is_none());
    }

    #[test]
    fn second_start_is_rejected() {
        let fx = Fixture::new();
        let mut session = fx.session();
        session.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();

        assert!(matches!(
            session.start(AUDIO_VIDEO_OFFER, "abc123"),
            Err(SessionError::InvalidState(SessionState::Active))
        ));
        let creates = fx
            .log
            .entries()
            .iter()
            .filter(|e| e.as_str() == "transport.create")
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn invalid_offer_creates_nothing_and_allows_retry() {
        let fx = Fixture::new();
        let mut session = fx.session();

        assert!(matches!(
            session.start("not an sdp", "abc123"),
            Err(SessionError::Engine(EngineError::InvalidOffer(_)))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!fx.log.contains("transport.create"));

        session.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn empty_key_is_rejected() {
        let fx = Fixture::new();
        let mut session = fx.session();
        assert!(matches!(
            session.start(AUDIO_VIDEO_OFFER, ""),
            Err(SessionError::MissingKey)
        ));
        assert!(fx.log.entries().is_empty());
    }

    #[test]
    fn transport_failure_rejects_only_this_session() {
        let fx = Fixture::new();
        fx.engine.fail_transport(true);
        let mut session = fx.session();

        assert!(session.start(AUDIO_VIDEO_OFFER, "abc123").is_err());
        assert_eq!(session.state(), SessionState::Idle);

        fx.engine.fail_transport(false);
        let mut other = fx.session();
        other.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();
        assert_eq!(other.state(), SessionState::Active);
    }

    #[test]
    fn failed_stream_does_not_roll_back_earlier_ones() {
        let fx = Fixture::new();
        fx.engine.fail_stream("second");
        let mut session = fx.session();

        session.start(TWO_STREAM_OFFER, "abc123").unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.stream_ids(), vec!["first"]);
        fx.engine
            .track("cam")
            .unwrap()
            .emit(Frame::new(vec![5; 10], 0));
        assert_eq!(fx.log.pushes().len(), 1);
    }

    #[test]
    fn no_usable_stream_releases_the_transport() {
        let fx = Fixture::new();
        fx.engine.fail_stream("first");
        fx.engine.fail_stream("second");
        let mut session = fx.session();

        assert!(matches!(
            session.start(TWO_STREAM_OFFER, "abc123"),
            Err(SessionError::NoStreams)
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(fx.log.contains("transport.stop"));
    }

    #[test]
    fn pipeline_failure_keeps_the_stream_without_output() {
        let fx = Fixture::new();
        fx.backend.fail_build(true);
        let mut session = fx.session();

        session.start(AUDIO_VIDEO_OFFER, "abc123").unwrap();
        assert_eq!(session.stream_ids(), vec!["stream0"]);

        fx.engine
            .track("video0")
            .unwrap()
            .emit(Frame::new(vec![5; 10], 0));
        assert!(fx.log.pushes().is_empty());

        session.close();
        assert!(!fx.log.contains("pipeline.null"));
        assert!(fx.log.contains("incoming.stop stream0"));
    }

    #[test]
    fn streams_are_processed_in_declaration_order() {
        let fx = Fixture::new();
        let mut session = fx.session();
        session.start(TWO_STREAM_OFFER, "abc123").unwrap();

        let first = fx.log.position("outgoing.attach first").unwrap();
        let second = fx.log.position("incoming.create second").unwrap();
        assert!(first < second);
        assert_eq!(session.stream_ids(), vec!["first", "second"]);
    }
}
