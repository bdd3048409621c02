//! Test doubles for the engine and pipeline seams
//!
//! Everything records into one [`CallLog`] so tests can assert on call order.

use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    Answer, Capabilities, EngineError, FrameCallback, IncomingStream, Offer, OutgoingStream,
    Track, Transport, WebRtcEngine,
};
use crate::model::media::{Frame, MediaInfo, StreamInfo, TrackKind};
use crate::rtmp::{Pipeline, PipelineBackend, PipelineError, PipelineState};

/// A browser style audio+video offer with one stream.
pub const AUDIO_VIDEO_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=msid-semantic: WMS stream0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=msid:stream0 audio0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:0 PCMU/8000\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=msid:stream0 video0\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtcp-fb:102 nack\r\n\
a=rtcp-fb:102 nack pli\r\n\
a=rtpmap:96 VP8/90000\r\n";

/// Two streams, each with one video track.
pub const TWO_STREAM_OFFER: &str = "v=0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
a=mid:0\r\n\
a=msid:first cam\r\n\
a=rtpmap:102 H264/90000\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
a=mid:1\r\n\
a=msid:second screen\r\n\
a=rtpmap:102 H264/90000\r\n";

#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
    pushes: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl CallLog {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    fn record_push(&self, element: &str, bytes: &[u8]) {
        self.entries.lock().push(format!("push {}", element));
        self.pushes.lock().push((element.to_string(), bytes.to_vec()));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn pushes(&self) -> Vec<(String, Vec<u8>)> {
        self.pushes.lock().clone()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e.starts_with(prefix))
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.position(prefix).is_some()
    }
}

pub struct RecordingBackend {
    log: CallLog,
    reject_pushes: Arc<AtomicBool>,
    refuse_playing: Arc<AtomicBool>,
    fail_build: AtomicBool,
}

impl RecordingBackend {
    pub fn new(log: CallLog) -> RecordingBackend {
        RecordingBackend {
            log,
            reject_pushes: Arc::new(AtomicBool::new(false)),
            refuse_playing: Arc::new(AtomicBool::new(false)),
            fail_build: AtomicBool::new(false),
        }
    }

    /// Pipelines built from now on fail to reach `Playing`.
    pub fn refuse_playing(&self, refuse: bool) {
        self.refuse_playing.store(refuse, Ordering::SeqCst);
    }

    pub fn reject_pushes(&self, reject: bool) {
        self.reject_pushes.store(reject, Ordering::SeqCst);
    }

    pub fn fail_build(&self, fail: bool) {
        self.fail_build.store(fail, Ordering::SeqCst);
    }
}

impl PipelineBackend for RecordingBackend {
    fn check_plugins(&self, _names: &[&str]) -> Result<(), PipelineError> {
        Ok(())
    }

    fn build(&self, description: &str) -> Result<Box<dyn Pipeline>, PipelineError> {
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(PipelineError::Description("refused by test".into()));
        }
        self.log.record(format!("pipeline.build {}", description));
        Ok(Box::new(RecordingPipeline {
            log: self.log.clone(),
            reject_pushes: self.reject_pushes.clone(),
            refuse_playing: self.refuse_playing.clone(),
        }))
    }
}

struct RecordingPipeline {
    log: CallLog,
    reject_pushes: Arc<AtomicBool>,
    refuse_playing: Arc<AtomicBool>,
}

impl Pipeline for RecordingPipeline {
    fn set_state(&self, state: PipelineState) -> Result<(), PipelineError> {
        match state {
            PipelineState::Playing if self.refuse_playing.load(Ordering::SeqCst) => {
                return Err(PipelineError::StateChange(state));
            }
            PipelineState::Playing => self.log.record("pipeline.playing"),
            PipelineState::Null => self.log.record("pipeline.null"),
        }
        Ok(())
    }

    fn push_buffer(&self, element: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        if self.reject_pushes.load(Ordering::SeqCst) {
            return Err(PipelineError::Push("rejected by test".into()));
        }
        self.log.record_push(element, bytes);
        Ok(())
    }
}

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    callback: Mutex<Option<FrameCallback>>,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> FakeTrack {
        FakeTrack {
            id: id.to_string(),
            kind,
            callback: Mutex::new(None),
        }
    }

    /// Delivers a frame the way the engine would: on the caller's thread.
    pub fn emit(&self, frame: Frame) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(frame);
        }
    }

    fn detach(&self) {
        self.callback.lock().take();
    }
}

impl Track for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn on_frame(&self, callback: FrameCallback) {
        *self.callback.lock() = Some(callback);
    }
}

/// Engine double. Tracks it hands out stay reachable through [`FakeEngine::track`].
#[derive(Default)]
pub struct FakeEngine {
    log: CallLog,
    fail_transport: AtomicBool,
    failing_streams: Arc<Mutex<HashSet<String>>>,
    tracks: Arc<Mutex<HashMap<String, Arc<FakeTrack>>>>,
    links: Mutex<Vec<CancellationToken>>,
}

impl FakeEngine {
    pub fn new(log: CallLog) -> FakeEngine {
        FakeEngine {
            log,
            ..Default::default()
        }
    }

    pub fn fail_transport(&self, fail: bool) {
        self.fail_transport.store(fail, Ordering::SeqCst);
    }

    /// Makes `create_incoming_stream` fail for the stream `id`.
    pub fn fail_stream(&self, id: &str) {
        self.failing_streams.lock().insert(id.to_string());
    }

    pub fn track(&self, id: &str) -> Option<Arc<FakeTrack>> {
        self.tracks.lock().get(id).cloned()
    }

    /// Every transport handed out so far dies, as if its peer vanished.
    pub fn lose_transports(&self) {
        for link in self.links.lock().iter() {
            link.cancel();
        }
    }
}

impl WebRtcEngine for FakeEngine {
    fn parse_offer(&self, sdp: &str) -> Result<Offer, EngineError> {
        self.log.record("engine.parse_offer");
        Offer::parse(sdp)
    }

    fn create_transport(&self, _offer: &Offer) -> Result<Box<dyn Transport>, EngineError> {
        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(EngineError::Negotiation("refused by test".into()));
        }
        self.log.record("transport.create");
        let closed = CancellationToken::new();
        self.links.lock().push(closed.clone());
        Ok(Box::new(FakeTransport {
            log: self.log.clone(),
            closed,
            failing_streams: self.failing_streams.clone(),
            tracks: self.tracks.clone(),
        }))
    }
}

struct FakeTransport {
    log: CallLog,
    closed: CancellationToken,
    failing_streams: Arc<Mutex<HashSet<String>>>,
    tracks: Arc<Mutex<HashMap<String, Arc<FakeTrack>>>>,
}

impl Transport for FakeTransport {
    fn set_remote_properties(
        &mut self,
        audio: Option<&MediaInfo>,
        video: Option<&MediaInfo>,
    ) -> Result<(), EngineError> {
        self.log.record(format!(
            "transport.set_remote audio={} video={}",
            audio.is_some(),
            video.is_some()
        ));
        Ok(())
    }

    fn build_answer(
        &mut self,
        offer: &Offer,
        capabilities: &Capabilities,
    ) -> Result<Answer, EngineError> {
        self.log.record("transport.build_answer");
        // Mirror the offer, the restriction does the rest.
        Ok(Answer::new(capabilities.restrict_answer(offer.sdp())))
    }

    fn set_local_properties(&mut self, _answer: &Answer) -> Result<(), EngineError> {
        self.log.record("transport.set_local");
        Ok(())
    }

    fn set_bandwidth_probing(&mut self, enabled: bool, max_kbps: u32) {
        self.log
            .record(format!("transport.probing {} {}", enabled, max_kbps));
    }

    fn create_incoming_stream(
        &mut self,
        info: &StreamInfo,
    ) -> Result<Box<dyn IncomingStream>, EngineError> {
        if self.failing_streams.lock().contains(&info.id) {
            return Err(EngineError::UnknownStream(info.id.clone()));
        }
        self.log.record(format!("incoming.create {}", info.id));

        let tracks: Vec<Arc<FakeTrack>> = info
            .tracks
            .iter()
            .map(|t| Arc::new(FakeTrack::new(&t.id, t.kind)))
            .collect();
        let mut registry = self.tracks.lock();
        for track in &tracks {
            registry.insert(track.id.clone(), track.clone());
        }

        Ok(Box::new(FakeIncoming {
            id: info.id.clone(),
            tracks,
            log: self.log.clone(),
        }))
    }

    fn create_outgoing_stream(
        &mut self,
        info: StreamInfo,
    ) -> Result<Box<dyn OutgoingStream>, EngineError> {
        self.log.record(format!("outgoing.create {}", info.id));
        Ok(Box::new(FakeOutgoing {
            id: info.id,
            log: self.log.clone(),
        }))
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn stop(&mut self) {
        self.log.record("transport.stop");
        self.closed.cancel();
    }
}

struct FakeIncoming {
    id: String,
    tracks: Vec<Arc<FakeTrack>>,
    log: CallLog,
}

impl IncomingStream for FakeIncoming {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self, kind: TrackKind) -> Vec<Arc<dyn Track>> {
        self.tracks
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.clone() as Arc<dyn Track>)
            .collect()
    }

    fn stop(&mut self) {
        self.log.record(format!("incoming.stop {}", self.id));
        for track in &self.tracks {
            track.detach();
        }
    }
}

struct FakeOutgoing {
    id: String,
    log: CallLog,
}

impl OutgoingStream for FakeOutgoing {
    fn id(&self) -> &str {
        &self.id
    }

    fn attach_to(&mut self, incoming: &dyn IncomingStream) -> Result<(), EngineError> {
        if incoming.id() != self.id {
            return Err(EngineError::UnknownStream(incoming.id().to_string()));
        }
        self.log.record(format!("outgoing.attach {}", self.id));
        Ok(())
    }
}
