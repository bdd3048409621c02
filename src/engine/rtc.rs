//! str0m backed engine
//!
//! Every transport binds its own UDP socket on the host address and, once
//! negotiated, moves its [`Rtc`] instance onto a driver thread. That thread
//! owns all network IO and invokes the frame callbacks of the tracks.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use str0m::bwe::Bitrate;
use str0m::change::SdpOffer;
use str0m::media::{KeyframeRequestKind, MediaData};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{
    Answer, Capabilities, EngineError, FrameCallback, IncomingStream, Offer, OutgoingStream,
    Track, Transport, WebRtcEngine,
};
use crate::model::media::{Frame, MediaInfo, StreamInfo, TrackKind};

/// Starting point of the bandwidth estimate before probing kicks in.
const INITIAL_BITRATE_KBPS: u64 = 300;

/// Upper bound on how long the driver blocks on the socket, so it notices a stop.
const MAX_WAIT: Duration = Duration::from_millis(100);

const KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

pub struct RtcEngine {
    host: IpAddr,
}

impl RtcEngine {
    pub fn new(host: IpAddr) -> RtcEngine {
        RtcEngine { host }
    }
}

impl WebRtcEngine for RtcEngine {
    fn parse_offer(&self, sdp: &str) -> Result<Offer, EngineError> {
        SdpOffer::from_sdp_string(sdp).map_err(|e| EngineError::InvalidOffer(e.to_string()))?;
        Offer::parse(sdp)
    }

    fn create_transport(&self, _offer: &Offer) -> Result<Box<dyn Transport>, EngineError> {
        Ok(Box::new(RtcTransport::bind(self.host)?))
    }
}

/// Where the frames of one mid go.
struct Route {
    stream: String,
    kind: TrackKind,
    sink: Option<FrameCallback>,
    /// Write received media back to the peer on the same mid
    echo: bool,
    last_keyframe_request: Option<Instant>,
}

/// State shared between a transport, its streams and the driver thread.
#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<String, Route>>,
    stopped: AtomicBool,
    probing_kbps: AtomicU32,
    probing_changed: AtomicBool,
    closed: CancellationToken,
}

pub struct RtcTransport {
    addr: SocketAddr,
    socket: Option<UdpSocket>,
    rtc: Option<Rtc>,
    /// Codecs offered per kind, `None` when the offer lacks that kind
    audio: Option<Vec<String>>,
    video: Option<Vec<String>>,
    shared: Arc<Shared>,
}

impl RtcTransport {
    fn bind(host: IpAddr) -> Result<RtcTransport, EngineError> {
        let socket = UdpSocket::bind(SocketAddr::new(host, 0))?;
        let addr = socket.local_addr()?;
        info!("Bound UDP port: {}", addr);

        Ok(RtcTransport {
            addr,
            socket: Some(socket),
            rtc: None,
            audio: None,
            video: None,
            shared: Arc::new(Shared::default()),
        })
    }
}

fn offers(codecs: &Option<Vec<String>>, codec: &str) -> bool {
    codecs
        .as_ref()
        .is_some_and(|codecs| codecs.iter().any(|c| c.eq_ignore_ascii_case(codec)))
}

impl Transport for RtcTransport {
    fn set_remote_properties(
        &mut self,
        audio: Option<&MediaInfo>,
        video: Option<&MediaInfo>,
    ) -> Result<(), EngineError> {
        if audio.is_none() && video.is_none() {
            return Err(EngineError::Negotiation(
                "offer has neither audio nor video".into(),
            ));
        }
        self.audio = audio.map(|m| m.codecs.clone());
        self.video = video.map(|m| m.codecs.clone());
        Ok(())
    }

    fn build_answer(
        &mut self,
        offer: &Offer,
        capabilities: &Capabilities,
    ) -> Result<Answer, EngineError> {
        let opus = offers(&self.audio, "opus") && capabilities.audio.supports_codec("opus");
        let h264 = offers(&self.video, "h264") && capabilities.video.supports_codec("h264");
        if !opus && !h264 {
            return Err(EngineError::Negotiation(
                "offer carries neither opus nor h264".into(),
            ));
        }

        let mut rtc = Rtc::builder()
            .clear_codecs()
            .enable_opus(opus)
            .enable_h264(h264)
            .enable_bwe(Some(Bitrate::kbps(INITIAL_BITRATE_KBPS)))
            .build();

        let candidate = Candidate::host(self.addr, "udp")
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        rtc.add_local_candidate(candidate);

        let remote = SdpOffer::from_sdp_string(offer.sdp())
            .map_err(|e| EngineError::InvalidOffer(e.to_string()))?;
        let answer = rtc
            .sdp_api()
            .accept_offer(remote)
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        self.rtc = Some(rtc);
        Ok(Answer::new(
            capabilities.restrict_answer(&answer.to_sdp_string()),
        ))
    }

    fn set_local_properties(&mut self, _answer: &Answer) -> Result<(), EngineError> {
        let (Some(rtc), Some(socket)) = (self.rtc.take(), self.socket.take()) else {
            return Err(EngineError::NotNegotiated);
        };

        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("rtc-{}", self.addr.port()))
            .spawn(move || run(rtc, socket, shared))?;
        Ok(())
    }

    fn set_bandwidth_probing(&mut self, enabled: bool, max_kbps: u32) {
        let kbps = if enabled { max_kbps } else { 0 };
        self.shared.probing_kbps.store(kbps, Ordering::Release);
        self.shared.probing_changed.store(true, Ordering::Release);
    }

    fn create_incoming_stream(
        &mut self,
        info: &StreamInfo,
    ) -> Result<Box<dyn IncomingStream>, EngineError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(EngineError::StreamStopped(info.id.clone()));
        }

        let mut routes = self.shared.routes.lock();
        let mut tracks = vec![];
        for track in &info.tracks {
            routes.insert(
                track.mid.clone(),
                Route {
                    stream: info.id.clone(),
                    kind: track.kind,
                    sink: None,
                    echo: false,
                    last_keyframe_request: None,
                },
            );
            tracks.push(Arc::new(RtcTrack {
                id: track.id.clone(),
                mid: track.mid.clone(),
                kind: track.kind,
                shared: self.shared.clone(),
            }));
        }

        Ok(Box::new(RtcIncoming {
            id: info.id.clone(),
            tracks,
            shared: self.shared.clone(),
        }))
    }

    fn create_outgoing_stream(
        &mut self,
        info: StreamInfo,
    ) -> Result<Box<dyn OutgoingStream>, EngineError> {
        Ok(Box::new(RtcOutgoing {
            info,
            shared: self.shared.clone(),
        }))
    }

    fn closed(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.routes.lock().clear();
        self.shared.closed.cancel();
        // Never handed to a driver.
        self.rtc.take();
        self.socket.take();
        info!("Transport on {} stopped", self.addr);
    }
}

struct RtcIncoming {
    id: String,
    tracks: Vec<Arc<RtcTrack>>,
    shared: Arc<Shared>,
}

impl IncomingStream for RtcIncoming {
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
        self.shared
            .routes
            .lock()
            .retain(|_, route| route.stream != self.id);
    }
}

struct RtcOutgoing {
    info: StreamInfo,
    shared: Arc<Shared>,
}

impl OutgoingStream for RtcOutgoing {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn attach_to(&mut self, incoming: &dyn IncomingStream) -> Result<(), EngineError> {
        if incoming.id() != self.info.id {
            return Err(EngineError::UnknownStream(incoming.id().to_string()));
        }

        let mut routes = self.shared.routes.lock();
        for track in &self.info.tracks {
            match routes.get_mut(&track.mid) {
                Some(route) if route.stream == self.info.id => route.echo = true,
                _ => return Err(EngineError::StreamStopped(self.info.id.clone())),
            }
        }
        Ok(())
    }
}

struct RtcTrack {
    id: String,
    mid: String,
    kind: TrackKind,
    shared: Arc<Shared>,
}

impl Track for RtcTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn on_frame(&self, callback: FrameCallback) {
        if let Some(route) = self.shared.routes.lock().get_mut(&self.mid) {
            route.sink = Some(callback);
        }
    }
}

/// Drives one [`Rtc`] until it dies or its transport is stopped.
fn run(mut rtc: Rtc, socket: UdpSocket, shared: Arc<Shared>) {
    let started = Instant::now();
    let mut buf = vec![0; 2000];

    while !shared.stopped.load(Ordering::Acquire) {
        apply_probing(&mut rtc, &shared);

        let Some(timeout) = poll_until_timeout(&mut rtc, &socket, &shared, started) else {
            break;
        };

        // The read timeout is not allowed to be 0.
        let duration = timeout
            .saturating_duration_since(Instant::now())
            .clamp(Duration::from_millis(1), MAX_WAIT);

        if let Err(e) = socket.set_read_timeout(Some(duration)) {
            warn!("Setting socket read timeout failed: {:?}", e);
            break;
        }

        let input = match read_socket_input(&socket, &mut buf) {
            Ok(Some(input)) => input,
            Ok(None) => Input::Timeout(Instant::now()),
            Err(e) => {
                warn!("UdpSocket read failed: {:?}", e);
                break;
            }
        };

        if let Err(e) = rtc.handle_input(input) {
            warn!("Transport disconnected: {:?}", e);
            break;
        }
    }

    rtc.disconnect();
    shared.closed.cancel();
    debug!("Driver for {:?} exited", socket.local_addr());
}

fn apply_probing(rtc: &mut Rtc, shared: &Shared) {
    if !shared.probing_changed.swap(false, Ordering::AcqRel) {
        return;
    }

    let kbps = shared.probing_kbps.load(Ordering::Acquire);
    if kbps > 0 {
        rtc.bwe().set_desired_bitrate(Bitrate::kbps(kbps as u64));
    }
}

/// Poll all the output from the rtc until it returns a timeout.
///
/// Returns `None` once the rtc is no longer alive.
fn poll_until_timeout(
    rtc: &mut Rtc,
    socket: &UdpSocket,
    shared: &Shared,
    started: Instant,
) -> Option<Instant> {
    loop {
        if !rtc.is_alive() {
            return None;
        }

        match rtc.poll_output() {
            Ok(Output::Timeout(t)) => return Some(t),
            Ok(Output::Transmit(transmit)) => {
                if let Err(e) = socket.send_to(&transmit.contents, transmit.destination) {
                    debug!("Sending UDP data failed: {:?}", e);
                }
            }
            Ok(Output::Event(event)) => handle_event(rtc, shared, event, started),
            Err(e) => {
                warn!("poll_output failed: {:?}", e);
                rtc.disconnect();
                return None;
            }
        }
    }
}

fn handle_event(rtc: &mut Rtc, shared: &Shared, event: Event, started: Instant) {
    match event {
        Event::IceConnectionStateChange(state) => {
            info!("ICE state = {:?}", state);
            if state == IceConnectionState::Disconnected {
                rtc.disconnect();
            }
        }
        Event::MediaAdded(added) => {
            debug!("Media added: {:?} {:?}", added.mid, added.kind);
        }
        Event::MediaData(data) => handle_media_data(rtc, shared, data, started),
        _ => {}
    }
}

fn handle_media_data(rtc: &mut Rtc, shared: &Shared, data: MediaData, started: Instant) {
    let (sink, echo, keyframe) = {
        let mut routes = shared.routes.lock();
        let Some(route) = routes.get_mut(&data.mid.to_string()) else {
            return;
        };

        let keyframe = !data.contiguous
            && route.kind == TrackKind::Video
            && route
                .last_keyframe_request
                .map(|t| t.elapsed() >= KEYFRAME_REQUEST_INTERVAL)
                .unwrap_or(true);
        if keyframe {
            route.last_keyframe_request = Some(Instant::now());
        }

        (route.sink.clone(), route.echo, keyframe)
    };

    if keyframe {
        if let Some(mut writer) = rtc.writer(data.mid) {
            if let Err(e) = writer.request_keyframe(data.rid, KeyframeRequestKind::Fir) {
                debug!("request_keyframe failed: {:?}", e);
            }
        }
    }

    if echo {
        // Only possible when the negotiated direction lets us send on this mid.
        if let Some(writer) = rtc.writer(data.mid) {
            if let Some(pt) = writer.match_params(data.params) {
                if let Err(e) = writer.write(pt, data.network_time, data.time, data.data.clone()) {
                    warn!("Relaying media back on {} failed, loopback off: {:?}", data.mid, e);
                    disable_echo(shared, &data.mid.to_string());
                }
            }
        }
    }

    if let Some(sink) = sink {
        let timestamp = data
            .network_time
            .saturating_duration_since(started)
            .as_micros() as u64;
        sink(Frame::new(data.data, timestamp));
    }
}

/// Stops writing media back on `mid`. Its track keeps receiving frames.
fn disable_echo(shared: &Shared, mid: &str) {
    if let Some(route) = shared.routes.lock().get_mut(mid) {
        route.echo = false;
    }
}

fn read_socket_input<'a>(socket: &UdpSocket, buf: &'a mut Vec<u8>) -> io::Result<Option<Input<'a>>> {
    buf.resize(2000, 0);

    match socket.recv_from(buf) {
        Ok((n, source)) => {
            buf.truncate(n);

            // Parse data to a DatagramRecv, which help preparse network data to
            // figure out the multiplexing of all protocols on one UDP port.
            let Ok(contents) = buf.as_slice().try_into() else {
                return Ok(None);
            };

            Ok(Some(Input::Receive(
                Instant::now(),
                Receive {
                    proto: Protocol::Udp,
                    source,
                    destination: socket.local_addr()?,
                    contents,
                },
            )))
        }

        Err(e) => match e.kind() {
            // Expected error for set_read_timeout(). One for windows, one for the rest.
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Ok(None),
            _ => Err(e),
        },
    }
}
