//! Media descriptions shared by the engine, the relay and the sessions
//!
//! This module provides the engine-agnostic view of what a publisher offers:
//! media sections, the streams grouping them, and the frames their tracks emit.

use std::fmt;

/// The kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Parses the media type of an SDP `m=` line.
    pub fn from_media_type(media: &str) -> Option<TrackKind> {
        match media {
            "audio" => Some(TrackKind::Audio),
            "video" => Some(TrackKind::Video),
            _ => None,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, TrackKind::Audio)
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A single media section of an offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    /// The media ID (Mid) of the section
    pub mid: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Codec names from the `a=rtpmap` lines, lowercased, in offer order
    pub codecs: Vec<String>,
}

/// A track declared inside a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    /// Track id from `a=msid`, or the mid when the offer has no msid
    pub id: String,
    /// The media section carrying the track
    pub mid: String,
    pub kind: TrackKind,
}

/// A media stream as declared by the offer: tracks grouped by msid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: String,
    pub tracks: Vec<TrackInfo>,
}

impl StreamInfo {
    pub fn new(id: impl Into<String>) -> StreamInfo {
        StreamInfo {
            id: id.into(),
            tracks: vec![],
        }
    }

    /// Tracks of the given kind, in declaration order.
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &TrackInfo> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }
}

/// A decoded media frame as delivered by a track.
///
/// Ownership moves to whoever consumes it; nobody keeps frames around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    /// Capture timestamp in microseconds since the transport started
    pub timestamp: u64,
}

impl Frame {
    pub fn new(payload: Vec<u8>, timestamp: u64) -> Frame {
        Frame { payload, timestamp }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
