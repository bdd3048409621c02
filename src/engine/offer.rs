//! Offer scanning
//!
//! Extracts what the session needs from a remote offer: the audio/video media
//! sections and the streams (msid groups) that tie them together. Everything
//! else in the SDP is left to the engine.

use crate::engine::EngineError;
use crate::model::media::{MediaInfo, StreamInfo, TrackInfo, TrackKind};

/// Stream id used for media sections that carry no msid.
pub const DEFAULT_STREAM: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    sdp: String,
    media: Vec<MediaInfo>,
    streams: Vec<StreamInfo>,
}

/// Media section being collected while walking the lines.
struct Section {
    kind: Option<TrackKind>,
    mid: Option<String>,
    codecs: Vec<String>,
    msid: Option<(String, String)>,
}

impl Section {
    fn new(kind: Option<TrackKind>) -> Section {
        Section {
            kind,
            mid: None,
            codecs: vec![],
            msid: None,
        }
    }
}

impl Offer {
    pub fn parse(sdp: &str) -> Result<Offer, EngineError> {
        let mut lines = sdp.lines().map(str::trim).filter(|l| !l.is_empty());

        match lines.next() {
            Some(first) if first.starts_with("v=") => {}
            _ => return Err(EngineError::InvalidOffer("missing version line".into())),
        }

        let mut sections: Vec<Section> = vec![];

        for line in lines {
            if let Some(rest) = line.strip_prefix("m=") {
                let media = rest.split_whitespace().next().unwrap_or_default();
                sections.push(Section::new(TrackKind::from_media_type(media)));
                continue;
            }

            // Session level attributes don't matter here.
            let Some(section) = sections.last_mut() else {
                continue;
            };

            if let Some(mid) = line.strip_prefix("a=mid:") {
                section.mid = Some(mid.to_string());
            } else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
                if let Some(codec) = rtpmap
                    .split_whitespace()
                    .nth(1)
                    .and_then(|enc| enc.split('/').next())
                {
                    section.codecs.push(codec.to_ascii_lowercase());
                }
            } else if let Some(msid) = line.strip_prefix("a=msid:") {
                section.msid = parse_msid(msid);
            } else if let Some(ssrc) = line.strip_prefix("a=ssrc:") {
                // Plan B style "a=ssrc:<ssrc> msid:<stream> <track>"
                if section.msid.is_none() {
                    if let Some((_, msid)) = ssrc.split_once(" msid:") {
                        section.msid = parse_msid(msid);
                    }
                }
            }
        }

        let mut media = vec![];
        let mut streams: Vec<StreamInfo> = vec![];

        for (index, section) in sections.into_iter().enumerate() {
            let Some(kind) = section.kind else {
                continue;
            };

            let mid = section.mid.unwrap_or_else(|| index.to_string());
            let (stream_id, track_id) = section
                .msid
                .unwrap_or_else(|| (DEFAULT_STREAM.to_string(), mid.clone()));

            let track = TrackInfo {
                id: track_id,
                mid: mid.clone(),
                kind,
            };

            match streams.iter_mut().find(|s| s.id == stream_id) {
                Some(stream) => stream.tracks.push(track),
                None => {
                    let mut stream = StreamInfo::new(stream_id);
                    stream.tracks.push(track);
                    streams.push(stream);
                }
            }

            media.push(MediaInfo {
                mid,
                kind,
                codecs: section.codecs,
            });
        }

        if media.is_empty() {
            return Err(EngineError::InvalidOffer(
                "offer has no audio or video media".into(),
            ));
        }

        Ok(Offer {
            sdp: sdp.to_string(),
            media,
            streams,
        })
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// The first media section of the given kind.
    pub fn media(&self, kind: TrackKind) -> Option<&MediaInfo> {
        self.media.iter().find(|m| m.kind == kind)
    }

    /// Streams in declaration order.
    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }
}

fn parse_msid(value: &str) -> Option<(String, String)> {
    let mut parts = value.split_whitespace();
    let stream = parts.next()?;
    let track = parts.next().unwrap_or(stream);
    Some((stream.to_string(), track.to_string()))
}
