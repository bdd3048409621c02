//! The fixed capability set the bridge negotiates
//!
//! Opus for audio; H.264 with retransmission for video, with REMB,
//! transport-cc, CCM FIR and NACK PLI feedback and a fixed set of header
//! extensions. [`Capabilities::restrict_answer`] strips whatever an engine
//! put in its answer beyond this set.

use std::collections::HashSet;

use crate::model::media::TrackKind;

pub const EXT_VIDEO_ORIENTATION: &str = "urn:3gpp:video-orientation";
pub const EXT_TRANSPORT_CC: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const EXT_ABS_SEND_TIME: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const EXT_TOFFSET: &str = "urn:ietf:params:rtp-hdrext:toffset";
pub const EXT_RTP_STREAM_ID: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";
pub const EXT_MID: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";

/// One `a=rtcp-fb` mechanism, e.g. `nack pli`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpFeedback {
    pub id: String,
    pub params: Vec<String>,
}

impl RtcpFeedback {
    pub fn new(id: &str, params: &[&str]) -> RtcpFeedback {
        RtcpFeedback {
            id: id.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Matches the value part of an `a=rtcp-fb:<pt> <value>` line.
    fn matches(&self, value: &str) -> bool {
        let mut parts = value.split_whitespace();
        parts.next() == Some(self.id.as_str()) && parts.eq(self.params.iter().map(String::as_str))
    }
}

/// What the bridge accepts for one media kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capability {
    /// Lowercase codec names
    pub codecs: Vec<String>,
    pub rtx: bool,
    pub rtcp_feedback: Vec<RtcpFeedback>,
    /// Header extension URIs
    pub extensions: Vec<String>,
}

impl Capability {
    pub fn supports_codec(&self, codec: &str) -> bool {
        self.codecs.iter().any(|c| c.eq_ignore_ascii_case(codec))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub audio: Capability,
    pub video: Capability,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            audio: Capability {
                codecs: vec!["opus".to_string()],
                ..Default::default()
            },
            video: Capability {
                codecs: vec!["h264".to_string()],
                rtx: true,
                rtcp_feedback: vec![
                    RtcpFeedback::new("goog-remb", &[]),
                    RtcpFeedback::new("transport-cc", &[]),
                    RtcpFeedback::new("ccm", &["fir"]),
                    RtcpFeedback::new("nack", &["pli"]),
                ],
                extensions: [
                    EXT_VIDEO_ORIENTATION,
                    EXT_TRANSPORT_CC,
                    EXT_ABS_SEND_TIME,
                    EXT_TOFFSET,
                    EXT_RTP_STREAM_ID,
                    EXT_MID,
                ]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            },
        }
    }
}

impl Capabilities {
    pub fn for_kind(&self, kind: TrackKind) -> &Capability {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    /// Removes codecs, feedback and extensions outside the capability set
    /// from every audio/video section of `sdp`.
    ///
    /// A section left without any codec is rejected by zeroing its port.
    pub fn restrict_answer(&self, sdp: &str) -> String {
        let mut out: Vec<String> = vec![];
        let mut section: Vec<&str> = vec![];
        let mut kind: Option<TrackKind> = None;

        for line in sdp.lines().map(|l| l.trim_end_matches('\r')) {
            if line.is_empty() {
                continue;
            }
            if line.starts_with("m=") {
                self.flush_section(kind, &section, &mut out);
                section.clear();
                let media = line[2..].split_whitespace().next().unwrap_or_default();
                kind = TrackKind::from_media_type(media);
            }
            section.push(line);
        }
        self.flush_section(kind, &section, &mut out);

        let mut sdp = out.join("\r\n");
        sdp.push_str("\r\n");
        sdp
    }

    fn flush_section(&self, kind: Option<TrackKind>, lines: &[&str], out: &mut Vec<String>) {
        let Some(kind) = kind else {
            // Session part or a section we don't restrict.
            out.extend(lines.iter().map(|l| l.to_string()));
            return;
        };
        let capability = self.for_kind(kind);

        // Payload types whose codec is accepted, then rtx bound to them.
        let mut allowed: HashSet<&str> = HashSet::new();
        for line in lines {
            if let Some((pt, codec)) = rtpmap(line) {
                if capability.supports_codec(codec) {
                    allowed.insert(pt);
                }
            }
        }
        if capability.rtx {
            let rtx: Vec<&str> = lines
                .iter()
                .filter_map(|l| rtpmap(l))
                .filter(|(_, codec)| codec.eq_ignore_ascii_case("rtx"))
                .map(|(pt, _)| pt)
                .filter(|pt| {
                    lines.iter().any(|l| {
                        fmtp(l)
                            .filter(|(fpt, _)| fpt == pt)
                            .and_then(|(_, params)| apt(params))
                            .is_some_and(|apt| allowed.contains(apt))
                    })
                })
                .collect();
            allowed.extend(rtx);
        }

        for line in lines {
            if line.starts_with("m=") {
                out.push(restrict_media_line(line, &allowed));
            } else if let Some((pt, _)) = rtpmap(line).or_else(|| fmtp(line)) {
                if allowed.contains(pt) {
                    out.push(line.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("a=rtcp-fb:") {
                let (pt, value) = rest.split_once(' ').unwrap_or((rest, ""));
                let pt_ok = pt == "*" || allowed.contains(pt);
                if pt_ok && capability.rtcp_feedback.iter().any(|fb| fb.matches(value)) {
                    out.push(line.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("a=extmap:") {
                let uri = rest.split_whitespace().nth(1).unwrap_or_default();
                if capability.extensions.iter().any(|e| e == uri) {
                    out.push(line.to_string());
                }
            } else {
                out.push(line.to_string());
            }
        }
    }
}

fn rtpmap(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("a=rtpmap:")?;
    let (pt, enc) = rest.split_once(' ')?;
    Some((pt, enc.split('/').next()?))
}

fn fmtp(line: &str) -> Option<(&str, &str)> {
    line.strip_prefix("a=fmtp:")?.split_once(' ')
}

fn apt(params: &str) -> Option<&str> {
    params
        .split(';')
        .find_map(|p| p.trim().strip_prefix("apt="))
}

fn restrict_media_line(line: &str, allowed: &HashSet<&str>) -> String {
    let mut parts = line.split_whitespace();
    let (Some(media), Some(port), Some(proto)) = (parts.next(), parts.next(), parts.next()) else {
        return line.to_string();
    };
    let formats: Vec<&str> = parts.collect();
    let kept: Vec<&str> = formats
        .iter()
        .copied()
        .filter(|pt| allowed.contains(pt))
        .collect();

    if kept.is_empty() {
        format!("{} 0 {} {}", media, proto, formats.join(" "))
    } else {
        format!("{} {} {} {}", media, port, proto, kept.join(" "))
    }
}
