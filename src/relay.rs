//! Media frame relay
//!
//! Forwards frames from inbound tracks to the push adapter of their stream.
//! Callbacks run on engine threads, so a relay only does a length check and
//! one push per frame.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tracing::trace;

use crate::engine::Track;
use crate::model::media::{Frame, TrackKind};
use crate::rtmp::PushAdapter;

/// Frames this short are keep-alives or empty NAL markers, not media.
pub const MIN_FRAME_LEN: usize = 4;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Frames the pipeline took
    pub forwarded: u64,
    /// Frames filtered out, or refused by a stopped or failing adapter
    pub dropped: u64,
}

pub struct FrameRelay {
    kind: TrackKind,
    adapter: Arc<PushAdapter>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl FrameRelay {
    pub fn new(kind: TrackKind, adapter: Arc<PushAdapter>) -> FrameRelay {
        FrameRelay {
            kind,
            adapter,
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a relay as the frame callback of `track`.
    pub fn attach(track: &dyn Track, adapter: Arc<PushAdapter>) -> Arc<FrameRelay> {
        let relay = Arc::new(FrameRelay::new(track.kind(), adapter));
        let callback = relay.clone();
        track.on_frame(Arc::new(move |frame| callback.on_frame(frame)));
        relay
    }

    pub fn on_frame(&self, frame: Frame) {
        if frame.len() <= MIN_FRAME_LEN {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        trace!("{} frame of {} bytes at {}", self.kind, frame.len(), frame.timestamp);
        // A stopped adapter absorbs the push.
        if self.adapter.push(&frame.payload, self.kind.is_audio()) {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
