//! RTMP push adapter
//!
//! Owns one outbound pipeline per stream: H.264 and Opus in, FLV over RTMP
//! out. Frames may arrive concurrently from several engine threads; pushes
//! share a read lock so audio and video never wait on each other, while
//! `stop` takes the write lock so no push can overlap it.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod pipeline;

pub use pipeline::{
    Pipeline, PipelineBackend, PipelineConfig, PipelineError, PipelineState, UnavailableBackend,
    VideoMode, AUDIO_SRC, VIDEO_SRC,
};

/// The backend this build can construct pipelines with.
pub fn default_backend() -> Result<Arc<dyn PipelineBackend>, PipelineError> {
    #[cfg(feature = "gstreamer")]
    {
        Ok(Arc::new(gst::GstBackend::new()?))
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        warn!("Built without the gstreamer feature, RTMP pushing is unavailable");
        Ok(Arc::new(UnavailableBackend))
    }
}

enum AdapterState {
    Idle,
    Running(Box<dyn Pipeline>),
    Stopped,
}

impl AdapterState {
    fn name(&self) -> &'static str {
        match self {
            AdapterState::Idle => "idle",
            AdapterState::Running(_) => "running",
            AdapterState::Stopped => "stopped",
        }
    }
}

pub struct PushAdapter {
    backend: Arc<dyn PipelineBackend>,
    config: PipelineConfig,
    url: RwLock<Option<String>>,
    state: RwLock<AdapterState>,
}

impl PushAdapter {
    pub fn new(backend: Arc<dyn PipelineBackend>, config: PipelineConfig) -> PushAdapter {
        PushAdapter {
            backend,
            config,
            url: RwLock::new(None),
            state: RwLock::new(AdapterState::Idle),
        }
    }

    /// Builds the pipeline for `rtmp_url` and sets it playing.
    ///
    /// Only valid once, on a fresh adapter.
    pub fn start(&self, rtmp_url: &str) -> Result<(), PipelineError> {
        let mut state = self.state.write();
        if !matches!(*state, AdapterState::Idle) {
            return Err(PipelineError::AlreadyStarted);
        }

        self.backend
            .check_plugins(&self.config.required_plugins())?;
        let description = self.config.describe(rtmp_url)?;
        let pipeline = self.backend.build(&description)?;

        if let Err(e) = pipeline.set_state(PipelineState::Playing) {
            // Don't leave a half started pipeline behind.
            if let Err(cleanup) = pipeline.set_state(PipelineState::Null) {
                debug!("Halting the failed pipeline failed too: {}", cleanup);
            }
            return Err(e);
        }

        info!("Pushing to {} ({} video)", rtmp_url, self.config.video);
        *self.url.write() = Some(rtmp_url.to_string());
        *state = AdapterState::Running(pipeline);
        Ok(())
    }

    /// Hands one buffer to the video or audio input.
    ///
    /// Failures are logged and the buffer dropped; the next frame supersedes it.
    /// Returns whether the pipeline took the buffer.
    pub fn push(&self, buffer: &[u8], is_audio: bool) -> bool {
        let state = self.state.read();
        let AdapterState::Running(pipeline) = &*state else {
            debug!(
                "Dropping {} byte frame, adapter is {}",
                buffer.len(),
                state.name()
            );
            return false;
        };

        let element = if is_audio { AUDIO_SRC } else { VIDEO_SRC };
        match pipeline.push_buffer(element, buffer) {
            Ok(()) => true,
            Err(e) => {
                warn!("push buffer error on {}: {}", element, e);
                false
            }
        }
    }

    /// Halts the pipeline. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        let mut state = self.state.write();
        let previous = std::mem::replace(&mut *state, AdapterState::Stopped);

        if let AdapterState::Running(pipeline) = previous {
            if let Err(e) = pipeline.set_state(PipelineState::Null) {
                warn!("Stopping pipeline failed: {}", e);
            }
            if let Some(url) = self.url.read().as_deref() {
                info!("Stopped pushing to {}", url);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.read(), AdapterState::Running(_))
    }

    pub fn url(&self) -> Option<String> {
        self.url.read().clone()
    }
}
