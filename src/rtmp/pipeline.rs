//! Push pipeline description and backend seam

use std::fmt;

use thiserror::Error;

/// Input element receiving H.264 access units.
pub const VIDEO_SRC: &str = "videosrc";
/// Input element receiving Opus packets.
pub const AUDIO_SRC: &str = "audiosrc";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing plugins: {}", .0.join(", "))]
    MissingPlugins(Vec<String>),
    #[error("invalid pipeline description: {0}")]
    Description(String),
    #[error("pipeline has no element named {0}")]
    NoSuchElement(String),
    #[error("state change to {0:?} failed")]
    StateChange(PipelineState),
    #[error("push rejected: {0}")]
    Push(String),
    #[error("adapter already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Playing,
    Null,
}

/// Builds pipelines. One backend serves the whole process.
pub trait PipelineBackend: Send + Sync {
    fn check_plugins(&self, names: &[&str]) -> Result<(), PipelineError>;

    fn build(&self, description: &str) -> Result<Box<dyn Pipeline>, PipelineError>;
}

/// A running (or halted) media pipeline.
pub trait Pipeline: Send + Sync {
    fn set_state(&self, state: PipelineState) -> Result<(), PipelineError>;

    fn push_buffer(&self, element: &str, bytes: &[u8]) -> Result<(), PipelineError>;
}

/// How the video branch treats incoming H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum VideoMode {
    /// Parse and mux the access units as they arrive
    #[default]
    Passthrough,
    /// Decode, scale to 1280x720 and re-encode on an NVIDIA GPU
    Nvenc,
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoMode::Passthrough => f.write_str("passthrough"),
            VideoMode::Nvenc => f.write_str("nvenc"),
        }
    }
}

const AUDIO_BRANCH: &str = "appsrc is-live=true do-timestamp=true name=audiosrc ! queue ! \
opusparse ! opusdec ! audioconvert ! audioresample ! avenc_aac ! muxer.";

const PASSTHROUGH_VIDEO_BRANCH: &str = "appsrc is-live=true do-timestamp=true name=videosrc ! \
queue ! h264parse ! video/x-h264,stream-format=(string)avc ! muxer.";

const NVENC_VIDEO_BRANCH: &str = "appsrc is-live=true do-timestamp=true name=videosrc ! \
queue ! h264parse ! nvh264dec ! cudaconvert ! cudascale ! \
video/x-raw(memory:CUDAMemory), width=1280, height=720 ! nvh264enc ! h264parse ! \
video/x-h264, stream-format=(string)avc, width=1280, height=720 ! muxer.";

/// Pipeline shape shared by every adapter of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineConfig {
    pub video: VideoMode,
}

impl PipelineConfig {
    pub fn required_plugins(&self) -> Vec<&'static str> {
        let mut plugins = vec![
            "app",
            "flv",
            "rtmp2",
            "libav",
            "opus",
            "opusparse",
            "videoparsersbad",
        ];
        if self.video == VideoMode::Nvenc {
            plugins.push("nvcodec");
        }
        plugins
    }

    /// The launch description pushing FLV to `rtmp_url`.
    pub fn describe(&self, rtmp_url: &str) -> Result<String, PipelineError> {
        // The url ends up inside a quoted property.
        if rtmp_url.is_empty() || rtmp_url.contains(['\'', '"', '!', ' ']) {
            return Err(PipelineError::Description(format!(
                "unusable rtmp url {:?}",
                rtmp_url
            )));
        }

        let video = match self.video {
            VideoMode::Passthrough => PASSTHROUGH_VIDEO_BRANCH,
            VideoMode::Nvenc => NVENC_VIDEO_BRANCH,
        };

        Ok(format!(
            "{}   {}  flvmux name=muxer streamable=true ! rtmp2sink sync=false location='{}'",
            video, AUDIO_BRANCH, rtmp_url
        ))
    }
}

/// Backend of a build without GStreamer: nothing can be constructed.
#[derive(Debug, Default)]
pub struct UnavailableBackend;

impl PipelineBackend for UnavailableBackend {
    fn check_plugins(&self, names: &[&str]) -> Result<(), PipelineError> {
        if names.is_empty() {
            return Ok(());
        }
        Err(PipelineError::MissingPlugins(
            names.iter().map(|n| n.to_string()).collect(),
        ))
    }

    fn build(&self, _description: &str) -> Result<Box<dyn Pipeline>, PipelineError> {
        Err(PipelineError::Description(
            "built without the gstreamer feature".into(),
        ))
    }
}
