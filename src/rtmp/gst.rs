//! GStreamer pipeline backend

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::AppSrc;
use tracing::debug;

use crate::rtmp::pipeline::{
    Pipeline, PipelineBackend, PipelineError, PipelineState, AUDIO_SRC, VIDEO_SRC,
};

pub struct GstBackend;

impl GstBackend {
    /// Initializes GStreamer for the process.
    pub fn new() -> Result<GstBackend, PipelineError> {
        gst::init().map_err(|e| PipelineError::Description(e.to_string()))?;
        Ok(GstBackend)
    }
}

impl PipelineBackend for GstBackend {
    fn check_plugins(&self, names: &[&str]) -> Result<(), PipelineError> {
        let registry = gst::Registry::get();
        let missing: Vec<String> = names
            .iter()
            .filter(|name| registry.find_plugin(name).is_none())
            .map(|name| name.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::MissingPlugins(missing))
        }
    }

    fn build(&self, description: &str) -> Result<Box<dyn Pipeline>, PipelineError> {
        debug!("Launching pipeline: {}", description);

        let pipeline = gst::parse::launch(description)
            .map_err(|e| PipelineError::Description(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::Description("not a pipeline".into()))?;

        let video = app_src(&pipeline, VIDEO_SRC)?;
        let audio = app_src(&pipeline, AUDIO_SRC)?;

        Ok(Box::new(GstPipeline {
            pipeline,
            video,
            audio,
        }))
    }
}

fn app_src(pipeline: &gst::Pipeline, name: &str) -> Result<AppSrc, PipelineError> {
    pipeline
        .by_name(name)
        .and_then(|e| e.downcast::<AppSrc>().ok())
        .ok_or_else(|| PipelineError::NoSuchElement(name.to_string()))
}

struct GstPipeline {
    pipeline: gst::Pipeline,
    video: AppSrc,
    audio: AppSrc,
}

impl Pipeline for GstPipeline {
    fn set_state(&self, state: PipelineState) -> Result<(), PipelineError> {
        let target = match state {
            PipelineState::Playing => gst::State::Playing,
            PipelineState::Null => gst::State::Null,
        };
        self.pipeline
            .set_state(target)
            .map(|_| ())
            .map_err(|_| PipelineError::StateChange(state))
    }

    fn push_buffer(&self, element: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        let src = match element {
            VIDEO_SRC => &self.video,
            AUDIO_SRC => &self.audio,
            other => return Err(PipelineError::NoSuchElement(other.to_string())),
        };

        src.push_buffer(gst::Buffer::from_slice(bytes.to_vec()))
            .map(|_| ())
            .map_err(|e| PipelineError::Push(format!("{:?}", e)))
    }
}
