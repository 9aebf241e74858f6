//! Republishing through a GStreamer `appsrc` pipeline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, warn};

use super::Sink;
use crate::capture::Frame;
use crate::error::SinkError;
use crate::OutputConfig;

/// Pushes paced frames into an `appsrc name=source` pipeline.
///
/// Readiness follows the appsrc flow callbacks: ready after the first
/// `need-data`, busy between `enough-data` and the next `need-data`.
pub struct GstSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    consumer: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    closed: bool,
}

impl GstSink {
    pub fn new(config: &OutputConfig, fps: u32) -> Result<Self> {
        gst::init().map_err(|e| eyre!("Failed to initialize GStreamer: {}", e))?;

        let pipeline_str = config
            .sink_pipeline
            .clone()
            .unwrap_or_else(|| Self::default_pipeline(config, fps));
        info!("Sink pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| eyre!("Failed to create pipeline"))?;

        let appsrc = pipeline
            .by_name("source")
            .ok_or_else(|| eyre!("Sink pipeline has no `appsrc name=source`"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| eyre!("Failed to cast to AppSrc"))?;

        if appsrc.caps().is_none() {
            let caps = gst::Caps::builder("video/x-raw")
                .field("format", config.format.caps_name())
                .field("width", config.width as i32)
                .field("height", config.height as i32)
                .field("framerate", gst::Fraction::new(fps as i32, 1))
                .build();
            appsrc.set_caps(Some(&caps));
        }
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        // Never let a slow encoder stall the pacer
        appsrc.set_property("block", false);

        let consumer = Arc::new(AtomicBool::new(false));
        let accepting = Arc::new(AtomicBool::new(false));
        appsrc.set_callbacks(
            gst_app::AppSrcCallbacks::builder()
                .need_data({
                    let consumer = consumer.clone();
                    let accepting = accepting.clone();
                    move |_, _| {
                        if !consumer.swap(true, Ordering::AcqRel) {
                            info!("downstream requested data");
                        }
                        accepting.store(true, Ordering::Release);
                    }
                })
                .enough_data({
                    let accepting = accepting.clone();
                    move |_| accepting.store(false, Ordering::Release)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| eyre!("Failed to start sink pipeline: {:?}", e))?;

        Ok(Self {
            pipeline,
            appsrc,
            consumer,
            accepting,
            closed: false,
        })
    }

    /// H.264 over RTP/UDP to localhost:5000
    fn default_pipeline(config: &OutputConfig, fps: u32) -> String {
        format!(
            "appsrc name=source is-live=true format=time \
             caps=video/x-raw,format={},width={},height={},framerate={}/1 ! \
             videoconvert ! video/x-raw,format=I420 ! \
             x264enc speed-preset=ultrafast tune=zerolatency ! \
             rtph264pay config-interval=1 name=pay0 pt=96 ! \
             udpsink host=127.0.0.1 port=5000",
            config.format.caps_name(),
            config.width,
            config.height,
            fps
        )
    }
}

impl Sink for GstSink {
    fn is_ready(&self) -> bool {
        self.consumer.load(Ordering::Acquire)
    }

    fn submit(&mut self, frame: Frame, timestamp_ns: u64, duration_ns: u64) -> Result<(), SinkError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SinkError::Busy);
        }

        let mut buffer = gst::Buffer::from_slice(frame.data);
        {
            let buffer = buffer.make_mut();
            let pts = gst::ClockTime::from_nseconds(timestamp_ns);
            buffer.set_pts(pts);
            buffer.set_dts(pts);
            buffer.set_duration(gst::ClockTime::from_nseconds(duration_ns));
        }

        match self.appsrc.push_buffer(buffer) {
            Ok(_) => Ok(()),
            Err(gst::FlowError::Flushing) | Err(gst::FlowError::Eos) => {
                self.consumer.store(false, Ordering::Release);
                self.accepting.store(false, Ordering::Release);
                Err(SinkError::NotReady)
            }
            Err(e) => {
                warn!("Error pushing buffer: {:?}", e);
                Err(SinkError::Busy)
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.appsrc.end_of_stream() {
            debug!("appsrc end-of-stream: {:?}", e);
        }
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop sink pipeline: {:?}", e);
        }
    }
}

impl Drop for GstSink {
    fn drop(&mut self) {
        self.close();
    }
}
