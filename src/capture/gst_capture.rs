//! GStreamer network source: depayload, decode and convert to raw frames

use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::Source;
use crate::error::{ConnectError, ReadError};
use crate::utils::redact_credentials;
use crate::{OutputConfig, SourceConfig};

/// Pulls decoded frames from an `appsink` at the end of a decode pipeline
pub struct GstSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    latency_ms: u32,
    connect_timeout: Duration,
    read_timeout: Duration,
    sequence: u64,
}

/// One running decode pipeline
pub struct GstSession {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    bus: gst::Bus,
}

impl GstSource {
    pub fn new(source: &SourceConfig, output: &OutputConfig) -> Result<Self> {
        gst::init().map_err(|e| eyre!("Failed to initialize GStreamer: {}", e))?;

        if output.format.frame_size(output.width, output.height).is_none() {
            return Err(eyre!("Network source must decode to a raw format, got {:?}", output.format));
        }

        Ok(Self {
            width: output.width,
            height: output.height,
            format: output.format,
            latency_ms: source.latency_ms,
            connect_timeout: source.connect_timeout(),
            read_timeout: source.read_timeout(),
            sequence: 0,
        })
    }

    /// Launch description for `address`
    fn build_pipeline_string(&self, address: &str) -> String {
        let convert = format!(
            "decodebin ! videoconvert ! videoscale ! \
             video/x-raw,format={},width={},height={} ! \
             appsink name=appsink",
            self.format.caps_name(),
            self.width,
            self.height
        );

        if address.starts_with("rtsp://") || address.starts_with("rtsps://") {
            format!(
                "rtspsrc location={} latency={} ! \
                 application/x-rtp,encoding-name=H264,payload=96 ! \
                 rtph264depay ! h264parse ! {}",
                address, self.latency_ms, convert
            )
        } else {
            // Files, http and anything else a uri handler exists for
            format!("uridecodebin uri={} ! {}", address, convert.trim_start_matches("decodebin ! "))
        }
    }

    /// First error or end-of-stream message waiting on the bus
    fn bus_failure(session: &GstSession) -> Option<ReadError> {
        let msg = session
            .bus
            .pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])?;

        use gst::MessageView;
        match msg.view() {
            MessageView::Eos(..) => Some(ReadError::end_of_stream()),
            MessageView::Error(err) => Some(ReadError::decode(format!(
                "{} ({})",
                err.error(),
                err.debug().unwrap_or_default()
            ))),
            _ => None,
        }
    }

    fn sample_to_frame(&mut self, sample: &gst::Sample) -> Result<Frame, ReadError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| ReadError::decode("Sample contains no buffer"))?;

        let map = buffer
            .map_readable()
            .map_err(|_| ReadError::decode("Failed to map buffer"))?;

        // Copy out so the pipeline can recycle its buffer pool
        let data = Bytes::copy_from_slice(map.as_slice());

        let caps = sample
            .caps()
            .ok_or_else(|| ReadError::decode("Sample has no caps"))?;

        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| ReadError::decode("Failed to parse video info from caps"))?;

        self.sequence += 1;
        let stride = video_info.stride().first().copied().unwrap_or(0).max(0) as u32;

        Ok(Frame::new(
            data,
            FrameMetadata {
                sequence: self.sequence,
                width: video_info.width(),
                height: video_info.height(),
                stride,
                format: self.format,
                device_timestamp: buffer.pts().map(|pts| pts.into()),
            },
        ))
    }
}

impl Source for GstSource {
    type Handle = GstSession;

    #[instrument(skip_all)]
    fn connect(&mut self, address: &str) -> Result<GstSession, ConnectError> {
        let pipeline_str = self.build_pipeline_string(address);
        info!("Pipeline: {}", redact_credentials(&pipeline_str));

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| ConnectError::Handshake(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| ConnectError::Handshake("Failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| ConnectError::Handshake("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| ConnectError::Handshake("Failed to cast to AppSink".into()))?;

        // Pull mode; keep the relay buffer as the only real queue
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        let bus = pipeline
            .bus()
            .ok_or_else(|| ConnectError::Handshake("Pipeline has no bus".into()))?;

        let session = GstSession {
            pipeline,
            appsink,
            bus,
        };

        if let Err(e) = session.pipeline.set_state(gst::State::Playing) {
            let detail = Self::bus_failure(&session)
                .map(|e| e.message)
                .unwrap_or_else(|| format!("{:?}", e));
            self.close(session);
            return Err(ConnectError::Unreachable(detail));
        }

        let timeout = gst::ClockTime::from_mseconds(self.connect_timeout.as_millis() as u64);
        let (state_change, _, _) = session.pipeline.state(Some(timeout));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                debug!("Pipeline playing");
            }
            Ok(gst::StateChangeSuccess::Async) => {
                debug!("Pipeline still prerolling after {:?}", self.connect_timeout);
            }
            Err(_) => {
                let detail = Self::bus_failure(&session)
                    .map(|e| e.message)
                    .unwrap_or_else(|| "pipeline refused to start".into());
                self.close(session);
                return Err(ConnectError::Unreachable(detail));
            }
        }

        Ok(session)
    }

    fn read_frame(&mut self, session: &mut GstSession) -> Result<Frame, ReadError> {
        if let Some(err) = Self::bus_failure(session) {
            return Err(err);
        }

        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        match session.appsink.try_pull_sample(timeout) {
            Some(sample) => self.sample_to_frame(&sample),
            None if session.appsink.is_eos() => Err(ReadError::end_of_stream()),
            None => Err(Self::bus_failure(session).unwrap_or_else(|| {
                ReadError::timeout(format!("no sample within {:?}", self.read_timeout))
            })),
        }
    }

    fn close(&mut self, session: GstSession) {
        if let Err(e) = session.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }
}
