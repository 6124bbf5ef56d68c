//! GStreamer-based decoding for rtsp/http/file URIs

use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::decoder::{Decoder, ReadOutcome};
use super::frame::{DecodedImage, PixelFormat};
use crate::config::StreamConfig;
use crate::{Error, Result};

/// How long one `read_frame` waits on the appsink before reporting idle
const PULL_TIMEOUT_MS: u64 = 100;

/// uridecodebin pipeline terminated by an RGB appsink
pub struct GstDecoder {
    stream: usize,
    uri: String,
    connect_timeout: Duration,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl GstDecoder {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let stream = config.index;
        let conn = |what: &str, e: &dyn std::fmt::Display| {
            Error::connection(stream, format!("{}: {}", what, e))
        };

        gst::init().map_err(|e| conn("initialize GStreamer", &e))?;

        let uri = to_uri(&config.uri);
        let pipeline_str = format!(
            "uridecodebin uri={} ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 leaky=downstream ! \
             videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=appsink",
            uri
        );
        debug!(stream, "Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| conn("build pipeline", &e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::connection(stream, "Failed to create pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| Error::connection(stream, "Failed to find appsink element"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| Error::connection(stream, "Failed to cast to AppSink"))?;

        // Latest frame wins; the source applies its own staleness policy
        appsink.set_max_buffers(2);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            stream,
            uri,
            connect_timeout: config.connect_timeout,
            pipeline,
            appsink,
        })
    }

    /// Drain the bus; errors mean the stream is gone
    fn poll_bus(&self) -> Result<Option<ReadOutcome>> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(None);
        };
        while let Some(message) = bus.timed_pop(gst::ClockTime::ZERO) {
            use gst::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(Error::connection(
                        self.stream,
                        format!(
                            "error from {:?}: {}",
                            err.src().map(|s| s.path_string()),
                            err.error()
                        ),
                    ));
                }
                MessageView::Eos(..) => return Ok(Some(ReadOutcome::EndOfStream)),
                MessageView::Warning(w) => warn!(stream = self.stream, "GStreamer warning: {}", w.error()),
                _ => {}
            }
        }
        Ok(None)
    }
}

fn to_uri(uri: &str) -> String {
    if uri.contains("://") {
        uri.to_string()
    } else {
        let path = std::path::Path::new(uri);
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        format!("file://{}", absolute.display())
    }
}

impl Decoder for GstDecoder {
    fn connect(&mut self) -> Result<()> {
        info!(stream = self.stream, "Connecting to {}", self.uri);

        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::connection(self.stream, format!("Failed to start pipeline: {:?}", e)))?;

        let timeout = gst::ClockTime::from_mseconds(self.connect_timeout.as_millis() as u64);
        let (state_change, _, _) = self.pipeline.state(timeout);
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                info!(stream = self.stream, "Pipeline playing");
            }
            Ok(gst::StateChangeSuccess::Async) => {
                debug!(stream = self.stream, "Pipeline still prerolling");
            }
            Err(e) => {
                let bus_error = self.poll_bus().err();
                return Err(bus_error.unwrap_or_else(|| {
                    Error::connection(self.stream, format!("Failed to reach Playing: {:?}", e))
                }));
            }
        }

        self.poll_bus().map(|_| ())
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        if let Some(outcome) = self.poll_bus()? {
            return Ok(outcome);
        }

        let Some(sample) = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
        else {
            if self.appsink.is_eos() {
                return Ok(ReadOutcome::EndOfStream);
            }
            return Ok(ReadOutcome::Idle);
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| Error::decode(self.stream, "Sample contains no buffer"))?;
        let caps = sample
            .caps()
            .ok_or_else(|| Error::decode(self.stream, "Sample has no caps"))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| Error::decode(self.stream, "Failed to parse video info from caps"))?;

        let map = buffer
            .map_readable()
            .map_err(|_| Error::decode(self.stream, "Failed to map buffer"))?;

        let image = DecodedImage {
            data: Bytes::copy_from_slice(map.as_slice()),
            width: video_info.width(),
            height: video_info.height(),
            stride: video_info.stride()[0] as u32,
            format: PixelFormat::Rgb24, // Output is always RGB after conversion
            device_timestamp: buffer.pts().map(|pts| Duration::from_nanos(pts.nseconds())),
        };
        if !image.is_complete() {
            return Err(Error::decode(self.stream, "Truncated buffer"));
        }

        Ok(ReadOutcome::Frame(image))
    }

    fn release(&mut self) {
        info!(stream = self.stream, "Stopping GStreamer pipeline");
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(stream = self.stream, "Failed to stop pipeline: {:?}", e);
        }
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
