//! `synthetic://` generator for demos and tests.
//!
//! `synthetic://WIDTHxHEIGHT?fps=25&motion=1&frames=300&fail=1&corrupt_every=10`
//!
//! - `fps`: pacing rate, overriding the stream's configured fps
//! - `motion`: a bright square sweeps across a flat background
//! - `frames`: end-of-stream after this many frames
//! - `fail` (alias `offline`): every connection attempt fails
//! - `corrupt_every`: every Nth read is a decode error

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info;

use super::decoder::{Decoder, ReadOutcome};
use super::frame::{DecodedImage, PixelFormat};
use crate::config::{frame_interval, StreamConfig};
use crate::{Error, Result};

const BACKGROUND: u8 = 60;
const FOREGROUND: u8 = 200;

pub struct SyntheticDecoder {
    stream: usize,
    width: u32,
    height: u32,
    interval: Duration,
    motion: bool,
    frames: Option<u64>,
    offline: bool,
    corrupt_every: Option<u64>,
    produced: u64,
    reads: u64,
    last_emit: Option<Instant>,
    connected: bool,
}

impl SyntheticDecoder {
    pub fn from_uri(config: &StreamConfig) -> Result<Self> {
        let bad = |why: &str| Error::connection(config.index, format!("{}: {}", config.uri, why));

        let rest = config
            .uri
            .strip_prefix("synthetic://")
            .ok_or_else(|| bad("not a synthetic uri"))?;
        let (size, query) = rest.split_once('?').unwrap_or((rest, ""));

        let (width, height): (u32, u32) = match size.split_once('x') {
            Some((w, h)) => (
                w.parse().map_err(|_| bad("bad width"))?,
                h.parse().map_err(|_| bad("bad height"))?,
            ),
            None if size.is_empty() => (320, 240),
            None => return Err(bad("size must be WIDTHxHEIGHT")),
        };
        if width == 0 || height == 0 {
            return Err(bad("empty frame size"));
        }

        let mut decoder = Self {
            stream: config.index,
            width,
            height,
            interval: config.frame_interval(),
            motion: false,
            frames: None,
            offline: false,
            corrupt_every: None,
            produced: 0,
            reads: 0,
            last_emit: None,
            connected: false,
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "1"));
            let flag = matches!(value, "1" | "true" | "yes");
            match key {
                "motion" => decoder.motion = flag,
                "fail" | "offline" => decoder.offline = flag,
                "fps" => {
                    decoder.interval = value
                        .parse()
                        .ok()
                        .and_then(frame_interval)
                        .ok_or_else(|| bad("bad fps"))?
                }
                "frames" => decoder.frames = Some(value.parse().map_err(|_| bad("bad frames"))?),
                "corrupt_every" => {
                    decoder.corrupt_every =
                        Some(value.parse().map_err(|_| bad("bad corrupt_every"))?)
                }
                other => return Err(bad(&format!("unknown option '{}'", other))),
            }
        }

        Ok(decoder)
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![BACKGROUND; w * h * 3];

        if self.motion {
            let side = (w.min(h) / 4).max(1);
            let travel = w.saturating_sub(side).max(1);
            let x0 = (self.produced as usize * 4) % travel;
            let y0 = (h - side) / 2;
            for y in y0..y0 + side {
                let row = &mut pixels[(y * w + x0) * 3..(y * w + x0 + side) * 3];
                row.fill(FOREGROUND);
            }
        }

        pixels
    }

    fn pace(&mut self) {
        if let Some(last) = self.last_emit {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        self.last_emit = Some(Instant::now());
    }
}

impl Decoder for SyntheticDecoder {
    fn connect(&mut self) -> Result<()> {
        if self.offline {
            return Err(Error::connection(self.stream, "synthetic source is offline"));
        }
        self.connected = true;
        info!(stream = self.stream, "Synthetic source connected ({}x{})", self.width, self.height);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        if !self.connected {
            return Err(Error::connection(self.stream, "not connected"));
        }
        if self.frames.is_some_and(|limit| self.produced >= limit) {
            return Ok(ReadOutcome::EndOfStream);
        }

        self.pace();
        self.reads += 1;
        if self.corrupt_every.is_some_and(|n| n > 0 && self.reads % n == 0) {
            return Err(Error::decode(self.stream, "synthetic corrupt frame"));
        }

        let pixels = self.render();
        self.produced += 1;
        let mut image = DecodedImage::packed(
            Bytes::from(pixels),
            self.width,
            self.height,
            PixelFormat::Rgb24,
        );
        image.device_timestamp = Some(self.interval * self.produced as u32);
        Ok(ReadOutcome::Frame(image))
    }

    fn release(&mut self) {
        self.connected = false;
    }
}
