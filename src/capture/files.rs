//! Local image-sequence source: a directory of PNG/JPEG frames or one still image

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::decoder::{Decoder, ReadOutcome};
use super::frame::{DecodedImage, PixelFormat};
use crate::config::StreamConfig;
use crate::{Error, Result};

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

pub struct ImageSequenceDecoder {
    stream: usize,
    root: PathBuf,
    interval: Duration,
    files: Vec<PathBuf>,
    cursor: usize,
    last_emit: Option<Instant>,
}

impl ImageSequenceDecoder {
    /// Directories and files with an image extension
    pub fn handles(path: &Path) -> bool {
        path.is_dir() || is_image(path)
    }

    pub fn new(config: &StreamConfig, path: &Path) -> Result<Self> {
        Ok(Self {
            stream: config.index,
            root: path.to_path_buf(),
            interval: config.frame_interval(),
            files: Vec::new(),
            cursor: 0,
            last_emit: None,
        })
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

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

impl Decoder for ImageSequenceDecoder {
    fn connect(&mut self) -> Result<()> {
        let conn_err = |e: std::io::Error| {
            Error::connection(self.stream, format!("{}: {}", self.root.display(), e))
        };

        let mut files = if self.root.is_dir() {
            std::fs::read_dir(&self.root)
                .map_err(conn_err)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image(p))
                .collect::<Vec<_>>()
        } else if self.root.is_file() {
            vec![self.root.clone()]
        } else {
            return Err(Error::connection(
                self.stream,
                format!("{} does not exist", self.root.display()),
            ));
        };

        if files.is_empty() {
            return Err(Error::connection(
                self.stream,
                format!("no images in {}", self.root.display()),
            ));
        }

        files.sort();
        info!(stream = self.stream, "Image sequence opened: {} frames", files.len());
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        let Some(path) = self.files.get(self.cursor).cloned() else {
            return Ok(ReadOutcome::EndOfStream);
        };
        self.cursor += 1;
        self.pace();

        debug!(stream = self.stream, "Decoding {}", path.display());
        let image = image::open(&path)
            .map_err(|e| Error::decode(self.stream, format!("{}: {}", path.display(), e)))?
            .to_rgb8();

        let (width, height) = image.dimensions();
        Ok(ReadOutcome::Frame(DecodedImage::packed(
            image.into_raw(),
            width,
            height,
            PixelFormat::Rgb24,
        )))
    }

    fn release(&mut self) {
        self.files.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, StreamEntry};

    fn config(path: &Path) -> StreamConfig {
        let mut entry = StreamEntry::new(path.display().to_string());
        entry.fps = Some(1_000.0);
        Settings::from_streams(vec![entry])
            .stream_configs()
            .unwrap()
            .remove(0)
    }

    #[test]
    fn plays_directory_in_name_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in [("b.png", 200u8), ("a.png", 10u8)] {
            image::RgbImage::from_pixel(8, 6, image::Rgb([value; 3]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();
        std::fs::write(dir.path().join("c.png"), "not really a png").unwrap();

        let mut decoder = ImageSequenceDecoder::new(&config(dir.path()), dir.path()).unwrap();
        decoder.connect().unwrap();

        match decoder.read_frame().unwrap() {
            ReadOutcome::Frame(img) => {
                assert_eq!((img.width, img.height), (8, 6));
                assert_eq!(img.data[0], 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(decoder.read_frame().unwrap(), ReadOutcome::Frame(_)));
        assert!(matches!(decoder.read_frame(), Err(Error::Decode { .. })));
        assert!(matches!(decoder.read_frame().unwrap(), ReadOutcome::EndOfStream));
    }

    #[test]
    fn missing_directory_is_a_connection_error() {
        let path = Path::new("/nonexistent/argus/frames");
        let mut decoder = ImageSequenceDecoder::new(&config(path), path).unwrap();
        assert!(matches!(decoder.connect(), Err(Error::Connection { .. })));
    }
}
