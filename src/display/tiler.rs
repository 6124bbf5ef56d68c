//! Grid layout and canvas composition for N streams

use tracing::debug;

use crate::motion::Rect;
use crate::pipeline::Batch;

/// Fill colour for cells without a frame in the current batch
pub const PLACEHOLDER: [u8; 3] = [16, 16, 16];

/// Row-major grid of `rows` x `columns` cells over a fixed canvas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    pub streams: usize,
    pub rows: u32,
    pub columns: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl TileLayout {
    /// rows = floor(sqrt(n)), columns = ceil(n / rows)
    pub fn new(streams: usize, canvas_width: u32, canvas_height: u32) -> Self {
        let n = streams.max(1) as u32;
        let mut rows = (n as f64).sqrt() as u32;
        while rows * rows > n {
            rows -= 1;
        }
        while (rows + 1) * (rows + 1) <= n {
            rows += 1;
        }
        let columns = n.div_ceil(rows);

        Self {
            streams,
            rows,
            columns,
            canvas_width,
            canvas_height,
        }
    }

    pub fn cell_width(&self) -> u32 {
        self.canvas_width / self.columns
    }

    pub fn cell_height(&self) -> u32 {
        self.canvas_height / self.rows
    }

    /// Canvas rectangle for stream `index`. The last column and row absorb the remainder pixels.
    pub fn cell(&self, index: usize) -> Rect {
        let index = index as u32;
        let (row, col) = (index / self.columns, index % self.columns);
        let (cw, ch) = (self.cell_width(), self.cell_height());

        let w = if col + 1 == self.columns {
            self.canvas_width - cw * col
        } else {
            cw
        };
        let h = if row + 1 == self.rows {
            self.canvas_height - ch * row
        } else {
            ch
        };
        Rect::new(col * cw, row * ch, w, h)
    }

    /// Scale `rect` from a `width` x `height` frame into stream `index`'s cell
    pub fn map_rect(&self, index: usize, rect: Rect, width: u32, height: u32) -> Rect {
        let cell = self.cell(index);
        let sx = |v: u32| (v as u64 * cell.w as u64 / width.max(1) as u64) as u32;
        let sy = |v: u32| (v as u64 * cell.h as u64 / height.max(1) as u64) as u32;
        Rect::new(
            cell.x + sx(rect.x),
            cell.y + sy(rect.y),
            sx(rect.w).max(1),
            sy(rect.h).max(1),
        )
    }
}

/// Composed RGB output
#[derive(Debug, Clone, PartialEq)]
pub struct Canvas {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            sequence: 0,
            width,
            height,
            data: vec![0; width as usize * height as usize * 3],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn fill(&mut self, rect: Rect, color: [u8; 3]) {
        for y in rect.y..rect.bottom().min(self.height) {
            let start = (y as usize * self.width as usize + rect.x as usize) * 3;
            let end = (y as usize * self.width as usize + rect.right().min(self.width) as usize) * 3;
            for px in self.data[start..end].chunks_exact_mut(3) {
                px.copy_from_slice(&color);
            }
        }
    }

    pub fn to_image(&self) -> Option<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}

/// Caches the layout and rebuilds it only when the stream count changes
pub struct Tiler {
    canvas_width: u32,
    canvas_height: u32,
    layout: Option<TileLayout>,
}

impl Tiler {
    pub fn new(canvas_width: u32, canvas_height: u32) -> Self {
        Self {
            canvas_width,
            canvas_height,
            layout: None,
        }
    }

    pub fn layout(&mut self, streams: usize) -> &TileLayout {
        let stale = self.layout.as_ref().map_or(true, |l| l.streams != streams);
        if stale {
            let layout = TileLayout::new(streams, self.canvas_width, self.canvas_height);
            debug!(
                "Tile layout for {} streams: {}x{} cells",
                streams, layout.rows, layout.columns
            );
            self.layout = Some(layout);
        }
        self.layout
            .get_or_insert_with(|| TileLayout::new(streams, self.canvas_width, self.canvas_height))
    }

    /// Nearest-neighbour scale every present frame into its cell; missing cells get the placeholder
    pub fn compose(&mut self, batch: &Batch) -> Canvas {
        let layout = self.layout(batch.entries.len()).clone();
        let mut canvas = Canvas::new(layout.canvas_width, layout.canvas_height);
        canvas.sequence = batch.sequence;

        for (index, entry) in batch.entries.iter().enumerate() {
            let cell = layout.cell(index);
            let Some(frame) = entry.frame() else {
                canvas.fill(cell, PLACEHOLDER);
                continue;
            };

            let meta = &frame.meta;
            let channels = meta.format.channels();
            for cy in 0..cell.h {
                let sy = (cy as u64 * meta.height as u64 / cell.h as u64) as u32;
                let src = frame.row(sy);
                let dst_start = ((cell.y + cy) as usize * canvas.width as usize + cell.x as usize) * 3;
                let dst = &mut canvas.data[dst_start..dst_start + cell.w as usize * 3];
                for (cx, px) in dst.chunks_exact_mut(3).enumerate() {
                    let sx = (cx as u64 * meta.width as u64 / cell.w as u64) as usize;
                    px.copy_from_slice(&meta.format.rgb(&src[sx * channels..]));
                }
            }
        }

        canvas
    }
}
