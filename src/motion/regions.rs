//! Connected-region extraction on a binary mask

use super::filter::GrayPlane;
use super::Rect;

/// One 8-connected foreground region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub bbox: Rect,
    /// Filled pixel count
    pub area: u32,
}

/// Label every 8-connected run of non-zero pixels. Regions come out in
/// raster order of their first pixel.
pub fn find_regions(mask: &GrayPlane) -> Vec<Region> {
    let w = mask.width as usize;
    let h = mask.height as usize;
    let mut visited = vec![false; w * h];
    let mut stack = Vec::new();
    let mut regions = Vec::new();

    for start in 0..w * h {
        if visited[start] || mask.data[start] == 0 {
            continue;
        }

        visited[start] = true;
        stack.push(start);

        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let mut area = 0u32;

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let n = ny * w + nx;
                    if !visited[n] && mask.data[n] != 0 {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
        }

        regions.push(Region {
            bbox: Rect::new(
                min_x as u32,
                min_y as u32,
                (max_x - min_x + 1) as u32,
                (max_y - min_y + 1) as u32,
            ),
            area,
        });
    }

    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> GrayPlane {
        let height = rows.len() as u32;
        let width = rows[0].len() as u32;
        let data = rows
            .iter()
            .flat_map(|r| r.bytes().map(|b| if b == b'#' { 255 } else { 0 }))
            .collect();
        GrayPlane {
            width,
            height,
            data,
        }
    }

    #[test]
    fn empty_mask_has_no_regions() {
        let mask = mask_from(&["....", "...."]);
        assert!(find_regions(&mask).is_empty());
    }

    #[test]
    fn diagonal_pixels_join_one_region() {
        let mask = mask_from(&["#...", ".#..", "..#.", "...."]);
        let regions = find_regions(&mask);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area, 3);
        assert_eq!(regions[0].bbox, Rect::new(0, 0, 3, 3));
    }

    #[test]
    fn separate_blobs_are_reported_separately() {
        let mask = mask_from(&[
            "##....", //
            "##....",
            "......",
            "...###",
            "...###",
        ]);
        let regions = find_regions(&mask);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].bbox, Rect::new(0, 0, 2, 2));
        assert_eq!(regions[0].area, 4);
        assert_eq!(regions[1].bbox, Rect::new(3, 3, 3, 2));
        assert_eq!(regions[1].area, 6);
    }
}
