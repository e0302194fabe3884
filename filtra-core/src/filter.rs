//! Median filter over a contiguous RGB pixel buffer.
//!
//! A square window of odd size `k` slides over every pixel; each color
//! channel takes the median of the in-bounds samples under the window.
//! The window is truncated at image borders — border pixels see fewer
//! samples, which is intentional. The filter reads only from the source
//! buffer and writes only to a fresh result buffer.

use image::RgbImage;
use std::io::Cursor;

use crate::error::FiltraError;

/// Default window size; strong smoothing.
pub const DEFAULT_WINDOW: usize = 15;

const CHANNELS: usize = 3;

// ── PixelBuffer ──────────────────────────────────────────────────

/// A contiguous row-major RGB buffer, 3 bytes per pixel, no padding.
///
/// All access goes through checked row/stride indexing; the window
/// clipping rule is the only bounds logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw RGB bytes. `data.len()` must equal `width * height * 3`.
    pub fn from_rgb(width: usize, height: usize, data: Vec<u8>) -> Result<Self, FiltraError> {
        if data.len() != width * height * CHANNELS {
            return Err(FiltraError::Other(format!(
                "pixel buffer size mismatch: {} bytes for {width}x{height} RGB",
                data.len(),
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Channel value at `(x, y)`. Caller guarantees in-bounds coordinates
    /// via the window clipping rule.
    fn channel(&self, x: usize, y: usize, c: usize) -> u8 {
        self.data[(y * self.width + x) * CHANNELS + c]
    }
}

// ── Median filter ────────────────────────────────────────────────

/// Apply a median filter with a square window of size `window`.
///
/// `window` should be odd; an even value behaves like `window + 1`
/// because the window is expressed as a symmetric offset around the
/// center pixel.
pub fn median_filter(src: &PixelBuffer, window: usize) -> PixelBuffer {
    let (width, height) = (src.width, src.height);
    let offset = (window / 2) as isize;
    let mut out = vec![0u8; width * height * CHANNELS];

    // Reused scratch; worst case window*window samples.
    let mut samples: [Vec<u8>; CHANNELS] =
        std::array::from_fn(|_| Vec::with_capacity(window * window));

    for y in 0..height {
        for x in 0..width {
            for s in &mut samples {
                s.clear();
            }

            for fy in -offset..=offset {
                for fx in -offset..=offset {
                    let sx = x as isize + fx;
                    let sy = y as isize + fy;
                    // Truncate the window at the borders.
                    if sx < 0 || sy < 0 || sx >= width as isize || sy >= height as isize {
                        continue;
                    }
                    for (c, s) in samples.iter_mut().enumerate() {
                        s.push(src.channel(sx as usize, sy as usize, c));
                    }
                }
            }

            let base = (y * width + x) * CHANNELS;
            for (c, s) in samples.iter_mut().enumerate() {
                out[base + c] = median(s);
            }
        }
    }

    PixelBuffer {
        width,
        height,
        data: out,
    }
}

/// Median of a non-empty sample set; for an even count, the integer
/// average of the two central values. Empty input yields 0.
fn median(values: &mut [u8]) -> u8 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let middle = values.len() / 2;
    if values.len() % 2 == 0 {
        ((values[middle - 1] as u16 + values[middle] as u16) / 2) as u8
    } else {
        values[middle]
    }
}

// ── File-level entry point ───────────────────────────────────────

/// Decode image bytes, median-filter them, and re-encode as PNG.
pub fn apply_median_filter(image_bytes: &[u8], window: usize) -> Result<Vec<u8>, FiltraError> {
    let decoded = image::load_from_memory(image_bytes)?.to_rgb8();
    let (width, height) = (decoded.width() as usize, decoded.height() as usize);

    let src = PixelBuffer::from_rgb(width, height, decoded.into_raw())?;
    let filtered = median_filter(&src, window);

    let img = RgbImage::from_raw(width as u32, height as u32, filtered.into_bytes())
        .ok_or(FiltraError::MalformedPayload("filtered buffer size mismatch"))?;

    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Single-channel test helper: gray pixels so all channels agree.
    fn gray_buffer(width: usize, height: usize, values: &[u8]) -> PixelBuffer {
        let mut data = Vec::with_capacity(values.len() * CHANNELS);
        for &v in values {
            data.extend_from_slice(&[v, v, v]);
        }
        PixelBuffer::from_rgb(width, height, data).unwrap()
    }

    #[test]
    fn median_odd_count() {
        let mut v = vec![9, 1, 5];
        assert_eq!(median(&mut v), 5);
    }

    #[test]
    fn median_even_count_averages_central_pair() {
        let mut v = vec![10, 20, 30, 40];
        assert_eq!(median(&mut v), 25);
        let mut v = vec![1, 2];
        assert_eq!(median(&mut v), 1); // (1 + 2) / 2 truncates
    }

    #[test]
    fn median_empty_is_zero() {
        assert_eq!(median(&mut []), 0);
    }

    #[test]
    fn center_pixel_sees_all_nine_values() {
        // 3x3 image, window 3: center = median of all 9.
        let values = [10, 20, 30, 40, 50, 60, 70, 80, 90];
        let src = gray_buffer(3, 3, &values);
        let out = median_filter(&src, 3);
        assert_eq!(out.channel(1, 1, 0), 50);
    }

    #[test]
    fn corner_pixel_sees_only_inbounds_subset() {
        // Top-left corner with window 3 sees 4 samples: even count,
        // so the two central values are averaged.
        let values = [10, 20, 30, 40, 50, 60, 70, 80, 90];
        let src = gray_buffer(3, 3, &values);
        let out = median_filter(&src, 3);
        // Samples {10, 20, 40, 50} -> (20 + 40) / 2 = 30.
        assert_eq!(out.channel(0, 0, 0), 30);
    }

    #[test]
    fn dimensions_preserved_and_source_untouched() {
        let values = [5u8; 9];
        let src = gray_buffer(3, 3, &values);
        let before = src.clone();
        let out = median_filter(&src, 15);
        assert_eq!(out.width(), 3);
        assert_eq!(out.height(), 3);
        assert_eq!(src, before);
    }

    #[test]
    fn channels_filtered_independently() {
        // 1x3 image; R ascending, B descending.
        let data = vec![
            10, 0, 90, //
            20, 0, 80, //
            30, 0, 70,
        ];
        let src = PixelBuffer::from_rgb(3, 1, data).unwrap();
        let out = median_filter(&src, 3);
        assert_eq!(out.channel(1, 0, 0), 20);
        assert_eq!(out.channel(1, 0, 1), 0);
        assert_eq!(out.channel(1, 0, 2), 80);
    }

    #[test]
    fn buffer_size_mismatch_rejected() {
        assert!(PixelBuffer::from_rgb(2, 2, vec![0u8; 5]).is_err());
    }

    #[test]
    fn apply_filter_roundtrips_png() {
        let img = RgbImage::from_fn(8, 8, |x, y| image::Rgb([(x * 30) as u8, (y * 30) as u8, 128]));
        let mut png = Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png).unwrap();

        let out = apply_median_filter(png.get_ref(), 3).unwrap();
        let back = image::load_from_memory(&out).unwrap();
        assert_eq!(back.width(), 8);
        assert_eq!(back.height(), 8);
    }

    #[test]
    fn apply_filter_rejects_garbage() {
        assert!(apply_median_filter(b"not an image", 3).is_err());
    }
}
