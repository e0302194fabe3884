//! Size-adaptive re-encode stage of the worker pipeline.
//!
//! After the median filter, the (PNG) result is usually far too large
//! for one datagram. Quality is chosen from the *filtered* byte size
//! using a fixed bracket table; each bracket gets a primary pass and,
//! if the result still exceeds the 40,000-byte budget, one secondary
//! pass at a lower quality. A bounded rescue loop then runs for at most
//! five further attempts. This caps worst-case CPU cost at seven encode
//! attempts per task; convergence is best-effort, never guaranteed.

use tracing::{debug, error, info, warn};

use crate::error::FiltraError;
use crate::filter;

// ── Constants ────────────────────────────────────────────────────

/// Byte budget for the re-encoded image. Leaves room for base64 and
/// envelope overhead inside one datagram.
pub const TARGET_PAYLOAD_BYTES: usize = 40_000;

/// Images at or below this size are sent without any compression pass.
pub const COMPRESSION_FLOOR_BYTES: usize = 50_000;

/// Maximum rescue-loop attempts after the bracket passes.
pub const MAX_RESCUE_ATTEMPTS: u32 = 5;

/// Size brackets: `(lower_bound_exclusive, primary_quality, secondary_quality)`.
/// Checked top-down; the secondary quality applies only when the primary
/// pass leaves the result above [`TARGET_PAYLOAD_BYTES`].
const QUALITY_BRACKETS: [(usize, u8, u8); 5] = [
    (2_000_000, 25, 15),
    (1_000_000, 30, 20),
    (500_000, 35, 25),
    (200_000, 40, 30),
    (COMPRESSION_FLOOR_BYTES, 55, 40),
];

// ── Quality selection ────────────────────────────────────────────

/// Primary and secondary JPEG quality for a filtered image of `size`
/// bytes, or `None` when the image already fits comfortably.
pub fn bracket_for(size: usize) -> Option<(u8, u8)> {
    QUALITY_BRACKETS
        .iter()
        .find(|&&(bound, _, _)| size > bound)
        .map(|&(_, primary, secondary)| (primary, secondary))
}

/// Quality for rescue attempt `n` (1-based): 25, 20, 15, 10, 10.
pub fn rescue_quality(attempt: u32) -> u8 {
    (30i32 - 5 * attempt as i32).max(10) as u8
}

// ── Convergence ──────────────────────────────────────────────────

/// Drive `recompress` until the result fits [`TARGET_PAYLOAD_BYTES`]
/// or the attempt budget is exhausted.
///
/// The encoder is injected so the quality schedule is testable without
/// multi-megabyte fixtures; production callers pass [`recompress_jpeg`].
/// An oversized final result is logged as an error but still returned —
/// the send is attempted regardless.
pub fn shrink_to_budget<F>(bytes: Vec<u8>, mut recompress: F) -> Result<Vec<u8>, FiltraError>
where
    F: FnMut(&[u8], u8) -> Result<Vec<u8>, FiltraError>,
{
    let original_size = bytes.len();
    let mut out = bytes;

    match bracket_for(original_size) {
        None => {
            debug!("{original_size} bytes fits the datagram budget, no compression");
            return Ok(out);
        }
        Some((primary, secondary)) => {
            info!("{original_size} bytes after filtering, compressing at quality {primary}");
            out = recompress(&out, primary)?;
            debug!("primary pass: {} bytes", out.len());

            if out.len() > TARGET_PAYLOAD_BYTES {
                info!("still {} bytes, second pass at quality {secondary}", out.len());
                out = recompress(&out, secondary)?;
                debug!("secondary pass: {} bytes", out.len());
            }
        }
    }

    let mut attempt = 0;
    while out.len() > TARGET_PAYLOAD_BYTES && attempt < MAX_RESCUE_ATTEMPTS {
        attempt += 1;
        let quality = rescue_quality(attempt);
        warn!(
            "attempt {attempt}: {} bytes still over budget, re-encoding at quality {quality}",
            out.len(),
        );
        out = recompress(&out, quality)?;
    }

    if out.len() > TARGET_PAYLOAD_BYTES {
        error!(
            "result is {} bytes after all attempts, above the {TARGET_PAYLOAD_BYTES}-byte \
             budget; the datagram may be lost in transit",
            out.len(),
        );
    } else if original_size > COMPRESSION_FLOOR_BYTES {
        let saved = 100.0 * (1.0 - out.len() as f64 / original_size as f64);
        info!("compressed {original_size} -> {} bytes ({saved:.1}% reduction)", out.len());
    }

    Ok(out)
}

/// Decode `bytes` and re-encode as JPEG at the given quality.
pub fn recompress_jpeg(bytes: &[u8], quality: u8) -> Result<Vec<u8>, FiltraError> {
    let img = image::load_from_memory(bytes)?;
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    img.write_with_encoder(encoder)?;
    Ok(out)
}

// ── Full pipeline ────────────────────────────────────────────────

/// Median filter followed by the size-adaptive re-encode.
pub fn process_image(image_bytes: &[u8], window: usize) -> Result<Vec<u8>, FiltraError> {
    let filtered = filter::apply_median_filter(image_bytes, window)?;
    shrink_to_budget(filtered, recompress_jpeg)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracket_boundaries() {
        assert_eq!(bracket_for(2_000_001), Some((25, 15)));
        assert_eq!(bracket_for(2_000_000), Some((30, 20)));
        assert_eq!(bracket_for(1_000_001), Some((30, 20)));
        assert_eq!(bracket_for(500_001), Some((35, 25)));
        assert_eq!(bracket_for(200_001), Some((40, 30)));
        assert_eq!(bracket_for(50_001), Some((55, 40)));
        assert_eq!(bracket_for(50_000), None);
        assert_eq!(bracket_for(0), None);
    }

    #[test]
    fn rescue_quality_schedule() {
        let qualities: Vec<u8> = (1..=MAX_RESCUE_ATTEMPTS).map(rescue_quality).collect();
        assert_eq!(qualities, vec![25, 20, 15, 10, 10]);
    }

    #[test]
    fn small_image_is_never_recompressed() {
        let input = vec![0u8; 50_000];
        let out = shrink_to_budget(input.clone(), |_, _| {
            panic!("encoder must not be called");
        })
        .unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn full_quality_sequence_when_never_converging() {
        // An encoder that never shrinks below budget: all seven
        // attempts run, in the exact bracket + rescue order.
        let mut seen = Vec::new();
        let out = shrink_to_budget(vec![0u8; 300_000], |bytes, quality| {
            seen.push(quality);
            Ok(bytes.to_vec())
        })
        .unwrap();

        assert_eq!(seen, vec![40, 30, 25, 20, 15, 10, 10]);
        assert_eq!(out.len(), 300_000); // still returned, not truncated
    }

    #[test]
    fn largest_bracket_quality_sequence() {
        let mut seen = Vec::new();
        shrink_to_budget(vec![0u8; 2_500_000], |bytes, quality| {
            seen.push(quality);
            Ok(bytes.to_vec())
        })
        .unwrap();
        assert_eq!(seen, vec![25, 15, 25, 20, 15, 10, 10]);
    }

    #[test]
    fn stops_once_under_budget() {
        let mut seen = Vec::new();
        let out = shrink_to_budget(vec![0u8; 300_000], |_, quality| {
            seen.push(quality);
            Ok(vec![0u8; 30_000])
        })
        .unwrap();

        assert_eq!(seen, vec![40]); // primary pass was enough
        assert_eq!(out.len(), 30_000);
    }

    #[test]
    fn secondary_pass_only_when_primary_insufficient() {
        let mut seen = Vec::new();
        let mut results = vec![vec![0u8; 35_000], vec![0u8; 60_000]]; // popped in reverse
        shrink_to_budget(vec![0u8; 600_000], |_, quality| {
            seen.push(quality);
            Ok(results.pop().unwrap())
        })
        .unwrap();
        assert_eq!(seen, vec![35, 25]);
    }

    #[test]
    fn recompress_jpeg_honors_quality_ordering() {
        let img = image::RgbImage::from_fn(64, 64, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8])
        });
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png).unwrap();

        let high = recompress_jpeg(png.get_ref(), 90).unwrap();
        let low = recompress_jpeg(png.get_ref(), 10).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn encoder_error_propagates() {
        let result = shrink_to_budget(vec![0u8; 300_000], |_, _| {
            Err(FiltraError::MalformedPayload("broken image"))
        });
        assert!(result.is_err());
    }
}
