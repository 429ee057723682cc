//! Heat-map frame geometry and sample rescaling.

use heapless::String;

/// Sensor rows.
pub const HEAT_MAP_ROWS: usize = 18;
/// Sensor columns.
pub const HEAT_MAP_COLS: usize = 25;
/// Bytes per raw sample on the wire.
pub const HEAT_MAP_BYTES_PER_PIXEL: usize = 2;
/// Pixels in one frame, which is also the size of a rescaled frame.
pub const HEAT_MAP_FRAME_LEN: usize = HEAT_MAP_ROWS * HEAT_MAP_COLS;
/// Size of a raw frame on the wire.
pub const HEAT_MAP_RAW_LEN: usize = HEAT_MAP_FRAME_LEN * HEAT_MAP_BYTES_PER_PIXEL;

/// A rescaled frame, one intensity byte per pixel, row major.
pub type HeatMapFrame = [u8; HEAT_MAP_FRAME_LEN];

/// Rescales one raw sample to an 8-bit intensity.
///
/// Negative samples become zero, the `bits_per_pixel - 8` low bits are
/// dropped and the result saturates at 255. Intensities below `threshold`
/// are clamped to zero.
pub fn rescale_sample(raw: i16, bits_per_pixel: u8, threshold: u8) -> u8 {
    let shift = bits_per_pixel.saturating_sub(8) as u32;
    let v = (raw.max(0) as u16 >> shift).min(255) as u8;
    if v < threshold {
        0
    } else {
        v
    }
}

/// Rescales a raw little-endian frame into `out`, one byte per pixel.
///
/// Returns `false` if every rescaled pixel is zero, i.e. the frame is empty.
pub fn rescale_frame(
    raw: &[u8; HEAT_MAP_RAW_LEN],
    out: &mut [u8],
    bits_per_pixel: u8,
    threshold: u8,
) -> bool {
    let mut any = 0u8;
    for (dst, sample) in out.iter_mut().zip(raw.chunks_exact(HEAT_MAP_BYTES_PER_PIXEL)) {
        let v = i16::from_le_bytes([sample[0], sample[1]]);
        *dst = rescale_sample(v, bits_per_pixel, threshold);
        any |= *dst;
    }
    any != 0
}

/// Renders one frame row as ASCII, mirrored on X.
///
/// Each pixel becomes a digit proportional to its intensity, blank for zero.
/// Rows outside `frame` render blank.
pub fn render_row(frame: &[u8], row: usize) -> String<HEAT_MAP_COLS> {
    let mut line = String::new();
    let start = row * HEAT_MAP_COLS;
    let pixels = frame.get(start..start + HEAT_MAP_COLS).unwrap_or(&[]);
    for &v in pixels.iter().rev() {
        let c = if v > 0 {
            (b'0' + (v as u16 * 10 / 256) as u8) as char
        } else {
            ' '
        };
        // At most HEAT_MAP_COLS characters are pushed.
        let _ = line.push(c);
    }
    line
}
