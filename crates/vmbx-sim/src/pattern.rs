//! Diagnostic image content for simulated frames.
//!
//! Layers, back to front:
//! - checkerboard with per-frame noise
//! - horizontal gradient bar along the top tenth
//! - vertical bar sweeping one column per frame
//! - low 16 bits of the frame id as bright/dim blocks on the first rows

use vmbx_core::frame::PixelFormat;

#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff
}

/// 16-bit intensity of pixel (`x`, `y`) in frame `frame_id`.
#[must_use]
pub fn intensity(x: usize, y: usize, width: usize, height: usize, frame_id: u64) -> u16 {
    let cell = (width.min(height) / 8).max(1);
    let bit_block = (width / 16).max(1);

    if y < cell.min(4) {
        let bit = x / bit_block;
        if bit < 16 {
            return if (frame_id >> bit) & 1 == 1 { 0xFFFF } else { 0x1000 };
        }
    }

    if y < (height / 10).max(1) {
        return ((x * 0xFFFF) / width.max(1)) as u16;
    }

    if width > 0 && x == (frame_id as usize) % width {
        return 0xE000;
    }

    let base: i32 = if ((x / cell) + (y / cell)) % 2 == 0 { 0x4000 } else { 0x4CCC };
    let noise = (prng(frame_id.wrapping_mul(2_654_435_761) ^ (y * width + x) as u64) & 0x3FF) as i32 - 0x200;
    (base + noise).clamp(0, 0xFFFF) as u16
}

/// Bytes needed for one image.
#[must_use]
pub fn image_size(width: u32, height: u32, format: PixelFormat) -> usize {
    width as usize * height as usize * format.bytes_per_pixel()
}

/// Write the pattern for `frame_id` into `dst`.
///
/// Multi-byte formats are little-endian, with samples scaled down to the
/// format's bit depth. Returns the number of bytes written, or `None` if
/// `dst` is too small.
pub fn fill(dst: &mut [u8], width: u32, height: u32, format: PixelFormat, frame_id: u64) -> Option<usize> {
    let size = image_size(width, height, format);
    if dst.len() < size {
        return None;
    }
    let (w, h) = (width as usize, height as usize);
    let shift = 16 - format.bit_depth();
    for y in 0..h {
        for x in 0..w {
            let v = intensity(x, y, w, h, frame_id) >> shift;
            let idx = y * w + x;
            match format.bytes_per_pixel() {
                1 => dst[idx] = v as u8,
                _ => dst[idx * 2..idx * 2 + 2].copy_from_slice(&v.to_le_bytes()),
            }
        }
    }
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(image_size(64, 48, PixelFormat::Mono8), 3072);
        assert_eq!(image_size(64, 48, PixelFormat::Mono12), 6144);
    }

    #[test]
    fn test_fill_rejects_small_buffer() {
        let mut dst = vec![0u8; 10];
        assert!(fill(&mut dst, 64, 48, PixelFormat::Mono8, 1).is_none());
    }

    #[test]
    fn test_frame_id_bits_visible() {
        let mut a = vec![0u8; 3072];
        let mut b = vec![0u8; 3072];
        fill(&mut a, 64, 48, PixelFormat::Mono8, 1).unwrap();
        fill(&mut b, 64, 48, PixelFormat::Mono8, 2).unwrap();
        // Bit 0 block of the first row differs between frames 1 and 2.
        assert_eq!(a[0], 0xFF);
        assert_eq!(b[0], 0x10);
    }

    #[test]
    fn test_depth_scaling() {
        let mut dst = vec![0u8; 64 * 48 * 2];
        fill(&mut dst, 64, 48, PixelFormat::Mono12, 1).unwrap();
        let first = u16::from_le_bytes([dst[0], dst[1]]);
        assert_eq!(first, 0x0FFF);
        assert!(dst
            .chunks_exact(2)
            .all(|p| u16::from_le_bytes([p[0], p[1]]) <= 0x0FFF));
    }
}
