//!
//! Row layout helpers for moving RGBA frames between GStreamer and wgpu buffers
//!

use crate::glib;

/// Bytes per pixel of every format the effect handles
pub const BYTES_PER_PIXEL: u32 = 4;

/// Tightly packed row size of a frame `width` pixels wide
#[inline]
pub fn unpadded_bytes_per_row(width: u32) -> u32 {
    width * BYTES_PER_PIXEL
}

/// Row size wgpu requires for texture to buffer copies
pub fn padded_bytes_per_row(width: u32) -> u32 {
    unpadded_bytes_per_row(width).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

/// Copies `rows` rows of `row_bytes` bytes between buffers laid out with different strides
pub fn copy_rows(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<(), glib::BoolError> {
    if rows == 0 {
        return Ok(());
    }

    if src_stride < row_bytes || dst_stride < row_bytes {
        return Err(glib::bool_error!(
            "stride smaller than row: src {}, dst {}, row {}",
            src_stride,
            dst_stride,
            row_bytes
        ));
    }

    let src_needed = src_stride * (rows - 1) + row_bytes;
    let dst_needed = dst_stride * (rows - 1) + row_bytes;
    if src.len() < src_needed || dst.len() < dst_needed {
        return Err(glib::bool_error!(
            "buffer too short for {} rows: src {}/{}, dst {}/{}",
            rows,
            src.len(),
            src_needed,
            dst.len(),
            dst_needed
        ));
    }

    if src_stride == dst_stride && src_stride == row_bytes {
        dst[..src_needed].copy_from_slice(&src[..src_needed]);
        return Ok(());
    }

    for row in 0..rows {
        let s = row * src_stride;
        let d = row * dst_stride;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }

    Ok(())
}
