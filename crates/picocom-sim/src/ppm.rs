//! Binary PPM (`P6`) export of the displayed frame.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use picocom_gpu::color::{channels, BLACK};
use picocom_gpu::tile::{FrameBuffer, FRAME_H, FRAME_W};

/// Expand RGB565 to 8 bits per channel, replicating the high bits.
pub fn rgb888(col: u16) -> [u8; 3] {
    let (r, g, b) = channels(col);
    [
        ((r << 3) | (r >> 2)) as u8,
        ((g << 2) | (g >> 4)) as u8,
        ((b << 3) | (b >> 2)) as u8,
    ]
}

pub fn ppm_header() -> String {
    format!("P6\n{} {}\n255\n", FRAME_W, FRAME_H)
}

/// The front buffer as a complete PPM image.
pub fn encode_ppm(fb: &FrameBuffer) -> Vec<u8> {
    let header = ppm_header();
    let mut out = Vec::with_capacity(header.len() + FRAME_W * FRAME_H * 3);
    out.extend_from_slice(header.as_bytes());
    for y in 0..FRAME_H as i32 {
        for x in 0..FRAME_W as i32 {
            out.extend_from_slice(&rgb888(fb.front_pixel(x, y).unwrap_or(BLACK)));
        }
    }
    out
}

pub fn write_ppm(path: &Path, fb: &FrameBuffer) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(&encode_ppm(fb))?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use picocom_gpu::color::{GREEN, RED, WHITE};

    #[test]
    fn full_channels_expand_to_255() {
        assert_eq!(rgb888(WHITE), [255, 255, 255]);
        assert_eq!(rgb888(RED), [255, 0, 0]);
        assert_eq!(rgb888(GREEN), [0, 255, 0]);
        assert_eq!(rgb888(BLACK), [0, 0, 0]);
    }

    #[test]
    fn blank_frame_is_black() {
        let ppm = encode_ppm(&FrameBuffer::new());
        let header = ppm_header();
        assert!(ppm.starts_with(header.as_bytes()));
        assert_eq!(ppm.len(), header.len() + 320 * 240 * 3);
        assert!(ppm[header.len()..].iter().all(|b| *b == 0));
    }
}
