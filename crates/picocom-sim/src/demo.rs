//! The scripted demo scene.
//!
//! The scene is written through [`SceneSink`] so the same frame can be
//! submitted to the pipeline or recorded into a standalone buffer for a
//! listing.

use picocom_gpu::client::{Section, SubmissionClient};
use picocom_gpu::cmd_list::CommandBuffer;
use picocom_gpu::color::{self, RED, WHITE};
use picocom_gpu::error::{ClientError, CmdListError};
use picocom_gpu::protocol::cmds::{BlitRect, DrawLine, FillRectCol};
use picocom_gpu::protocol::{BlendMode, GpuCommand};
use picocom_gpu::tile::{tile_cull_mask, tile_cull_mask_line, FRAME_H, FRAME_W, TILE_COUNT, TILE_HEIGHT};
use picocom_hal::BusChannel;

/// Sprite edge length in pixels.
pub const SPRITE_SIZE: u16 = 16;

/// Checker cell size inside the sprite.
const CHECKER: usize = 4;

/// Sprite row; lies inside band 2.
pub const SPRITE_Y: i16 = 112;

/// Horizontal sprite speed in pixels per frame.
const SPRITE_STEP: u32 = 7;

/// Background colour of each band, top to bottom.
pub const BAND_COLORS: [u16; TILE_COUNT] = [
    color::rgb(2, 4, 12),
    color::rgb(4, 10, 16),
    color::rgb(6, 18, 20),
    color::rgb(10, 30, 12),
    color::rgb(14, 40, 6),
];

/// Destination for scene commands.
pub trait SceneSink {
    type Error;

    fn emit<'a, T: GpuCommand<'a>>(&mut self, cmd: &T, cull_mask: Option<u16>) -> Result<(), Self::Error>;
}

impl<C: BusChannel, const N: usize> SceneSink for SubmissionClient<C, N> {
    type Error = ClientError<C::Error>;

    fn emit<'a, T: GpuCommand<'a>>(&mut self, cmd: &T, cull_mask: Option<u16>) -> Result<(), Self::Error> {
        self.push_command(Section::Primary, cmd, cull_mask)
    }
}

impl SceneSink for CommandBuffer {
    type Error = CmdListError;

    fn emit<'a, T: GpuCommand<'a>>(&mut self, cmd: &T, cull_mask: Option<u16>) -> Result<(), Self::Error> {
        self.push(cmd, cull_mask)
    }
}

/// Sprite texel at `(x, y)`: a white and red checkerboard.
pub fn sprite_texel(x: usize, y: usize) -> u16 {
    if (x / CHECKER + y / CHECKER) % 2 == 0 {
        WHITE
    } else {
        RED
    }
}

/// RGB565 little-endian sprite texture.
pub fn sprite_texture() -> Vec<u8> {
    let size = SPRITE_SIZE as usize;
    (0..size * size)
        .flat_map(|i| sprite_texel(i % size, i / size).to_le_bytes())
        .collect()
}

/// Top-left corner of the sprite on `frame`.
pub fn sprite_position(frame: u32) -> (i16, i16) {
    let span = FRAME_W as u32 - SPRITE_SIZE as u32;
    ((frame.wrapping_mul(SPRITE_STEP) % span) as i16, SPRITE_Y)
}

/// Record one frame of the scene: a fill per band, a diagonal line and the
/// moving sprite blitted from buffer `sprite`.
pub fn record_scene<S: SceneSink>(sink: &mut S, sprite: u8, frame: u32) -> Result<(), S::Error> {
    for (band, col) in BAND_COLORS.iter().enumerate() {
        let y = (band * TILE_HEIGHT) as i16;
        let fill = FillRectCol {
            x: 0,
            y,
            w: FRAME_W as i16,
            h: TILE_HEIGHT as i16,
            col: *col,
            a: 255,
            blend: BlendMode::None as u8,
        };
        sink.emit(&fill, Some(tile_cull_mask(y as i32, TILE_HEIGHT as i32)))?;
    }

    let (right, bottom) = (FRAME_W as i16 - 1, FRAME_H as i16 - 1);
    let diagonal = DrawLine {
        x0: 0,
        y0: 0,
        x1: right,
        y1: bottom,
        col: WHITE,
    };
    sink.emit(&diagonal, Some(tile_cull_mask_line(0, bottom as i32)))?;

    let (x, y) = sprite_position(frame);
    let blit = BlitRect {
        buffer_id: sprite,
        dst_x: x,
        dst_y: y,
        w: SPRITE_SIZE,
        h: SPRITE_SIZE,
        blend: BlendMode::None as u8,
        ..BlitRect::default()
    };
    sink.emit(&blit, Some(tile_cull_mask(y as i32, SPRITE_SIZE as i32)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_has_one_texel_per_pixel() {
        let texture = sprite_texture();
        assert_eq!(texture.len(), 16 * 16 * 2);
        assert_eq!(&texture[..2], &WHITE.to_le_bytes());
        assert_eq!(&texture[8..10], &RED.to_le_bytes());
    }

    #[test]
    fn sprite_stays_on_screen() {
        for frame in [0, 1, 43, 44, 1000, u32::MAX] {
            let (x, _) = sprite_position(frame);
            assert!(x >= 0 && x as usize + SPRITE_SIZE as usize <= FRAME_W);
        }
    }

    #[test]
    fn scene_records_seven_commands() {
        let mut buffer = CommandBuffer::new(1024, 0);
        record_scene(&mut buffer, 16, 0).expect("record");
        assert_eq!(buffer.cmd_count(), 7);
    }
}
