//! Tile compositor: merges the bound source tile into a destination tile.

use super::CommandContext;
use crate::color;
use crate::error::GpuFault;
use crate::protocol::{BlendMode, ColorDepth, TextureFormat};
use crate::tile::{TileFrameBuffer, ATTR_ALPHA_MASK, ATTR_PIXEL_WRITE};

/// `CompositeTile` handler: source is the instance's bound `fb0`.
pub fn composite_tile(ctx: &mut CommandContext<'_, '_>, blend: BlendMode, pal_id: u16) -> Result<(), GpuFault> {
    let src = ctx
        .instance
        .fb0()
        .ok_or_else(|| GpuFault::general("Missing fb0"))?;
    if src.depth == ColorDepth::Indexed8 {
        let buffers = ctx.state.buffers();
        let pal = buffers.get(pal_id)?;
        if pal.format != TextureFormat::Rgb16 {
            return Err(GpuFault::general(format!("palette {pal_id} is not RGB16")));
        }
        composite(src, ctx.tile, blend, Some(buffers.data(pal_id)?))
    } else {
        composite(src, ctx.tile, blend, None)
    }
}

/// Attribute alpha (16 levels) scaled to 0..=255.
fn attr_alpha(attr: u8) -> u8 {
    (attr & ATTR_ALPHA_MASK) * 17
}

fn palette_lookup(palette: &[u8], index: u16) -> u16 {
    let i = (index & 0xFF) as usize * 2;
    palette
        .get(i..i + 2)
        .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]))
}

/// Merge `src` into `dst` over their common area.
pub fn composite(
    src: &TileFrameBuffer,
    dst: &mut TileFrameBuffer,
    blend: BlendMode,
    palette: Option<&[u8]>,
) -> Result<(), GpuFault> {
    let indexed = src.depth == ColorDepth::Indexed8;
    let supported = if indexed {
        matches!(blend, BlendMode::None | BlendMode::ColorKey | BlendMode::Alpha)
    } else {
        matches!(
            blend,
            BlendMode::None
                | BlendMode::ColorKey
                | BlendMode::Alpha
                | BlendMode::DebugAttrAlpha
                | BlendMode::DebugAttrPixelWriteMask
        )
    };
    if !supported {
        return Err(GpuFault::general(format!(
            "unsupported composite blend mode {blend:?} for {:?}",
            src.depth
        )));
    }
    let needs_attr = matches!(
        blend,
        BlendMode::Alpha | BlendMode::DebugAttrAlpha | BlendMode::DebugAttrPixelWriteMask
    );
    let attrs = match (&src.attr, needs_attr) {
        (Some(a), _) => Some(a.as_slice()),
        (None, false) => None,
        (None, true) => {
            return Err(GpuFault::general(format!("{blend:?} composite needs an attribute plane")));
        }
    };
    let palette = match (indexed, palette) {
        (true, None) => return Err(GpuFault::general("indexed composite needs a palette")),
        (_, p) => p.unwrap_or(&[]),
    };

    let width = src.width.min(dst.width);
    let height = src.height.min(dst.height);
    for y in 0..height {
        for x in 0..width {
            let si = y * src.width + x;
            let di = y * dst.width + x;
            let raw = src.pixels[si];
            let attr = attrs.map_or(0, |a| a[si]);
            let col = if indexed { palette_lookup(palette, raw) } else { raw };
            let out = match blend {
                BlendMode::None => Some(col),
                BlendMode::ColorKey => {
                    let key = if indexed { raw & 0xFF } else { raw };
                    (key != 0).then_some(col)
                }
                BlendMode::Alpha => Some(color::alpha_blit(col, dst.pixels[di], attr_alpha(attr))),
                BlendMode::DebugAttrAlpha => {
                    let level = ((attr & ATTR_ALPHA_MASK) as u32 * 16) as f32 / 255.0;
                    Some(color::from_rgbf(level, 0.0, 0.0))
                }
                BlendMode::DebugAttrPixelWriteMask => Some(if attr & ATTR_PIXEL_WRITE != 0 {
                    color::RED
                } else {
                    color::BLACK
                }),
                _ => None,
            };
            if let Some(col) = out {
                dst.pixels[di] = col;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile_with(pixel: u16, attr: u8) -> TileFrameBuffer {
        let mut t = TileFrameBuffer::new(0, 4, 2);
        t.pixels.fill(pixel);
        if let Some(a) = t.attr.as_mut() {
            a.fill(attr);
        }
        t
    }

    #[test]
    fn alpha_uses_attribute_level() {
        let src = tile_with(color::WHITE, 0);
        let mut dst = tile_with(color::BLUE, 0);
        composite(&src, &mut dst, BlendMode::Alpha, None).unwrap();
        assert!(dst.pixels.iter().all(|p| *p == color::BLUE));
    }

    #[test]
    fn debug_write_mask() {
        let src = tile_with(color::GREEN, ATTR_PIXEL_WRITE);
        let mut dst = tile_with(color::BLUE, 0);
        composite(&src, &mut dst, BlendMode::DebugAttrPixelWriteMask, None).unwrap();
        assert!(dst.pixels.iter().all(|p| *p == color::RED));
    }

    #[test]
    fn indexed_needs_palette() {
        let mut src = tile_with(3, 0);
        src.depth = ColorDepth::Indexed8;
        let mut dst = tile_with(0, 0);
        assert!(composite(&src, &mut dst, BlendMode::None, None).is_err());
        let palette = [0, 0, 0, 0, 0, 0, 0x1F, 0x00];
        composite(&src, &mut dst, BlendMode::None, Some(&palette)).unwrap();
        assert!(dst.pixels.iter().all(|p| *p == color::BLUE));
    }

    #[test]
    fn unsupported_mode_is_an_error() {
        let src = tile_with(1, 0);
        let mut dst = tile_with(0, 0);
        assert!(composite(&src, &mut dst, BlendMode::Add, None).is_err());
    }
}
