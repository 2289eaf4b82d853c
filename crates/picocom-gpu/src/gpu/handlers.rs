//! Built-in command handlers.

use super::{compositor, render3d, tilemap, CommandContext};
use crate::color;
use crate::error::{GpuErrorCode, GpuFault};
use crate::protocol::cmds::{
    AnyCommand, BlitRect, CompositeTile, CreateBuffer, CreateLinkedTilemapBuffer, DrawLine, FillRectCol,
    RegisterCmd, ResetGpu, SetClearCol, SetDebug, WriteBufferData, BLIT_FLIP_X, NO_BUFFER,
};
use crate::protocol::{BlendMode, BufferArena, CmdId, TextureFormat, WriteFlags};
use crate::tile::TileFrameBuffer;

/// Attribute written by line drawing.
pub const LINE_ATTR: u8 = 0x0F;

pub fn execute(id: CmdId, ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    match id {
        CmdId::Nop => Ok(()),
        CmdId::ResetGpu => reset_gpu(ctx),
        CmdId::SetDebug => {
            let cmd: SetDebug = ctx.decode()?;
            ctx.instance.debug_uploads = cmd.enabled != 0;
            Ok(())
        }
        CmdId::SetClearCol => {
            let cmd: SetClearCol = ctx.decode()?;
            ctx.instance.clear_color = cmd.col;
            Ok(())
        }
        CmdId::FillRectCol => fill_rect(ctx),
        CmdId::CreateBuffer => create_buffer(ctx),
        CmdId::WriteBufferData => write_buffer_data(ctx),
        CmdId::BlitRect => blit_rect(ctx),
        CmdId::RegisterCmd => register_cmd(ctx),
        CmdId::DrawLine => {
            let cmd: DrawLine = ctx.decode()?;
            draw_line(
                ctx.tile,
                (cmd.x0 as i32, cmd.y0 as i32),
                (cmd.x1 as i32, cmd.y1 as i32),
                cmd.col,
            );
            Ok(())
        }
        CmdId::InitRenderer3D
        | CmdId::BeginFrameTile3D
        | CmdId::SetShader3D
        | CmdId::SetMatrix3D
        | CmdId::DrawTriTex
        | CmdId::LookAt3D => render3d::execute(id, ctx),
        CmdId::DrawTileMap => tilemap::draw_tilemap(ctx),
        CmdId::DrawWater => tilemap::draw_water(ctx),
        CmdId::CreateLinkedTilemapBuffer => link_tilemap(ctx),
        CmdId::CompositeTile => {
            let cmd: CompositeTile = ctx.decode()?;
            let blend = BlendMode::from_u8(cmd.blend)?;
            compositor::composite_tile(ctx, blend, cmd.pal_id)
        }
    }
}

/// Field-level sanity checks run before a list is trusted.
pub fn validate(id: CmdId, bytes: &[u8]) -> Result<(), String> {
    let (header, cmd) = AnyCommand::decode(bytes).map_err(|e| e.to_string())?;
    if header.cmd != id as u8 {
        return Err(format!("command byte {} does not match {}", header.cmd, id.name()));
    }
    let blend = |b: u8| BlendMode::from_u8(b).map(|_| ()).map_err(|e| e.to_string());
    match cmd {
        AnyCommand::FillRectCol(c) => {
            if c.w < 0 || c.h < 0 {
                return Err(format!("negative fill size {}x{}", c.w, c.h));
            }
            blend(c.blend)
        }
        AnyCommand::BlitRect(c) => blend(c.blend),
        AnyCommand::CompositeTile(c) => blend(c.blend),
        AnyCommand::DrawTileMap(c) => blend(c.blend),
        AnyCommand::DrawWater(c) => blend(c.blend),
        AnyCommand::CreateBuffer(c) => {
            BufferArena::from_u8(c.arena).map_err(|e| e.to_string())?;
            TextureFormat::from_u8(c.format).map_err(|e| e.to_string())?;
            Ok(())
        }
        AnyCommand::WriteBufferData(c) if c.data.is_empty() => Err("empty buffer write".to_string()),
        _ => Ok(()),
    }
}

fn reset_gpu(ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    let cmd: ResetGpu = ctx.decode()?;
    if !ctx.is_write_point() {
        return Ok(());
    }
    if cmd.buffers != 0 {
        ctx.state.buffers_mut().reset();
    }
    if cmd.cmds != 0 {
        ctx.state.commands_mut().reset_to_builtins();
    }
    if cmd.stats != 0 {
        ctx.instance.clear_error_stats();
    }
    log::info!(
        "gpu reset: cmds={} buffers={} stats={}",
        cmd.cmds,
        cmd.buffers,
        cmd.stats
    );
    Ok(())
}

fn create_buffer(ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    let cmd: CreateBuffer = ctx.decode()?;
    if !ctx.is_write_point() {
        return Ok(());
    }
    ctx.state.buffers_mut().create(&cmd)?;
    if ctx.instance.debug_uploads {
        log::info!(
            "create buffer {} arena={} offset={} size={}",
            cmd.buffer_id,
            cmd.arena,
            cmd.mem_offset,
            cmd.mem_size
        );
    }
    Ok(())
}

fn write_buffer_data(ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    let cmd: WriteBufferData = ctx.decode()?;
    let allowed = ctx.instance.instance_id == 0 && (ctx.tile.tile_id == 0 || cmd.allow_non_tile_zero != 0);
    if !allowed {
        return Ok(());
    }
    ctx.state
        .buffers_mut()
        .write(cmd.buffer_id as u16, cmd.offset, cmd.data, WriteFlags::from_bits_retain(cmd.flags))?;
    if ctx.instance.debug_uploads {
        log::info!(
            "write buffer {} offset={} size={} flags=0x{:02X}",
            cmd.buffer_id,
            cmd.offset,
            cmd.data.len(),
            cmd.flags
        );
    }
    Ok(())
}

fn register_cmd(ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    let cmd: RegisterCmd = ctx.decode()?;
    if cmd.vdp_id != ctx.state.vdp_id() || !ctx.is_write_point() {
        return Ok(());
    }
    let key = {
        let buffers = ctx.state.buffers();
        let descriptor = buffers.read(cmd.buffer_id, 0, 2).map_err(|_| {
            GpuFault::general(format!("extension descriptor buffer {} too small", cmd.buffer_id))
        })?;
        u16::from_le_bytes([descriptor[0], descriptor[1]])
    };
    ctx.state.commands_mut().bind_catalogued(cmd.cmd_id, key)?;
    Ok(())
}

fn link_tilemap(ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    let cmd: CreateLinkedTilemapBuffer = ctx.decode()?;
    if !ctx.is_write_point() {
        return Ok(());
    }
    let mut buffers = ctx.state.buffers_mut();
    if cmd.data_id == NO_BUFFER || cmd.state_id == NO_BUFFER {
        return Err(GpuFault::new(GpuErrorCode::InvalidBufferId, "tilemap link needs data and state"));
    }
    buffers.get(cmd.data_id)?;
    buffers.get(cmd.state_id)?;
    buffers.link_edges(cmd.data_id, &cmd.edge_data)?;
    buffers.link_edges(cmd.state_id, &cmd.edge_state)?;
    Ok(())
}

fn fill_rect(ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    let cmd: FillRectCol = ctx.decode()?;
    let blend = BlendMode::from_u8(cmd.blend)?;
    if !matches!(blend, BlendMode::None | BlendMode::Add | BlendMode::Alpha) {
        return Err(GpuFault::general(format!("unsupported fill blend mode {blend:?}")));
    }
    let tile = &mut *ctx.tile;
    let Some(rect) = tile.clip(cmd.x as i32, cmd.y as i32, cmd.w as i32, cmd.h as i32) else {
        return Ok(());
    };
    for ly in rect.y0..rect.y1 {
        let row = ly * tile.width;
        for i in row + rect.x0..row + rect.x1 {
            let dst = &mut tile.pixels[i];
            *dst = match blend {
                BlendMode::Add => color::add_saturate(cmd.col, *dst),
                BlendMode::Alpha => color::alpha_blit(cmd.col, *dst, cmd.a),
                _ => cmd.col,
            };
            if let Some(attr) = tile.attr.as_mut() {
                attr[i] = cmd.a;
            }
        }
    }
    Ok(())
}

/// Source pixel fetch for blits: direct RGB565 or palette-indexed.
struct Texture<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
    format: TextureFormat,
    palette: Option<&'a [u8]>,
}

impl Texture<'_> {
    fn fetch(&self, x: usize, y: usize) -> Option<u16> {
        let i = y * self.width + x;
        match self.format {
            TextureFormat::Rgb16 | TextureFormat::Rgba16 => {
                let b = self.data.get(i * 2..i * 2 + 2)?;
                Some(u16::from_le_bytes([b[0], b[1]]))
            }
            TextureFormat::Bpp8 => {
                let index = *self.data.get(i)? as usize;
                let b = self.palette?.get(index * 2..index * 2 + 2)?;
                Some(u16::from_le_bytes([b[0], b[1]]))
            }
            TextureFormat::Bpp1 => {
                let byte = *self.data.get(i / 8)?;
                Some(if byte & (0x80 >> (i % 8)) != 0 { color::WHITE } else { color::BLACK })
            }
            TextureFormat::None => None,
        }
    }
}

fn blit_rect(ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    let cmd: BlitRect = ctx.decode()?;
    let blend = BlendMode::from_u8(cmd.blend)?;
    if !matches!(
        blend,
        BlendMode::None
            | BlendMode::ColorKey
            | BlendMode::ColorKeyTintAdd
            | BlendMode::FillMasked
            | BlendMode::ColkeyAlpha
            | BlendMode::Add
            | BlendMode::Alpha
            | BlendMode::Multiply
    ) {
        return Err(GpuFault::general(format!("unsupported blit blend mode {blend:?}")));
    }

    let buffers = ctx.state.buffers();
    let id = cmd.buffer_id as u16;
    let buffer = *buffers.get(id)?;
    if buffer.width == 0 || buffer.height == 0 {
        return Err(GpuFault::general(format!("blit source {id} has no dimensions")));
    }
    let palette = match buffer.format {
        TextureFormat::Bpp8 => {
            let pal = buffers.get(cmd.pal_id)?;
            if pal.format != TextureFormat::Rgb16 {
                return Err(GpuFault::general(format!("palette {} is not RGB16", cmd.pal_id)));
            }
            Some(buffers.data(cmd.pal_id)?)
        }
        TextureFormat::None => {
            return Err(GpuFault::general(format!("blit source {id} has no format")));
        }
        _ => None,
    };
    let texture = Texture {
        data: buffers.data(id)?,
        width: buffer.width as usize,
        height: buffer.height as usize,
        format: buffer.format,
        palette,
    };

    let tile = &mut *ctx.tile;
    let (dst_x, dst_y) = (cmd.dst_x as i32, cmd.dst_y as i32);
    let Some(rect) = tile.clip(dst_x, dst_y, cmd.w as i32, cmd.h as i32) else {
        return Ok(());
    };
    let wrap = cmd.w as usize > texture.width || cmd.h as usize > texture.height;
    let flip_x = cmd.flags & BLIT_FLIP_X != 0;

    for ly in rect.y0..rect.y1 {
        let fy = (tile.y + ly as i32 - dst_y) as usize;
        for lx in rect.x0..rect.x1 {
            let mut fx = (lx as i32 - dst_x) as usize;
            if flip_x {
                fx = cmd.w as usize - fx - 1;
            }
            let mut sx = fx + cmd.src_x as usize;
            let mut sy = fy + cmd.src_y as usize;
            if wrap {
                sx %= texture.width;
                sy %= texture.height;
            } else if sx >= texture.width || sy >= texture.height {
                continue;
            }
            let Some(src) = texture.fetch(sx, sy) else {
                continue;
            };

            let i = ly * tile.width + lx;
            let dst = tile.pixels[i];
            let out = match blend {
                BlendMode::None => Some(src),
                BlendMode::ColorKey => (src != cmd.col_key).then_some(src),
                BlendMode::ColorKeyTintAdd => (src != cmd.col_key).then(|| color::add_saturate(src, cmd.pal_id)),
                BlendMode::FillMasked => (src != cmd.col_key).then_some(cmd.pal_id),
                BlendMode::ColkeyAlpha => (src != 0).then(|| color::alpha_blit(src, dst, cmd.col_key as u8)),
                BlendMode::Add => Some(color::add_saturate(src, dst)),
                BlendMode::Alpha => Some(color::alpha_blit(src, dst, cmd.alpha)),
                BlendMode::Multiply => Some(color::multiply(src, dst)),
                _ => None,
            };
            if let Some(col) = out {
                tile.pixels[i] = col;
                if let Some(attr) = tile.attr.as_mut() {
                    attr[i] = cmd.write_alpha;
                }
            }
        }
    }
    Ok(())
}

/// Bresenham line in frame coordinates, clipped to the tile.
pub fn draw_line(tile: &mut TileFrameBuffer, from: (i32, i32), to: (i32, i32), col: u16) {
    let (mut x, mut y) = from;
    let (x1, y1) = to;
    let dx = (x1 - x).abs();
    let dy = -(y1 - y).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let sy = if y < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        tile.put(x, y, col, LINE_ATTR);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}
