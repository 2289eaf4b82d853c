//! Tilemap chunk rendering with auto-tiling across linked chunks.
//!
//! A chunk is 16x16 tiles of 16x16 pixels. The data buffer holds one tile
//! id byte per tile, the state buffer one state byte per tile (fluid mass
//! for water tiles). The attribute buffer holds one [`TileAttr`] record per
//! tile id. Neighbouring chunks are reached through the edge links bound by
//! `CreateLinkedTilemapBuffer`.

use super::CommandContext;
use crate::buffers::{BufferTable, EDGE_SELF};
use crate::color;
use crate::error::GpuFault;
use crate::protocol::cmds::{DrawTileMap, DrawWater};
use crate::protocol::{BlendMode, TextureFormat};
use crate::tile::TileFrameBuffer;

/// Tile edge in pixels.
pub const GPU_TILEMAP_TILE_SZ: i32 = 16;
/// Chunk edge in tiles.
pub const TILEMAP_CHUNK_TILES: i32 = 16;
/// Encoded size of a [`TileAttr`].
pub const TILE_ATTR_SIZE: usize = 16;
/// Tiles per row in an auto-tile sheet.
const SHEET_COLUMNS: u32 = 8;

pub const TILE_FLAG_FLUID: u8 = 1 << 0;
pub const TILE_FLAG_ADDITIVE: u8 = 1 << 1;

/// Per tile-id render attributes.
///
/// Layout (little-endian): valid u8, group u8, flags u8, frame_count u8,
/// texture_id u16, frame_x u16, frame_y u16, write_alpha u8, anim_rate u8,
/// frame_stride_y u16, water_col u16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileAttr {
    pub valid: bool,
    pub group: u8,
    pub flags: u8,
    pub frame_count: u8,
    pub texture_id: u16,
    pub frame_x: u16,
    pub frame_y: u16,
    pub write_alpha: u8,
    /// Animation frames per second.
    pub anim_rate: u8,
    pub frame_stride_y: u16,
    pub water_col: u16,
}

impl TileAttr {
    pub fn encode(&self) -> [u8; TILE_ATTR_SIZE] {
        let mut out = [0u8; TILE_ATTR_SIZE];
        out[0] = self.valid as u8;
        out[1] = self.group;
        out[2] = self.flags;
        out[3] = self.frame_count;
        out[4..6].copy_from_slice(&self.texture_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.frame_x.to_le_bytes());
        out[8..10].copy_from_slice(&self.frame_y.to_le_bytes());
        out[10] = self.write_alpha;
        out[11] = self.anim_rate;
        out[12..14].copy_from_slice(&self.frame_stride_y.to_le_bytes());
        out[14..16].copy_from_slice(&self.water_col.to_le_bytes());
        out
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        let b = b.get(..TILE_ATTR_SIZE)?;
        let le = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        Some(Self {
            valid: b[0] != 0,
            group: b[1],
            flags: b[2],
            frame_count: b[3],
            texture_id: le(4),
            frame_x: le(6),
            frame_y: le(8),
            write_alpha: b[10],
            anim_rate: b[11],
            frame_stride_y: le(12),
            water_col: le(14),
        })
    }

    pub fn is_fluid(&self) -> bool {
        self.flags & TILE_FLAG_FLUID != 0
    }

    fn frame(&self, time: f32) -> u32 {
        if self.frame_count <= 1 || self.anim_rate == 0 {
            return 0;
        }
        (time.max(0.0) * self.anim_rate as f32) as u32 % self.frame_count as u32
    }
}

/// Neighbour mask bit to auto-tile index. Masks not listed map to 0.
pub fn auto_tile_index(mask: u8) -> u8 {
    match mask {
        0 => 47,
        2 => 1,
        8 => 2,
        10 => 3,
        11 => 4,
        16 => 5,
        18 => 6,
        22 => 7,
        24 => 8,
        26 => 9,
        27 => 10,
        30 => 11,
        31 => 12,
        64 => 13,
        66 => 14,
        72 => 15,
        74 => 16,
        75 => 17,
        80 => 18,
        82 => 19,
        86 => 20,
        88 => 21,
        90 => 22,
        91 => 23,
        94 => 24,
        95 => 25,
        104 => 26,
        106 => 27,
        107 => 28,
        120 => 29,
        122 => 48,
        123 => 31,
        126 => 32,
        127 => 33,
        208 => 34,
        210 => 35,
        214 => 36,
        216 => 37,
        218 => 38,
        219 => 23,
        222 => 40,
        223 => 41,
        248 => 42,
        250 => 43,
        251 => 44,
        254 => 45,
        255 => 46,
        _ => 0,
    }
}

const NW: u8 = 1;
const N: u8 = 2;
const NE: u8 = 4;
const W: u8 = 8;
const E: u8 = 16;
const SW: u8 = 32;
const S: u8 = 64;
const SE: u8 = 128;

/// Neighbour mask from "same group" tests of the 8 neighbours. A corner
/// only counts when both sides next to it match.
pub fn neighbour_mask(same: impl Fn(i32, i32) -> bool) -> u8 {
    let n = same(0, -1);
    let w = same(-1, 0);
    let e = same(1, 0);
    let s = same(0, 1);
    let nw = n && w && same(-1, -1);
    let ne = n && e && same(1, -1);
    let sw = s && w && same(-1, 1);
    let se = s && e && same(1, 1);
    [(nw, NW), (n, N), (ne, NE), (w, W), (e, E), (sw, SW), (s, S), (se, SE)]
        .iter()
        .filter(|(hit, _)| *hit)
        .fold(0, |mask, (_, bit)| mask | bit)
}

/// Read-only view of one chunk and its linked neighbours.
struct ChunkView<'a> {
    buffers: &'a BufferTable,
    data_id: u16,
    state_id: u16,
    attribs: &'a [u8],
    tile_id_mask: u8,
}

fn modi(v: i32, m: i32) -> i32 {
    ((v % m) + m) % m
}

impl<'a> ChunkView<'a> {
    /// Byte at chunk-relative tile `(tx, ty)`, following edge links.
    fn byte(&self, own: u16, tx: i32, ty: i32) -> Option<u8> {
        let rx = tx.div_euclid(TILEMAP_CHUNK_TILES);
        let ry = ty.div_euclid(TILEMAP_CHUNK_TILES);
        if !(-1..=1).contains(&rx) || !(-1..=1).contains(&ry) {
            return None;
        }
        let slot = ((rx + 1) + (ry + 1) * 3) as usize;
        let id = if slot == EDGE_SELF {
            own
        } else {
            self.buffers.get(own).ok()?.edges[slot]?
        };
        let lx = modi(tx, TILEMAP_CHUNK_TILES);
        let ly = modi(ty, TILEMAP_CHUNK_TILES);
        let offset = (ly * TILEMAP_CHUNK_TILES + lx) as u32;
        self.buffers.read(id, offset, 1).ok().map(|b| b[0])
    }

    fn tile_id(&self, tx: i32, ty: i32) -> Option<u8> {
        self.byte(self.data_id, tx, ty).map(|id| id & self.tile_id_mask)
    }

    fn state(&self, tx: i32, ty: i32) -> u8 {
        self.byte(self.state_id, tx, ty).unwrap_or(0)
    }

    fn attr(&self, tile_id: u8) -> Option<TileAttr> {
        let start = tile_id as usize * TILE_ATTR_SIZE;
        TileAttr::decode(self.attribs.get(start..)?).filter(|a| a.valid)
    }

    fn group_at(&self, tx: i32, ty: i32) -> Option<u8> {
        let id = self.tile_id(tx, ty)?;
        if id == 0 {
            return None;
        }
        self.attr(id).map(|a| a.group)
    }
}

struct DrawParams {
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    tile_group_mask: u8,
    time: f32,
    blend: BlendMode,
}

fn write_pixel(tile: &mut TileFrameBuffer, x: i32, y: i32, col: u16, blend: BlendMode, attr: &TileAttr) {
    let Some(i) = tile.index(x, y) else {
        return;
    };
    let dst = tile.pixels[i];
    tile.pixels[i] = match blend {
        BlendMode::Alpha => color::alpha_blit(col, dst, attr.write_alpha),
        BlendMode::Add => color::add_saturate(col, dst),
        _ if attr.flags & TILE_FLAG_ADDITIVE != 0 => color::add_saturate(col, dst),
        _ => col,
    };
    if let Some(a) = tile.attr.as_mut() {
        a[i] = attr.write_alpha;
    }
}

/// Visit every tile of the chunk whose pixels intersect both the draw
/// rectangle and the destination tile band.
fn for_each_visible_tile(tile: &TileFrameBuffer, p: &DrawParams, mut f: impl FnMut(i32, i32)) {
    let band_top = tile.y;
    let band_bottom = tile.y + tile.height as i32;
    for ty in 0..TILEMAP_CHUNK_TILES {
        let py = p.y + ty * GPU_TILEMAP_TILE_SZ;
        if py + GPU_TILEMAP_TILE_SZ <= band_top.max(p.y) || py >= band_bottom.min(p.y + p.h) {
            continue;
        }
        for tx in 0..TILEMAP_CHUNK_TILES {
            let px = p.x + tx * GPU_TILEMAP_TILE_SZ;
            if px + GPU_TILEMAP_TILE_SZ <= p.x.max(0) || px >= (p.x + p.w).min(tile.width as i32) {
                continue;
            }
            f(tx, ty);
        }
    }
}

fn in_rect(p: &DrawParams, x: i32, y: i32) -> bool {
    x >= p.x && y >= p.y && x < p.x + p.w && y < p.y + p.h
}

fn load_attribs(buffers: &BufferTable, attrib_id: u16) -> Result<&[u8], GpuFault> {
    Ok(buffers.data(attrib_id)?)
}

macro_rules! draw_params {
    ($cmd:expr) => {
        DrawParams {
            x: $cmd.x as i32,
            y: $cmd.y as i32,
            w: $cmd.w as i32,
            h: $cmd.h as i32,
            tile_group_mask: $cmd.tile_group_mask,
            time: $cmd.time,
            blend: BlendMode::from_u8($cmd.blend)?,
        }
    };
}

fn group_selected(mask: u8, group: u8) -> bool {
    mask == 0xFF || mask & group != 0
}

pub fn draw_tilemap(ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    let cmd: DrawTileMap = ctx.decode()?;
    let params = draw_params!(cmd);
    let buffers = ctx.state.buffers();
    let view = ChunkView {
        buffers: &*buffers,
        data_id: cmd.data_id,
        state_id: cmd.state_id,
        attribs: load_attribs(&buffers, cmd.attrib_id)?,
        tile_id_mask: cmd.tile_id_mask,
    };
    buffers.get(cmd.data_id)?;

    let tile = &mut *ctx.tile;
    let mut visible = Vec::new();
    for_each_visible_tile(tile, &params, |tx, ty| visible.push((tx, ty)));

    for (tx, ty) in visible {
        let Some(id) = view.tile_id(tx, ty).filter(|id| *id != 0) else {
            continue;
        };
        let Some(attr) = view.attr(id) else {
            continue;
        };
        if attr.is_fluid() || !group_selected(params.tile_group_mask, attr.group) {
            continue;
        }
        let texture = buffers.get(attr.texture_id)?;
        if !matches!(texture.format, TextureFormat::Rgb16 | TextureFormat::Rgba16) {
            return Err(GpuFault::general(format!("tile texture {} is not RGB16", attr.texture_id)));
        }
        let tex_w = texture.width as u32;
        let tex_h = texture.height as u32;
        let pixels = buffers.data(attr.texture_id)?;

        let mask = neighbour_mask(|dx, dy| view.group_at(tx + dx, ty + dy) == Some(attr.group));
        let auto = auto_tile_index(mask) as u32;
        let base_x = (auto % SHEET_COLUMNS) * GPU_TILEMAP_TILE_SZ as u32 + attr.frame_x as u32;
        let base_y = (auto / SHEET_COLUMNS) * GPU_TILEMAP_TILE_SZ as u32
            + attr.frame_y as u32
            + attr.frame(params.time) * attr.frame_stride_y as u32;

        for py in 0..GPU_TILEMAP_TILE_SZ {
            for px in 0..GPU_TILEMAP_TILE_SZ {
                let x = params.x + tx * GPU_TILEMAP_TILE_SZ + px;
                let y = params.y + ty * GPU_TILEMAP_TILE_SZ + py;
                if !in_rect(&params, x, y) {
                    continue;
                }
                let (sx, sy) = (base_x + px as u32, base_y + py as u32);
                if sx >= tex_w || sy >= tex_h {
                    continue;
                }
                let si = ((sy * tex_w + sx) * 2) as usize;
                let Some(texel) = pixels.get(si..si + 2) else {
                    continue;
                };
                let col = u16::from_le_bytes([texel[0], texel[1]]);
                if col == 0 {
                    continue;
                }
                write_pixel(tile, x, y, col, params.blend, &attr);
            }
        }
    }
    Ok(())
}

pub fn draw_water(ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    let cmd: DrawWater = ctx.decode()?;
    let params = draw_params!(cmd);
    let buffers = ctx.state.buffers();
    let view = ChunkView {
        buffers: &*buffers,
        data_id: cmd.data_id,
        state_id: cmd.state_id,
        attribs: load_attribs(&buffers, cmd.attrib_id)?,
        tile_id_mask: cmd.tile_id_mask,
    };
    buffers.get(cmd.data_id)?;
    buffers.get(cmd.state_id)?;

    let tile = &mut *ctx.tile;
    let mut visible = Vec::new();
    for_each_visible_tile(tile, &params, |tx, ty| visible.push((tx, ty)));

    for (tx, ty) in visible {
        let Some(attr) = view.tile_id(tx, ty).and_then(|id| view.attr(id)) else {
            continue;
        };
        if !attr.is_fluid() || !group_selected(params.tile_group_mask, attr.group) {
            continue;
        }
        let mass = view.state(tx, ty) as i32;
        if mass == 0 {
            continue;
        }
        // A full tile above keeps the surface flat; otherwise it ripples.
        let covered = view
            .tile_id(tx, ty - 1)
            .and_then(|id| view.attr(id))
            .is_some_and(|a| a.is_fluid() && view.state(tx, ty - 1) > 0);
        let level = mass * GPU_TILEMAP_TILE_SZ / 255;
        for px in 0..GPU_TILEMAP_TILE_SZ {
            let ripple = if covered {
                0.0
            } else {
                libm::sinf(params.time * 4.0 + (tx * GPU_TILEMAP_TILE_SZ + px) as f32 * 0.4) * 1.5
            };
            let top = (GPU_TILEMAP_TILE_SZ - level + ripple as i32).clamp(0, GPU_TILEMAP_TILE_SZ);
            for py in top..GPU_TILEMAP_TILE_SZ {
                let x = params.x + tx * GPU_TILEMAP_TILE_SZ + px;
                let y = params.y + ty * GPU_TILEMAP_TILE_SZ + py;
                if in_rect(&params, x, y) {
                    write_pixel(tile, x, y, attr.water_col, params.blend, &attr);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolated_tile_uses_island_index() {
        assert_eq!(auto_tile_index(neighbour_mask(|_, _| false)), 47);
    }

    #[test]
    fn fully_surrounded_tile() {
        assert_eq!(neighbour_mask(|_, _| true), 255);
        assert_eq!(auto_tile_index(255), 46);
    }

    #[test]
    fn corners_need_both_sides() {
        // Only the NW diagonal matches: ignored without N and W.
        let mask = neighbour_mask(|dx, dy| dx == -1 && dy == -1);
        assert_eq!(mask, 0);
        let mask = neighbour_mask(|dx, dy| (dx, dy) == (0, -1) || (dx, dy) == (-1, 0) || (dx, dy) == (-1, -1));
        assert_eq!(mask, NW | N | W);
        assert_eq!(auto_tile_index(mask), 4);
    }

    #[test]
    fn attr_record_layout() {
        let attr = TileAttr {
            valid: true,
            group: 3,
            texture_id: 0x1234,
            water_col: color::BLUE,
            ..TileAttr::default()
        };
        let bytes = attr.encode();
        assert_eq!(bytes[4], 0x34);
        assert_eq!(bytes[5], 0x12);
        assert_eq!(TileAttr::decode(&bytes), Some(attr));
    }
}
