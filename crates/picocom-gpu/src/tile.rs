//! Tile frame buffers and tile-band culling.
//!
//! The 320x240 frame is split into five horizontal bands of 48 rows. A band
//! is the unit of execution on VDP1 and of compositing on VDP2.

use crate::protocol::ColorDepth;

pub const FRAME_W: usize = 320;
pub const FRAME_H: usize = 240;
pub const TILE_HEIGHT: usize = 48;
pub const TILE_COUNT: usize = FRAME_H / TILE_HEIGHT;

/// Mask with every tile band set.
pub const ALL_TILES: u16 = (1 << TILE_COUNT) - 1;

/// Attribute bit: pixel has been written this pass.
pub const ATTR_PIXEL_WRITE: u8 = 0x80;
/// Attribute bits: 16-level alpha.
pub const ATTR_ALPHA_MASK: u8 = 0x0F;

/// Bits of the tile bands overlapped by rows `[y, y + h)`.
pub fn tile_cull_mask(y: i32, h: i32) -> u16 {
    let frame_h = FRAME_H as i32;
    let tile_h = TILE_HEIGHT as i32;
    if h <= 0 {
        return 0;
    }
    let min_y = y.max(0);
    if min_y >= frame_h {
        return 0;
    }
    let max_y = (y + h).min(frame_h);
    if max_y <= 0 {
        return 0;
    }
    let first = min_y / tile_h;
    let last = (max_y + tile_h - 1) / tile_h;
    (first..last).fold(0u16, |mask, band| mask | (1 << band))
}

/// Cull mask for a line between two rows.
pub fn tile_cull_mask_line(y0: i32, y1: i32) -> u16 {
    let top = y0.min(y1);
    tile_cull_mask(top, (y0 - y1).abs() + 1)
}

/// One band of pixels plus its per-pixel attribute plane.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFrameBuffer {
    pub tile_id: u8,
    /// Frame row of the first line of this tile.
    pub y: i32,
    pub width: usize,
    pub height: usize,
    pub depth: ColorDepth,
    pub pixels: Vec<u16>,
    pub attr: Option<Vec<u8>>,
}

impl TileFrameBuffer {
    pub fn new(tile_id: u8, width: usize, height: usize) -> Self {
        Self {
            tile_id,
            y: tile_id as i32 * height as i32,
            width,
            height,
            depth: ColorDepth::Bgr565,
            pixels: vec![0; width * height],
            attr: Some(vec![0; width * height]),
        }
    }

    /// A standard frame band with attributes.
    pub fn band(tile_id: u8) -> Self {
        Self::new(tile_id, FRAME_W, TILE_HEIGHT)
    }

    /// Zero-sized target used when executing state-only command lists.
    pub fn headless() -> Self {
        Self {
            tile_id: 0,
            y: 0,
            width: 0,
            height: 0,
            depth: ColorDepth::Bgr565,
            pixels: Vec::new(),
            attr: None,
        }
    }

    /// Bit of this tile in a cull mask.
    pub fn mask(&self) -> u16 {
        1 << self.tile_id
    }

    pub fn clear(&mut self, col: u16) {
        self.pixels.fill(col);
        if let Some(attr) = self.attr.as_mut() {
            attr.fill(0);
        }
    }

    /// Frame coordinates to an index into `pixels`, if inside this tile.
    pub fn index(&self, x: i32, y: i32) -> Option<usize> {
        let ly = y - self.y;
        if x < 0 || ly < 0 || x as usize >= self.width || ly as usize >= self.height {
            return None;
        }
        Some(ly as usize * self.width + x as usize)
    }

    pub fn pixel(&self, x: i32, y: i32) -> Option<u16> {
        self.index(x, y).map(|i| self.pixels[i])
    }

    /// Write a pixel and its attribute byte; out-of-tile writes are ignored.
    pub fn put(&mut self, x: i32, y: i32, col: u16, attr: u8) {
        if let Some(i) = self.index(x, y) {
            self.pixels[i] = col;
            if let Some(a) = self.attr.as_mut() {
                a[i] = attr;
            }
        }
    }

    /// Pixels as little-endian bytes.
    pub fn pixel_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
    }

    pub fn load_pixel_bytes(&mut self, bytes: &[u8]) {
        for (dst, src) in self.pixels.iter_mut().zip(bytes.chunks_exact(2)) {
            *dst = u16::from_le_bytes([src[0], src[1]]);
        }
    }
}

/// Rows of a tile clipped to a rectangle, in tile-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipRect {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl TileFrameBuffer {
    /// Intersect a frame-space rectangle with this tile.
    pub fn clip(&self, x: i32, y: i32, w: i32, h: i32) -> Option<ClipRect> {
        let ly = y - self.y;
        let x0 = x.max(0);
        let y0 = ly.max(0);
        let x1 = (x + w).min(self.width as i32);
        let y1 = (ly + h).min(self.height as i32);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(ClipRect {
            x0: x0 as usize,
            y0: y0 as usize,
            x1: x1 as usize,
            y1: y1 as usize,
        })
    }
}

/// A full frame held as a front and a back set of bands.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub front: Vec<TileFrameBuffer>,
    pub back: Vec<TileFrameBuffer>,
    flips: u32,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        let bands = || (0..TILE_COUNT as u8).map(TileFrameBuffer::band).collect::<Vec<_>>();
        Self {
            front: bands(),
            back: bands(),
            flips: 0,
        }
    }

    pub fn flip(&mut self) {
        core::mem::swap(&mut self.front, &mut self.back);
        self.flips += 1;
    }

    pub fn copy_back_to_front(&mut self) {
        self.front.clone_from(&self.back);
    }

    pub fn flips(&self) -> u32 {
        self.flips
    }

    /// Pixel of the displayed frame.
    pub fn front_pixel(&self, x: i32, y: i32) -> Option<u16> {
        if y < 0 {
            return None;
        }
        self.front
            .get(y as usize / TILE_HEIGHT)
            .and_then(|band| band.pixel(x, y))
    }
}
