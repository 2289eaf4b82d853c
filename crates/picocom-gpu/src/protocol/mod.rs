//! Wire protocol for command lists.
//!
//! Every command starts with a 6-byte [`CommandHeader`]; all multi-byte
//! fields are little-endian with no padding. Payloads are encoded and decoded
//! field by field through [`Writer`] and [`Reader`], never by reinterpreting
//! host structs.

pub mod bus;
pub mod cmds;

use bitflags::bitflags;

use crate::error::ProtocolError;

/// Encoded size of a [`CommandHeader`].
pub const HEADER_SIZE: usize = 6;

/// Hard ceiling on a single command's declared size.
pub const MAX_CMD_SIZE: usize = u16::MAX as usize;

/// Header flag: `cull_tile_mask` is meaningful.
pub const FLAG_CULL_MASK: u8 = 1 << 0;

/// Header present at the start of every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandHeader {
    pub cmd: u8,
    /// Total size including this header.
    pub size: u16,
    pub flags: u8,
    /// Bit n set = command affects tile band n.
    pub cull_tile_mask: u16,
}

impl CommandHeader {
    pub fn new(cmd: u8, size: u16) -> Self {
        Self {
            cmd,
            size,
            flags: 0,
            cull_tile_mask: 0,
        }
    }

    pub fn with_cull_mask(mut self, mask: u16) -> Self {
        self.flags |= FLAG_CULL_MASK;
        self.cull_tile_mask = mask;
        self
    }

    pub fn has_cull_mask(&self) -> bool {
        self.flags & FLAG_CULL_MASK != 0
    }

    /// True when the command declares a cull mask that misses `tile_mask`.
    pub fn is_culled(&self, tile_mask: u16) -> bool {
        self.has_cull_mask() && (tile_mask & self.cull_tile_mask) == 0
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            cmd: r.u8()?,
            size: r.u16()?,
            flags: r.u8()?,
            cull_tile_mask: r.u16()?,
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<(), ProtocolError> {
        let mut w = Writer::new(out);
        w.u8(self.cmd)?;
        w.u16(self.size)?;
        w.u8(self.flags)?;
        w.u16(self.cull_tile_mask)
    }
}

/// Built-in command ids. Ids below [`USER_CMD_BASE`] are reserved.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdId {
    Nop = 0,
    ResetGpu = 1,
    SetDebug = 2,
    SetClearCol = 3,
    FillRectCol = 4,
    CreateBuffer = 5,
    WriteBufferData = 6,
    BlitRect = 7,
    RegisterCmd = 8,
    DrawLine = 9,
    InitRenderer3D = 10,
    BeginFrameTile3D = 11,
    SetShader3D = 12,
    SetMatrix3D = 13,
    DrawTriTex = 14,
    LookAt3D = 16,
    DrawTileMap = 17,
    DrawWater = 18,
    CreateLinkedTilemapBuffer = 19,
    CompositeTile = 20,
}

/// Size of the command dispatch table.
pub const MAX_CMD_ID: usize = 128;

/// First id available to extension commands.
pub const USER_CMD_BASE: u8 = 64;

impl CmdId {
    pub const ALL: [CmdId; 20] = [
        CmdId::Nop,
        CmdId::ResetGpu,
        CmdId::SetDebug,
        CmdId::SetClearCol,
        CmdId::FillRectCol,
        CmdId::CreateBuffer,
        CmdId::WriteBufferData,
        CmdId::BlitRect,
        CmdId::RegisterCmd,
        CmdId::DrawLine,
        CmdId::InitRenderer3D,
        CmdId::BeginFrameTile3D,
        CmdId::SetShader3D,
        CmdId::SetMatrix3D,
        CmdId::DrawTriTex,
        CmdId::LookAt3D,
        CmdId::DrawTileMap,
        CmdId::DrawWater,
        CmdId::CreateLinkedTilemapBuffer,
        CmdId::CompositeTile,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| *id as u8 == v)
    }

    pub fn name(self) -> &'static str {
        match self {
            CmdId::Nop => "Nop",
            CmdId::ResetGpu => "ResetGpu",
            CmdId::SetDebug => "SetDebug",
            CmdId::SetClearCol => "SetClearCol",
            CmdId::FillRectCol => "FillRectCol",
            CmdId::CreateBuffer => "CreateBuffer",
            CmdId::WriteBufferData => "WriteBufferData",
            CmdId::BlitRect => "BlitRect",
            CmdId::RegisterCmd => "RegisterCmd",
            CmdId::DrawLine => "DrawLine",
            CmdId::InitRenderer3D => "InitRenderer3D",
            CmdId::BeginFrameTile3D => "BeginFrameTile3D",
            CmdId::SetShader3D => "SetShader3D",
            CmdId::SetMatrix3D => "SetMatrix3D",
            CmdId::DrawTriTex => "DrawTriTex",
            CmdId::LookAt3D => "LookAt3D",
            CmdId::DrawTileMap => "DrawTileMap",
            CmdId::DrawWater => "DrawWater",
            CmdId::CreateLinkedTilemapBuffer => "CreateLinkedTilemapBuffer",
            CmdId::CompositeTile => "CompositeTile",
        }
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $val:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $val),+
        }

        impl $name {
            pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
                match v {
                    $($val => Ok($name::$variant),)+
                    _ => Err(ProtocolError::InvalidValue {
                        field: stringify!($name),
                        value: v as u32,
                    }),
                }
            }
        }
    };
}

wire_enum!(
    /// Per-pixel combination rule.
    BlendMode {
        None = 0,
        Add = 1,
        Alpha = 2,
        ColorKey = 3,
        Multiply = 4,
        FillMasked = 5,
        ColkeyAlpha = 6,
        DebugAttrAlpha = 7,
        DebugAttrPixelWriteMask = 8,
        ColorKeyTintAdd = 9,
    }
);

wire_enum!(
    /// Element format of a GPU buffer.
    TextureFormat {
        None = 0,
        Bpp1 = 1,
        Bpp8 = 2,
        Rgb16 = 3,
        Rgba16 = 4,
    }
);

wire_enum!(
    /// Backing store of a GPU buffer.
    BufferArena {
        Ram0 = 0,
        Flash0 = 1,
    }
);

wire_enum!(
    /// Pixel depth of a tile frame buffer.
    ColorDepth {
        Bgr565 = 0,
        Indexed8 = 1,
    }
);

bitflags! {
    /// Flags bracketing a multi-chunk `WriteBufferData` upload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct WriteFlags: u8 {
        const COMMIT_PAGE = 1;
        const FINAL_PAGE = 2;
        const LOCK_WRITES = 4;
        const FIRST_PAGE = 8;
    }
}

bitflags! {
    /// What VDP2 does with a finished frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct CompleteFlags: u8 {
        const FLIP_DISPLAY = 1;
        const WRITE_VDP2_TILE = 2;
        const COPY_FB = 4;
    }
}

/// Little-endian cursor over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.array()?))
    }
}

/// Little-endian cursor writing into a byte slice. Never panics on overflow.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bytes(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let available = self.buf.len() - self.pos;
        if available < data.len() {
            return Err(ProtocolError::Truncated {
                needed: data.len(),
                available,
            });
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }

    pub fn u8(&mut self, v: u8) -> Result<(), ProtocolError> {
        self.bytes(&[v])
    }

    pub fn u16(&mut self, v: u16) -> Result<(), ProtocolError> {
        self.bytes(&v.to_le_bytes())
    }

    pub fn i16(&mut self, v: i16) -> Result<(), ProtocolError> {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u32(&mut self, v: u32) -> Result<(), ProtocolError> {
        self.bytes(&v.to_le_bytes())
    }

    pub fn f32(&mut self, v: f32) -> Result<(), ProtocolError> {
        self.bytes(&v.to_le_bytes())
    }
}

/// A typed command with an explicit wire encoding.
pub trait GpuCommand<'a>: Sized {
    const ID: CmdId;

    /// Payload length in bytes, excluding the header.
    fn payload_len(&self) -> usize;

    fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), ProtocolError>;

    fn decode_payload(r: &mut Reader<'a>) -> Result<Self, ProtocolError>;

    fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Write header and payload into `out`, returning the bytes written.
    fn encode(&self, cull_mask: Option<u16>, out: &mut [u8]) -> Result<usize, ProtocolError> {
        let size = self.encoded_len();
        if size > MAX_CMD_SIZE {
            return Err(ProtocolError::BadSize {
                declared: MAX_CMD_SIZE,
                actual: size,
            });
        }
        let mut header = CommandHeader::new(Self::ID as u8, size as u16);
        if let Some(mask) = cull_mask {
            header = header.with_cull_mask(mask);
        }
        if out.len() < size {
            return Err(ProtocolError::Truncated {
                needed: size,
                available: out.len(),
            });
        }
        header.encode(&mut out[..HEADER_SIZE])?;
        let mut w = Writer::new(&mut out[HEADER_SIZE..size]);
        self.encode_payload(&mut w)?;
        if w.position() != size - HEADER_SIZE {
            return Err(ProtocolError::BadSize {
                declared: size,
                actual: HEADER_SIZE + w.position(),
            });
        }
        Ok(size)
    }

    /// Decode a full command (header included), checking id and size.
    fn decode(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        let header = CommandHeader::decode(bytes)?;
        if header.cmd != Self::ID as u8 {
            return Err(ProtocolError::UnknownCommand(header.cmd));
        }
        let size = header.size as usize;
        if size < HEADER_SIZE || size > bytes.len() {
            return Err(ProtocolError::BadSize {
                declared: size,
                actual: bytes.len(),
            });
        }
        let mut r = Reader::new(&bytes[HEADER_SIZE..size]);
        Self::decode_payload(&mut r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_packed_little_endian() {
        let h = CommandHeader::new(7, 0x0123).with_cull_mask(0b10100);
        let mut out = [0u8; HEADER_SIZE];
        h.encode(&mut out).unwrap();
        assert_eq!(out, [7, 0x23, 0x01, FLAG_CULL_MASK, 0b10100, 0]);
        assert_eq!(CommandHeader::decode(&out).unwrap(), h);
    }

    #[test]
    fn cull_only_applies_with_flag() {
        let mut h = CommandHeader::new(4, 18);
        h.cull_tile_mask = 0b00001;
        assert!(!h.is_culled(0b00010));
        let h = h.with_cull_mask(0b00001);
        assert!(h.is_culled(0b00010));
        assert!(!h.is_culled(0b00001));
    }

    #[test]
    fn short_header_is_truncated() {
        assert!(matches!(
            CommandHeader::decode(&[1, 2, 3]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn flags_combine() {
        let f = WriteFlags::FIRST_PAGE | WriteFlags::COMMIT_PAGE;
        assert!(f.contains(WriteFlags::FIRST_PAGE));
        assert!(!f.contains(WriteFlags::FINAL_PAGE));
        assert_eq!(f.bits(), 9);
        assert_eq!(f.difference(WriteFlags::COMMIT_PAGE), WriteFlags::FIRST_PAGE);
        // Unknown wire bits survive a round trip.
        assert_eq!(WriteFlags::from_bits_retain(0x19).bits(), 0x19);
    }
}
