//! Command payloads.
//!
//! Fixed-layout commands are declared through `fixed_command!`, which derives
//! the encoder and decoder from the field list in wire order. Commands with
//! arrays or trailing data are written out by hand.

use core::fmt;

use super::{CmdId, CommandHeader, GpuCommand, Reader, Writer, HEADER_SIZE};
use crate::error::ProtocolError;

/// Sentinel for "no parent buffer" / "no linked edge".
pub const NO_BUFFER: u16 = 0xFFFF;

macro_rules! fixed_command {
    ($(#[$meta:meta])* $name:ident = $id:ident { $($(#[$fmeta:meta])* $field:ident : $ty:ident),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Default)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: $ty,)*
        }

        impl<'a> GpuCommand<'a> for $name {
            const ID: CmdId = CmdId::$id;

            fn payload_len(&self) -> usize {
                0 $(+ core::mem::size_of::<$ty>())*
            }

            #[allow(unused_variables)]
            fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), ProtocolError> {
                $(w.$ty(self.$field)?;)*
                Ok(())
            }

            #[allow(unused_variables)]
            fn decode_payload(r: &mut Reader<'a>) -> Result<Self, ProtocolError> {
                Ok(Self { $($field: r.$ty()?,)* })
            }
        }
    };
}

fixed_command!(
    /// Does nothing.
    Nop = Nop {}
);

fixed_command!(
    /// Reset parts of the engine state. Each field is a boolean.
    ResetGpu = ResetGpu {
        /// Restore the command table to the built-ins.
        cmds: u8,
        /// Invalidate every buffer and zero the RAM arena.
        buffers: u8,
        /// Clear the error and frame counters.
        stats: u8,
    }
);

fixed_command!(
    /// Toggle per-instance upload tracing.
    SetDebug = SetDebug { enabled: u8 }
);

fixed_command!(
    /// Colour used when a tile is cleared before execution.
    SetClearCol = SetClearCol { col: u16 }
);

fixed_command!(
    FillRectCol = FillRectCol {
        x: i16,
        y: i16,
        w: i16,
        h: i16,
        col: u16,
        /// Alpha for `Alpha` blending; also written to the attribute plane.
        a: u8,
        blend: u8,
    }
);

fixed_command!(
    CreateBuffer = CreateBuffer {
        arena: u8,
        buffer_id: u16,
        mem_offset: u32,
        mem_size: u32,
        format: u8,
        width: u16,
        height: u16,
        /// [`NO_BUFFER`] for a root buffer, otherwise the containing buffer.
        parent: u16,
    }
);

fixed_command!(
    BlitRect = BlitRect {
        buffer_id: u8,
        src_x: u16,
        src_y: u16,
        dst_x: i16,
        dst_y: i16,
        w: u16,
        h: u16,
        col_key: u16,
        pal_id: u16,
        /// Bit 0: flip horizontally.
        flags: u8,
        blend: u8,
        alpha: u8,
        write_alpha: u8,
    }
);

/// `BlitRect::flags` bit: mirror the source horizontally.
pub const BLIT_FLIP_X: u8 = 1;

fixed_command!(
    /// Bind the extension catalogued in `buffer_id` to `cmd_id`.
    RegisterCmd = RegisterCmd {
        vdp_id: u8,
        cmd_id: u8,
        buffer_id: u16,
    }
);

fixed_command!(
    DrawLine = DrawLine {
        x0: i16,
        y0: i16,
        x1: i16,
        y1: i16,
        col: u16,
    }
);

fixed_command!(
    /// Merge the bound source tile into the destination tile.
    CompositeTile = CompositeTile { blend: u8, pal_id: u16 }
);

fixed_command!(
    /// Draw one 16x16 chunk of a tilemap.
    DrawTileMap = DrawTileMap {
        data_id: u16,
        state_id: u16,
        attrib_id: u16,
        x: i16,
        y: i16,
        w: u16,
        h: u16,
        tile_id_mask: u8,
        tile_group_mask: u8,
        time: f32,
        seed: u32,
        blend: u8,
    }
);

fixed_command!(
    /// Draw the fluid tiles of a tilemap chunk.
    DrawWater = DrawWater {
        data_id: u16,
        state_id: u16,
        attrib_id: u16,
        x: i16,
        y: i16,
        w: u16,
        h: u16,
        tile_id_mask: u8,
        tile_group_mask: u8,
        time: f32,
        seed: u32,
        blend: u8,
    }
);

fixed_command!(
    InitRenderer3D = InitRenderer3D {
        fov_y_deg: f32,
        near: f32,
        far: f32,
    }
);

fixed_command!(
    BeginFrameTile3D = BeginFrameTile3D {}
);

fixed_command!(
    SetShader3D = SetShader3D {
        shader_id: u8,
        texture_id: u16,
        col: u16,
    }
);

/// Upload data into a buffer. Payload is followed by `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteBufferData<'a> {
    pub buffer_id: u8,
    pub flags: u8,
    pub offset: u32,
    /// Execute on every tile, not only tile 0.
    pub allow_non_tile_zero: u8,
    pub data: &'a [u8],
}

/// Fixed part of [`WriteBufferData`], excluding the header.
pub const WRITE_BUFFER_DATA_FIXED: usize = 9;

impl<'a> GpuCommand<'a> for WriteBufferData<'a> {
    const ID: CmdId = CmdId::WriteBufferData;

    fn payload_len(&self) -> usize {
        WRITE_BUFFER_DATA_FIXED + self.data.len()
    }

    fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), ProtocolError> {
        let len = u16::try_from(self.data.len()).map_err(|_| ProtocolError::InvalidValue {
            field: "data_size",
            value: self.data.len() as u32,
        })?;
        w.u8(self.buffer_id)?;
        w.u8(self.flags)?;
        w.u32(self.offset)?;
        w.u16(len)?;
        w.u8(self.allow_non_tile_zero)?;
        w.bytes(self.data)
    }

    fn decode_payload(r: &mut Reader<'a>) -> Result<Self, ProtocolError> {
        let buffer_id = r.u8()?;
        let flags = r.u8()?;
        let offset = r.u32()?;
        let len = r.u16()? as usize;
        let allow_non_tile_zero = r.u8()?;
        let data = r.bytes(len)?;
        Ok(Self {
            buffer_id,
            flags,
            offset,
            allow_non_tile_zero,
            data,
        })
    }
}

/// Bind neighbouring chunks to a tilemap's data and state buffers.
///
/// Slot `(dx + 1) + (dy + 1) * 3` holds the chunk at offset `(dx, dy)`;
/// slot 4 is the chunk itself. [`NO_BUFFER`] leaves a slot untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateLinkedTilemapBuffer {
    pub data_id: u16,
    pub state_id: u16,
    pub edge_data: [u16; 9],
    pub edge_state: [u16; 9],
}

impl Default for CreateLinkedTilemapBuffer {
    fn default() -> Self {
        Self {
            data_id: NO_BUFFER,
            state_id: NO_BUFFER,
            edge_data: [NO_BUFFER; 9],
            edge_state: [NO_BUFFER; 9],
        }
    }
}

impl<'a> GpuCommand<'a> for CreateLinkedTilemapBuffer {
    const ID: CmdId = CmdId::CreateLinkedTilemapBuffer;

    fn payload_len(&self) -> usize {
        4 + 9 * 2 * 2
    }

    fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), ProtocolError> {
        w.u16(self.data_id)?;
        w.u16(self.state_id)?;
        for id in self.edge_data.iter().chain(self.edge_state.iter()) {
            w.u16(*id)?;
        }
        Ok(())
    }

    fn decode_payload(r: &mut Reader<'a>) -> Result<Self, ProtocolError> {
        let mut cmd = Self {
            data_id: r.u16()?,
            state_id: r.u16()?,
            ..Self::default()
        };
        for slot in cmd.edge_data.iter_mut() {
            *slot = r.u16()?;
        }
        for slot in cmd.edge_state.iter_mut() {
            *slot = r.u16()?;
        }
        Ok(cmd)
    }
}

/// Which matrix `SetMatrix3D` replaces.
pub const MATRIX_SLOT_MODEL: u8 = 0;
pub const MATRIX_SLOT_VIEW: u8 = 1;
pub const MATRIX_SLOT_PROJECTION: u8 = 2;

/// Column-major 4x4 matrix upload.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SetMatrix3D {
    pub slot: u8,
    pub m: [f32; 16],
}

impl<'a> GpuCommand<'a> for SetMatrix3D {
    const ID: CmdId = CmdId::SetMatrix3D;

    fn payload_len(&self) -> usize {
        1 + 16 * 4
    }

    fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), ProtocolError> {
        w.u8(self.slot)?;
        self.m.iter().try_for_each(|v| w.f32(*v))
    }

    fn decode_payload(r: &mut Reader<'a>) -> Result<Self, ProtocolError> {
        let slot = r.u8()?;
        let mut m = [0.0; 16];
        for v in m.iter_mut() {
            *v = r.f32()?;
        }
        Ok(Self { slot, m })
    }
}

fn write_vec3(w: &mut Writer<'_>, v: &[f32; 3]) -> Result<(), ProtocolError> {
    v.iter().try_for_each(|c| w.f32(*c))
}

fn read_vec3(r: &mut Reader<'_>) -> Result<[f32; 3], ProtocolError> {
    Ok([r.f32()?, r.f32()?, r.f32()?])
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LookAt3D {
    pub eye: [f32; 3],
    pub target: [f32; 3],
    pub up: [f32; 3],
}

impl<'a> GpuCommand<'a> for LookAt3D {
    const ID: CmdId = CmdId::LookAt3D;

    fn payload_len(&self) -> usize {
        9 * 4
    }

    fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), ProtocolError> {
        write_vec3(w, &self.eye)?;
        write_vec3(w, &self.target)?;
        write_vec3(w, &self.up)
    }

    fn decode_payload(r: &mut Reader<'a>) -> Result<Self, ProtocolError> {
        Ok(Self {
            eye: read_vec3(r)?,
            target: read_vec3(r)?,
            up: read_vec3(r)?,
        })
    }
}

/// One object-space triangle, drawn as a wireframe in `col`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DrawTriTex {
    pub v: [[f32; 3]; 3],
    pub col: u16,
}

impl<'a> GpuCommand<'a> for DrawTriTex {
    const ID: CmdId = CmdId::DrawTriTex;

    fn payload_len(&self) -> usize {
        9 * 4 + 2
    }

    fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), ProtocolError> {
        for v in &self.v {
            write_vec3(w, v)?;
        }
        w.u16(self.col)
    }

    fn decode_payload(r: &mut Reader<'a>) -> Result<Self, ProtocolError> {
        Ok(Self {
            v: [read_vec3(r)?, read_vec3(r)?, read_vec3(r)?],
            col: r.u16()?,
        })
    }
}

/// Any decoded command. Unknown ids keep their raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyCommand<'a> {
    Nop(Nop),
    ResetGpu(ResetGpu),
    SetDebug(SetDebug),
    SetClearCol(SetClearCol),
    FillRectCol(FillRectCol),
    CreateBuffer(CreateBuffer),
    WriteBufferData(WriteBufferData<'a>),
    BlitRect(BlitRect),
    RegisterCmd(RegisterCmd),
    DrawLine(DrawLine),
    InitRenderer3D(InitRenderer3D),
    BeginFrameTile3D(BeginFrameTile3D),
    SetShader3D(SetShader3D),
    SetMatrix3D(SetMatrix3D),
    DrawTriTex(DrawTriTex),
    LookAt3D(LookAt3D),
    DrawTileMap(DrawTileMap),
    DrawWater(DrawWater),
    CreateLinkedTilemapBuffer(CreateLinkedTilemapBuffer),
    CompositeTile(CompositeTile),
    Extension { cmd: u8, payload: &'a [u8] },
}

impl<'a> AnyCommand<'a> {
    /// Decode one command from the start of `bytes`.
    pub fn decode(bytes: &'a [u8]) -> Result<(CommandHeader, Self), ProtocolError> {
        let header = CommandHeader::decode(bytes)?;
        let size = header.size as usize;
        if size < HEADER_SIZE || size > bytes.len() {
            return Err(ProtocolError::BadSize {
                declared: size,
                actual: bytes.len(),
            });
        }
        let bytes = &bytes[..size];
        let Some(id) = CmdId::from_u8(header.cmd) else {
            return Ok((
                header,
                AnyCommand::Extension {
                    cmd: header.cmd,
                    payload: &bytes[HEADER_SIZE..],
                },
            ));
        };
        let cmd = match id {
            CmdId::Nop => AnyCommand::Nop(Nop::decode(bytes)?),
            CmdId::ResetGpu => AnyCommand::ResetGpu(ResetGpu::decode(bytes)?),
            CmdId::SetDebug => AnyCommand::SetDebug(SetDebug::decode(bytes)?),
            CmdId::SetClearCol => AnyCommand::SetClearCol(SetClearCol::decode(bytes)?),
            CmdId::FillRectCol => AnyCommand::FillRectCol(FillRectCol::decode(bytes)?),
            CmdId::CreateBuffer => AnyCommand::CreateBuffer(CreateBuffer::decode(bytes)?),
            CmdId::WriteBufferData => AnyCommand::WriteBufferData(WriteBufferData::decode(bytes)?),
            CmdId::BlitRect => AnyCommand::BlitRect(BlitRect::decode(bytes)?),
            CmdId::RegisterCmd => AnyCommand::RegisterCmd(RegisterCmd::decode(bytes)?),
            CmdId::DrawLine => AnyCommand::DrawLine(DrawLine::decode(bytes)?),
            CmdId::InitRenderer3D => AnyCommand::InitRenderer3D(InitRenderer3D::decode(bytes)?),
            CmdId::BeginFrameTile3D => {
                AnyCommand::BeginFrameTile3D(BeginFrameTile3D::decode(bytes)?)
            }
            CmdId::SetShader3D => AnyCommand::SetShader3D(SetShader3D::decode(bytes)?),
            CmdId::SetMatrix3D => AnyCommand::SetMatrix3D(SetMatrix3D::decode(bytes)?),
            CmdId::DrawTriTex => AnyCommand::DrawTriTex(DrawTriTex::decode(bytes)?),
            CmdId::LookAt3D => AnyCommand::LookAt3D(LookAt3D::decode(bytes)?),
            CmdId::DrawTileMap => AnyCommand::DrawTileMap(DrawTileMap::decode(bytes)?),
            CmdId::DrawWater => AnyCommand::DrawWater(DrawWater::decode(bytes)?),
            CmdId::CreateLinkedTilemapBuffer => {
                AnyCommand::CreateLinkedTilemapBuffer(CreateLinkedTilemapBuffer::decode(bytes)?)
            }
            CmdId::CompositeTile => AnyCommand::CompositeTile(CompositeTile::decode(bytes)?),
        };
        Ok((header, cmd))
    }
}

impl fmt::Display for AnyCommand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyCommand::Nop(_) | AnyCommand::BeginFrameTile3D(_) => Ok(()),
            AnyCommand::ResetGpu(c) => {
                write!(f, "cmds={} buffers={} stats={}", c.cmds, c.buffers, c.stats)
            }
            AnyCommand::SetDebug(c) => write!(f, "enabled={}", c.enabled),
            AnyCommand::SetClearCol(c) => write!(f, "col=0x{:04X}", c.col),
            AnyCommand::FillRectCol(c) => write!(
                f,
                "x={} y={} w={} h={} col=0x{:04X} a={} blend={}",
                c.x, c.y, c.w, c.h, c.col, c.a, c.blend
            ),
            AnyCommand::CreateBuffer(c) => write!(
                f,
                "id={} arena={} offset={} size={} fmt={} {}x{} parent={}",
                c.buffer_id, c.arena, c.mem_offset, c.mem_size, c.format, c.width, c.height, c.parent
            ),
            AnyCommand::WriteBufferData(c) => write!(
                f,
                "id={} offset={} size={} flags=0x{:02X}",
                c.buffer_id,
                c.offset,
                c.data.len(),
                c.flags
            ),
            AnyCommand::BlitRect(c) => write!(
                f,
                "id={} src=({},{}) dst=({},{}) {}x{} blend={} key=0x{:04X}",
                c.buffer_id, c.src_x, c.src_y, c.dst_x, c.dst_y, c.w, c.h, c.blend, c.col_key
            ),
            AnyCommand::RegisterCmd(c) => write!(
                f,
                "vdp={} cmd={} buffer={}",
                c.vdp_id, c.cmd_id, c.buffer_id
            ),
            AnyCommand::DrawLine(c) => write!(
                f,
                "({},{})-({},{}) col=0x{:04X}",
                c.x0, c.y0, c.x1, c.y1, c.col
            ),
            AnyCommand::InitRenderer3D(c) => {
                write!(f, "fov={} near={} far={}", c.fov_y_deg, c.near, c.far)
            }
            AnyCommand::SetShader3D(c) => write!(
                f,
                "shader={} texture={} col=0x{:04X}",
                c.shader_id, c.texture_id, c.col
            ),
            AnyCommand::SetMatrix3D(c) => write!(f, "slot={}", c.slot),
            AnyCommand::DrawTriTex(c) => write!(f, "v={:?} col=0x{:04X}", c.v, c.col),
            AnyCommand::LookAt3D(c) => {
                write!(f, "eye={:?} target={:?} up={:?}", c.eye, c.target, c.up)
            }
            AnyCommand::DrawTileMap(c) => write!(
                f,
                "data={} state={} attrib={} at=({},{}) {}x{}",
                c.data_id, c.state_id, c.attrib_id, c.x, c.y, c.w, c.h
            ),
            AnyCommand::DrawWater(c) => write!(
                f,
                "data={} state={} attrib={} at=({},{}) {}x{}",
                c.data_id, c.state_id, c.attrib_id, c.x, c.y, c.w, c.h
            ),
            AnyCommand::CreateLinkedTilemapBuffer(c) => write!(
                f,
                "data={} state={} edges={:?}",
                c.data_id, c.state_id, c.edge_data
            ),
            AnyCommand::CompositeTile(c) => write!(f, "blend={} pal={}", c.blend, c.pal_id),
            AnyCommand::Extension { cmd, payload } => {
                write!(f, "extension cmd={} payload={} bytes", cmd, payload.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_payload_sizes() {
        assert_eq!(FillRectCol::default().payload_len(), 12);
        assert_eq!(CreateBuffer::default().payload_len(), 18);
        assert_eq!(BlitRect::default().payload_len(), 21);
        assert_eq!(DrawTileMap::default().payload_len(), 25);
        assert_eq!(CreateLinkedTilemapBuffer::default().payload_len(), 40);
        assert_eq!(Nop::default().encoded_len(), HEADER_SIZE);
    }

    #[test]
    fn write_buffer_data_carries_trailing_bytes() {
        let data = [1u8, 2, 3, 4, 5];
        let cmd = WriteBufferData {
            buffer_id: 17,
            flags: 2,
            offset: 4096,
            allow_non_tile_zero: 0,
            data: &data,
        };
        let mut out = [0u8; 32];
        let n = cmd.encode(Some(1), &mut out).unwrap();
        assert_eq!(n, HEADER_SIZE + 9 + 5);
        let (header, decoded) = AnyCommand::decode(&out[..n]).unwrap();
        assert!(header.has_cull_mask());
        assert_eq!(decoded, AnyCommand::WriteBufferData(cmd));
    }

    #[test]
    fn unknown_ids_decode_as_extensions() {
        let mut out = [0u8; 8];
        CommandHeader::new(70, 8).encode(&mut out).unwrap();
        let (_, cmd) = AnyCommand::decode(&out).unwrap();
        assert!(matches!(cmd, AnyCommand::Extension { cmd: 70, payload } if payload.len() == 2));
    }

    #[test]
    fn encode_rejects_short_output() {
        let mut out = [0u8; 10];
        assert!(FillRectCol::default().encode(None, &mut out).is_err());
    }
}
