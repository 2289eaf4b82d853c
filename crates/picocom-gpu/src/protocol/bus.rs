//! Bus messages exchanged between the app core and the VDP cores.
//!
//! A draw packet is a [`FrameHeader`] followed by the primary command stream
//! and then the secondary (VDP2) sub-list. Everything is little-endian.

use super::{BlendMode, ColorDepth, CompleteFlags, Reader, Writer};
use crate::error::ProtocolError;

/// First byte of every bus packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusCmd {
    GetStatus = 1,
    StatusReply = 2,
    DrawCmdData = 3,
    ForwardVdp2CmdData = 4,
    AckDrawCmdData = 5,
    TileFrameBuffer = 6,
}

impl BusCmd {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            1 => BusCmd::GetStatus,
            2 => BusCmd::StatusReply,
            3 => BusCmd::DrawCmdData,
            4 => BusCmd::ForwardVdp2CmdData,
            5 => BusCmd::AckDrawCmdData,
            6 => BusCmd::TileFrameBuffer,
            other => return Err(ProtocolError::UnknownBusCommand(other)),
        })
    }

    /// Packet that answers a blocking request of this kind.
    pub fn reply(self) -> Option<BusCmd> {
        match self {
            BusCmd::GetStatus => Some(BusCmd::StatusReply),
            _ => None,
        }
    }

    /// Peek the command byte of a packet.
    pub fn of(packet: &[u8]) -> Result<Self, ProtocolError> {
        match packet.first() {
            Some(b) => Self::from_u8(*b),
            None => Err(ProtocolError::Truncated {
                needed: 1,
                available: 0,
            }),
        }
    }
}

/// Encoded size of a [`FrameHeader`].
pub const FRAME_HEADER_SIZE: usize = 28;

/// Frame-level wrapper stamped into the reserved prefix of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub bus_cmd: BusCmd,
    pub seq: u32,
    pub tile_mask: u16,
    pub flags: CompleteFlags,
    pub color_depth: ColorDepth,
    pub palette_id: u16,
    pub pass_id: u32,
    pub default_blend: BlendMode,
    pub vdp2_count: u16,
    pub vdp2_size: u32,
    pub cmd_count: u16,
    pub cmd_size: u32,
}

impl FrameHeader {
    pub fn encode(&self, out: &mut [u8]) -> Result<(), ProtocolError> {
        let mut w = Writer::new(out);
        w.u8(self.bus_cmd as u8)?;
        w.u32(self.seq)?;
        w.u16(self.tile_mask)?;
        w.u8(self.flags.bits())?;
        w.u8(self.color_depth as u8)?;
        w.u16(self.palette_id)?;
        w.u32(self.pass_id)?;
        w.u8(self.default_blend as u8)?;
        w.u16(self.vdp2_count)?;
        w.u32(self.vdp2_size)?;
        w.u16(self.cmd_count)?;
        w.u32(self.cmd_size)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            bus_cmd: BusCmd::from_u8(r.u8()?)?,
            seq: r.u32()?,
            tile_mask: r.u16()?,
            flags: CompleteFlags::from_bits_retain(r.u8()?),
            color_depth: ColorDepth::from_u8(r.u8()?)?,
            palette_id: r.u16()?,
            pass_id: r.u32()?,
            default_blend: BlendMode::from_u8(r.u8()?)?,
            vdp2_count: r.u16()?,
            vdp2_size: r.u32()?,
            cmd_count: r.u16()?,
            cmd_size: r.u32()?,
        })
    }
}

/// A decoded draw packet borrowing its streams from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct DrawPacket<'a> {
    pub header: FrameHeader,
    pub cmds: &'a [u8],
    pub vdp2: &'a [u8],
}

impl<'a> DrawPacket<'a> {
    /// Split a packet into header and streams, checking declared sizes
    /// against the bytes actually received.
    pub fn decode(packet: &'a [u8]) -> Result<Self, ProtocolError> {
        let header = FrameHeader::decode(packet)?;
        let cmd_size = header.cmd_size as usize;
        let vdp2_size = header.vdp2_size as usize;
        let needed = FRAME_HEADER_SIZE + cmd_size + vdp2_size;
        if needed > packet.len() {
            return Err(ProtocolError::BadSize {
                declared: needed,
                actual: packet.len(),
            });
        }
        let cmds_end = FRAME_HEADER_SIZE + cmd_size;
        Ok(Self {
            header,
            cmds: &packet[FRAME_HEADER_SIZE..cmds_end],
            vdp2: &packet[cmds_end..cmds_end + vdp2_size],
        })
    }
}

/// Encoded size of an [`Ack`].
pub const ACK_SIZE: usize = 17;

/// Completion of one draw packet, matched to its record by `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ack {
    pub seq: u32,
    pub gpu_errors: u32,
    pub tile_bus_copy_time_us: u32,
    pub tile_render_time_us: u32,
}

impl Ack {
    pub fn encode(&self) -> [u8; ACK_SIZE] {
        let mut out = [0u8; ACK_SIZE];
        out[0] = BusCmd::AckDrawCmdData as u8;
        out[1..5].copy_from_slice(&self.seq.to_le_bytes());
        out[5..9].copy_from_slice(&self.gpu_errors.to_le_bytes());
        out[9..13].copy_from_slice(&self.tile_bus_copy_time_us.to_le_bytes());
        out[13..17].copy_from_slice(&self.tile_render_time_us.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        expect_cmd(&mut r, BusCmd::AckDrawCmdData)?;
        Ok(Self {
            seq: r.u32()?,
            gpu_errors: r.u32()?,
            tile_bus_copy_time_us: r.u32()?,
            tile_render_time_us: r.u32()?,
        })
    }
}

fn expect_cmd(r: &mut Reader<'_>, cmd: BusCmd) -> Result<(), ProtocolError> {
    let got = BusCmd::from_u8(r.u8()?)?;
    if got != cmd {
        return Err(ProtocolError::UnknownBusCommand(got as u8));
    }
    Ok(())
}

pub const STATUS_REQUEST_SIZE: usize = 5;

/// Encode a status request tagged with a caller counter.
pub fn encode_status_request(counter: u32) -> [u8; STATUS_REQUEST_SIZE] {
    let mut out = [0u8; STATUS_REQUEST_SIZE];
    out[0] = BusCmd::GetStatus as u8;
    out[1..5].copy_from_slice(&counter.to_le_bytes());
    out
}

pub fn decode_status_request(bytes: &[u8]) -> Result<u32, ProtocolError> {
    let mut r = Reader::new(bytes);
    expect_cmd(&mut r, BusCmd::GetStatus)?;
    r.u32()
}

pub const STATUS_REPLY_SIZE: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusReply {
    /// Echo of the request counter.
    pub counter: u32,
    pub online: bool,
    pub busy: bool,
    pub frames: u32,
}

impl StatusReply {
    pub fn encode(&self) -> [u8; STATUS_REPLY_SIZE] {
        let mut out = [0u8; STATUS_REPLY_SIZE];
        out[0] = BusCmd::StatusReply as u8;
        out[1..5].copy_from_slice(&self.counter.to_le_bytes());
        out[5] = self.online as u8;
        out[6] = self.busy as u8;
        out[7..11].copy_from_slice(&self.frames.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        expect_cmd(&mut r, BusCmd::StatusReply)?;
        Ok(Self {
            counter: r.u32()?,
            online: r.u8()? != 0,
            busy: r.u8()? != 0,
            frames: r.u32()?,
        })
    }
}

/// Fixed part of a [`TileFramePacket`].
pub const TILE_FRAME_HEADER_SIZE: usize = 21;

/// A rendered tile sent from VDP1 to VDP2 for compositing.
#[derive(Debug, Clone, Copy)]
pub struct TileFramePacket<'a> {
    pub seq: u32,
    pub flags: CompleteFlags,
    pub tile_id: u8,
    pub pass_id: u32,
    pub default_blend: BlendMode,
    pub palette_id: u16,
    pub color_depth: ColorDepth,
    pub vdp2_count: u16,
    /// Little-endian RGB565 pixels.
    pub pixels: &'a [u8],
    pub attrs: &'a [u8],
    pub vdp2: &'a [u8],
}

impl<'a> TileFramePacket<'a> {
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let start = out.len();
        out.resize(start + TILE_FRAME_HEADER_SIZE, 0);
        let mut w = Writer::new(&mut out[start..]);
        w.u8(BusCmd::TileFrameBuffer as u8)?;
        w.u32(self.seq)?;
        w.u8(self.flags.bits())?;
        w.u8(self.tile_id)?;
        w.u32(self.pass_id)?;
        w.u8(self.default_blend as u8)?;
        w.u16(self.palette_id)?;
        w.u8(self.color_depth as u8)?;
        w.u16(self.vdp2_count)?;
        w.u32(self.vdp2.len() as u32)?;
        out.extend_from_slice(self.pixels);
        out.extend_from_slice(self.attrs);
        out.extend_from_slice(self.vdp2);
        Ok(())
    }

    /// Decode a tile packet carrying `pixel_count` pixels.
    pub fn decode(bytes: &'a [u8], pixel_count: usize) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        expect_cmd(&mut r, BusCmd::TileFrameBuffer)?;
        let seq = r.u32()?;
        let flags = CompleteFlags::from_bits_retain(r.u8()?);
        let tile_id = r.u8()?;
        let pass_id = r.u32()?;
        let default_blend = BlendMode::from_u8(r.u8()?)?;
        let palette_id = r.u16()?;
        let color_depth = ColorDepth::from_u8(r.u8()?)?;
        let vdp2_count = r.u16()?;
        let vdp2_size = r.u32()? as usize;
        Ok(Self {
            seq,
            flags,
            tile_id,
            pass_id,
            default_blend,
            palette_id,
            color_depth,
            vdp2_count,
            pixels: r.bytes(pixel_count * 2)?,
            attrs: r.bytes(pixel_count)?,
            vdp2: r.bytes(vdp2_size)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FrameHeader {
        FrameHeader {
            bus_cmd: BusCmd::DrawCmdData,
            seq: 9,
            tile_mask: 0b11111,
            flags: CompleteFlags::WRITE_VDP2_TILE,
            color_depth: ColorDepth::Bgr565,
            palette_id: 0,
            pass_id: 1,
            default_blend: BlendMode::Alpha,
            vdp2_count: 0,
            vdp2_size: 0,
            cmd_count: 1,
            cmd_size: 4,
        }
    }

    #[test]
    fn frame_header_fills_prefix_exactly() {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        header().encode(&mut out).unwrap();
        assert_eq!(FrameHeader::decode(&out).unwrap(), header());
        let mut short = [0u8; FRAME_HEADER_SIZE - 1];
        assert!(header().encode(&mut short).is_err());
    }

    #[test]
    fn draw_packet_rejects_overstated_sizes() {
        let mut out = vec![0u8; FRAME_HEADER_SIZE + 3];
        header().encode(&mut out).unwrap();
        assert!(matches!(
            DrawPacket::decode(&out),
            Err(ProtocolError::BadSize { .. })
        ));
    }

    #[test]
    fn ack_layout() {
        let ack = Ack {
            seq: 0x01020304,
            gpu_errors: 2,
            ..Ack::default()
        };
        let bytes = ack.encode();
        assert_eq!(bytes[0], BusCmd::AckDrawCmdData as u8);
        assert_eq!(&bytes[1..5], &[4, 3, 2, 1]);
        assert_eq!(Ack::decode(&bytes).unwrap(), ack);
    }
}
