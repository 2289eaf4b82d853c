//! Minimal 3D path: transform state plus wireframe triangles.

use glam::{Mat4, Vec3, Vec4};

use super::{handlers, CommandContext};
use crate::error::GpuFault;
use crate::protocol::cmds::{
    DrawTriTex, InitRenderer3D, LookAt3D, SetMatrix3D, SetShader3D, MATRIX_SLOT_MODEL, MATRIX_SLOT_PROJECTION,
    MATRIX_SLOT_VIEW,
};
use crate::protocol::CmdId;
use crate::tile::{FRAME_H, FRAME_W};

/// Transform and shading state of one worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Render3dState {
    pub projection: Mat4,
    pub view: Mat4,
    pub model: Mat4,
    pub shader_id: u8,
    pub texture_id: u16,
    pub col: u16,
    /// Triangles drawn since the last `BeginFrameTile3D`.
    pub tris: u32,
}

impl Default for Render3dState {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            model: Mat4::IDENTITY,
            shader_id: 0,
            texture_id: 0,
            col: 0xFFFF,
            tris: 0,
        }
    }
}

impl Render3dState {
    pub fn init(&mut self, fov_y_deg: f32, near: f32, far: f32) -> Result<(), GpuFault> {
        if !(near > 0.0 && far > near && fov_y_deg > 0.0 && fov_y_deg < 180.0) {
            return Err(GpuFault::general(format!(
                "bad projection fov={fov_y_deg} near={near} far={far}"
            )));
        }
        let aspect = FRAME_W as f32 / FRAME_H as f32;
        self.projection = Mat4::perspective_rh(fov_y_deg.to_radians(), aspect, near, far);
        self.view = Mat4::IDENTITY;
        self.model = Mat4::IDENTITY;
        Ok(())
    }

    /// Object space to frame pixel coordinates. `None` behind the eye.
    pub fn project(&self, v: [f32; 3]) -> Option<(i32, i32)> {
        let clip: Vec4 = self.projection * self.view * self.model * Vec3::from(v).extend(1.0);
        if clip.w <= 0.0 {
            return None;
        }
        let ndc = clip.truncate() / clip.w;
        let x = (ndc.x + 1.0) * 0.5 * FRAME_W as f32;
        let y = (1.0 - ndc.y) * 0.5 * FRAME_H as f32;
        Some((x as i32, y as i32))
    }
}

pub fn execute(id: CmdId, ctx: &mut CommandContext<'_, '_>) -> Result<(), GpuFault> {
    match id {
        CmdId::InitRenderer3D => {
            let cmd: InitRenderer3D = ctx.decode()?;
            ctx.instance.render3d.init(cmd.fov_y_deg, cmd.near, cmd.far)
        }
        CmdId::BeginFrameTile3D => {
            ctx.instance.render3d.tris = 0;
            Ok(())
        }
        CmdId::SetShader3D => {
            let cmd: SetShader3D = ctx.decode()?;
            let state = &mut ctx.instance.render3d;
            state.shader_id = cmd.shader_id;
            state.texture_id = cmd.texture_id;
            state.col = cmd.col;
            Ok(())
        }
        CmdId::SetMatrix3D => {
            let cmd: SetMatrix3D = ctx.decode()?;
            let m = Mat4::from_cols_array(&cmd.m);
            let state = &mut ctx.instance.render3d;
            match cmd.slot {
                MATRIX_SLOT_MODEL => state.model = m,
                MATRIX_SLOT_VIEW => state.view = m,
                MATRIX_SLOT_PROJECTION => state.projection = m,
                slot => return Err(GpuFault::general(format!("unknown matrix slot {slot}"))),
            }
            Ok(())
        }
        CmdId::LookAt3D => {
            let cmd: LookAt3D = ctx.decode()?;
            ctx.instance.render3d.view =
                Mat4::look_at_rh(Vec3::from(cmd.eye), Vec3::from(cmd.target), Vec3::from(cmd.up));
            Ok(())
        }
        CmdId::DrawTriTex => {
            let cmd: DrawTriTex = ctx.decode()?;
            let state = &mut ctx.instance.render3d;
            state.tris += 1;
            let projected: Option<Vec<(i32, i32)>> = cmd.v.iter().map(|v| state.project(*v)).collect();
            let Some(points) = projected else {
                return Ok(());
            };
            let col = if cmd.col != 0 { cmd.col } else { state.col };
            for i in 0..3 {
                handlers::draw_line(ctx.tile, points[i], points[(i + 1) % 3], col);
            }
            Ok(())
        }
        other => Err(GpuFault::general(format!("{} is not a 3D command", other.name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_projects_to_centre() {
        let mut state = Render3dState::default();
        state.init(60.0, 0.1, 100.0).unwrap();
        state.view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        assert_eq!(state.project([0.0, 0.0, 0.0]), Some((160, 120)));
    }

    #[test]
    fn behind_camera_is_dropped() {
        let mut state = Render3dState::default();
        state.init(60.0, 0.1, 100.0).unwrap();
        assert_eq!(state.project([0.0, 0.0, 5.0]), None);
    }

    #[test]
    fn rejects_bad_projection() {
        let mut state = Render3dState::default();
        assert!(state.init(60.0, 1.0, 0.5).is_err());
    }
}
