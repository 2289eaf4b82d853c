//! Tile executor tests: band culling, the write point, error accounting,
//! extension commands and dry-run validation.

use picocom_gpu::cmd_list::{CommandBuffer, CommandStream};
use picocom_gpu::error::{ExtensionError, GpuErrorCode};
use picocom_gpu::gpu::{validate, CommandContext, Extension, GpuConfig, GpuInstance, GpuState};
use picocom_gpu::protocol::cmds::{CreateBuffer, FillRectCol, RegisterCmd, ResetGpu, WriteBufferData, NO_BUFFER};
use picocom_gpu::protocol::{BufferArena, CmdId, CommandHeader, GpuCommand, TextureFormat, HEADER_SIZE};
use picocom_gpu::tile::{tile_cull_mask, TileFrameBuffer};

const USER_CMD: u8 = 100;

fn state() -> GpuState {
    GpuState::new(1, &GpuConfig::default(), None)
}

fn fill(y: i16, h: i16, col: u16) -> FillRectCol {
    FillRectCol {
        x: 0,
        y,
        w: 320,
        h,
        col,
        a: 255,
        blend: 0,
    }
}

fn push_culled<'a, T: GpuCommand<'a>>(buffer: &mut CommandBuffer, cmd: &T, y: i16, h: i16) {
    buffer
        .push(cmd, Some(tile_cull_mask(y as i32, h as i32)))
        .expect("push");
}

fn push_user_cmd(buffer: &mut CommandBuffer) {
    let mut bytes = [0u8; HEADER_SIZE];
    CommandHeader::new(USER_CMD, HEADER_SIZE as u16)
        .encode(&mut bytes)
        .expect("encode");
    buffer.add(&bytes).expect("add");
}

fn ram_buffer(id: u16) -> CreateBuffer {
    CreateBuffer {
        arena: BufferArena::Ram0 as u8,
        buffer_id: id,
        mem_offset: 128,
        mem_size: 16,
        format: TextureFormat::None as u8,
        width: 0,
        height: 0,
        parent: NO_BUFFER,
    }
}

// ============================================================================
// Culling
// ============================================================================

mod cull_tests {
    use super::*;

    #[test]
    fn fill_only_touches_overlapped_band() {
        let state = state();
        let mut instance = GpuInstance::new(0);
        let mut buffer = CommandBuffer::new(256, 0);
        push_culled(&mut buffer, &fill(100, 10, 0xF800), 100, 10);

        let mut band0 = TileFrameBuffer::band(0);
        let mut band2 = TileFrameBuffer::band(2);
        instance.begin_frame();
        assert_eq!(instance.run_tile(&state, buffer.stream(), &mut band0), 0);
        assert_eq!(instance.run_tile(&state, buffer.stream(), &mut band2), 0);
        let stats = instance.end_frame();

        assert!(band0.pixels.iter().all(|p| *p == 0));
        assert_eq!(band2.pixel(5, 100), Some(0xF800));
        assert_eq!(band2.pixel(5, 99), Some(0));
        assert_eq!(band2.pixel(5, 110), Some(0));
        assert_eq!(stats.cull_count, 1);
        assert_eq!(stats.tile_count, 2);
    }

    #[test]
    fn uncull_commands_run_everywhere() {
        let state = state();
        let mut instance = GpuInstance::new(0);
        let mut buffer = CommandBuffer::new(256, 0);
        buffer.push(&fill(0, 240, 0x001F), None).expect("push");

        for id in 0..5 {
            let mut band = TileFrameBuffer::band(id);
            instance.run_tile(&state, buffer.stream(), &mut band);
            assert!(band.pixels.iter().all(|p| *p == 0x001F));
        }
        assert_eq!(instance.stats.cull_count, 0);
    }
}

// ============================================================================
// Write point
// ============================================================================

mod write_point_tests {
    use super::*;

    #[test]
    fn create_runs_once_on_tile_zero() {
        let state = state();
        let mut buffer = CommandBuffer::new(256, 0);
        buffer.push(&ram_buffer(16), None).expect("push");

        let mut worker = GpuInstance::new(1);
        worker.run_tile(&state, buffer.stream(), &mut TileFrameBuffer::band(0));
        assert!(state.buffers().get(16).is_err());

        let mut instance = GpuInstance::new(0);
        instance.run_tile(&state, buffer.stream(), &mut TileFrameBuffer::band(3));
        assert!(state.buffers().get(16).is_err());

        let errors = instance.run_tile(&state, buffer.stream(), &mut TileFrameBuffer::band(0));
        assert_eq!(errors, 0);
        assert!(state.buffers().get(16).is_ok());
    }

    #[test]
    fn reset_gpu_drops_buffers() {
        let state = state();
        let mut instance = GpuInstance::new(0);
        let mut buffer = CommandBuffer::new(256, 0);
        buffer.push(&ram_buffer(16), None).expect("push");
        buffer
            .push(
                &ResetGpu {
                    cmds: 1,
                    buffers: 1,
                    stats: 0,
                },
                None,
            )
            .expect("push");
        instance.run_tile(&state, buffer.stream(), &mut TileFrameBuffer::band(0));
        assert_eq!(state.buffers().live_count(), 0);
    }
}

// ============================================================================
// Errors and extensions
// ============================================================================

mod extension_tests {
    use super::*;

    #[test]
    fn unbound_command_counts_an_error() {
        let state = state();
        let mut instance = GpuInstance::new(0);
        let mut buffer = CommandBuffer::new(64, 0);
        push_user_cmd(&mut buffer);
        buffer.push(&fill(0, 48, 0x07E0), None).expect("push");

        let mut band = TileFrameBuffer::band(0);
        assert_eq!(instance.run_tile(&state, buffer.stream(), &mut band), 1);
        assert_eq!(instance.stats.last_error, GpuErrorCode::General);
        // Execution carries on after a failed command.
        assert_eq!(band.pixel(0, 0), Some(0x07E0));
    }

    #[test]
    fn registered_extension_runs() {
        let state = state();
        state
            .commands_mut()
            .register(
                USER_CMD,
                Extension::new("fill7", |ctx: &mut CommandContext<'_, '_>| {
                    ctx.tile.pixels.fill(7);
                    Ok(())
                }),
            )
            .expect("register");

        let mut buffer = CommandBuffer::new(64, 0);
        push_user_cmd(&mut buffer);
        let mut band = TileFrameBuffer::band(1);
        assert_eq!(GpuInstance::new(0).run_tile(&state, buffer.stream(), &mut band), 0);
        assert!(band.pixels.iter().all(|p| *p == 7));
    }

    #[test]
    fn builtin_ids_are_reserved() {
        let state = state();
        let result = state
            .commands_mut()
            .register(10, Extension::new("nope", |_: &mut CommandContext<'_, '_>| Ok(())));
        assert_eq!(result, Err(ExtensionError::ReservedId(10)));
    }

    #[test]
    fn register_cmd_binds_catalogued_extension() {
        let state = state();
        state.commands_mut().catalogue(
            0xBEEF,
            Extension::new("stripe", |ctx: &mut CommandContext<'_, '_>| {
                ctx.tile.pixels[0] = 0x1234;
                Ok(())
            }),
        );

        let mut buffer = CommandBuffer::new(256, 0);
        buffer.push(&ram_buffer(16), None).expect("push");
        buffer
            .push(
                &WriteBufferData {
                    buffer_id: 16,
                    flags: 0,
                    offset: 0,
                    allow_non_tile_zero: 0,
                    data: &[0xEF, 0xBE],
                },
                None,
            )
            .expect("push");
        buffer
            .push(
                &RegisterCmd {
                    vdp_id: 1,
                    cmd_id: USER_CMD,
                    buffer_id: 16,
                },
                None,
            )
            .expect("push");
        push_user_cmd(&mut buffer);

        let mut band = TileFrameBuffer::band(0);
        assert_eq!(GpuInstance::new(0).run_tile(&state, buffer.stream(), &mut band), 0);
        assert_eq!(band.pixels[0], 0x1234);
        assert_eq!(state.commands().name(USER_CMD).as_deref(), Some("stripe"));
    }
}

// ============================================================================
// Validation
// ============================================================================

mod validate_tests {
    use super::*;

    #[test]
    fn accepts_well_formed_stream() {
        let state = state();
        let mut buffer = CommandBuffer::new(256, 0);
        buffer.push(&fill(0, 10, 1), None).expect("push");
        buffer.push(&ram_buffer(16), None).expect("push");
        assert_eq!(validate(&state, buffer.stream(), 0), Ok(2));
    }

    #[test]
    fn reports_first_bad_command() {
        let state = state();
        let mut buffer = CommandBuffer::new(256, 0);
        buffer.push(&fill(0, 10, 1), None).expect("push");
        buffer
            .push(
                &FillRectCol {
                    w: -4,
                    ..fill(0, 10, 1)
                },
                None,
            )
            .expect("push");

        let err = validate(&state, buffer.stream(), 3).expect_err("negative width");
        assert_eq!(err.cmd_index, 1);
        assert_eq!(err.cmd_data_offset, fill(0, 10, 1).encoded_len());
        assert_eq!(err.list_index, 3);
    }

    #[test]
    fn corrupt_header_reports_where_the_walk_stopped() {
        let state = state();
        let size = fill(0, 10, 1).encoded_len();
        let mut data = vec![0u8; size + HEADER_SIZE];
        fill(0, 10, 1).encode(None, &mut data[..size]).expect("encode");
        CommandHeader::new(CmdId::FillRectCol as u8, 0)
            .encode(&mut data[size..])
            .expect("encode");

        let err = validate(&state, CommandStream::new(&data, 2), 1).expect_err("zero size");
        assert_eq!(err.cmd_index, 1);
        assert_eq!(err.cmd_data_offset, size);
        assert_eq!(err.list_index, 1);
    }

    #[test]
    fn extension_validator_is_consulted() {
        let state = state();
        state
            .commands_mut()
            .register(
                USER_CMD,
                Extension::new("strict", |_: &mut CommandContext<'_, '_>| Ok(()))
                    .with_validator(|bytes| if bytes.len() > HEADER_SIZE { Ok(()) } else { Err("no payload".into()) }),
            )
            .expect("register");

        let mut buffer = CommandBuffer::new(64, 0);
        push_user_cmd(&mut buffer);
        let err = validate(&state, buffer.stream(), 0).expect_err("validator rejects");
        assert_eq!(err.reason, "no payload");
    }
}
