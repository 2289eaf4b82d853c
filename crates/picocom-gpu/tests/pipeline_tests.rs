//! End-to-end tests: app-core client -> VDP1 -> VDP2 over loopback links.
//!
//! A service hook on the client's endpoint polls both cores, so every
//! blocking call on the client drives the whole pipeline on one thread.

use std::cell::RefCell;
use std::rc::Rc;

use picocom_gpu::client::{ClientConfig, SubmissionClient};
use picocom_gpu::color::{self, BLACK, GREEN, RED};
use picocom_gpu::error::ClientError;
use picocom_gpu::flash::{MemoryFlash, FLASH_PAGE_SIZE};
use picocom_gpu::gpu::GpuConfig;
use picocom_gpu::loopback::{self, LoopbackEndpoint, Service};
use picocom_gpu::protocol::cmds::BlitRect;
use picocom_gpu::protocol::{BlendMode, BufferArena, ColorDepth, CompleteFlags, TextureFormat};
use picocom_gpu::tile::ALL_TILES;
use picocom_gpu::upload::{upload_buffer, BufferAllocator, Vdp};
use picocom_gpu::vdp::{Vdp1Core, Vdp2Core};
use picocom_hal::FlashDevice;

const FLASH_PAGES: usize = 4;

struct Rig {
    client: SubmissionClient<LoopbackEndpoint, 2>,
    alloc: BufferAllocator,
    vdp1: Rc<RefCell<Vdp1Core<LoopbackEndpoint>>>,
    vdp2: Rc<RefCell<Vdp2Core<LoopbackEndpoint>>>,
}

fn flash() -> Option<Box<dyn FlashDevice + Send + Sync>> {
    Some(Box::new(MemoryFlash::new(FLASH_PAGES * FLASH_PAGE_SIZE)))
}

fn rig() -> Rig {
    let (mut app, vdp1_host) = loopback::link();
    let (vdp1_out, vdp2_in) = loopback::link();
    let config = GpuConfig::default();
    let vdp1 = Rc::new(RefCell::new(Vdp1Core::new(vdp1_host, vdp1_out, &config, flash())));
    let vdp2 = Rc::new(RefCell::new(Vdp2Core::new(vdp2_in, &config, flash())));

    let (v1, v2) = (vdp1.clone(), vdp2.clone());
    let service: Service = Rc::new(RefCell::new(move || {
        v1.borrow_mut().poll().expect("vdp1 poll");
        v2.borrow_mut().poll().expect("vdp2 poll");
    }));
    app.set_service(service);

    Rig {
        client: SubmissionClient::new(app, ClientConfig::default()),
        alloc: BufferAllocator::new(config.ram_arena_size as u32, (FLASH_PAGES * FLASH_PAGE_SIZE) as u32),
        vdp1,
        vdp2,
    }
}

fn solid_texture(w: usize, h: usize, col: u16) -> Vec<u8> {
    (0..w * h).flat_map(|_| col.to_le_bytes()).collect()
}

/// Texel colour that encodes its own position.
fn texel(x: usize, y: usize) -> u16 {
    color::rgb(x as u8, y as u8, 31)
}

fn coordinate_texture(w: usize, h: usize) -> Vec<u8> {
    (0..w * h).flat_map(|i| texel(i % w, i / w).to_le_bytes()).collect()
}

// ============================================================================
// Drawing
// ============================================================================

mod draw_tests {
    use super::*;

    #[test]
    fn blit_lands_on_display() {
        let mut rig = rig();
        let texture = coordinate_texture(16, 16);
        let id = upload_buffer(
            &mut rig.client,
            &mut rig.alloc,
            Vdp::Vdp1,
            BufferArena::Ram0,
            &texture,
            TextureFormat::Rgb16,
            16,
            16,
        )
        .expect("upload");

        let c = &mut rig.client;
        c.begin_frame(ALL_TILES, CompleteFlags::FLIP_DISPLAY).expect("begin");
        c.set_default_blend(BlendMode::None);
        c.fill_rect(0, 0, 320, 240, BLACK, BlendMode::None, 255).expect("fill");
        c.blit(&BlitRect {
            buffer_id: id as u8,
            dst_x: 10,
            dst_y: 10,
            w: 16,
            h: 16,
            blend: BlendMode::None as u8,
            ..BlitRect::default()
        })
        .expect("blit");
        c.end_frame(true, true).expect("end frame");

        let vdp2 = rig.vdp2.borrow();
        let fb = vdp2.framebuffer();
        assert_eq!(fb.flips(), 1);
        for (x, y) in [(0, 0), (15, 0), (0, 15), (15, 15), (3, 9)] {
            assert_eq!(
                fb.front_pixel(10 + x as i32, 10 + y as i32),
                Some(texel(x, y)),
                "texel ({x}, {y})"
            );
        }
        assert_eq!(fb.front_pixel(9, 10), Some(BLACK));
        assert_eq!(fb.front_pixel(26, 26), Some(BLACK));
        assert_eq!(fb.front_pixel(10, 26), Some(BLACK));
        assert_eq!(fb.front_pixel(300, 200), Some(BLACK));
    }

    #[test]
    fn blit_straddling_bands_keeps_rows() {
        let mut rig = rig();
        let texture = coordinate_texture(16, 16);
        let id = upload_buffer(
            &mut rig.client,
            &mut rig.alloc,
            Vdp::Vdp1,
            BufferArena::Ram0,
            &texture,
            TextureFormat::Rgb16,
            16,
            16,
        )
        .expect("upload");

        let c = &mut rig.client;
        c.begin_frame(ALL_TILES, CompleteFlags::FLIP_DISPLAY).expect("begin");
        c.set_default_blend(BlendMode::None);
        c.blit(&BlitRect {
            buffer_id: id as u8,
            dst_x: 100,
            dst_y: 40,
            w: 16,
            h: 16,
            blend: BlendMode::None as u8,
            ..BlitRect::default()
        })
        .expect("blit");
        c.end_frame(true, true).expect("end frame");

        let vdp2 = rig.vdp2.borrow();
        let fb = vdp2.framebuffer();
        // Rows 0..8 land in band 0, rows 8..16 in band 1.
        assert_eq!(fb.front_pixel(100, 47), Some(texel(0, 7)));
        assert_eq!(fb.front_pixel(100, 48), Some(texel(0, 8)));
        assert_eq!(fb.front_pixel(115, 55), Some(texel(15, 15)));
    }

    #[test]
    fn only_last_band_flips() {
        let mut rig = rig();
        let c = &mut rig.client;
        c.begin_frame(0b00011, CompleteFlags::FLIP_DISPLAY).expect("begin");
        c.set_default_blend(BlendMode::None);
        c.fill_rect(0, 0, 320, 96, RED, BlendMode::None, 255).expect("fill");
        c.end_frame(true, true).expect("end frame");

        let vdp2 = rig.vdp2.borrow();
        let fb = vdp2.framebuffer();
        assert_eq!(fb.flips(), 1);
        assert_eq!(fb.front_pixel(0, 0), Some(RED));
        assert_eq!(fb.front_pixel(0, 95), Some(RED));
        // Bands outside the mask are never sent.
        assert_eq!(fb.front_pixel(0, 96), Some(BLACK));
    }

    #[test]
    fn secondary_list_composites_each_band() {
        let mut rig = rig();
        let c = &mut rig.client;
        c.begin_frame(ALL_TILES, CompleteFlags::FLIP_DISPLAY).expect("begin");
        c.fill_rect(0, 0, 320, 240, RED, BlendMode::None, 255).expect("fill");
        c.composite(BlendMode::None, 0).expect("composite");
        c.end_frame(true, true).expect("end frame");

        let vdp2 = rig.vdp2.borrow();
        assert_eq!(vdp2.framebuffer().front_pixel(160, 239), Some(RED));
        assert_eq!(vdp2.perf().errors, 0);
    }

    #[test]
    fn indexed_frame_uses_vdp2_palette() {
        let mut rig = rig();
        let mut palette = solid_texture(256, 1, BLACK);
        palette[6..8].copy_from_slice(&GREEN.to_le_bytes());
        let pal_id = upload_buffer(
            &mut rig.client,
            &mut rig.alloc,
            Vdp::Vdp2,
            BufferArena::Ram0,
            &palette,
            TextureFormat::Rgb16,
            256,
            1,
        )
        .expect("palette upload");
        assert!(rig.vdp1.borrow().state().buffers().get(pal_id).is_err());

        let c = &mut rig.client;
        c.begin_frame(ALL_TILES, CompleteFlags::FLIP_DISPLAY).expect("begin");
        c.set_color_depth(ColorDepth::Indexed8);
        c.set_palette(pal_id);
        c.set_default_blend(BlendMode::None);
        c.fill_rect(0, 0, 320, 240, 3, BlendMode::None, 255).expect("fill");
        c.end_frame(true, true).expect("end frame");

        assert_eq!(rig.vdp2.borrow().framebuffer().front_pixel(100, 100), Some(GREEN));
    }

    #[test]
    fn command_errors_come_back_in_ack() {
        let mut rig = rig();
        let c = &mut rig.client;
        c.begin_frame(ALL_TILES, CompleteFlags::FLIP_DISPLAY).expect("begin");
        c.blit(&BlitRect {
            buffer_id: 99,
            w: 8,
            h: 8,
            ..BlitRect::default()
        })
        .expect("blit");
        match c.end_frame(true, true) {
            Err(ClientError::GpuErrors { errors, .. }) => assert_eq!(errors, 1),
            other => panic!("expected GpuErrors, got {other:?}"),
        }
        assert_eq!(rig.vdp1.borrow().perf().errors, 1);
    }
}

// ============================================================================
// Uploads and status
// ============================================================================

mod upload_tests {
    use super::*;

    #[test]
    fn flash_upload_spans_pages_and_locks() {
        let mut rig = rig();
        let bytes: Vec<u8> = (0..8200u32).map(|i| (i * 7) as u8).collect();
        let id = upload_buffer(
            &mut rig.client,
            &mut rig.alloc,
            Vdp::Vdp1,
            BufferArena::Flash0,
            &bytes,
            TextureFormat::None,
            0,
            0,
        )
        .expect("upload");

        {
            let vdp1 = rig.vdp1.borrow();
            let buffers = vdp1.state().buffers();
            let flash = buffers.flash().expect("flash attached");
            assert_eq!(flash.stats().pages_programmed, 3);
            assert_eq!(buffers.data(id).expect("data"), &bytes[..]);
            assert!(buffers.get(id).expect("buffer").locked);
        }

        // Page rounding leaves no room for a second copy.
        let again = upload_buffer(
            &mut rig.client,
            &mut rig.alloc,
            Vdp::Vdp1,
            BufferArena::Flash0,
            &bytes,
            TextureFormat::None,
            0,
            0,
        );
        assert!(matches!(again, Err(ClientError::ArenaExhausted { vdp: 1, .. })));
    }

    #[test]
    fn status_reports_vdp1_frames() {
        let mut rig = rig();
        let c = &mut rig.client;
        c.begin_frame(ALL_TILES, CompleteFlags::FLIP_DISPLAY).expect("begin");
        c.fill_rect(0, 0, 8, 8, RED, BlendMode::None, 255).expect("fill");
        c.end_frame(true, true).expect("end frame");

        let status = rig.client.get_status().expect("status");
        assert!(status.online);
        assert!(!status.busy);
        assert_eq!(status.counter, 1);
        assert_eq!(status.frames, 1);
    }
}
