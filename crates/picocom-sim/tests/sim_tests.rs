//! Simulator tests: demo frames through the full pipeline, PPM output and
//! the command listing.

use picocom_gpu::color::WHITE;
use picocom_gpu::protocol::BufferArena;
use picocom_sim::demo::{sprite_texel, BAND_COLORS, SPRITE_Y};
use picocom_sim::ppm::{ppm_header, rgb888};
use picocom_sim::{dump_scene, SimConfig, Simulator, MAX_POOL_SIZE};

const PIXEL_BYTES: usize = 320 * 240 * 3;

// ============================================================================
// Running frames
// ============================================================================

mod run_tests {
    use super::*;

    #[test]
    fn frames_are_presented() {
        let mut sim = Simulator::new(&SimConfig::default());
        let report = sim.run(3).expect("run");
        assert_eq!(report.frames, 3);
        assert_eq!(report.flips, 3);
        assert_eq!(report.vdp2.frames, 3);
        assert_eq!(report.vdp1.errors, 0);
        assert_eq!(report.vdp2.errors, 0);
    }

    #[test]
    fn scene_reaches_the_display() {
        let mut sim = Simulator::new(&SimConfig::default());
        sim.run(1).expect("run");
        let fb = sim.framebuffer();
        // Frame 0 puts the sprite at the left edge.
        assert_eq!(fb.front_pixel(0, SPRITE_Y as i32), Some(sprite_texel(0, 0)));
        assert_eq!(fb.front_pixel(4, SPRITE_Y as i32), Some(sprite_texel(4, 0)));
        assert_eq!(fb.front_pixel(0, 0), Some(WHITE));
        assert_eq!(fb.front_pixel(300, 10), Some(BAND_COLORS[0]));
        assert_eq!(fb.front_pixel(300, 200), Some(BAND_COLORS[4]));
    }

    #[test]
    fn sprite_moves_between_frames() {
        let mut sim = Simulator::new(&SimConfig::default());
        sim.run(2).expect("run");
        let fb = sim.framebuffer();
        assert_eq!(fb.front_pixel(0, SPRITE_Y as i32), Some(BAND_COLORS[2]));
        assert_eq!(fb.front_pixel(7, SPRITE_Y as i32), Some(sprite_texel(0, 0)));
    }

    #[test]
    fn flash_sprite_programs_one_page() {
        let config = SimConfig {
            sprite_arena: BufferArena::Flash0,
            ..SimConfig::default()
        };
        let mut sim = Simulator::new(&config);
        let report = sim.run(1).expect("run");
        assert_eq!(report.vdp1_pages_programmed, 1);
        assert_eq!(
            sim.framebuffer().front_pixel(4, SPRITE_Y as i32),
            Some(sprite_texel(4, 0))
        );
    }

    #[test]
    fn assets_are_uploaded_once() {
        let mut sim = Simulator::new(&SimConfig::default());
        let first = sim.load_assets().expect("load");
        sim.run(2).expect("run");
        assert_eq!(sim.load_assets().expect("reload"), first);
        assert_eq!(first, 16);
    }

    #[test]
    fn pool_size_is_clamped() {
        for (requested, expected) in [(0, 1), (3, 3), (100, MAX_POOL_SIZE)] {
            let mut sim = Simulator::new(&SimConfig {
                pool_size: requested,
                ..SimConfig::default()
            });
            assert_eq!(sim.client_mut().config().pool_size, expected);
        }
    }
}

// ============================================================================
// Output
// ============================================================================

mod output_tests {
    use super::*;

    #[test]
    fn ppm_has_header_and_every_pixel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frame.ppm");

        let mut sim = Simulator::new(&SimConfig::default());
        sim.run(1).expect("run");
        sim.write_ppm(&path).expect("write");

        let bytes = std::fs::read(&path).expect("read back");
        let header = ppm_header();
        assert_eq!(header, "P6\n320 240\n255\n");
        assert_eq!(bytes.len(), header.len() + PIXEL_BYTES);
        assert!(bytes.starts_with(header.as_bytes()));
        // Top-left pixel is the start of the white diagonal.
        assert_eq!(&bytes[header.len()..header.len() + 3], &rgb888(WHITE));
    }

    #[test]
    fn unwritable_path_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("frame.ppm");
        let sim = Simulator::new(&SimConfig::default());
        assert!(matches!(sim.write_ppm(&path), Err(picocom_sim::SimError::Io(_))));
    }

    #[test]
    fn dump_lists_every_scene_command() {
        let listing = dump_scene(0).expect("dump");
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 7);
        assert!(lines[0].contains("[*----]"));
        assert!(lines[5].contains("[*****]"));
        assert!(lines[6].contains("[--*--]"));
        assert!(!listing.contains("corrupt"));
    }
}
