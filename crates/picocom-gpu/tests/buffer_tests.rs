//! Buffer table tests: creation rules, bounds, locking and flash-backed
//! uploads that span several pages.

use picocom_gpu::buffers::BufferTable;
use picocom_gpu::error::{BufferError, FlashError};
use picocom_gpu::flash::{FlashPageWriter, MemoryFlash, DEFAULT_WRITE_CEILING, FLASH_PAGE_SIZE};
use picocom_gpu::protocol::cmds::{CreateBuffer, NO_BUFFER};
use picocom_gpu::protocol::{BufferArena, TextureFormat, WriteFlags};

const RAM_SIZE: usize = 1024;

fn table() -> BufferTable {
    let flash = FlashPageWriter::new(Box::new(MemoryFlash::new(3 * FLASH_PAGE_SIZE)), DEFAULT_WRITE_CEILING);
    BufferTable::new(RAM_SIZE, Some(flash))
}

fn ram_buffer(id: u16, offset: u32, size: u32) -> CreateBuffer {
    CreateBuffer {
        arena: BufferArena::Ram0 as u8,
        buffer_id: id,
        mem_offset: offset,
        mem_size: size,
        format: TextureFormat::Rgb16 as u8,
        width: 4,
        height: 8,
        parent: NO_BUFFER,
    }
}

fn flash_buffer(id: u16, offset: u32, size: u32) -> CreateBuffer {
    CreateBuffer {
        arena: BufferArena::Flash0 as u8,
        format: TextureFormat::None as u8,
        width: 0,
        height: 0,
        ..ram_buffer(id, offset, size)
    }
}

// ============================================================================
// Creation
// ============================================================================

mod create_tests {
    use super::*;

    #[test]
    fn rejects_ids_past_table() {
        let mut t = table();
        assert_eq!(t.create(&ram_buffer(300, 0, 8)), Err(BufferError::InvalidId(300)));
        assert_eq!(t.get(300).err(), Some(BufferError::InvalidId(300)));
        assert_eq!(t.get(20).err(), Some(BufferError::NotCreated(20)));
    }

    #[test]
    fn rejects_ranges_outside_arena() {
        let mut t = table();
        assert!(matches!(
            t.create(&ram_buffer(16, 1000, 100)),
            Err(BufferError::OutOfBounds { .. })
        ));
        assert_eq!(t.live_count(), 0);
    }

    #[test]
    fn range_ending_at_arena_end_is_accepted() {
        let mut t = table();
        assert_eq!(
            t.create(&ram_buffer(16, 1001, 24)),
            Err(BufferError::OutOfBounds {
                offset: 1001,
                size: 24,
                limit: RAM_SIZE as u32
            })
        );
        t.create(&ram_buffer(16, 1000, 24)).expect("exact fit");
        assert_eq!(t.get(16).expect("buffer").size, 24);
    }

    #[test]
    fn rejects_overlapping_roots() {
        let mut t = table();
        t.create(&ram_buffer(16, 128, 64)).expect("create");
        assert_eq!(
            t.create(&ram_buffer(17, 150, 10)),
            Err(BufferError::Overlap { id: 17, other: 16 })
        );
        t.create(&ram_buffer(17, 192, 10)).expect("adjacent buffer");
    }

    #[test]
    fn child_views_parent_bytes() {
        let mut t = table();
        t.create(&ram_buffer(16, 128, 64)).expect("create parent");
        let child = CreateBuffer {
            mem_offset: 8,
            mem_size: 8,
            parent: 16,
            ..ram_buffer(17, 0, 0)
        };
        t.create(&child).expect("create child");
        assert_eq!(t.get(17).expect("child").offset, 136);

        let bytes: Vec<u8> = (0..64).collect();
        t.write(16, 0, &bytes, WriteFlags::empty()).expect("write");
        assert_eq!(t.data(17).expect("child data"), &bytes[8..16]);

        let too_big = CreateBuffer {
            mem_offset: 60,
            mem_size: 8,
            parent: 16,
            ..ram_buffer(18, 0, 0)
        };
        assert!(matches!(t.create(&too_big), Err(BufferError::OutOfBounds { .. })));
    }

    #[test]
    fn flash_needs_device_and_alignment() {
        let mut no_flash = BufferTable::new(RAM_SIZE, None);
        assert_eq!(no_flash.create(&flash_buffer(16, 0, 16)), Err(BufferError::NoFlash));

        let mut t = table();
        assert_eq!(t.create(&flash_buffer(16, 100, 16)), Err(BufferError::Unaligned(100)));
    }

    #[test]
    fn reset_drops_everything() {
        let mut t = table();
        t.create(&ram_buffer(16, 128, 64)).expect("create");
        t.write(16, 0, &[9; 4], WriteFlags::empty()).expect("write");
        t.reset();
        assert_eq!(t.live_count(), 0);
        assert!(t.ram().region(128, 4).expect("region").iter().all(|b| *b == 0));
    }
}

// ============================================================================
// Writes
// ============================================================================

mod write_tests {
    use super::*;

    #[test]
    fn ram_round_trip() {
        let mut t = table();
        t.create(&ram_buffer(16, 128, 64)).expect("create");
        t.write(16, 4, &[1, 2, 3], WriteFlags::empty()).expect("write");
        assert_eq!(t.read(16, 3, 5).expect("read"), &[0, 1, 2, 3, 0]);
        assert_eq!(t.get(16).expect("buffer").write_count, 1);
    }

    #[test]
    fn write_past_end_is_rejected_without_side_effects() {
        let mut t = table();
        t.create(&ram_buffer(16, 128, 64)).expect("create");
        t.create(&ram_buffer(17, 192, 64)).expect("neighbour");

        assert_eq!(
            t.write(16, 60, &[0xEE; 8], WriteFlags::empty()),
            Err(BufferError::OutOfBounds {
                offset: 60,
                size: 8,
                limit: 64
            })
        );
        assert_eq!(t.get(16).expect("buffer").write_count, 0);
        assert!(t.data(17).expect("neighbour data").iter().all(|b| *b == 0));

        // The last bytes of the buffer are still writable.
        t.write(16, 56, &[0xEE; 8], WriteFlags::empty()).expect("exact fit");
    }

    #[test]
    fn read_past_end_is_rejected() {
        let mut t = table();
        t.create(&ram_buffer(16, 128, 64)).expect("create");
        assert!(matches!(t.read(16, 0, 65), Err(BufferError::OutOfBounds { .. })));
    }

    #[test]
    fn final_page_locks_ram_buffer() {
        let mut t = table();
        t.create(&ram_buffer(16, 128, 64)).expect("create");
        t.write(16, 0, &[1], WriteFlags::FINAL_PAGE).expect("final write");
        assert!(t.get(16).expect("buffer").locked);
        assert_eq!(t.write(16, 0, &[2], WriteFlags::empty()), Err(BufferError::Locked(16)));
        assert_eq!(t.read(16, 0, 1).expect("read"), &[1]);
    }

    #[test]
    fn lock_writes_freezes_ram_buffer() {
        let mut t = table();
        t.create(&ram_buffer(16, 128, 64)).expect("create");
        t.write(16, 0, &[1], WriteFlags::empty()).expect("plain write");
        assert!(!t.get(16).expect("buffer").locked);
        t.write(16, 0, &[2], WriteFlags::LOCK_WRITES).expect("locking write");
        assert_eq!(t.write(16, 0, &[3], WriteFlags::empty()), Err(BufferError::Locked(16)));
        assert_eq!(t.read(16, 0, 1).expect("read"), &[2]);
    }

    #[test]
    fn flash_upload_spans_three_pages() {
        let mut t = table();
        let bytes: Vec<u8> = (0..8200u32).map(|i| (i % 251) as u8).collect();
        t.create(&flash_buffer(16, 0, bytes.len() as u32)).expect("create");

        // Second chunk crosses the first page boundary, third the second.
        t.write(16, 0, &bytes[..3000], WriteFlags::FIRST_PAGE).expect("chunk 1");
        t.write(16, 3000, &bytes[3000..7000], WriteFlags::COMMIT_PAGE)
            .expect("chunk 2");
        t.write(
            16,
            7000,
            &bytes[7000..],
            WriteFlags::COMMIT_PAGE | WriteFlags::FINAL_PAGE,
        )
        .expect("chunk 3");

        let flash = t.flash().expect("flash attached");
        assert_eq!(flash.stats().pages_programmed, 3);
        assert_eq!(flash.remaining_budget(), DEFAULT_WRITE_CEILING - 3);
        assert_eq!(t.data(16).expect("data"), &bytes[..]);

        let buffer = t.get(16).expect("buffer");
        assert!(buffer.locked);
        assert_eq!(buffer.final_write_count, 1);
        assert_eq!(t.write(16, 0, &[0], WriteFlags::empty()), Err(BufferError::Locked(16)));
    }

    #[test]
    fn flash_upload_in_two_chunks_crossing_a_page() {
        let mut t = table();
        let bytes: Vec<u8> = (0..8200u32).map(|i| (i % 253) as u8).collect();
        t.create(&flash_buffer(16, 0, bytes.len() as u32)).expect("create");

        t.write(16, 0, &bytes[..4100], WriteFlags::FIRST_PAGE).expect("chunk 1");
        t.write(16, 4100, &bytes[4100..], WriteFlags::FINAL_PAGE).expect("chunk 2");

        let flash = t.flash().expect("flash attached");
        assert_eq!(flash.stats().pages_programmed, 3);
        assert_eq!(flash.remaining_budget(), DEFAULT_WRITE_CEILING - 3);
        assert_eq!(t.data(16).expect("data"), &bytes[..]);
        assert!(t.get(16).expect("buffer").locked);
        assert_eq!(t.get(16).expect("buffer").write_count, 2);
    }

    #[test]
    fn flash_chunks_must_arrive_in_order() {
        let mut t = table();
        t.create(&flash_buffer(16, 0, 2 * FLASH_PAGE_SIZE as u32)).expect("create");
        t.write(16, 0, &[1; 100], WriteFlags::FIRST_PAGE).expect("chunk 1");
        assert_eq!(
            t.write(16, 300, &[2; 100], WriteFlags::empty()),
            Err(BufferError::Flash(FlashError::OutOfSequence {
                offset: 300,
                expected: 100
            }))
        );
        assert_eq!(t.get(16).expect("buffer").write_count, 1);
        assert_eq!(t.flash().expect("flash").stats().blocks_staged, 1);
    }

    #[test]
    fn rejected_multi_page_chunk_stages_nothing() {
        let mut t = table();
        t.create(&flash_buffer(16, 0, 2 * FLASH_PAGE_SIZE as u32)).expect("create");
        t.write(16, 0, &[1; 100], WriteFlags::FIRST_PAGE).expect("chunk 1");
        assert!(t.write(16, 200, &[2; 5000], WriteFlags::empty()).is_err());

        let flash = t.flash().expect("flash");
        assert_eq!(flash.stats().pages_programmed, 0);
        assert_eq!(flash.expected_offset(), 100);
        assert_eq!(t.get(16).expect("buffer").write_count, 1);
    }
}

// ============================================================================
// Flash write budget
// ============================================================================

mod budget_tests {
    use super::*;

    const SIZE: usize = 8200;

    fn upload(t: &mut BufferTable, bytes: &[u8]) {
        t.create(&flash_buffer(16, 0, bytes.len() as u32)).expect("create");
        t.write(16, 0, &bytes[..4100], WriteFlags::FIRST_PAGE).expect("chunk 1");
        t.write(16, 4100, &bytes[4100..], WriteFlags::FINAL_PAGE).expect("chunk 2");
    }

    fn pattern() -> Vec<u8> {
        (0..SIZE as u32).map(|i| (i * 13) as u8).collect()
    }

    #[test]
    fn identical_reupload_costs_nothing() {
        let mut t = table();
        let bytes = pattern();
        upload(&mut t, &bytes);
        let before = t.flash().expect("flash").remaining_budget();

        t.reset();
        upload(&mut t, &bytes);

        let flash = t.flash().expect("flash");
        assert_eq!(flash.remaining_budget(), before);
        assert_eq!(flash.stats().pages_skipped, 3);
        assert_eq!(t.data(16).expect("data"), &bytes[..]);
    }

    #[test]
    fn only_changed_pages_are_charged() {
        let mut t = table();
        let mut bytes = pattern();
        upload(&mut t, &bytes);
        let before = t.flash().expect("flash").remaining_budget();

        // One byte in the middle page.
        bytes[5000] ^= 0xFF;
        t.reset();
        upload(&mut t, &bytes);

        let flash = t.flash().expect("flash");
        assert_eq!(flash.remaining_budget(), before - 1);
        assert_eq!(flash.stats().pages_skipped, 2);
        assert_eq!(t.data(16).expect("data"), &bytes[..]);
    }
}
