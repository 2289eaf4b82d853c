//! Flash page writer tests against the RAM-backed flash device.

use picocom_gpu::error::FlashError;
use picocom_gpu::flash::{FlashPageWriter, FlushOutcome, MemoryFlash, FLASH_ERASED, FLASH_PAGE_SIZE};

const PAGE: u32 = FLASH_PAGE_SIZE as u32;

fn writer(pages: usize, ceiling: u32) -> FlashPageWriter {
    FlashPageWriter::new(Box::new(MemoryFlash::new(pages * FLASH_PAGE_SIZE)), ceiling)
}

// ============================================================================
// Sequential writes
// ============================================================================

mod sequence_tests {
    use super::*;

    #[test]
    fn full_page_flushes_itself() {
        let mut w = writer(2, 16);
        w.begin(0).expect("begin");
        w.next_write_block(0, &[0xAA; FLASH_PAGE_SIZE]).expect("write");
        assert_eq!(w.stats().pages_programmed, 1);
        assert_eq!(w.expected_offset(), PAGE);
        assert_eq!(w.get(0, 4).expect("read"), &[0xAA; 4]);
    }

    #[test]
    fn partial_page_is_padded_with_erased_bytes() {
        let mut w = writer(2, 16);
        w.begin(PAGE).expect("begin");
        w.next_write_block(PAGE, &[1, 2, 3]).expect("write");
        assert_eq!(w.stats().pages_programmed, 0);
        assert_eq!(w.end().expect("end"), FlushOutcome::Programmed);
        assert_eq!(
            w.get(PAGE, 5).expect("read"),
            &[1, 2, 3, FLASH_ERASED, FLASH_ERASED]
        );
        assert_eq!(w.end().expect("end"), FlushOutcome::Idle);
    }

    #[test]
    fn out_of_sequence_write_changes_nothing() {
        let mut w = writer(1, 16);
        w.begin(0).expect("begin");
        w.next_write_block(0, &[5; 100]).expect("write");
        assert_eq!(
            w.next_write_block(200, &[6; 10]),
            Err(FlashError::OutOfSequence {
                offset: 200,
                expected: 100
            })
        );
        assert_eq!(w.expected_offset(), 100);
        assert_eq!(w.stats().blocks_staged, 1);
    }

    #[test]
    fn block_may_not_cross_a_page() {
        let mut w = writer(2, 16);
        w.begin(0).expect("begin");
        w.next_write_block(0, &[0; 4000]).expect("write");
        assert_eq!(
            w.next_write_block(4000, &[0; 200]),
            Err(FlashError::PageOverflow {
                offset: 4000,
                size: 200
            })
        );
        assert_eq!(w.expected_offset(), 4000);
    }

    #[test]
    fn begin_needs_page_alignment() {
        let mut w = writer(1, 16);
        assert_eq!(w.begin(100), Err(FlashError::Unaligned(100)));
        assert!(matches!(w.begin(PAGE), Err(FlashError::OutOfRange { .. })));
    }
}

// ============================================================================
// Idempotence and budget
// ============================================================================

mod budget_tests {
    use super::*;

    #[test]
    fn unchanged_page_is_not_reprogrammed() {
        let mut w = writer(1, 16);
        for _ in 0..2 {
            w.begin(0).expect("begin");
            w.next_write_block(0, &[7; FLASH_PAGE_SIZE]).expect("write");
        }
        let stats = w.stats();
        assert_eq!(stats.pages_programmed, 1);
        assert_eq!(stats.pages_skipped, 1);
        assert_eq!(w.remaining_budget(), 15);
    }

    #[test]
    fn ceiling_stops_new_streams() {
        let mut w = writer(2, 1);
        w.begin(0).expect("begin");
        w.next_write_block(0, &[1; FLASH_PAGE_SIZE]).expect("write");
        assert_eq!(w.remaining_budget(), 0);
        assert_eq!(w.begin(PAGE), Err(FlashError::BudgetExhausted { ceiling: 1 }));
    }

    #[test]
    fn ceiling_stops_partial_page_commit() {
        let mut w = writer(2, 1);
        w.begin(0).expect("begin");
        w.next_write_block(0, &[1; FLASH_PAGE_SIZE]).expect("first page");
        w.next_write_block(PAGE, &[2; 16]).expect("staged");
        assert_eq!(w.end(), Err(FlashError::BudgetExhausted { ceiling: 1 }));
        assert_eq!(w.get(PAGE, 1).expect("read"), &[FLASH_ERASED]);
    }
}
