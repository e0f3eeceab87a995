//! Page checksum calculation and validation.
//!
//! Three wire formats are recognized: `Crc32` (default for new pages), the
//! legacy fold-based `Innodb` polynomial, and `None` (a magic constant).
//! Non-strict settings accept a page that validates under *any* of the three
//! so that a tablespace can migrate between algorithms online; strict
//! settings accept only their own format.

use crate::page::{
    Lsn, Page, FIELD_CHECKSUM, FIELD_LSN, FIELD_TRAILER_CHECKSUM, FIELD_TRAILER_LSN_LOW,
    PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_TRAILER_SIZE,
};

/// Stored in both checksum fields when checksumming is disabled.
pub const NO_CHECKSUM_MAGIC: u32 = 0xDEAD_BEEF;

/// End of the header range covered by the legacy "old" checksum.
const OLD_CHECKSUM_END: usize = 26;

const FOLD_MASK1: u32 = 1_463_735_687;
const FOLD_MASK2: u32 = 1_653_893_711;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Crc32,
    Innodb,
    None,
    StrictCrc32,
    StrictInnodb,
    StrictNone,
}

impl ChecksumAlgorithm {
    pub fn is_strict(&self) -> bool {
        matches!(
            self,
            ChecksumAlgorithm::StrictCrc32
                | ChecksumAlgorithm::StrictInnodb
                | ChecksumAlgorithm::StrictNone
        )
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crc32" => Ok(ChecksumAlgorithm::Crc32),
            "innodb" => Ok(ChecksumAlgorithm::Innodb),
            "none" => Ok(ChecksumAlgorithm::None),
            "strict_crc32" => Ok(ChecksumAlgorithm::StrictCrc32),
            "strict_innodb" => Ok(ChecksumAlgorithm::StrictInnodb),
            "strict_none" => Ok(ChecksumAlgorithm::StrictNone),
            other => Err(format!("unknown checksum algorithm: {other}")),
        }
    }
}

#[inline]
fn fold_pair(n1: u32, n2: u32) -> u32 {
    (((n1 ^ n2 ^ FOLD_MASK2) << 8)
        .wrapping_add(n1)
        ^ FOLD_MASK1)
        .wrapping_add(n2)
}

fn fold_bytes(bytes: &[u8]) -> u32 {
    let mut fold = 0u32;
    for &b in bytes {
        fold = fold_pair(fold, b as u32);
    }
    fold
}

/// CRC32 over the two ranges that exclude the checksum fields themselves and
/// the trailer.
fn crc32_checksum(page: &Page) -> u32 {
    let header = crc32fast::hash(&page[FIELD_CHECKSUM + 4..OLD_CHECKSUM_END]);
    let body = crc32fast::hash(&page[PAGE_HEADER_SIZE..PAGE_SIZE - PAGE_TRAILER_SIZE]);
    header ^ body
}

/// Legacy checksum stored in the header field: fold of the header past the
/// checksum word plus the fold of the payload.
fn legacy_new_checksum(page: &Page) -> u32 {
    fold_bytes(&page[FIELD_CHECKSUM + 4..OLD_CHECKSUM_END])
        .wrapping_add(fold_bytes(
            &page[PAGE_HEADER_SIZE..PAGE_SIZE - PAGE_TRAILER_SIZE],
        ))
}

/// Legacy checksum stored in the trailer: fold of the first 26 header bytes,
/// *including* the header checksum field. Must therefore be computed after
/// the header field is stamped.
fn legacy_old_checksum(page: &Page) -> u32 {
    fold_bytes(&page[..OLD_CHECKSUM_END])
}

/// Stamps `lsn` and the checksum fields for the configured algorithm.
/// Strict and non-strict settings write the same format.
pub fn stamp(page: &mut Page, algorithm: ChecksumAlgorithm, lsn: Lsn) {
    page.set_lsn(lsn);
    match algorithm {
        ChecksumAlgorithm::Crc32 | ChecksumAlgorithm::StrictCrc32 => {
            let c = crc32_checksum(page);
            page.write_u32(FIELD_CHECKSUM, c);
            page.write_u32(FIELD_TRAILER_CHECKSUM, c);
        }
        ChecksumAlgorithm::Innodb | ChecksumAlgorithm::StrictInnodb => {
            page.write_u32(FIELD_CHECKSUM, legacy_new_checksum(page));
            page.write_u32(FIELD_TRAILER_CHECKSUM, legacy_old_checksum(page));
        }
        ChecksumAlgorithm::None | ChecksumAlgorithm::StrictNone => {
            page.write_u32(FIELD_CHECKSUM, NO_CHECKSUM_MAGIC);
            page.write_u32(FIELD_TRAILER_CHECKSUM, NO_CHECKSUM_MAGIC);
        }
    }
}

fn matches_crc32(page: &Page) -> bool {
    let c = crc32_checksum(page);
    page.read_u32(FIELD_CHECKSUM) == c && page.read_u32(FIELD_TRAILER_CHECKSUM) == c
}

fn matches_legacy(page: &Page) -> bool {
    page.read_u32(FIELD_CHECKSUM) == legacy_new_checksum(page)
        && page.read_u32(FIELD_TRAILER_CHECKSUM) == legacy_old_checksum(page)
}

fn matches_none(page: &Page) -> bool {
    page.read_u32(FIELD_CHECKSUM) == NO_CHECKSUM_MAGIC
        && page.read_u32(FIELD_TRAILER_CHECKSUM) == NO_CHECKSUM_MAGIC
}

/// Validates a page read from disk. An all-zero page is valid (never
/// written). The trailer must mirror the low word of the header LSN, and the
/// checksum fields must match a format the configured algorithm accepts.
pub fn validate(page: &Page, algorithm: ChecksumAlgorithm) -> bool {
    if page.iter().all(|&b| b == 0) {
        return true;
    }
    // Torn-write check.
    if page.read_u32(FIELD_TRAILER_LSN_LOW) != page.read_u64(FIELD_LSN) as u32 {
        return false;
    }
    match algorithm {
        ChecksumAlgorithm::StrictCrc32 => matches_crc32(page),
        ChecksumAlgorithm::StrictInnodb => matches_legacy(page),
        ChecksumAlgorithm::StrictNone => matches_none(page),
        ChecksumAlgorithm::Crc32 | ChecksumAlgorithm::Innodb | ChecksumAlgorithm::None => {
            matches_crc32(page) || matches_legacy(page) || matches_none(page)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageId;

    fn sample_page() -> Page {
        let mut page = Page::new_empty();
        page.set_id(PageId::new(7, 9));
        page[100] = 0x5A;
        page[PAGE_SIZE - 100] = 0xA5;
        page
    }

    #[test]
    fn test_stamp_validate_roundtrip() {
        for algo in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Innodb,
            ChecksumAlgorithm::None,
        ] {
            let mut page = sample_page();
            stamp(&mut page, algo, 42);
            assert!(validate(&page, algo), "{algo:?}");
            assert_eq!(page.lsn(), 42);
        }
    }

    #[test]
    fn test_cross_algorithm_acceptance() {
        // A legacy-stamped page is accepted by non-strict crc32 but rejected
        // by strict crc32.
        let mut page = sample_page();
        stamp(&mut page, ChecksumAlgorithm::Innodb, 7);
        assert!(validate(&page, ChecksumAlgorithm::Crc32));
        assert!(!validate(&page, ChecksumAlgorithm::StrictCrc32));
        assert!(validate(&page, ChecksumAlgorithm::StrictInnodb));
    }

    #[test]
    fn test_corruption_detected() {
        let mut page = sample_page();
        stamp(&mut page, ChecksumAlgorithm::Crc32, 7);
        page[200] ^= 0xFF;
        assert!(!validate(&page, ChecksumAlgorithm::Crc32));
    }

    #[test]
    fn test_torn_write_detected() {
        let mut page = sample_page();
        stamp(&mut page, ChecksumAlgorithm::Crc32, 0x1_0000_0007);
        // Clobber the trailer LSN mirror only.
        page.write_u32(FIELD_TRAILER_LSN_LOW, 3);
        assert!(!validate(&page, ChecksumAlgorithm::Crc32));
    }

    #[test]
    fn test_zero_page_valid() {
        let page = Page::new_empty();
        assert!(validate(&page, ChecksumAlgorithm::StrictCrc32));
    }

    #[test]
    fn test_magic_rejected_by_strict() {
        let mut page = sample_page();
        page.set_lsn(1);
        page.write_u32(FIELD_CHECKSUM, NO_CHECKSUM_MAGIC);
        page.write_u32(FIELD_TRAILER_CHECKSUM, NO_CHECKSUM_MAGIC);
        assert!(validate(&page, ChecksumAlgorithm::Crc32));
        assert!(!validate(&page, ChecksumAlgorithm::StrictCrc32));
    }
}
