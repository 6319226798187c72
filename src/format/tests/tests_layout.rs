//! Section-layout validation tests.
//!
//! Coverage:
//! - Valid layouts pass, empty sections are ignored
//! - Astronomical offsets and offset+size overflow rejected
//! - Sections beyond the declared file size rejected
//! - Overlapping sections rejected
//! - Declared file size larger than the physical file rejected;
//!   trailing padding tolerated

#[cfg(test)]
mod tests {
    use crate::format::{FileHeader, FormatError, HEADER_LEN, SectionSpan, VERSION};

    fn valid() -> FileHeader {
        FileHeader {
            version: VERSION,
            file_size: 2048,
            flags: 0,
            data: SectionSpan::new(128, 512),
            dict: SectionSpan::new(640, 256),
            index: SectionSpan::new(896, 256),
            wal: SectionSpan::new(1152, 128),
        }
    }

    /// # Scenario
    /// A well-formed layout with a gap between sections validates.
    #[test]
    fn valid_layout_passes() {
        assert!(valid().validate_layout(2048).is_ok());
    }

    /// # Scenario
    /// Physical file larger than the declared size is trailing padding —
    /// tolerated by contract.
    #[test]
    fn trailing_padding_tolerated() {
        assert!(valid().validate_layout(1 << 20).is_ok());
    }

    /// # Scenario
    /// Declared file size exceeding the physical size means the file was
    /// truncated underneath us.
    #[test]
    fn shrunk_file_rejected() {
        assert!(valid().validate_layout(1024).is_err());
    }

    /// # Scenario
    /// An astronomical offset — the historical garbage-offset failure —
    /// is rejected before any read.
    #[test]
    fn astronomical_offset_rejected() {
        let mut hdr = valid();
        hdr.wal = SectionSpan::new(u64::MAX - 10, 128);
        assert!(matches!(
            hdr.validate_layout(2048),
            Err(FormatError::SectionOutOfBounds { name: "wal", .. })
        ));
    }

    /// # Scenario
    /// `offset + size` overflowing u64 is corruption, not wraparound.
    #[test]
    fn offset_size_overflow_rejected() {
        let mut hdr = valid();
        hdr.index = SectionSpan::new(u64::MAX, u64::MAX);
        assert!(hdr.validate_layout(2048).is_err());
    }

    /// # Scenario
    /// A section poking past the declared file size is out of bounds.
    #[test]
    fn section_past_file_size_rejected() {
        let mut hdr = valid();
        hdr.wal = SectionSpan::new(2000, 128); // ends at 2128 > 2048
        assert!(matches!(
            hdr.validate_layout(2048),
            Err(FormatError::SectionOutOfBounds { name: "wal", .. })
        ));
    }

    /// # Scenario
    /// A section starting inside the header region is rejected.
    #[test]
    fn section_inside_header_rejected() {
        let mut hdr = valid();
        hdr.data = SectionSpan::new(64, 128);
        assert!(hdr.validate_layout(2048).is_err());
        assert!((HEADER_LEN as u64) > 64);
    }

    /// # Scenario
    /// Overlapping data and dict sections are rejected with both names.
    #[test]
    fn overlap_rejected() {
        let mut hdr = valid();
        hdr.dict = SectionSpan::new(500, 256); // data ends at 640
        assert!(matches!(
            hdr.validate_layout(2048),
            Err(FormatError::SectionOverlap { a: "data", b: "dict" })
        ));
    }

    /// # Scenario
    /// Empty sections never participate in bounds or overlap checks.
    #[test]
    fn empty_sections_ignored() {
        let mut hdr = valid();
        hdr.dict = SectionSpan::new(0, 0);
        hdr.index = SectionSpan::new(u64::MAX, 0);
        assert!(hdr.validate_layout(2048).is_ok());
    }

    /// # Scenario
    /// `contains_range` is the astronomical-offset guard readers use
    /// before seeking: in-bounds ranges pass, anything else fails.
    #[test]
    fn contains_range_guard() {
        let data = SectionSpan::new(128, 512);
        assert!(data.contains_range(128, 512));
        assert!(data.contains_range(200, 100));
        assert!(!data.contains_range(100, 10)); // before section
        assert!(!data.contains_range(600, 100)); // past end
        assert!(!data.contains_range(u64::MAX, 1)); // overflow
    }
}
