//! Header encode / decode tests.
//!
//! Coverage:
//! - Fixed 128-byte encoding, round-trip, reserved padding
//! - CRC, magic, and version rejection
//! - Truncated buffers
//! - Flag bit manipulation

#[cfg(test)]
mod tests {
    use crate::format::{
        FLAG_COMPRESSION, FileHeader, FormatError, HEADER_LEN, SectionSpan, VERSION,
    };

    fn populated() -> FileHeader {
        FileHeader {
            version: VERSION,
            file_size: 4096,
            flags: FLAG_COMPRESSION,
            data: SectionSpan::new(128, 1000),
            dict: SectionSpan::new(1128, 200),
            index: SectionSpan::new(1328, 300),
            wal: SectionSpan::new(1628, 100),
        }
    }

    /// # Scenario
    /// A populated header encodes to exactly 128 bytes and decodes back
    /// to an equal value.
    #[test]
    fn encode_decode_round_trip() {
        let hdr = populated();
        let bytes = hdr.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);

        let decoded = FileHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, hdr);
    }

    /// # Scenario
    /// The fresh-file header describes an empty database whose data
    /// section starts right after the header.
    #[test]
    fn empty_header_shape() {
        let hdr = FileHeader::empty();
        assert_eq!(hdr.file_size, HEADER_LEN as u64);
        assert_eq!(hdr.data.offset, HEADER_LEN as u64);
        assert_eq!(hdr.data.size, 0);
        let bytes = hdr.encode().unwrap();
        assert_eq!(FileHeader::decode(&bytes).unwrap(), hdr);
    }

    /// # Scenario
    /// Flipping any covered byte breaks the CRC.
    #[test]
    fn crc_detects_corruption() {
        let mut bytes = populated().encode().unwrap();
        bytes[10] ^= 0x55;
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(FormatError::ChecksumMismatch)
        ));
    }

    /// # Scenario
    /// Wrong magic is reported as such — but only after the CRC passes,
    /// so the magic check needs a recomputed checksum.
    #[test]
    fn bad_magic_rejected() {
        let mut hdr_bytes = populated().encode().unwrap();
        hdr_bytes[0] = b'X';
        // Recompute the CRC so the magic check is what fails.
        let crc = {
            let mut h = crc32fast::Hasher::new();
            h.update(&hdr_bytes[..HEADER_LEN - 4]);
            h.finalize()
        };
        hdr_bytes[HEADER_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            FileHeader::decode(&hdr_bytes),
            Err(FormatError::BadMagic)
        ));
    }

    /// # Scenario
    /// A future format version is refused.
    #[test]
    fn unsupported_version_rejected() {
        let mut hdr = populated();
        hdr.version = VERSION + 1;
        // encode() writes whatever version the struct carries.
        let bytes = hdr.encode().unwrap();
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(FormatError::UnsupportedVersion(v)) if v == VERSION + 1
        ));
    }

    /// # Scenario
    /// Buffers shorter than 128 bytes report truncation.
    #[test]
    fn truncated_header() {
        let bytes = populated().encode().unwrap();
        assert!(matches!(
            FileHeader::decode(&bytes[..HEADER_LEN - 1]),
            Err(FormatError::Truncated(_))
        ));
        assert!(matches!(
            FileHeader::decode(&[]),
            Err(FormatError::Truncated(0))
        ));
    }

    /// # Scenario
    /// The clean-shutdown bit sets and clears without touching other
    /// flags.
    #[test]
    fn clean_shutdown_flag() {
        let mut hdr = populated();
        assert!(!hdr.is_clean_shutdown());

        hdr.set_clean_shutdown(true);
        assert!(hdr.is_clean_shutdown());
        assert_ne!(hdr.flags & FLAG_COMPRESSION, 0, "other bits preserved");

        hdr.set_clean_shutdown(false);
        assert!(!hdr.is_clean_shutdown());
    }
}
