//! Id and value validation boundary tests.
//!
//! Coverage:
//! - Id length boundaries: 0, 1, 256, 257
//! - Id character set: printable ASCII accepted; control bytes, DEL,
//!   and non-ASCII rejected
//! - Value length boundaries: 1024 accepted, 1025 rejected
//! - Non-printable ratio: ≤ 10% accepted, above rejected

#[cfg(test)]
mod tests {
    use crate::tag::{MAX_ID_LEN, MAX_TAG_LEN, TagError, validate_id, validate_value};

    // ----------------------------------------------------------------
    // Entity ids
    // ----------------------------------------------------------------

    /// # Scenario
    /// Id length boundaries straddle the documented 1..=256 range.
    ///
    /// # Expected behavior
    /// Length 0 and 257 are rejected with `IdLength`; 1 and 256 pass.
    #[test]
    fn id_length_boundaries() {
        assert_eq!(validate_id(""), Err(TagError::IdLength(0)));
        assert!(validate_id("a").is_ok());
        assert!(validate_id(&"x".repeat(MAX_ID_LEN)).is_ok());
        assert_eq!(
            validate_id(&"x".repeat(MAX_ID_LEN + 1)),
            Err(TagError::IdLength(MAX_ID_LEN + 1))
        );
    }

    /// # Scenario
    /// The id character set is printable ASCII (0x20..=0x7E), which
    /// already covers `- _ .` and the rest of the punctuation range.
    /// Control bytes, DEL, and non-ASCII are rejected.
    #[test]
    fn id_character_set() {
        for id in ["user-42_v1.beta", "user@1", "a b", "v1.0(beta)", "sla/sh"] {
            assert!(validate_id(id).is_ok(), "{id} should validate");
        }
        assert_eq!(validate_id("tab\there"), Err(TagError::IdCharacter(b'\t')));
        assert_eq!(validate_id("del\u{7f}"), Err(TagError::IdCharacter(0x7F)));
        assert_eq!(validate_id("uni\u{00e9}"), Err(TagError::IdCharacter(0xC3)));
        assert_eq!(validate_id("nul\0"), Err(TagError::IdCharacter(0)));
    }

    // ----------------------------------------------------------------
    // Tag values
    // ----------------------------------------------------------------

    /// # Scenario
    /// Value length boundaries straddle the documented 1024 ceiling.
    ///
    /// # Expected behavior
    /// 1024 bytes accepted; 1025 rejected with `ValueTooLong`.
    #[test]
    fn value_length_boundaries() {
        assert!(validate_value(&"v".repeat(MAX_TAG_LEN)).is_ok());
        assert_eq!(
            validate_value(&"v".repeat(MAX_TAG_LEN + 1)),
            Err(TagError::ValueTooLong(MAX_TAG_LEN + 1))
        );
        assert_eq!(validate_value(""), Err(TagError::EmptyValue));
    }

    /// # Scenario
    /// Values tolerate up to 10% non-printable bytes.
    ///
    /// # Starting environment
    /// A 100-byte value with exactly 10 control bytes, and one with 11.
    ///
    /// # Expected behavior
    /// 10/100 passes; 11/100 fails with `NonPrintable`.
    #[test]
    fn non_printable_ratio() {
        let mut ok = "p".repeat(90);
        ok.push_str(&"\u{1}".repeat(10));
        assert!(validate_value(&ok).is_ok());

        let mut bad = "p".repeat(89);
        bad.push_str(&"\u{1}".repeat(11));
        assert_eq!(validate_value(&bad), Err(TagError::NonPrintable));
    }

    /// # Scenario
    /// An entirely printable value of typical shape passes.
    #[test]
    fn typical_values_pass() {
        for v in ["type:user", "status:active", "rbac:role:admin", "plain"] {
            assert!(validate_value(v).is_ok(), "{v} should validate");
        }
    }
}
