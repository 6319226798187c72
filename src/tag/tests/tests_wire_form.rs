//! Wire-form compose / parse / strip tests.
//!
//! Coverage:
//! - Fixed-width composition and round-trip through `parse`
//! - First-`|` split semantics for values containing `|`
//! - Malformed wire forms: missing separator, non-numeric or zero timestamp
//! - `strip` pass-through for already-stripped values
//! - Namespace resolution and equal-timestamp tie-breaks

#[cfg(test)]
mod tests {
    use crate::tag::{
        Tag, TagError, compose, current_value_at, namespace_of, parse, strip, strip_many,
    };

    // ----------------------------------------------------------------
    // Compose / parse round-trips
    // ----------------------------------------------------------------

    /// # Scenario
    /// Compose a tag at a positive nanosecond timestamp and parse it back.
    ///
    /// # Starting environment
    /// None — pure string manipulation.
    ///
    /// # Actions
    /// 1. `compose(1_700_000_000_000_000_000, "status:active")`.
    /// 2. `parse` the result.
    ///
    /// # Expected behavior
    /// The rendered form is zero-padded to 19 digits; parsing restores the
    /// exact `(ts, value)` pair.
    #[test]
    fn compose_parse_round_trip() {
        let raw = compose(1_700_000_000_000_000_000, "status:active");
        assert_eq!(raw, "1700000000000000000|status:active");

        let tag = parse(&raw).unwrap();
        assert_eq!(tag.ts, 1_700_000_000_000_000_000);
        assert_eq!(tag.value, "status:active");
    }

    /// # Scenario
    /// Small timestamps are zero-padded to the fixed width.
    #[test]
    fn compose_zero_pads() {
        let raw = compose(1000, "type:user");
        assert_eq!(raw, "0000000000000001000|type:user");
        assert_eq!(parse(&raw).unwrap().ts, 1000);
    }

    /// # Scenario
    /// A negative (pre-epoch) timestamp survives the round trip.
    #[test]
    fn negative_timestamp_round_trip() {
        let raw = compose(-42, "epoch:before");
        let tag = parse(&raw).unwrap();
        assert_eq!(tag.ts, -42);
        assert_eq!(tag.value, "epoch:before");
    }

    /// # Scenario
    /// A value containing `|` splits on the *first* separator only.
    ///
    /// # Expected behavior
    /// `parse` keeps everything after the first `|` as the value.
    #[test]
    fn value_containing_separator() {
        let raw = compose(5, "note:a|b|c");
        let tag = parse(&raw).unwrap();
        assert_eq!(tag.value, "note:a|b|c");
    }

    // ----------------------------------------------------------------
    // Malformed wire forms
    // ----------------------------------------------------------------

    /// # Scenario
    /// A bare value without any separator is not a wire-form tag.
    #[test]
    fn parse_missing_separator() {
        assert_eq!(parse("status:active"), Err(TagError::MissingSeparator));
    }

    /// # Scenario
    /// A non-numeric timestamp half is rejected.
    #[test]
    fn parse_non_numeric_timestamp() {
        let err = parse("not-a-number|status:active").unwrap_err();
        assert!(matches!(err, TagError::BadTimestamp(_)));
    }

    /// # Scenario
    /// A zero timestamp is rejected — persisted tags always carry a real
    /// creation time.
    #[test]
    fn parse_zero_timestamp() {
        assert_eq!(
            parse("0000000000000000000|status:active"),
            Err(TagError::ZeroTimestamp)
        );
        assert_eq!(Tag::new(0, "x:y"), Err(TagError::ZeroTimestamp));
    }

    /// # Scenario
    /// A timestamp outside the i64 range is a bad timestamp, not a panic.
    #[test]
    fn parse_overflowing_timestamp() {
        let err = parse("99999999999999999999999|x:y").unwrap_err();
        assert!(matches!(err, TagError::BadTimestamp(_)));
    }

    // ----------------------------------------------------------------
    // Strip
    // ----------------------------------------------------------------

    /// # Scenario
    /// `strip` removes the timestamp half of a wire-form tag but passes
    /// already-stripped values through unchanged.
    #[test]
    fn strip_wire_and_plain_forms() {
        assert_eq!(strip("0000000000000001000|type:user"), "type:user");
        assert_eq!(strip("type:user"), "type:user");
        // A value whose prefix is not numeric is not mistaken for wire form.
        assert_eq!(strip("note:a|b"), "note:a|b");
    }

    /// # Scenario
    /// `strip_many` maps over a mixed batch.
    #[test]
    fn strip_many_batch() {
        let raws = vec!["0000000000000000005|a:b", "c:d"];
        assert_eq!(strip_many(raws.iter().map(|s| &**s)), vec!["a:b", "c:d"]);
    }

    // ----------------------------------------------------------------
    // Namespaces and current-value resolution
    // ----------------------------------------------------------------

    /// # Scenario
    /// Namespace is the text before the first `:`; deeper separators stay
    /// in the subvalue.
    #[test]
    fn namespace_extraction() {
        assert_eq!(namespace_of("rbac:role:admin"), Some("rbac"));
        assert_eq!(namespace_of("plain"), None);
        assert_eq!(namespace_of(":odd"), None);
    }

    /// # Scenario
    /// The current value of a namespace at time T is the tag with maximal
    /// `ts ≤ T`; ties go to the later insertion index.
    ///
    /// # Starting environment
    /// Tag list: `status:active` at 1000, `status:inactive` at 2000,
    /// `status:banned` also at 2000 (inserted later), `type:user` at 500.
    ///
    /// # Expected behavior
    /// - At T=1500 the current `status` is `active`.
    /// - At T=2500 the current `status` is `banned` (equal-ts tie broken
    ///   by insertion order).
    /// - At T=400 there is no `status` value.
    #[test]
    fn current_value_resolution() {
        let tags = vec![
            Tag::new(500, "type:user").unwrap(),
            Tag::new(1000, "status:active").unwrap(),
            Tag::new(2000, "status:inactive").unwrap(),
            Tag::new(2000, "status:banned").unwrap(),
        ];

        assert_eq!(
            current_value_at(&tags, "status", 1500).map(|t| t.value.as_str()),
            Some("status:active")
        );
        assert_eq!(
            current_value_at(&tags, "status", 2500).map(|t| t.value.as_str()),
            Some("status:banned")
        );
        assert!(current_value_at(&tags, "status", 400).is_none());
    }
}
