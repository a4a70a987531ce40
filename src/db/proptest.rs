//! Property-Based Tests for Identifier Validation
//!
//! # Test Properties
//!
//! 1. **Acceptance**: every `[A-Za-z_][A-Za-z0-9_]*` string is accepted unchanged
//! 2. **Injection**: any identifier containing `;` or whitespace is rejected
//! 3. **Leading digit**: identifiers starting with a digit are rejected

#![cfg(test)]

use proptest::prelude::*;

use super::query::{build_insert_query, sanitize_identifier, Dialect};
use crate::error::Error;

fn identifier_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z_][A-Za-z0-9_]{0,30}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_valid_identifiers_accepted(id in identifier_strategy()) {
        prop_assert_eq!(sanitize_identifier(&id).unwrap(), id.as_str());
    }

    #[test]
    fn prop_forbidden_characters_rejected(
        prefix in identifier_strategy(),
        bad in prop::sample::select(vec![';', ' ', '\t', '\n', '-', '\'', '"']),
        suffix in "[A-Za-z0-9_]{0,10}",
    ) {
        let id = format!("{}{}{}", prefix, bad, suffix);
        prop_assert!(matches!(sanitize_identifier(&id), Err(Error::InvalidIdentifier(_))));
    }

    #[test]
    fn prop_leading_digit_rejected(digit in 0u8..10, rest in "[A-Za-z0-9_]{0,20}") {
        let id = format!("{}{}", digit, rest);
        prop_assert!(sanitize_identifier(&id).is_err());
    }

    #[test]
    fn prop_insert_lists_every_column(columns in prop::collection::vec(identifier_strategy(), 1..8)) {
        let refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        let query = build_insert_query("t", &refs, Dialect::Postgres).unwrap();

        prop_assert!(query.contains(&refs.join(", ")));
        prop_assert_eq!(query.matches("%s").count(), columns.len());
    }
}
