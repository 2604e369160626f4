//! ABOUTME: Strength validation for the query secret
//! ABOUTME: Length, character-class mix, and weak-pattern rejection

use ld_core::{Error, Result};
use std::fmt;

const MIN_LENGTH: usize = 32;
const MIN_CHARACTER_CLASSES: usize = 3;
/// Shortest repeated or sequential run that disqualifies a secret.
const WEAK_RUN_LENGTH: usize = 4;

const COMMON_WORDS: &[&str] = &[
    "password", "secret", "qwerty", "letmein", "admin", "welcome", "iloveyou", "dragon", "monkey",
    "abc123",
];

/// A validated passphrase for the query envelope.
///
/// Construction enforces the strength rules; the raw value is never shown
/// through `Debug` or `Display`.
#[derive(Clone)]
pub struct QuerySecret(String);

impl QuerySecret {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();

        if secret.chars().count() < MIN_LENGTH {
            return Err(Error::validation(format!(
                "query secret must be at least {MIN_LENGTH} characters"
            )));
        }

        if character_classes(&secret) < MIN_CHARACTER_CLASSES {
            return Err(Error::validation(
                "query secret must mix at least three of: lowercase, uppercase, digits, symbols",
            ));
        }

        if has_repeated_run(&secret) {
            return Err(Error::validation(
                "query secret must not contain long runs of a repeated character",
            ));
        }

        if has_sequential_run(&secret) {
            return Err(Error::validation(
                "query secret must not contain sequential character runs",
            ));
        }

        let lowered = secret.to_lowercase();
        if COMMON_WORDS.iter().any(|word| lowered.contains(word)) {
            return Err(Error::validation(
                "query secret must not contain common words",
            ));
        }

        Ok(Self(secret))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for QuerySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QuerySecret(***)")
    }
}

fn character_classes(secret: &str) -> usize {
    let mut lower = false;
    let mut upper = false;
    let mut digit = false;
    let mut symbol = false;
    for c in secret.chars() {
        if c.is_lowercase() {
            lower = true;
        } else if c.is_uppercase() {
            upper = true;
        } else if c.is_ascii_digit() {
            digit = true;
        } else {
            symbol = true;
        }
    }
    [lower, upper, digit, symbol].iter().filter(|b| **b).count()
}

fn has_repeated_run(secret: &str) -> bool {
    let chars: Vec<char> = secret.chars().collect();
    let mut run = 1;
    for pair in chars.windows(2) {
        if pair[0] == pair[1] {
            run += 1;
            if run >= WEAK_RUN_LENGTH {
                return true;
            }
        } else {
            run = 1;
        }
    }
    false
}

/// Ascending or descending runs of consecutive letters or digits
/// ("abcd", "4321"), compared case-insensitively.
fn has_sequential_run(secret: &str) -> bool {
    let codes: Vec<i32> = secret
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c as i32
            } else {
                // Symbols break any run.
                -1
            }
        })
        .collect();

    for direction in [1i32, -1i32] {
        let mut run = 1;
        for pair in codes.windows(2) {
            if pair[0] >= 0 && pair[1] == pair[0] + direction {
                run += 1;
                if run >= WEAK_RUN_LENGTH as i32 {
                    return true;
                }
            } else {
                run = 1;
            }
        }
    }
    false
}
