//! ABOUTME: At-rest protection for job query strings
//! ABOUTME: Secret strength rules, the AES-256-CTR envelope, and the query sanitizer

pub mod envelope;
pub mod sanitize;
pub mod secret;

pub use envelope::{decrypt, encrypt};
pub use sanitize::sanitize_query;
pub use secret::QuerySecret;
