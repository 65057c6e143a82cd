//! Bounded strings with an explicit, compile-time maximum length.
//!
//! The design notes call for eliminating unbounded copying on the signal
//! path and for a framed protocol that can use fixed-width length fields.
//! `BoundedString<N>` gives both: construction either rejects an
//! over-length value (`new`) or truncates to the limit on a UTF-8 char
//! boundary (`truncated`), and `N` never exceeds `u16::MAX` so every
//! bounded string fits the protocol's 2-byte length prefix.

use crate::error::Error;
use std::fmt;

/// Maximum length, in bytes, of an attribute key.
pub const MAX_KEY_LEN: usize = 128;
/// Maximum length, in bytes, of an attribute value.
pub const MAX_VALUE_LEN: usize = 512;
/// Maximum length, in bytes, of a grouping message passed to `emit`/`fatal`.
pub const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BoundedString<const N: usize>(String);

impl<const N: usize> BoundedString<N> {
    const _ASSERT_FITS_U16: () = assert!(N <= u16::MAX as usize);

    /// Builds a bounded string, rejecting input that exceeds `N` bytes.
    pub fn new(s: impl Into<String>) -> Result<Self, Error> {
        let s = s.into();
        if s.len() > N {
            return Err(Error::InvalidConfig(format!(
                "value of {} bytes exceeds the {N}-byte limit",
                s.len()
            )));
        }
        Ok(BoundedString(s))
    }

    /// Builds a bounded string, truncating input that exceeds `N` bytes to
    /// the nearest preceding UTF-8 char boundary. Used on paths (like the
    /// fatal record and error messages) where a fallible constructor would
    /// be self-defeating.
    pub fn truncated(s: &str) -> Self {
        if s.len() <= N {
            return BoundedString(s.to_string());
        }
        let mut end = N;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        BoundedString(s[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub const fn max_len() -> usize {
        N
    }
}

impl<const N: usize> fmt::Debug for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<const N: usize> AsRef<str> for BoundedString<N> {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<const N: usize> TryFrom<&str> for BoundedString<N> {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        BoundedString::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_over_length() {
        let long = "a".repeat(MAX_KEY_LEN + 1);
        assert!(BoundedString::<MAX_KEY_LEN>::new(long).is_err());
    }

    #[test]
    fn new_accepts_exact_length() {
        let exact = "a".repeat(MAX_KEY_LEN);
        assert!(BoundedString::<MAX_KEY_LEN>::new(exact).is_ok());
    }

    #[test]
    fn truncated_respects_char_boundaries() {
        // 3-byte UTF-8 char repeated so a byte-oriented truncation would
        // otherwise split it.
        let s = "\u{20AC}".repeat(10); // each euro sign is 3 bytes
        let bounded = BoundedString::<7>::truncated(&s);
        assert!(bounded.as_str().len() <= 7);
        assert!(std::str::from_utf8(bounded.as_str().as_bytes()).is_ok());
    }

    #[test]
    fn truncated_is_identity_when_short_enough() {
        let bounded = BoundedString::<MAX_VALUE_LEN>::truncated("short");
        assert_eq!(bounded.as_str(), "short");
    }
}
