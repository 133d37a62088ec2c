// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::fmt;

/// Inline UTF-8 string with a fixed byte capacity
///
/// Lives inside shared entry slots, so the all-zero value must be a valid
/// empty string and nothing may point outside the struct.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedStr<const N: usize> {
    len: u32,
    bytes: [u8; N],
}

impl<const N: usize> FixedStr<N> {
    pub const CAPACITY: usize = N;

    pub fn new(value: &str) -> Self {
        let mut s = Self::default();
        s.set(value);
        s
    }

    /// Replaces the contents, truncating on a character boundary
    pub fn set(&mut self, value: &str) {
        let value = truncate_utf8(value, N);
        self.bytes[..value.len()].copy_from_slice(value.as_bytes());
        self.len = value.len() as u32;
    }

    pub fn as_str(&self) -> &str {
        let len = (self.len as usize).min(N);
        // Only whole characters are ever written, a damaged length falls back to empty
        std::str::from_utf8(&self.bytes[..len]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self { len: 0, bytes: [0; N] }
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest prefix of `value` that fits in `max` bytes without splitting a character
pub fn truncate_utf8(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_str_roundtrip() {
        let s: FixedStr<16> = FixedStr::new("psql");
        assert_eq!(s.as_str(), "psql");
        assert_eq!(s.len(), 4);
        assert!(!s.is_empty());
    }

    #[test]
    fn test_fixed_str_truncates_on_char_boundary() {
        // 'é' is two bytes, the cut would land in its middle
        let s: FixedStr<4> = FixedStr::new("abcé");
        assert_eq!(s.as_str(), "abc");

        let s: FixedStr<5> = FixedStr::new("abcé");
        assert_eq!(s.as_str(), "abcé");
    }

    #[test]
    fn test_zeroed_is_empty() {
        let s: FixedStr<8> = unsafe { std::mem::zeroed() };
        assert!(s.is_empty());
        assert_eq!(s.as_str(), "");
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        assert_eq!(truncate_utf8("日本語", 4), "日");
    }
}
