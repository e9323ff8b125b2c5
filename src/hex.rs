// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dump for `Debug` impls and error messages.

pub struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = std::cmp::min(self.inner.len(), self.max_bytes);
        write!(f, "[{} bytes:", self.inner.len())?;
        for b in &self.inner[..shown] {
            write!(f, " {b:02x}")?;
        }
        if shown < self.inner.len() {
            write!(f, " ...{} more", self.inner.len() - shown)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn elides_long_input() {
        let out = format!("{:?}", LimitedHex::new(&[0u8; 70], 4));
        assert_eq!(out, "[70 bytes: 00 00 00 00 ...66 more]");
    }

    #[test]
    fn short_input_shown_in_full() {
        let out = format!("{:?}", LimitedHex::new(&[0xff, 0x0a], 64));
        assert_eq!(out, "[2 bytes: ff 0a]");
    }
}
