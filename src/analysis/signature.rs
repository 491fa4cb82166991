//! Byte-pattern signatures with single-byte wildcards.
//!
//! The textual syntax is a whitespace-separated list of tokens, each either two hex digits (a
//! literal byte) or `?`/`??` (any byte), e.g. `"E8 ? ? ? ? 48 89 87"`.

use std::str::FromStr;

use memchr::memmem;

use super::ImageView;

/// Error returned when parsing a [`Signature`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The signature contains no tokens.
    Empty,
    /// A token is neither two hex digits nor a wildcard.
    InvalidToken(String),
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "signature is empty"),
            Self::InvalidToken(tok) => write!(f, "invalid signature token {tok:?}"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// A byte pattern in which [`None`] matches any byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pattern: Vec<Option<u8>>,
}

impl Signature {
    /// Create a signature from a byte pattern.
    pub fn from_pattern(pattern: Vec<Option<u8>>) -> Self {
        Self { pattern }
    }

    /// Parse a signature from its textual form.
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let pattern = text
            .split_whitespace()
            .map(|tok| match tok {
                "?" | "??" => Ok(None),
                _ if tok.len() == 2 && tok.bytes().all(|b| b.is_ascii_hexdigit()) => {
                    u8::from_str_radix(tok, 16)
                        .map(Some)
                        .map_err(|_| SignatureError::InvalidToken(tok.to_owned()))
                }
                _ => Err(SignatureError::InvalidToken(tok.to_owned())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if pattern.is_empty() {
            return Err(SignatureError::Empty);
        }
        Ok(Self { pattern })
    }

    pub fn pattern(&self) -> &[Option<u8>] {
        &self.pattern
    }

    pub fn len(&self) -> usize {
        self.pattern.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// Returns `true` if `bytes` starts with this signature.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() >= self.pattern.len()
            && self.pattern.iter().zip(bytes).all(|(p, b)| p.is_none_or(|p| p == *b))
    }

    /// The longest run of literal bytes and its offset in the pattern.
    fn anchor(&self) -> (usize, Vec<u8>) {
        let mut best = (0, Vec::new());
        let mut run_start = 0;
        let mut run = Vec::new();

        for (i, byte) in self.pattern.iter().enumerate() {
            match byte {
                Some(b) => {
                    if run.is_empty() {
                        run_start = i;
                    }
                    run.push(*b);
                    if run.len() > best.1.len() {
                        best = (run_start, run.clone());
                    }
                }
                None => run.clear(),
            }
        }
        best
    }

    /// Find the offset of every match in `haystack`, in ascending order.
    pub fn find_all(&self, haystack: &[u8]) -> Vec<usize> {
        if self.pattern.is_empty() || haystack.len() < self.pattern.len() {
            return Vec::new();
        }

        let (anchor_offset, anchor) = self.anchor();
        if anchor.is_empty() {
            return (0..=haystack.len() - self.pattern.len()).collect();
        }

        memmem::find_iter(haystack, &anchor)
            .filter_map(|pos| pos.checked_sub(anchor_offset))
            .filter(|&start| self.matches(&haystack[start..]))
            .collect()
    }

    /// Find the offset of the first match in `haystack`.
    pub fn find_first(&self, haystack: &[u8]) -> Option<usize> {
        self.find_all(haystack).first().copied()
    }

    /// Find the virtual address of every match in the code regions of `image`.
    pub fn find_in_image<I: ImageView>(&self, image: &I) -> Vec<u64> {
        image
            .code_regions()
            .flat_map(|(va, bytes)| self.find_all(bytes).into_iter().map(move |ofs| va + ofs as u64))
            .collect()
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, byte) in self.pattern.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            match byte {
                Some(b) => write!(f, "{b:02X}")?,
                None => f.write_str("?")?,
            }
        }
        Ok(())
    }
}
