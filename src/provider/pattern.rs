use crate::provider::RegionProtection;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("empty byte pattern")]
    Empty,
    #[error("invalid pattern byte `{0}`")]
    InvalidToken(String),
    #[error("invalid protection flag `{0}`")]
    InvalidFlag(char),
}

/// Array of bytes with `??` wildcards, e.g. `48 89 5C 24 ??`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytePattern(Vec<Option<u8>>);

impl BytePattern {
    pub fn exact(bytes: &[u8]) -> Self {
        Self(bytes.iter().copied().map(Some).collect())
    }

    /// Pattern from bytes where `None` is a wildcard.
    pub fn with_wildcards(bytes: Vec<Option<u8>>) -> Self {
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.0.len()
            && self
                .0
                .iter()
                .zip(window)
                .all(|(expected, actual)| expected.map_or(true, |e| e == *actual))
    }

    /// Offsets of every (possibly overlapping) match in `haystack`.
    pub fn find_all<'a>(&'a self, haystack: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
        let len = self.0.len().max(1);
        haystack
            .windows(len)
            .enumerate()
            .filter(move |(_, window)| !self.0.is_empty() && self.matches(window))
            .map(|(offset, _)| offset)
    }
}

impl FromStr for BytePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = vec![];
        for token in s.split_whitespace() {
            // accept both "48 89 5C" and "48895C"
            let chunks: Vec<&str> = if token.len() > 2 && token.len() % 2 == 0 {
                (0..token.len())
                    .step_by(2)
                    .map(|i| token.get(i..i + 2))
                    .collect::<Option<_>>()
                    .ok_or_else(|| PatternError::InvalidToken(token.to_string()))?
            } else {
                vec![token]
            };

            for chunk in chunks {
                let byte = match chunk {
                    "?" | "??" | "*" => None,
                    hex => Some(
                        u8::from_str_radix(hex, 16)
                            .map_err(|_| PatternError::InvalidToken(hex.to_string()))?,
                    ),
                };
                bytes.push(byte);
            }
        }

        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self(bytes))
    }
}

impl Display for BytePattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for byte in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match byte {
                None => f.write_str("??")?,
                Some(b) => write!(f, "{b:02X}")?,
            }
        }
        Ok(())
    }
}

/// Region protection requirements in `+W-C` notation.
///
/// `+` requires a flag, `-` forbids it, flags are `W` (writable), `X` (executable)
/// and `C` (copy-on-write). Unmentioned flags are not checked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProtectionFilter {
    pub writable: Option<bool>,
    pub executable: Option<bool>,
    pub copy_on_write: Option<bool>,
}

impl ProtectionFilter {
    pub fn admits(&self, protection: &RegionProtection) -> bool {
        let check = |required: Option<bool>, actual: bool| required.map_or(true, |r| r == actual);
        protection.read
            && check(self.writable, protection.write)
            && check(self.executable, protection.execute)
            && check(self.copy_on_write, protection.copy_on_write)
    }
}

impl FromStr for ProtectionFilter {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut filter = ProtectionFilter::default();
        let mut required = true;
        for c in s.chars() {
            match c.to_ascii_uppercase() {
                '+' => required = true,
                '-' => required = false,
                'W' => filter.writable = Some(required),
                'X' => filter.executable = Some(required),
                'C' => filter.copy_on_write = Some(required),
                '*' => {}
                c if c.is_whitespace() => {}
                c => return Err(PatternError::InvalidFlag(c)),
            }
        }
        Ok(filter)
    }
}
