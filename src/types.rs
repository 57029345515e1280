//! Core types: Price, Symbol

use std::fmt;

/// Price in smallest units (cents).
///
/// `Price(10050)` represents $100.50. Broker prices arrive as `f64` and are
/// rounded to the nearest cent on the way in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Price(pub i64);

impl Price {
    pub const ZERO: Price = Price(0);

    /// Convert a broker-reported decimal price to cents.
    ///
    /// Returns `None` for NaN/infinite input. Negative values are kept: they
    /// show up legitimately in PnL fields.
    pub fn from_f64(value: f64) -> Option<Price> {
        if !value.is_finite() {
            return None;
        }
        Some(Price((value * 100.0).round() as i64))
    }

    /// Like [`Price::from_f64`], but treats the broker's "no value" sentinels
    /// (zero, negative, `f64::MAX`) as absent. Used for bid/ask/last ticks.
    pub fn from_tick(value: f64) -> Option<Price> {
        if !value.is_finite() || value <= 0.0 || value >= f64::MAX / 2.0 {
            return None;
        }
        Price::from_f64(value)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dollars = self.0 / 100;
        let cents = (self.0 % 100).abs();
        if self.0 < 0 {
            write!(f, "-${}.{:02}", dollars.abs(), cents)
        } else {
            write!(f, "${}.{:02}", dollars, cents)
        }
    }
}

/// Ticker symbol, stored inline (max 8 ASCII bytes) so it is `Copy`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol {
    bytes: [u8; Symbol::MAX_LEN],
    len: u8,
}

impl Symbol {
    pub const MAX_LEN: usize = 8;

    /// Create a symbol from a string known to fit.
    ///
    /// # Panics
    /// Panics if `s` is longer than 8 bytes. Use [`Symbol::try_new`] for
    /// untrusted input.
    pub fn new(s: &str) -> Self {
        match Self::try_new(s) {
            Some(sym) => sym,
            None => panic!("symbol '{s}' exceeds {} bytes", Self::MAX_LEN),
        }
    }

    /// Create a symbol, returning `None` if `s` is longer than 8 bytes.
    pub fn try_new(s: &str) -> Option<Self> {
        let raw = s.as_bytes();
        if raw.len() > Self::MAX_LEN {
            return None;
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            bytes,
            len: raw.len() as u8,
        })
    }

    /// Normalize raw broker/provider text into a ticker.
    ///
    /// Trims, uppercases, maps an inner space class separator to `.`
    /// (`"BRK B"` → `BRK.B`) and validates ticker shape: a leading letter,
    /// then letters, digits or single `.`/`-` separators, never trailing.
    pub fn normalize(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase().replace(' ', ".");
        if upper.is_empty() || upper.len() > Self::MAX_LEN {
            return None;
        }
        let bytes = upper.as_bytes();
        if !bytes[0].is_ascii_uppercase() {
            return None;
        }
        let mut prev_sep = false;
        for &b in &bytes[1..] {
            let sep = b == b'.' || b == b'-';
            if sep && prev_sep {
                return None;
            }
            if !(sep || b.is_ascii_uppercase() || b.is_ascii_digit()) {
                return None;
            }
            prev_sep = sep;
        }
        if prev_sep {
            return None;
        }
        Self::try_new(&upper)
    }

    pub fn as_str(&self) -> &str {
        // Only constructed from &str slices that fit, so always valid UTF-8.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.as_str())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Symbol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Symbol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Symbol::normalize(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid ticker symbol '{s}'")))
    }
}
