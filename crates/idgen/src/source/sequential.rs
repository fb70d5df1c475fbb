use crate::{CheckDigit, Error, Result};
use serde::{Deserialize, Serialize};

/// Formatting rules of a sequential generator.
///
/// A sequence value `n` is written in the positional system whose digits are
/// the characters of `base_character_set`, left-padded with its first
/// character to the width of `first_identifier_base`, then wrapped in
/// `prefix`/`suffix` and optionally given a check digit.
///
/// ```
/// use idgen::{CheckDigit, SequentialConfig};
///
/// let config = SequentialConfig {
///     prefix: Some("MRN".into()),
///     check_digit: Some(CheckDigit::LuhnMod30),
///     ..SequentialConfig::decimal("0001")
/// };
///
/// assert_eq!(config.first_value().unwrap(), 1);
/// let id = config.format(42).unwrap().unwrap();
/// assert!(id.starts_with("MRN0042"));
/// assert!(CheckDigit::LuhnMod30.is_valid(&id));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequentialConfig {
    /// Ordered digits of the numbering system; the radix is its length.
    pub base_character_set: String,
    /// The first value handed out, written with `base_character_set`.
    pub first_identifier_base: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    /// Identifiers shorter than this are padded in their numeric part.
    #[serde(default)]
    pub min_length: Option<usize>,
    /// Values whose identifier would exceed this length are not issued.
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub check_digit: Option<CheckDigit>,
}

impl SequentialConfig {
    /// Base-10 generator starting at `first_identifier_base`.
    pub fn decimal(first_identifier_base: impl Into<String>) -> Self {
        Self {
            base_character_set: "0123456789".into(),
            first_identifier_base: first_identifier_base.into(),
            prefix: None,
            suffix: None,
            min_length: None,
            max_length: None,
            check_digit: None,
        }
    }

    fn digits(&self) -> Vec<char> {
        self.base_character_set.chars().collect()
    }

    /// Decodes `first_identifier_base` into the counter's starting value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the base is empty, uses characters
    /// outside the character set, or overflows `u64`.
    pub fn first_value(&self) -> Result<u64> {
        let digits = self.digits();
        if digits.len() < 2 {
            return Err(Error::invalid(
                "base_character_set",
                "must contain at least two characters",
            ));
        }
        if self.first_identifier_base.is_empty() {
            return Err(Error::invalid("first_identifier_base", "is required"));
        }

        let radix = digits.len() as u64;
        self.first_identifier_base.chars().try_fold(0_u64, |acc, c| {
            let digit = digits.iter().position(|&d| d == c).ok_or_else(|| {
                Error::invalid(
                    "first_identifier_base",
                    format!("character '{c}' is not in the base character set"),
                )
            })?;
            acc.checked_mul(radix)
                .and_then(|v| v.checked_add(digit as u64))
                .ok_or_else(|| Error::invalid("first_identifier_base", "value is too large"))
        })
    }

    /// Formats the sequence value `value`.
    ///
    /// Returns `Ok(None)` when the identifier would be longer than
    /// `max_length`, i.e. the generator is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the character set is unusable or the
    /// configured check digit cannot encode a character of the identifier.
    pub fn format(&self, value: u64) -> Result<Option<String>> {
        let digits = self.digits();
        if digits.len() < 2 {
            return Err(Error::invalid(
                "base_character_set",
                "must contain at least two characters",
            ));
        }

        let radix = digits.len() as u64;
        let mut encoded = Vec::new();
        let mut rest = value;
        loop {
            encoded.push(digits[(rest % radix) as usize]);
            rest /= radix;
            if rest == 0 {
                break;
            }
        }

        let prefix = self.prefix.as_deref().unwrap_or_default();
        let suffix = self.suffix.as_deref().unwrap_or_default();
        let fixed = prefix.chars().count()
            + suffix.chars().count()
            + usize::from(self.check_digit.is_some());
        let min_width = self
            .min_length
            .map_or(0, |min| min.saturating_sub(fixed))
            .max(self.first_identifier_base.chars().count());
        while encoded.len() < min_width {
            encoded.push(digits[0]);
        }

        let mut identifier = String::with_capacity(fixed + encoded.len());
        identifier.push_str(prefix);
        identifier.extend(encoded.iter().rev());
        identifier.push_str(suffix);

        if let Some(check_digit) = self.check_digit {
            identifier = check_digit.apply(&identifier).ok_or_else(|| {
                Error::invalid(
                    "check_digit",
                    format!("cannot compute a check digit for '{identifier}'"),
                )
            })?;
        }

        match self.max_length {
            Some(max) if identifier.chars().count() > max => Ok(None),
            _ => Ok(Some(identifier)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_first_identifier_base() {
        let hex = SequentialConfig {
            base_character_set: "0123456789ABCDEF".into(),
            ..SequentialConfig::decimal("FF")
        };
        assert_eq!(hex.first_value().unwrap(), 255);
        assert_eq!(SequentialConfig::decimal("000").first_value().unwrap(), 0);
    }

    #[test]
    fn rejects_base_outside_character_set() {
        let err = SequentialConfig::decimal("12A").first_value().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn pads_to_first_base_width() {
        let config = SequentialConfig::decimal("0000");
        assert_eq!(config.format(7).unwrap().unwrap(), "0007");
        assert_eq!(config.format(12345).unwrap().unwrap(), "12345");
    }

    #[test]
    fn applies_prefix_suffix_and_min_length() {
        let config = SequentialConfig {
            prefix: Some("A-".into()),
            suffix: Some("-Z".into()),
            min_length: Some(8),
            ..SequentialConfig::decimal("1")
        };
        assert_eq!(config.format(5).unwrap().unwrap(), "A-0005-Z");
    }

    #[test]
    fn custom_character_set() {
        let config = SequentialConfig {
            base_character_set: "ACDEFGHJKLMNPRTUVWXY".into(),
            ..SequentialConfig::decimal("A")
        };
        assert_eq!(config.format(0).unwrap().unwrap(), "A");
        assert_eq!(config.format(21).unwrap().unwrap(), "CC");
    }

    #[test]
    fn exhausted_beyond_max_length() {
        let config = SequentialConfig {
            max_length: Some(2),
            ..SequentialConfig::decimal("1")
        };
        assert_eq!(config.format(99).unwrap().as_deref(), Some("99"));
        assert_eq!(config.format(100).unwrap(), None);
    }

    #[test]
    fn appends_valid_check_digit() {
        let config = SequentialConfig {
            check_digit: Some(CheckDigit::LuhnMod30),
            ..SequentialConfig::decimal("100")
        };
        let id = config.format(100).unwrap().unwrap();
        assert_eq!(id.len(), 4);
        assert!(id.starts_with("100"));
        assert!(CheckDigit::LuhnMod30.is_valid(&id));
    }
}
