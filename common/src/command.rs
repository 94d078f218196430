use serde::Serialize;

use crate::{
    config::BridgeConfig,
    error::{ValidationError, ValidationReason},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransmitCommand {
    pub address: u8,
    pub command: u8,
    pub repeats: u8,
}

impl TransmitCommand {
    /// Builds a command from untrusted text. `command` is required; absent or
    /// empty `address` and `repeats` take the configured defaults.
    pub fn from_params(
        address: Option<&str>,
        command: Option<&str>,
        repeats: Option<&str>,
        config: &BridgeConfig,
    ) -> Result<Self, ValidationError> {
        let command = match command.map(str::trim) {
            Some(text) if !text.is_empty() => parse_byte_param("command", text)?,
            _ => return Err(ValidationError::new("command", ValidationReason::Missing)),
        };

        Ok(Self {
            address: parse_with_default("address", address, config.default_address)?,
            command,
            repeats: parse_with_default("repeats", repeats, config.default_repeats)?,
        })
    }
}

/// Decimal, or hex with a `0x`/`0X` prefix, bounded to 0..=255.
pub fn parse_byte_param(field: &'static str, text: &str) -> Result<u8, ValidationError> {
    parse_byte(text.trim()).map_err(|reason| ValidationError::new(field, reason))
}

/// Absent or blank input yields `default`; anything else must parse.
pub fn parse_with_default(
    field: &'static str,
    text: Option<&str>,
    default: u8,
) -> Result<u8, ValidationError> {
    match text.map(str::trim) {
        None | Some("") => Ok(default),
        Some(text) => parse_byte_param(field, text),
    }
}

fn parse_byte(text: &str) -> Result<u8, ValidationReason> {
    let (digits, radix) = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (text.strip_prefix('-').unwrap_or(text), 10),
    };

    if digits.is_empty() || !digits.chars().all(|ch| ch.is_digit(radix)) {
        return Err(ValidationReason::Malformed);
    }
    if digits.len() != text.len() && radix == 10 {
        // A leading minus on an otherwise valid number.
        return Err(ValidationReason::OutOfRange);
    }

    match u64::from_str_radix(digits, radix) {
        Ok(value) => u8::try_from(value).map_err(|_| ValidationReason::OutOfRange),
        // Only overflow is possible once every character is a digit.
        Err(_) => Err(ValidationReason::OutOfRange),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_byte_parses_in_both_notations() {
        for value in 0..=u8::MAX {
            assert_eq!(parse_byte_param("v", &value.to_string()), Ok(value));
            assert_eq!(parse_byte_param("v", &format!("0x{value:x}")), Ok(value));
            assert_eq!(parse_byte_param("v", &format!("0X{value:02X}")), Ok(value));
        }
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        let cases = [
            ("256", ValidationReason::OutOfRange),
            ("-1", ValidationReason::OutOfRange),
            ("0x100", ValidationReason::OutOfRange),
            ("99999999999999999999999", ValidationReason::OutOfRange),
            ("", ValidationReason::Malformed),
            ("zz", ValidationReason::Malformed),
            ("0x", ValidationReason::Malformed),
            ("0xg1", ValidationReason::Malformed),
            ("+5", ValidationReason::Malformed),
            ("1.5", ValidationReason::Malformed),
            ("--1", ValidationReason::Malformed),
        ];

        for (text, reason) in cases {
            assert_eq!(
                parse_byte_param("address", text),
                Err(ValidationError::new("address", reason)),
                "input {text:?}"
            );
        }
    }

    #[test]
    fn default_applies_only_to_absent_input() {
        assert_eq!(parse_with_default("repeats", None, 7), Ok(7));
        assert_eq!(parse_with_default("repeats", Some("  "), 7), Ok(7));
        assert_eq!(parse_with_default("repeats", Some("2"), 7), Ok(2));
        assert_eq!(
            parse_with_default("repeats", Some("x"), 7),
            Err(ValidationError::new("repeats", ValidationReason::Malformed))
        );
    }

    #[test]
    fn command_defaults_are_resolved() {
        let config = BridgeConfig::default();
        let command = TransmitCommand::from_params(None, Some("0x1B"), None, &config).unwrap();

        assert_eq!(
            command,
            TransmitCommand {
                address: 0x01,
                command: 0x1B,
                repeats: 0
            }
        );
    }

    #[test]
    fn command_field_is_required() {
        let config = BridgeConfig::default();
        for command in [None, Some(""), Some(" ")] {
            assert_eq!(
                TransmitCommand::from_params(Some("0x10"), command, Some("1"), &config),
                Err(ValidationError::new("command", ValidationReason::Missing))
            );
        }
    }

    #[test]
    fn invalid_optional_field_is_named() {
        let config = BridgeConfig::default();
        let err = TransmitCommand::from_params(Some("300"), Some("1"), None, &config).unwrap_err();
        assert_eq!(err.field, "address");
        assert_eq!(err.to_string(), "invalid `address`: must be between 0 and 255");
    }
}
