//! Textual form of target addresses.

use serde::Serializer;

/// Render an address the way it goes over the wire: `0x` and upper-case hex digits.
pub fn format_address(address: u64) -> String {
    format!("0x{address:X}")
}

/// Parse a textual address literal, `0x401000` or bare hex digits `401000`.
pub fn parse_address_literal(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// `serialize_with` adapter for address fields.
pub fn serialize<S: Serializer>(address: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_address(*address))
}

/// `serialize_with` adapter for optional address fields.
pub fn serialize_opt<S: Serializer>(
    address: &Option<u64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match address {
        Some(address) => serialize(address, serializer),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_address_literals() {
        assert_eq!(format_address(0x401000), "0x401000");
        assert_eq!(format_address(0xdeadbeef), "0xDEADBEEF");
        assert_eq!(parse_address_literal("0x401000"), Some(0x401000));
        assert_eq!(parse_address_literal("0XdeadBEEF"), Some(0xdeadbeef));
        assert_eq!(parse_address_literal("7ff6a000"), Some(0x7ff6a000));
        assert_eq!(parse_address_literal("0x"), None);
        assert_eq!(parse_address_literal("game.exe"), None);
    }
}
