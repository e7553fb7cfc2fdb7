use crate::error::{Error, Result};

/// Case-insensitive glob match supporting `*` for any byte sequence.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some((b'*', rest)) => {
                (0..=text.len()).any(|skip| inner(rest, &text[skip..]))
            }
            Some((&p, rest)) => match text.split_first() {
                Some((&t, text_rest)) => {
                    p.eq_ignore_ascii_case(&t) && inner(rest, text_rest)
                }
                None => false,
            },
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Parses a two-digit hex byte.
pub(crate) fn parse_hex_byte(text: &str) -> Result<u8> {
    let text = text.trim();
    if text.len() != 2 {
        return Err(Error::invalid_arg(format!("hex byte {}", text)));
    }
    u8::from_str_radix(text, 16).map_err(|_| Error::invalid_arg(format!("hex byte {}", text)))
}

/// Parses an even-length hex string into bytes.
pub(crate) fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return Err(Error::invalid_arg(format!("hex string {}", text)));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| parse_hex_byte(&text[i..i + 2]))
        .collect()
}

/// Renders bytes as a lower-case hex string.
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
