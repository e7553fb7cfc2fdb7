use super::{Value, MAX_FIELD_LEN, REMAIN_LEN};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrKind {
    /// Character data padded with spaces on the right.
    Padded,
    /// Character data terminated by NUL when shorter than the field.
    NulTerminated,
    /// Raw bytes rendered as space-separated hex pairs.
    Hex,
    /// Consumes bytes without producing a field.
    Ignore,
}

/// An adjustable-length string type. `len` is the instantiated byte length,
/// [`REMAIN_LEN`] for "until end of payload".
#[derive(Debug, Clone, PartialEq)]
pub struct StrType {
    pub name: &'static str,
    pub kind: StrKind,
    pub len: u8,
}

pub(crate) fn get(name: &str, length: u8) -> Option<super::DataType> {
    let (name, kind): (&'static str, StrKind) = match name {
        "STR" => ("STR", StrKind::Padded),
        "NTS" => ("NTS", StrKind::NulTerminated),
        "HEX" => ("HEX", StrKind::Hex),
        "IGN" => ("IGN", StrKind::Ignore),
        _ => return None,
    };
    let len = if length == 0 { 1 } else { length };
    if len != REMAIN_LEN && len > MAX_FIELD_LEN {
        return None;
    }
    Some(super::DataType::Str(StrType { name, kind, len }))
}

impl StrType {
    /// The byte count this field consumes from `data`, resolving `*`.
    fn span(&self, data: &[u8]) -> usize {
        if self.len == REMAIN_LEN {
            data.len()
        } else {
            self.len as usize
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Value> {
        let span = self.span(data);
        if data.len() < span {
            return Err(Error::InvalidPos);
        }
        let data = &data[..span];
        match self.kind {
            StrKind::Ignore => Ok(Value::Null),
            StrKind::Hex => {
                let pairs: Vec<String> = data.iter().map(|b| format!("{:02x}", b)).collect();
                Ok(Value::Str(pairs.join(" ")))
            }
            StrKind::Padded => {
                let text: String = data
                    .iter()
                    .map(|&b| if b == 0 { ' ' } else { b as char })
                    .collect();
                Ok(Value::Str(text))
            }
            StrKind::NulTerminated => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let text: String = data[..end].iter().map(|&b| b as char).collect();
                Ok(Value::Str(text))
            }
        }
    }

    pub fn encode(&self, value: &str, out: &mut Vec<u8>) -> Result<()> {
        match self.kind {
            StrKind::Ignore => {
                if self.len != REMAIN_LEN {
                    out.resize(out.len() + self.len as usize, 0x00);
                }
                Ok(())
            }
            StrKind::Hex => {
                let mut count = 0usize;
                for pair in value.split_whitespace() {
                    if pair.len() != 2 {
                        return Err(Error::invalid_arg(format!("hex pair {}", pair)));
                    }
                    let byte = u8::from_str_radix(pair, 16)
                        .map_err(|_| Error::invalid_arg(format!("hex pair {}", pair)))?;
                    out.push(byte);
                    count += 1;
                }
                if self.len != REMAIN_LEN && count != self.len as usize {
                    return Err(Error::OutOfRange);
                }
                if self.len == REMAIN_LEN && count > MAX_FIELD_LEN as usize {
                    return Err(Error::OutOfRange);
                }
                Ok(())
            }
            StrKind::Padded | StrKind::NulTerminated => {
                let bytes = value.as_bytes();
                if self.len == REMAIN_LEN {
                    if bytes.len() > MAX_FIELD_LEN as usize {
                        return Err(Error::OutOfRange);
                    }
                    out.extend_from_slice(bytes);
                    if self.kind == StrKind::NulTerminated {
                        out.push(0x00);
                    }
                    return Ok(());
                }
                let len = self.len as usize;
                if bytes.len() > len {
                    return Err(Error::OutOfRange);
                }
                out.extend_from_slice(bytes);
                let fill = if self.kind == StrKind::Padded { 0x20 } else { 0x00 };
                out.resize(out.len() + len - bytes.len(), fill);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{get, DataType, Value};
    use super::*;

    fn str_type(name: &str, length: u8) -> StrType {
        match get(name, length).unwrap() {
            DataType::Str(t) => t,
            other => panic!("not a string: {:?}", other),
        }
    }

    fn encoded(name: &str, length: u8, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        str_type(name, length).encode(value, &mut out).unwrap();
        out
    }

    #[test]
    fn padded_string() {
        let t = str_type("STR", 10);
        assert_eq!(
            t.decode(b"Hallo, Du!").unwrap(),
            Value::Str("Hallo, Du!".into())
        );
        assert_eq!(encoded("STR", 10, "Hallo, Du!"), b"Hallo, Du!".to_vec());
        assert_eq!(encoded("STR", 10, "Hallo, Du"), b"Hallo, Du ".to_vec());
        assert!(str_type("STR", 4).encode("Hallo", &mut Vec::new()).is_err());
    }

    #[test]
    fn nul_terminated_string() {
        let t = str_type("NTS", 10);
        assert_eq!(
            t.decode(b"Hallo, Du\x00").unwrap(),
            Value::Str("Hallo, Du".into())
        );
        assert_eq!(
            encoded("NTS", 10, "Hallo, Du"),
            b"Hallo, Du\x00".to_vec()
        );
        assert_eq!(encoded("NTS", 10, ""), vec![0u8; 10]);
        // open-ended variant appends the terminator
        assert_eq!(encoded("NTS", REMAIN_LEN, "abcde"), b"abcde\x00".to_vec());
    }

    #[test]
    fn hex_string() {
        let t = str_type("HEX", 5);
        assert_eq!(
            t.decode(&[0x48, 0x61, 0x6C, 0x6C, 0x6F]).unwrap(),
            Value::Str("48 61 6c 6c 6f".into())
        );
        assert_eq!(
            encoded("HEX", 5, "48 61 6c 6c 6f"),
            vec![0x48, 0x61, 0x6C, 0x6C, 0x6F]
        );
        assert!(str_type("HEX", 2).encode("48", &mut Vec::new()).is_err());
    }

    #[test]
    fn ignored_bytes() {
        let t = str_type("IGN", 4);
        assert_eq!(t.decode(&[1, 2, 3, 4]).unwrap(), Value::Null);
        assert_eq!(encoded("IGN", 4, "anything"), vec![0u8; 4]);
    }
}
