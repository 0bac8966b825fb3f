//! Fixed-width PETSCII strings as used in CBM DOS filenames and disk names.
//!
//! CBM DOS stores names in fixed 16-byte fields, right-padded with 0xA0
//! (a shifted space).  This module keeps names as raw byte strings so that
//! directory matching stays byte-exact, and only maps to Unicode at display
//! time.

use std::fmt;

/// The byte used to right-pad names to their fixed field width.
pub const PADDING_BYTE: u8 = 0xa0;

/// The fixed width of file and disk name fields.
pub const NAME_SIZE: usize = 16;

/// A PETSCII byte string.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Petscii(Vec<u8>);

impl Petscii {
    /// Wrap raw PETSCII bytes verbatim.
    pub fn from_bytes(bytes: &[u8]) -> Petscii {
        Petscii(bytes.to_vec())
    }

    /// Read a fixed-width field, stripping the trailing padding bytes.
    pub fn from_padded_bytes(bytes: &[u8], padding: u8) -> Petscii {
        let mut end = bytes.len();
        while end > 0 && bytes[end - 1] == padding {
            end -= 1;
        }
        Petscii(bytes[..end].to_vec())
    }

    /// Convert a host string to PETSCII.  ASCII letters are uppercased (the
    /// 1541 stores unshifted text in the 0x41..0x5A range), other printable
    /// ASCII is taken verbatim, and anything else becomes '?'.  The result
    /// is truncated to the fixed name width.
    pub fn from_str(string: &str) -> Petscii {
        let bytes: Vec<u8> = string
            .bytes()
            .take(NAME_SIZE)
            .map(|b| match b {
                b'a'..=b'z' => b - 0x20,
                0x20..=0x7e => b,
                _ => b'?',
            })
            .collect();
        Petscii(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render this name into a fixed-width field, right-padding with the
    /// provided byte.  Overlong names are truncated to the field width.
    pub fn write_bytes_with_padding(&self, field: &mut [u8], padding: u8) {
        let len = self.0.len().min(field.len());
        field[..len].copy_from_slice(&self.0[..len]);
        for b in field[len..].iter_mut() {
            *b = padding;
        }
    }

    /// Return the name right-padded to the fixed 16-byte field width.  This
    /// is the form used for byte-exact directory matching.
    pub fn to_padded_name(&self) -> [u8; NAME_SIZE] {
        let mut field = [PADDING_BYTE; NAME_SIZE];
        let len = self.0.len().min(NAME_SIZE);
        field[..len].copy_from_slice(&self.0[..len]);
        field
    }

    /// Escape unprintable bytes as {xx} for diagnostics.
    pub fn to_escaped_string(&self) -> String {
        let mut string = String::new();
        for b in self.0.iter() {
            match *b {
                0x20..=0x7e => string.push(*b as char),
                b => string.push_str(&format!("{{{:02x}}}", b)),
            }
        }
        string
    }
}

impl fmt::Display for Petscii {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut string = String::with_capacity(self.0.len());
        for b in self.0.iter() {
            string.push(match *b {
                0x20..=0x7e => *b as char,
                _ => '.',
            });
        }
        f.pad(&string)
    }
}

impl fmt::Debug for Petscii {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self.to_escaped_string())
    }
}

impl<'a> From<&'a str> for Petscii {
    fn from(string: &str) -> Petscii {
        Petscii::from_str(string)
    }
}

impl From<String> for Petscii {
    fn from(string: String) -> Petscii {
        Petscii::from_str(&string)
    }
}

impl<'a> From<&'a String> for Petscii {
    fn from(string: &String) -> Petscii {
        Petscii::from_str(string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_uppercases() {
        let name = Petscii::from_str("hello.prg");
        assert_eq!(name.as_bytes(), b"HELLO.PRG");
        let name = Petscii::from_str("Test 123");
        assert_eq!(name.as_bytes(), b"TEST 123");
    }

    #[test]
    fn test_from_str_truncates() {
        let name = Petscii::from_str("a very long filename indeed");
        assert_eq!(name.len(), NAME_SIZE);
    }

    #[test]
    fn test_padded_roundtrip() {
        let name = Petscii::from_str("test");
        let field = name.to_padded_name();
        assert_eq!(&field[..4], b"TEST");
        assert!(field[4..].iter().all(|&b| b == PADDING_BYTE));
        let back = Petscii::from_padded_bytes(&field, PADDING_BYTE);
        assert_eq!(back, name);
    }

    #[test]
    fn test_padding_not_stripped_mid_name() {
        let bytes = [0x41, PADDING_BYTE, 0x42, PADDING_BYTE, PADDING_BYTE];
        let name = Petscii::from_padded_bytes(&bytes, PADDING_BYTE);
        assert_eq!(name.as_bytes(), &[0x41, PADDING_BYTE, 0x42]);
    }
}
