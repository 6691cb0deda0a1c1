//! Text encodings and line endings for notes files
//!
//! Notes files in the wild are UTF-8 (with or without BOM) or Windows-1252.
//! Decoding tries UTF-8 first and falls back to Windows-1252, which accepts
//! every byte sequence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MetadataError, Result};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Windows-1252 code points for bytes 0x80..=0x9F.
///
/// The five bytes left undefined by the code page map to the C1 control
/// character with the same value.
const CP1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

/// Output encoding of a committed notes file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Utf8Bom,
    Cp1252,
}

impl TextEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf8",
            TextEncoding::Utf8Bom => "utf8_bom",
            TextEncoding::Cp1252 => "cp1252",
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "utf8" => Ok(TextEncoding::Utf8),
            "utf8_bom" | "utf8bom" | "utf8sig" => Ok(TextEncoding::Utf8Bom),
            "cp1252" | "windows1252" => Ok(TextEncoding::Cp1252),
            _ => Err(format!("Unknown text encoding: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineEnding {
    Lf,
    #[default]
    Crlf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::Crlf => "\r\n",
        }
    }
}

/// Decode raw notes bytes, stripping a UTF-8 BOM if present.
pub fn decode_text(bytes: &[u8]) -> String {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => decode_cp1252(bytes),
    }
}

fn decode_cp1252(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            0x80..=0x9F => CP1252_HIGH[(b - 0x80) as usize],
            _ => b as char,
        })
        .collect()
}

fn encode_cp1252(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let code = ch as u32;
        let byte = if code < 0x80 || (0xA0..=0xFF).contains(&code) {
            code as u8
        } else {
            CP1252_HIGH
                .iter()
                .position(|&c| c == ch)
                .map(|idx| 0x80 + idx as u8)
                .ok_or(MetadataError::Unencodable(ch))?
        };
        out.push(byte);
    }
    Ok(out)
}

/// Encode `text` with the given encoding, normalizing all line breaks to `line_ending`.
pub fn encode_text(text: &str, encoding: TextEncoding, line_ending: LineEnding) -> Result<Vec<u8>> {
    let normalized = text
        .replace("\r\n", "\n")
        .replace('\n', line_ending.as_str());

    match encoding {
        TextEncoding::Utf8 => Ok(normalized.into_bytes()),
        TextEncoding::Utf8Bom => {
            let mut out = UTF8_BOM.to_vec();
            out.extend_from_slice(normalized.as_bytes());
            Ok(out)
        }
        TextEncoding::Cp1252 => encode_cp1252(&normalized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8_with_and_without_bom() {
        assert_eq!(decode_text("#TITLE:Café".as_bytes()), "#TITLE:Café");

        let mut with_bom = UTF8_BOM.to_vec();
        with_bom.extend_from_slice("#TITLE:Café".as_bytes());
        assert_eq!(decode_text(&with_bom), "#TITLE:Café");
    }

    #[test]
    fn test_decode_falls_back_to_cp1252() {
        // "Café – Olé" in Windows-1252
        let bytes = [
            b'C', b'a', b'f', 0xE9, b' ', 0x96, b' ', b'O', b'l', 0xE9,
        ];
        assert_eq!(decode_text(&bytes), "Café – Olé");
    }

    #[test]
    fn test_encode_cp1252() {
        let bytes = encode_text("€ Zoë", TextEncoding::Cp1252, LineEnding::Lf).unwrap();
        assert_eq!(bytes, vec![0x80, b' ', b'Z', b'o', 0xEB]);
    }

    #[test]
    fn test_encode_cp1252_rejects_unrepresentable() {
        let err = encode_text("東京", TextEncoding::Cp1252, LineEnding::Lf).unwrap_err();
        assert!(matches!(err, MetadataError::Unencodable('東')));
    }

    #[test]
    fn test_line_endings_and_bom() {
        let bytes = encode_text("a\r\nb\nc", TextEncoding::Utf8Bom, LineEnding::Crlf).unwrap();
        assert_eq!(&bytes[..3], UTF8_BOM);
        assert_eq!(&bytes[3..], b"a\r\nb\r\nc");

        let bytes = encode_text("a\r\nb", TextEncoding::Utf8, LineEnding::Lf).unwrap();
        assert_eq!(bytes, b"a\nb");
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("UTF-8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("utf8_bom".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8Bom);
        assert_eq!("cp1252".parse::<TextEncoding>().unwrap(), TextEncoding::Cp1252);
        assert!("latin9".parse::<TextEncoding>().is_err());
    }
}
