//! Notes file parsing, validation and serialization
//!
//! A notes file is a block of `#KEY:VALUE` header lines followed by timed
//! body lines and a terminating `E`:
//!
//! ```text
//! #ARTIST:Some Artist
//! #TITLE:Some Song
//! #BPM:280,5
//! #GAP:1200
//! : 0 4 5 Hel
//! : 4 4 7 lo
//! - 10
//! * 12 6 9 world
//! E
//! ```
//!
//! Parsing is strict about body lines (any unknown line is an error with its
//! line number) and lenient about headers (unknown keys are kept verbatim).

use std::collections::BTreeMap;
use std::fmt;

use tracing::trace;

use crate::encoding::{decode_text, encode_text, LineEnding, TextEncoding};
use crate::error::{MetadataError, Result};

/// Known header keys in the order they are written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeaderKey {
    Artist,
    Title,
    Language,
    Edition,
    Year,
    Genre,
    Album,
    Creator,
    Bpm,
    Gap,
    VideoGap,
    Start,
    End,
    PreviewStart,
    MedleyStartBeat,
    MedleyEndBeat,
    Mp3,
    Video,
    Cover,
    Background,
    P1,
    P2,
    Relative,
    Resolution,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Float,
    Int,
}

impl HeaderKey {
    pub fn tag(&self) -> &'static str {
        match self {
            HeaderKey::Artist => "ARTIST",
            HeaderKey::Title => "TITLE",
            HeaderKey::Language => "LANGUAGE",
            HeaderKey::Edition => "EDITION",
            HeaderKey::Year => "YEAR",
            HeaderKey::Genre => "GENRE",
            HeaderKey::Album => "ALBUM",
            HeaderKey::Creator => "CREATOR",
            HeaderKey::Bpm => "BPM",
            HeaderKey::Gap => "GAP",
            HeaderKey::VideoGap => "VIDEOGAP",
            HeaderKey::Start => "START",
            HeaderKey::End => "END",
            HeaderKey::PreviewStart => "PREVIEWSTART",
            HeaderKey::MedleyStartBeat => "MEDLEYSTARTBEAT",
            HeaderKey::MedleyEndBeat => "MEDLEYENDBEAT",
            HeaderKey::Mp3 => "MP3",
            HeaderKey::Video => "VIDEO",
            HeaderKey::Cover => "COVER",
            HeaderKey::Background => "BACKGROUND",
            HeaderKey::P1 => "P1",
            HeaderKey::P2 => "P2",
            HeaderKey::Relative => "RELATIVE",
            HeaderKey::Resolution => "RESOLUTION",
            HeaderKey::Comment => "COMMENT",
        }
    }

    /// Case-insensitive lookup, accepting common aliases.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let key = match tag.trim().to_ascii_uppercase().as_str() {
            "ARTIST" => HeaderKey::Artist,
            "TITLE" => HeaderKey::Title,
            "LANGUAGE" => HeaderKey::Language,
            "EDITION" => HeaderKey::Edition,
            "YEAR" => HeaderKey::Year,
            "GENRE" => HeaderKey::Genre,
            "ALBUM" => HeaderKey::Album,
            "CREATOR" | "AUTHOR" => HeaderKey::Creator,
            "BPM" => HeaderKey::Bpm,
            "GAP" => HeaderKey::Gap,
            "VIDEOGAP" => HeaderKey::VideoGap,
            "START" => HeaderKey::Start,
            "END" => HeaderKey::End,
            "PREVIEWSTART" => HeaderKey::PreviewStart,
            "MEDLEYSTARTBEAT" => HeaderKey::MedleyStartBeat,
            "MEDLEYENDBEAT" => HeaderKey::MedleyEndBeat,
            "MP3" | "AUDIO" => HeaderKey::Mp3,
            "VIDEO" => HeaderKey::Video,
            "COVER" => HeaderKey::Cover,
            "BACKGROUND" => HeaderKey::Background,
            "P1" | "DUETSINGERP1" => HeaderKey::P1,
            "P2" | "DUETSINGERP2" => HeaderKey::P2,
            "RELATIVE" => HeaderKey::Relative,
            "RESOLUTION" => HeaderKey::Resolution,
            "COMMENT" => HeaderKey::Comment,
            _ => return None,
        };
        Some(key)
    }

    /// Headers that point at sibling files in the song directory.
    pub fn is_file_reference(&self) -> bool {
        matches!(
            self,
            HeaderKey::Mp3 | HeaderKey::Video | HeaderKey::Cover | HeaderKey::Background
        )
    }

    fn value_kind(&self) -> ValueKind {
        match self {
            HeaderKey::Bpm
            | HeaderKey::Gap
            | HeaderKey::VideoGap
            | HeaderKey::Start
            | HeaderKey::End
            | HeaderKey::PreviewStart => ValueKind::Float,
            HeaderKey::MedleyStartBeat | HeaderKey::MedleyEndBeat => ValueKind::Int,
            _ => ValueKind::Text,
        }
    }
}

fn parse_float(value: &str) -> Option<f64> {
    value.trim().replace(',', ".").parse::<f64>().ok()
}

/// Header block of a notes file.
///
/// Values are stored as written so a parse/serialize cycle keeps the
/// author's number formatting (e.g. a comma decimal separator).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    known: BTreeMap<HeaderKey, String>,
    unknown: Vec<(String, String)>,
}

impl Headers {
    pub fn get(&self, key: HeaderKey) -> Option<&str> {
        self.known.get(&key).map(String::as_str)
    }

    pub fn set(&mut self, key: HeaderKey, value: impl Into<String>) {
        self.known.insert(key, value.into());
    }

    pub fn remove(&mut self, key: HeaderKey) -> Option<String> {
        self.known.remove(&key)
    }

    pub fn title(&self) -> &str {
        self.get(HeaderKey::Title).unwrap_or_default()
    }

    pub fn artist(&self) -> &str {
        self.get(HeaderKey::Artist).unwrap_or_default()
    }

    /// Numeric value of a float header such as `#BPM` or `#GAP`.
    pub fn float(&self, key: HeaderKey) -> Option<f64> {
        self.get(key).and_then(parse_float)
    }

    /// Headers with keys this parser does not interpret, in file order.
    pub fn unknown(&self) -> &[(String, String)] {
        &self.unknown
    }

    fn parse_line(&mut self, line: &str, line_no: usize) -> Result<()> {
        let Some((key, value)) = line[1..].split_once(':') else {
            return Err(MetadataError::InvalidLine {
                line: line_no,
                content: line.to_string(),
            });
        };
        let value = value.trim();
        if value.is_empty() {
            return Ok(());
        }

        let Some(header) = HeaderKey::from_tag(key) else {
            self.unknown.push((key.trim().to_string(), value.to_string()));
            return Ok(());
        };

        let valid = match header.value_kind() {
            ValueKind::Text => true,
            ValueKind::Float => parse_float(value).is_some(),
            ValueKind::Int => value.parse::<i64>().is_ok(),
        };
        if !valid {
            return Err(MetadataError::InvalidHeader {
                line: line_no,
                key: header.tag().to_string(),
                value: value.to_string(),
            });
        }

        self.known.insert(header, value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteKind {
    Regular,
    Golden,
    Freestyle,
    Rap,
    GoldenRap,
}

impl NoteKind {
    fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            ':' => Some(NoteKind::Regular),
            '*' => Some(NoteKind::Golden),
            'F' => Some(NoteKind::Freestyle),
            'R' => Some(NoteKind::Rap),
            'G' => Some(NoteKind::GoldenRap),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            NoteKind::Regular => ':',
            NoteKind::Golden => '*',
            NoteKind::Freestyle => 'F',
            NoteKind::Rap => 'R',
            NoteKind::GoldenRap => 'G',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub kind: NoteKind,
    pub start: i64,
    pub duration: i64,
    pub pitch: i64,
    /// Syllable text; leading and trailing spaces are significant.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyLine {
    Note(Note),
    LineBreak { start: i64, end: Option<i64> },
    /// Duet voice marker (`P1`, `P2`)
    Player(u8),
}

impl fmt::Display for BodyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyLine::Note(note) => write!(
                f,
                "{} {} {} {} {}",
                note.kind.symbol(),
                note.start,
                note.duration,
                note.pitch,
                note.text
            ),
            BodyLine::LineBreak { start, end: None } => write!(f, "- {}", start),
            BodyLine::LineBreak {
                start,
                end: Some(end),
            } => write!(f, "- {} {}", start, end),
            BodyLine::Player(n) => write!(f, "P{}", n),
        }
    }
}

/// Splits a leading (optionally negative) integer off `s`.
fn take_int(s: &str) -> Option<(i64, &str)> {
    let end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}

/// Requires at least one space and skips all of them.
fn skip_spaces(s: &str) -> Option<&str> {
    s.starts_with(' ').then(|| s.trim_start_matches(' '))
}

impl BodyLine {
    fn parse(line: &str, line_no: usize) -> Result<Self> {
        let invalid = || MetadataError::InvalidLine {
            line: line_no,
            content: line.to_string(),
        };

        let mut chars = line.chars();
        let first = chars.next().ok_or_else(invalid)?;
        let rest = chars.as_str();

        if let Some(kind) = NoteKind::from_symbol(first) {
            let rest = rest.strip_prefix(':').unwrap_or(rest);
            let rest = skip_spaces(rest).ok_or_else(invalid)?;
            let (start, rest) = take_int(rest).ok_or_else(invalid)?;
            let rest = skip_spaces(rest).ok_or_else(invalid)?;
            let (duration, rest) = take_int(rest).ok_or_else(invalid)?;
            let rest = skip_spaces(rest).ok_or_else(invalid)?;
            let (pitch, rest) = take_int(rest).ok_or_else(invalid)?;
            let text = rest.strip_prefix(' ').ok_or_else(invalid)?;
            if duration < 0 || text.is_empty() {
                return Err(invalid());
            }
            return Ok(BodyLine::Note(Note {
                kind,
                start,
                duration,
                pitch,
                text: text.to_string(),
            }));
        }

        match first {
            '-' => {
                let (start, rest) = take_int(rest.trim_start()).ok_or_else(invalid)?;
                let end = take_int(rest.trim_start()).map(|(end, _)| end);
                Ok(BodyLine::LineBreak { start, end })
            }
            'P' => match rest.trim().parse::<u8>() {
                Ok(n @ 1..=3) => Ok(BodyLine::Player(n)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

/// A parsed and validated notes file
#[derive(Debug, Clone, PartialEq)]
pub struct NotesFile {
    pub headers: Headers,
    pub body: Vec<BodyLine>,
}

impl NotesFile {
    /// Parse decoded text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut headers = Headers::default();
        let mut body = Vec::new();
        let mut in_body = false;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let line = raw.trim_start();

            if !in_body && line.starts_with('#') {
                headers.parse_line(line.trim_end(), line_no)?;
                continue;
            }
            in_body = true;

            if line.trim_end() == "E" {
                break;
            }
            body.push(BodyLine::parse(line, line_no)?);
        }

        for required in [HeaderKey::Title, HeaderKey::Artist] {
            if headers.get(required).is_none() {
                return Err(MetadataError::MissingHeader(required.tag()));
            }
        }
        if !body.iter().any(|l| matches!(l, BodyLine::Note(_))) {
            return Err(MetadataError::NoNotes);
        }

        trace!(lines = body.len(), "Parsed notes file");
        Ok(Self { headers, body })
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.body.iter().filter_map(|line| match line {
            BodyLine::Note(note) => Some(note),
            _ => None,
        })
    }

    pub fn is_duet(&self) -> bool {
        self.body.iter().any(|l| matches!(l, BodyLine::Player(_)))
    }

    /// Drop every header that points at a sibling file.
    pub fn clear_file_references(&mut self) {
        self.headers.known.retain(|key, _| !key.is_file_reference());
    }

    /// Serialize with `\n` line breaks.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.headers.known {
            out.push_str(&format!("#{}:{}\n", key.tag(), value));
        }
        for (key, value) in &self.headers.unknown {
            out.push_str(&format!("#{}:{}\n", key, value));
        }
        for line in &self.body {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out.push_str("E\n");
        out
    }

    /// Serialize into the committed byte form.
    pub fn encode(&self, encoding: TextEncoding, line_ending: LineEnding) -> Result<Vec<u8>> {
        encode_text(&self.to_text(), encoding, line_ending)
    }
}

/// Decode and parse raw notes bytes.
pub fn parse_notes(bytes: &[u8]) -> Result<NotesFile> {
    NotesFile::parse(&decode_text(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "#TITLE:Song\n#ARTIST:Band\n#BPM:280,5\n#GAP:1200\n: 0 4 5 Hel\n: 4 4 7 lo\n- 10\n* 12 6 9  world \nE\n";

    #[test]
    fn test_parse_simple() {
        let notes = NotesFile::parse(SIMPLE).unwrap();
        assert_eq!(notes.headers.title(), "Song");
        assert_eq!(notes.headers.artist(), "Band");
        assert_eq!(notes.headers.float(HeaderKey::Bpm), Some(280.5));
        assert_eq!(notes.headers.get(HeaderKey::Bpm), Some("280,5"));
        assert_eq!(notes.notes().count(), 3);

        let last = notes.notes().last().unwrap();
        assert_eq!(last.kind, NoteKind::Golden);
        assert_eq!(last.text, " world ");
    }

    #[test]
    fn test_header_aliases_and_unknown() {
        let text = "#AUTHOR:someone\n#TITLE:T\n#ARTIST:A\n#X-CUSTOM:kept\n: 0 1 0 la\nE";
        let notes = NotesFile::parse(text).unwrap();
        assert_eq!(notes.headers.get(HeaderKey::Creator), Some("someone"));
        assert_eq!(
            notes.headers.unknown(),
            &[("X-CUSTOM".to_string(), "kept".to_string())]
        );
    }

    #[test]
    fn test_missing_title() {
        let err = NotesFile::parse("#ARTIST:A\n: 0 1 0 la\nE").unwrap_err();
        assert!(matches!(err, MetadataError::MissingHeader("TITLE")));
    }

    #[test]
    fn test_no_notes() {
        let err = NotesFile::parse("#TITLE:T\n#ARTIST:A\n- 10\nE").unwrap_err();
        assert!(matches!(err, MetadataError::NoNotes));
    }

    #[test]
    fn test_invalid_float_header() {
        let err = NotesFile::parse("#TITLE:T\n#ARTIST:A\n#BPM:fast\n: 0 1 0 la\nE").unwrap_err();
        assert!(matches!(err, MetadataError::InvalidHeader { line: 3, .. }));
    }

    #[test]
    fn test_invalid_body_line_reports_line_number() {
        let err = NotesFile::parse("#TITLE:T\n#ARTIST:A\n: 0 1 0 la\n: x 1 0 la\nE").unwrap_err();
        assert_eq!(err.line(), Some(4));
    }

    #[test]
    fn test_content_after_end_is_ignored() {
        let notes = NotesFile::parse("#TITLE:T\n#ARTIST:A\n: 0 1 0 la\nE\ngarbage").unwrap();
        assert_eq!(notes.body.len(), 1);
    }

    #[test]
    fn test_duet_and_line_break_end() {
        let text = "#TITLE:T\n#ARTIST:A\nP1\n: 0 1 0 la\n- 4 6\nP2\nR: 8 2 -3 yo\nE";
        let notes = NotesFile::parse(text).unwrap();
        assert!(notes.is_duet());
        assert_eq!(
            notes.body[2],
            BodyLine::LineBreak {
                start: 4,
                end: Some(6)
            }
        );
        let rap = notes.notes().last().unwrap();
        assert_eq!(rap.kind, NoteKind::Rap);
        assert_eq!(rap.pitch, -3);
    }

    #[test]
    fn test_serialize_canonical_order() {
        let text = "#MP3:old.mp3\n#BPM:300\n#TITLE:T\n#ARTIST:A\n: 0 1 0 la\nE";
        let mut notes = NotesFile::parse(text).unwrap();
        notes.clear_file_references();
        notes.headers.set(HeaderKey::Mp3, "A - T.m4a");

        assert_eq!(
            notes.to_text(),
            "#ARTIST:A\n#TITLE:T\n#BPM:300\n#MP3:A - T.m4a\n: 0 1 0 la\nE\n"
        );
    }

    #[test]
    fn test_parse_notes_from_cp1252_bytes() {
        let mut bytes = b"#TITLE:Caf".to_vec();
        bytes.push(0xE9);
        bytes.extend_from_slice(b"\r\n#ARTIST:A\r\n: 0 1 0 la\r\nE\r\n");

        let notes = parse_notes(&bytes).unwrap();
        assert_eq!(notes.headers.title(), "Café");
    }
}
