//! Per-pass download preferences
//!
//! A [`SyncOptions`] value is snapshotted when a pass starts and shared
//! read-only by every job of that pass.

use bridge_traits::AudioCodec;
use core_metadata::{LineEnding, TextEncoding};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    M4a,
    Mp3,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::M4a => "m4a",
            AudioFormat::Mp3 => "mp3",
        }
    }

    pub fn codec(&self) -> AudioCodec {
        match self {
            AudioFormat::M4a => AudioCodec::Aac,
            AudioFormat::Mp3 => AudioCodec::Mp3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub download_audio: bool,
    pub download_video: bool,
    pub download_cover: bool,
    pub download_background: bool,
    /// Fetch a background image even when a video is downloaded too
    pub background_even_with_video: bool,
    pub audio_format: AudioFormat,
    /// Target audio bitrate in kbit/s
    pub audio_bitrate: u32,
    pub normalize_audio: bool,
    /// Embed the cover into the audio file
    pub embed_artwork: bool,
    /// Maximum video height in pixels
    pub video_max_resolution: u32,
    pub video_max_fps: u32,
    pub reencode_video: bool,
    /// Longest side of cover and background images; 0 keeps the original size
    pub cover_max_size_px: u32,
    pub notes_encoding: TextEncoding,
    pub notes_line_ending: LineEnding,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            download_audio: true,
            download_video: true,
            download_cover: true,
            download_background: true,
            background_even_with_video: false,
            audio_format: AudioFormat::M4a,
            audio_bitrate: 128,
            normalize_audio: false,
            embed_artwork: false,
            video_max_resolution: 1080,
            video_max_fps: 60,
            reencode_video: false,
            cover_max_size_px: 1920,
            notes_encoding: TextEncoding::Utf8,
            notes_line_ending: LineEnding::Crlf,
        }
    }
}

impl SyncOptions {
    /// Only the notes file, no media at all.
    pub fn notes_only() -> Self {
        Self {
            download_audio: false,
            download_video: false,
            download_cover: false,
            download_background: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(32..=320).contains(&self.audio_bitrate) {
            return Err(SyncError::InvalidOptions(format!(
                "audio_bitrate must be between 32 and 320 kbit/s, got {}",
                self.audio_bitrate
            )));
        }
        if self.video_max_resolution == 0 || self.video_max_fps == 0 {
            return Err(SyncError::InvalidOptions(
                "video_max_resolution and video_max_fps must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a downloaded audio source with extension `source_ext` must go
    /// through the transcoder.
    pub fn audio_needs_transcode(&self, source_ext: Option<&str>) -> bool {
        self.normalize_audio
            || self.embed_artwork
            || source_ext != Some(self.audio_format.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SyncOptions::default();
        assert!(options.download_audio && options.download_video);
        assert_eq!(options.audio_format, AudioFormat::M4a);
        assert_eq!(options.audio_bitrate, 128);
        assert_eq!(options.video_max_resolution, 1080);
        assert_eq!(options.cover_max_size_px, 1920);
        assert_eq!(options.notes_encoding, TextEncoding::Utf8);
        assert_eq!(options.notes_line_ending, LineEnding::Crlf);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: SyncOptions =
            serde_json::from_str(r#"{"audio_format":"mp3","notes_encoding":"cp1252"}"#).unwrap();
        assert_eq!(options.audio_format, AudioFormat::Mp3);
        assert_eq!(options.notes_encoding, TextEncoding::Cp1252);
        assert!(options.download_cover);
    }

    #[test]
    fn test_validate_bitrate() {
        let options = SyncOptions {
            audio_bitrate: 1000,
            ..SyncOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(SyncError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_audio_needs_transcode() {
        let options = SyncOptions::default();
        assert!(!options.audio_needs_transcode(Some("m4a")));
        assert!(options.audio_needs_transcode(Some("webm")));
        assert!(options.audio_needs_transcode(None));

        let options = SyncOptions {
            normalize_audio: true,
            ..SyncOptions::default()
        };
        assert!(options.audio_needs_transcode(Some("m4a")));
    }
}
