//! Audio format conversion.
//!
//! Every target format is one [`Encoder`] variant. Conversion parameters are
//! kept as short normalized strings (`vbr:2`, `quality:6`, ...) so they can be
//! stored in the config file and compared verbatim.

pub mod encoder;
pub mod rules;

pub use encoder::ConversionExecutor;
pub use rules::{ConversionRule, RuleSpec, RuleTable, WILDCARD};

use crate::error::ConversionError;
use once_cell::sync::Lazy;
use regex::Regex;

/// Conversion string meaning "copy the file byte for byte".
pub const COPY: &str = "copy";

/// Suffixes the encoder is able to read.
pub const DECODABLE: &[&str] = &["flac", "wav", "aiff", "mp3", "ogg", "opus", "m4a"];

static PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<mode>[a-z]+)(?::(?P<value>-?\d+))?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoder {
    Flac,
    Mp3,
    Ogg,
    Opus,
    Copy,
}

impl Encoder {
    /// Encoder producing files with the given suffix, if there is one.
    pub fn for_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "flac" => Some(Encoder::Flac),
            "mp3" => Some(Encoder::Mp3),
            "ogg" => Some(Encoder::Ogg),
            "opus" => Some(Encoder::Opus),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Encoder::Flac => "flac",
            Encoder::Mp3 => "mp3",
            Encoder::Ogg => "ogg",
            Encoder::Opus => "opus",
            Encoder::Copy => COPY,
        }
    }

    /// Validate a raw parameter string and fill in defaults.
    pub fn normalize(&self, raw: &str) -> Result<String, ConversionError> {
        let cleaned: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();

        if *self == Encoder::Copy {
            return if cleaned == COPY {
                Ok(COPY.to_string())
            } else {
                Err(self.invalid(raw, "only 'copy' is accepted"))
            };
        }

        let (mode, value) = if cleaned.is_empty() {
            (self.default_mode(), None)
        } else {
            let caps = PARAM_RE
                .captures(&cleaned)
                .ok_or_else(|| self.invalid(raw, "expected '<mode>' or '<mode>:<number>'"))?;
            let value = match caps.name("value") {
                Some(v) => Some(
                    v.as_str()
                        .parse::<i32>()
                        .map_err(|e| self.invalid(raw, &e.to_string()))?,
                ),
                None => None,
            };
            (caps.name("mode").map_or("", |m| m.as_str()), value)
        };

        let (lo, hi, default) = self
            .mode_range(mode)
            .ok_or_else(|| self.invalid(raw, &format!("unknown mode '{}'", mode)))?;
        let value = value.unwrap_or(default);
        if value < lo || value > hi {
            return Err(self.invalid(raw, &format!("value must be within {}..={}", lo, hi)));
        }

        Ok(format!("{}:{}", mode, value))
    }

    /// Codec arguments for ffmpeg, given an already normalized parameter string.
    pub fn codec_args(&self, params: &str) -> Vec<String> {
        let (mode, value) = params.split_once(':').unwrap_or((params, ""));
        let args: Vec<String> = match (self, mode) {
            (Encoder::Flac, _) => vec!["-c:a", "flac", "-compression_level", value]
                .into_iter()
                .map(String::from)
                .collect(),
            (Encoder::Mp3, "cbr") => vec![
                "-c:a".into(),
                "libmp3lame".into(),
                "-b:a".into(),
                format!("{}k", value),
            ],
            (Encoder::Mp3, _) => vec!["-c:a", "libmp3lame", "-q:a", value]
                .into_iter()
                .map(String::from)
                .collect(),
            (Encoder::Ogg, _) => vec!["-c:a", "libvorbis", "-q:a", value]
                .into_iter()
                .map(String::from)
                .collect(),
            (Encoder::Opus, _) => vec![
                "-c:a".into(),
                "libopus".into(),
                "-b:a".into(),
                format!("{}k", value),
            ],
            (Encoder::Copy, _) => Vec::new(),
        };

        // Cover art survives in flac and mp3 only.
        let mut video = match self {
            Encoder::Flac | Encoder::Mp3 => vec!["-c:v".to_string(), "copy".to_string()],
            _ => vec!["-vn".to_string()],
        };
        video.extend(args);
        video
    }

    fn default_mode(&self) -> &'static str {
        match self {
            Encoder::Flac => "compression",
            Encoder::Mp3 => "vbr",
            Encoder::Ogg => "quality",
            Encoder::Opus => "bitrate",
            Encoder::Copy => COPY,
        }
    }

    /// (min, max, default) for a mode of this encoder.
    fn mode_range(&self, mode: &str) -> Option<(i32, i32, i32)> {
        match (self, mode) {
            (Encoder::Flac, "compression") => Some((0, 12, 5)),
            (Encoder::Mp3, "vbr") => Some((0, 9, 2)),
            (Encoder::Mp3, "cbr") => Some((32, 320, 320)),
            (Encoder::Ogg, "quality") => Some((-1, 10, 6)),
            (Encoder::Opus, "bitrate") => Some((6, 510, 128)),
            _ => None,
        }
    }

    fn invalid(&self, value: &str, message: &str) -> ConversionError {
        ConversionError::InvalidParams {
            format: self.name(),
            value: value.to_string(),
            message: message.to_string(),
        }
    }
}

/// Normalize a raw conversion string for files ending up with `target_suffix`.
///
/// `copy` is accepted for every suffix; whether it is legal for a given rule
/// is checked by the rule table.
pub fn normalize(target_suffix: &str, raw: &str) -> Result<String, ConversionError> {
    if raw.trim().eq_ignore_ascii_case(COPY) {
        return Ok(COPY.to_string());
    }
    match Encoder::for_suffix(target_suffix) {
        Some(encoder) => encoder.normalize(raw),
        None => Err(ConversionError::InvalidParams {
            format: "unknown",
            value: raw.to_string(),
            message: format!("no encoder produces '.{}' files", target_suffix),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fills_defaults() {
        assert_eq!(normalize("mp3", "").unwrap(), "vbr:2");
        assert_eq!(normalize("mp3", "VBR").unwrap(), "vbr:2");
        assert_eq!(normalize("mp3", " cbr : 192 ").unwrap(), "cbr:192");
        assert_eq!(normalize("ogg", "").unwrap(), "quality:6");
        assert_eq!(normalize("ogg", "quality:-1").unwrap(), "quality:-1");
        assert_eq!(normalize("opus", "bitrate").unwrap(), "bitrate:128");
        assert_eq!(normalize("flac", "compression:8").unwrap(), "compression:8");
    }

    #[test]
    fn copy_is_accepted_for_any_suffix() {
        assert_eq!(normalize("mp3", "Copy").unwrap(), COPY);
        assert_eq!(normalize("jpg", "copy").unwrap(), COPY);
    }

    #[test]
    fn normalize_rejects_bad_values() {
        assert!(normalize("mp3", "vbr:10").is_err());
        assert!(normalize("mp3", "cbr:16").is_err());
        assert!(normalize("opus", "quality:5").is_err());
        assert!(normalize("flac", "fast").is_err());
        assert!(normalize("flac", "compression:x").is_err());
        assert!(normalize("wav", "").is_err());
    }

    #[test]
    fn codec_args_follow_mode() {
        let args = Encoder::Mp3.codec_args("cbr:256");
        assert!(args.windows(2).any(|w| w[0] == "-b:a" && w[1] == "256k"));

        let args = Encoder::Mp3.codec_args("vbr:0");
        assert!(args.windows(2).any(|w| w[0] == "-q:a" && w[1] == "0"));

        let args = Encoder::Opus.codec_args("bitrate:96");
        assert!(args.contains(&"libopus".to_string()));
        assert!(args.contains(&"-vn".to_string()));
    }
}
