use std::time::Duration;

use roundtable_audio::DeviceProperties;

use crate::{CodecError, Result};

/// Clock rates the Opus family supports.
pub const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12_000, 16_000, 24_000, 48_000];

/// Negotiated codec parameters announced by the transport for a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CodecDescriptor {
    pub clock_rate: u32,
    pub channels: u16,
}

impl CodecDescriptor {
    /// Parse a configured codec name such as `Opus48000Mono`.
    pub fn parse(name: &str) -> Result<Self> {
        let rest = name
            .strip_prefix("Opus")
            .ok_or_else(|| CodecError::UnsupportedCodec(name.to_string()))?;

        let (rate_str, channels) = if let Some(r) = rest.strip_suffix("Mono") {
            (r, 1)
        } else if let Some(r) = rest.strip_suffix("Stereo") {
            (r, 2)
        } else {
            return Err(CodecError::UnsupportedCodec(name.to_string()));
        };

        let clock_rate: u32 = rate_str
            .parse()
            .map_err(|_| CodecError::UnsupportedCodec(name.to_string()))?;
        if !OPUS_SAMPLE_RATES.contains(&clock_rate) {
            return Err(CodecError::UnsupportedCodec(name.to_string()));
        }

        Ok(Self {
            clock_rate,
            channels,
        })
    }

    pub fn name(&self) -> String {
        let layout = if self.channels == 1 { "Mono" } else { "Stereo" };
        format!("Opus{}{layout}", self.clock_rate)
    }

    /// The edge format of PCM entering the encoder or leaving the decoder.
    pub fn properties(&self) -> DeviceProperties {
        DeviceProperties {
            sample_rate: self.clock_rate,
            channels: self.channels,
        }
    }
}

/// Parse an ordered configured codec list.
pub fn parse_codec_list(names: &[String]) -> Result<Vec<CodecDescriptor>> {
    names.iter().map(|n| CodecDescriptor::parse(n)).collect()
}

/// The preferred codec is the first local entry both peers support.
pub fn negotiate(
    local: &[CodecDescriptor],
    remote: &[CodecDescriptor],
) -> Option<CodecDescriptor> {
    local.iter().copied().find(|c| remote.contains(c))
}

/// Opus frame durations; `frame_size = rate x channels x duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDuration {
    Ms2_5,
    Ms5,
    Ms10,
    Ms20,
    Ms40,
    Ms60,
    Ms120,
}

impl FrameDuration {
    pub fn from_millis(ms: f64) -> Result<Self> {
        match ms {
            x if x == 2.5 => Ok(Self::Ms2_5),
            x if x == 5.0 => Ok(Self::Ms5),
            x if x == 10.0 => Ok(Self::Ms10),
            x if x == 20.0 => Ok(Self::Ms20),
            x if x == 40.0 => Ok(Self::Ms40),
            x if x == 60.0 => Ok(Self::Ms60),
            x if x == 120.0 => Ok(Self::Ms120),
            other => Err(CodecError::InvalidFrameDuration(other)),
        }
    }

    pub fn micros(&self) -> u64 {
        match self {
            Self::Ms2_5 => 2_500,
            Self::Ms5 => 5_000,
            Self::Ms10 => 10_000,
            Self::Ms20 => 20_000,
            Self::Ms40 => 40_000,
            Self::Ms60 => 60_000,
            Self::Ms120 => 120_000,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros())
    }

    /// Interleaved samples per encoded window at the given descriptor.
    pub fn frame_size(&self, descriptor: CodecDescriptor) -> usize {
        (descriptor.clock_rate as u64 * descriptor.channels as u64 * self.micros() / 1_000_000)
            as usize
    }
}

impl Default for FrameDuration {
    fn default() -> Self {
        Self::Ms20
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_names() {
        let d = CodecDescriptor::parse("Opus48000Mono").unwrap();
        assert_eq!(d.clock_rate, 48_000);
        assert_eq!(d.channels, 1);
        assert_eq!(d.name(), "Opus48000Mono");

        let d = CodecDescriptor::parse("Opus24000Stereo").unwrap();
        assert_eq!(d.clock_rate, 24_000);
        assert_eq!(d.channels, 2);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(CodecDescriptor::parse("G711").is_err());
        assert!(CodecDescriptor::parse("Opus44100Mono").is_err());
        assert!(CodecDescriptor::parse("Opus48000Quad").is_err());
    }

    #[test]
    fn test_negotiate_prefers_first_local() {
        let local = parse_codec_list(&[
            "Opus48000Mono".to_string(),
            "Opus24000Mono".to_string(),
        ])
        .unwrap();
        let remote = parse_codec_list(&[
            "Opus24000Mono".to_string(),
            "Opus48000Mono".to_string(),
        ])
        .unwrap();
        assert_eq!(
            negotiate(&local, &remote).unwrap().name(),
            "Opus48000Mono"
        );
        assert!(negotiate(&local, &[]).is_none());
    }

    #[test]
    fn test_frame_duration_parse_and_size() {
        let d = CodecDescriptor::parse("Opus48000Mono").unwrap();
        assert_eq!(FrameDuration::from_millis(20.0).unwrap().frame_size(d), 960);
        assert_eq!(FrameDuration::from_millis(2.5).unwrap().frame_size(d), 120);
        let stereo = CodecDescriptor::parse("Opus48000Stereo").unwrap();
        assert_eq!(
            FrameDuration::from_millis(20.0).unwrap().frame_size(stereo),
            1920
        );
        assert!(FrameDuration::from_millis(15.0).is_err());
    }
}
