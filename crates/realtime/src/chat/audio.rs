//! Voice note payloads

/// Approximate encoded bitrate of recorded voice notes (128 kbit/s)
pub const AUDIO_BYTES_PER_SECOND: u64 = 16_000;

/// A recorded voice note awaiting upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    /// Duration estimated from payload size, at least one second
    pub fn estimated_duration_secs(&self) -> u32 {
        estimate_duration_secs(self.bytes.len() as u64)
    }

    pub fn extension(&self) -> &'static str {
        let subtype = self
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();

        match subtype {
            "audio/ogg" => "ogg",
            "audio/mpeg" => "mp3",
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
            "audio/wav" | "audio/x-wav" => "wav",
            _ => "webm",
        }
    }
}

/// Estimate playback length from byte size, rounding up
pub fn estimate_duration_secs(size_bytes: u64) -> u32 {
    let secs = size_bytes.div_ceil(AUDIO_BYTES_PER_SECOND).max(1);
    u32::try_from(secs).unwrap_or(u32::MAX)
}
