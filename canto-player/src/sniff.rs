//! Content sniffing: pick a codec from the first bytes of a track.
//!
//! The worker never trusts file names (it never sees one it could trust,
//! only descriptors); the magic bytes decide.

/// The codecs the worker knows how to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Vorbis,
    Flac,
    Mp3,
    Opus,
}

impl Codec {
    /// Extension hint handed to the format prober.
    pub fn extension(self) -> &'static str {
        match self {
            Codec::Vorbis => "ogg",
            Codec::Flac => "flac",
            Codec::Mp3 => "mp3",
            Codec::Opus => "opus",
        }
    }
}

/// Sniff the codec from the opening bytes of a file. `None` for unknown
/// formats. Opus is checked before the generic Ogg capture, since an
/// Opus stream is itself Ogg-framed.
pub fn sniff(head: &[u8]) -> Option<Codec> {
    if head.len() < 8 {
        return None;
    }
    if head.starts_with(b"fLaC") {
        return Some(Codec::Flac);
    }
    if head.starts_with(b"ID3") || head.starts_with(&[0xFF, 0xFB]) {
        return Some(Codec::Mp3);
    }
    if contains(head, b"OpusHead") {
        return Some(Codec::Opus);
    }
    if contains(head, b"OggS") {
        return Some(Codec::Vorbis);
    }
    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
