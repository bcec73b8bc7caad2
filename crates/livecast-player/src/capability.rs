//! Playback path selection.
//!
//! Chooses, once per session and before anything is fetched, between
//! appending the stream into a platform decode buffer ("buffered") and
//! handing the stream URL to the platform's own player ("fallback").

/// What the platform can do, as reported by its [`MediaPlatform`].
///
/// [`MediaPlatform`]: crate::MediaPlatform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// An incremental decode buffer API is available.
    pub buffered_decode: bool,
    /// Response bodies can be read incrementally while they arrive.
    pub incremental_fetch: bool,
    /// Running on a mobile device.
    pub mobile: bool,
}

impl Capabilities {
    /// A desktop platform with everything the buffered path needs.
    pub fn full() -> Self {
        Self {
            buffered_decode: true,
            incremental_fetch: true,
            mobile: false,
        }
    }
}

/// MIME type with codec parameters, as passed to a type-support query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodecProfile(String);

impl CodecProfile {
    pub fn new(mime: impl Into<String>) -> Self {
        Self(mime.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CodecProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodecProfile {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// H.264 Constrained Baseline 3.0 + AAC-LC.
pub const AVC_BASELINE_AAC: &str = r#"video/mp4; codecs="avc1.42E01E, mp4a.40.2""#;
/// H.264 Main 3.1 + AAC-LC.
pub const AVC_MAIN_AAC: &str = r#"video/mp4; codecs="avc1.4D401F, mp4a.40.2""#;
/// H.264 High 4.0 + AAC-LC.
pub const AVC_HIGH_AAC: &str = r#"video/mp4; codecs="avc1.640028, mp4a.40.2""#;

/// Acceptable profiles, most compatible first.
pub fn default_codecs() -> Vec<CodecProfile> {
    [AVC_BASELINE_AAC, AVC_MAIN_AAC, AVC_HIGH_AAC]
        .into_iter()
        .map(CodecProfile::from)
        .collect()
}

/// Why the fallback path was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NoBufferedDecode,
    NoIncrementalFetch,
    /// Mobile platforms always use the native player.
    Mobile,
    NoSupportedCodec,
    /// The path looked usable but no decode buffer could be opened.
    BufferSetupFailed,
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoBufferedDecode => "no decode buffer support",
            Self::NoIncrementalFetch => "no incremental fetch support",
            Self::Mobile => "mobile platform",
            Self::NoSupportedCodec => "no supported codec profile",
            Self::BufferSetupFailed => "decode buffer setup failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackPath {
    /// Append into a decode buffer opened for this profile.
    Buffered(CodecProfile),
    /// Let the platform play the stream URL directly.
    Fallback(FallbackReason),
}

/// First profile in `codecs` the platform claims to support.
pub fn first_supported<'a>(
    codecs: &'a [CodecProfile],
    is_supported: impl Fn(&CodecProfile) -> bool,
) -> Option<&'a CodecProfile> {
    codecs.iter().find(|codec| is_supported(codec))
}

/// Decide the playback path.
pub fn select_path(
    caps: &Capabilities,
    codecs: &[CodecProfile],
    is_supported: impl Fn(&CodecProfile) -> bool,
) -> PlaybackPath {
    if !caps.buffered_decode {
        return PlaybackPath::Fallback(FallbackReason::NoBufferedDecode);
    }
    if !caps.incremental_fetch {
        return PlaybackPath::Fallback(FallbackReason::NoIncrementalFetch);
    }
    if caps.mobile {
        return PlaybackPath::Fallback(FallbackReason::Mobile);
    }

    match first_supported(codecs, is_supported) {
        Some(codec) => PlaybackPath::Buffered(codec.clone()),
        None => PlaybackPath::Fallback(FallbackReason::NoSupportedCodec),
    }
}
