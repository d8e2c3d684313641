//! Error taxonomy, one enum per failure domain (spec.md §7).
//!
//! Only `ConfigError`/`ResourceError` ever bubble out of `main`'s init path;
//! everything else is observed, logged and counted by the component that
//! hit it and never propagates past that boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("invalid interface name for endpoint {0}")]
    InvalidInterface(usize),
    #[error("private/peer key must be {expected}-char base64 x25519 keys")]
    BadKeyLength { expected: usize },
    #[error("invalid base64 in key material: {0}")]
    BadKeyEncoding(#[from] base64::DecodeError),
    #[error("decoded key is not 32 bytes")]
    BadKeyLen,
    #[error("unknown audio encoding {0:?}")]
    UnknownEncoding(String),
    #[error("failed reading config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to allocate {0}")]
    Alloc(&'static str),
    #[error("failed to spawn thread/task: {0}")]
    Spawn(String),
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("tunnel construction failed: {0}")]
    Init(String),
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("SLIP scratch buffer overflow")]
    Overflow,
    #[error("invalid SLIP escape byte")]
    BadEscape,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("opus decode returned unexpected length {got}, expected {expected}")]
    UnexpectedLength { got: i32, expected: usize },
    #[error("pcm payload has wrong length {got}, expected {expected}")]
    BadLength { got: usize, expected: usize },
    #[error("pcm CRC-16 mismatch")]
    CrcMismatch,
    #[error("opus error: {0}")]
    Opus(#[from] opus::Error),
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("decode ring overrun")]
    Overrun,
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no matching or default output device found")]
    NoDevice,
    #[error("cpal device error: {0}")]
    Device(#[from] cpal::DevicesError),
    #[error("cpal build stream error: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("cpal play stream error: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
    #[error("cpal default stream config error: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
}

/// Top-level error returned by the fallible init path in `main`.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Audio(#[from] AudioError),
}
