//! Process configuration, loaded from a JSON file (spec.md §4.K / §6).
//! Replaces the C original's global `globals` registry with an explicit,
//! validated, `Arc`-shared value.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

pub const SEC_KEY_LENGTH: usize = 44; // base64-encoded 32-byte x25519 key, padded

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub interface: String,
    pub port: u16,
    #[serde(default)]
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    pub private_key: String,
    pub peer_public_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AudioEncoding {
    Opus,
    Pcm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub encoding: AudioEncoding,
    pub network_channel_count: usize,
    pub io_sample_rate: u32,
    pub device_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpusConfig {
    pub frame_size: usize,
    pub max_packet_size: usize,
    pub decode_ring_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PcmConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub decode_ring_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FecConfig {
    pub source_symbols_per_block: usize,
    pub symbol_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub ws_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub endpoints: Vec<EndpointConfig>,
    pub root: RootConfig,
    pub audio: AudioConfig,
    #[serde(default)]
    pub opus: Option<OpusConfig>,
    #[serde(default)]
    pub pcm: Option<PcmConfig>,
    pub fec: FecConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Config = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        for (i, ep) in self.endpoints.iter().enumerate() {
            if ep.interface.is_empty() {
                return Err(ConfigError::InvalidInterface(i));
            }
        }
        if self.root.private_key.len() != SEC_KEY_LENGTH
            || self.root.peer_public_key.len() != SEC_KEY_LENGTH
        {
            return Err(ConfigError::BadKeyLength {
                expected: SEC_KEY_LENGTH,
            });
        }
        match self.audio.encoding {
            AudioEncoding::Opus if self.opus.is_none() => {
                return Err(ConfigError::UnknownEncoding("OPUS (missing [opus] section)".into()))
            }
            AudioEncoding::Pcm if self.pcm.is_none() => {
                return Err(ConfigError::UnknownEncoding("PCM (missing [pcm] section)".into()))
            }
            _ => {}
        }
        Ok(())
    }

    pub fn decode_ring_length(&self) -> usize {
        match self.audio.encoding {
            AudioEncoding::Opus => self.opus.as_ref().unwrap().decode_ring_length,
            AudioEncoding::Pcm => self.pcm.as_ref().unwrap().decode_ring_length,
        }
    }

    pub fn audio_frame_size(&self) -> usize {
        match self.audio.encoding {
            AudioEncoding::Opus => self.opus.as_ref().unwrap().frame_size,
            AudioEncoding::Pcm => self.pcm.as_ref().unwrap().frame_size,
        }
    }

    pub fn encoded_sample_rate(&self) -> f64 {
        match self.audio.encoding {
            AudioEncoding::Opus => 48_000.0,
            AudioEncoding::Pcm => self.pcm.as_ref().unwrap().sample_rate as f64,
        }
    }

    pub fn max_encoded_packet_size(&self) -> usize {
        match self.audio.encoding {
            AudioEncoding::Opus => self.opus.as_ref().unwrap().max_packet_size,
            AudioEncoding::Pcm => 3 * self.audio.network_channel_count * self.audio_frame_size() + 2,
        }
    }
}
