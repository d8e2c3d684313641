//! Adapter over `boringtun::noise::Tunn`, one-to-one with `endpoint-secure.c`
//! (spec.md §4.C).

use std::sync::atomic::Ordering;
use std::time::Duration;

use boringtun::noise::{Tunn, TunnResult};
use parking_lot::Mutex;
use tracing::warn;

use crate::config::RootConfig;
use crate::endpoint::EndpointSet;
use crate::error::CryptoError;
use crate::stats::Stats;
use crate::util;

const SEC_KEEP_ALIVE_INTERVAL: u16 = 25;
const ENDPOINT_TICK_INTERVAL: Duration = Duration::from_millis(250);
const WG_READ_BUF_LEN: usize = 1500;
const SEC_KEY_LENGTH: usize = 44;

/// Builds the synthetic 20-byte IPv4 header BoringTun's packet checks
/// require: version 4, IHL 5, total length at bytes 2-3 big-endian, all
/// other fields zero.
pub fn build_fake_ipv4_header(payload_len: usize) -> [u8; 20] {
    let mut hdr = [0u8; 20];
    hdr[0] = 0x45;
    let total_len = (payload_len + 20) as u16;
    hdr[2] = (total_len >> 8) as u8;
    hdr[3] = (total_len & 0xff) as u8;
    hdr
}

pub struct Tunnel {
    tunn: Mutex<Tunn>,
}

impl Tunnel {
    pub fn new(cfg: &RootConfig) -> Result<Self, CryptoError> {
        let priv_key_bytes = util::x25519_base64_to_key(&cfg.private_key, SEC_KEY_LENGTH)
            .map_err(|e| CryptoError::Init(e.to_string()))?;
        let peer_key_bytes = util::x25519_base64_to_key(&cfg.peer_public_key, SEC_KEY_LENGTH)
            .map_err(|e| CryptoError::Init(e.to_string()))?;

        let private_key = boringtun::x25519::StaticSecret::from(priv_key_bytes);
        let peer_public_key = boringtun::x25519::PublicKey::from(peer_key_bytes);

        let tunn = Tunn::new(private_key, peer_public_key, None, Some(SEC_KEEP_ALIVE_INTERVAL), 0, None)
            .map_err(|e| CryptoError::Init(format!("{e:?}")))?;

        Ok(Self {
            tunn: Mutex::new(tunn),
        })
    }

    /// Decrypts one inbound datagram, looping the tunnel's internal state
    /// machine until it is done. Recovered plaintext (with the synthetic
    /// IPv4 header stripped) is handed to `on_plaintext`; any
    /// handshake/keepalive response is sent back out on every endpoint.
    pub fn decrypt(
        &self,
        datagram: &[u8],
        ep_index: usize,
        endpoints: &EndpointSet,
        stats: &Stats,
        mut on_plaintext: impl FnMut(&[u8], usize),
    ) {
        stats.endpoints[ep_index]
            .bytes_in
            .fetch_add(datagram.len() as u64 + 28, Ordering::Relaxed);

        let mut dst = vec![0u8; WG_READ_BUF_LEN];
        let mut src: &[u8] = datagram;
        loop {
            let result = {
                let mut tunn = self.tunn.lock();
                tunn.decapsulate(None, src, &mut dst)
            };
            match result {
                TunnResult::Done => break,
                TunnResult::Err(e) => {
                    if !matches!(e, boringtun::noise::errors::WireGuardError::DuplicateCounter) {
                        warn!(?e, ep_index, "wireguard decrypt error");
                        stats.endpoints[ep_index].errors.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
                TunnResult::WriteToTunnelV4(buf, _addr) => {
                    if buf.len() > 20 {
                        on_plaintext(&buf[20..], ep_index);
                    }
                    break;
                }
                TunnResult::WriteToTunnelV6(_, _) => break,
                TunnResult::WriteToNetwork(buf) => {
                    endpoints.send_to_all(buf, stats);
                    // Drain any further handshake responses the tunnel queues
                    // up by re-polling with an empty input, matching the
                    // original's bufLen = 0 continuation.
                    src = &[];
                }
            }
        }
    }

    /// Encrypts one plaintext application packet and sends the resulting
    /// ciphertext (or handshake-initiation traffic) to every endpoint.
    pub fn encrypt(&self, plaintext: &[u8], endpoints: &EndpointSet, stats: &Stats) -> Result<(), CryptoError> {
        const MAX_SRC_DATA_LEN: usize = 1480;
        if plaintext.len() > MAX_SRC_DATA_LEN {
            return Err(CryptoError::Init("plaintext exceeds max tunnel payload".into()));
        }

        let header = build_fake_ipv4_header(plaintext.len());
        let mut src = Vec::with_capacity(20 + plaintext.len());
        src.extend_from_slice(&header);
        src.extend_from_slice(plaintext);

        let mut dst = vec![0u8; 1500];
        let result = {
            let mut tunn = self.tunn.lock();
            tunn.encapsulate(&src, &mut dst)
        };
        if let TunnResult::WriteToNetwork(buf) = result {
            if !buf.is_empty() {
                endpoints.send_to_all(buf, stats);
            }
        }
        Ok(())
    }

    /// Periodically drives the tunnel's internal timers, sending any
    /// resulting handshake/keepalive traffic. On Linux, promotes this task's
    /// carrier thread to `SCHED_FIFO` priority 98 on first poll to avoid
    /// priority inversion against `decrypt`/`encrypt` callers contending the
    /// same mutex.
    pub async fn tick_loop(
        &self,
        endpoints: &EndpointSet,
        stats: &Stats,
        cancel: &tokio_util::sync::CancellationToken,
    ) {
        #[cfg(target_os = "linux")]
        set_caller_thread_realtime(98);

        let mut interval = tokio::time::interval(ENDPOINT_TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let mut buf = vec![0u8; 1500];
            let result = {
                let mut tunn = self.tunn.lock();
                tunn.update_timers(&mut buf)
            };
            if let TunnResult::WriteToNetwork(out) = result {
                endpoints.send_to_all(out, stats);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn set_caller_thread_realtime(priority: libc::c_int) {
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let ret = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
        if ret != 0 {
            warn!("failed to set tunnel tick thread to SCHED_FIFO; continuing at default priority");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_ipv4_header_encodes_total_length() {
        let hdr = build_fake_ipv4_header(100);
        assert_eq!(hdr[0], 0x45);
        let total = u16::from_be_bytes([hdr[2], hdr[3]]);
        assert_eq!(total, 120);
        assert!(hdr[4..].iter().all(|&b| b == 0));
    }
}
