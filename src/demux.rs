//! Transport-header parsing, channel dispatch and FEC block reassembly
//! (spec.md §4.D).

use std::collections::HashMap;

use parking_lot::Mutex;
use raptorq::{Decoder, EncodingPacket, ObjectTransmissionInformation, PayloadId};
use tracing::debug;

use crate::channel::Channel;
use crate::config::FecConfig;
use crate::stats::Stats;

/// Transport header: 1-byte channel id, 1-byte SBN, 2-byte little-endian ESI,
/// followed by the FEC symbol payload.
const HEADER_LEN: usize = 4;

struct FecState {
    sbn: u8,
    decoder: Decoder,
}

struct ChannelEntry {
    channel: Mutex<Channel>,
    fec: Mutex<Option<FecState>>,
    oti: ObjectTransmissionInformation,
}

/// Demultiplexes decrypted datagrams across registered channels, running
/// each channel's FEC reconstruction and then its ordering/destuffer state
/// machine exactly once per recovered source block.
pub struct Demux {
    channels: HashMap<u8, ChannelEntry>,
}

impl Demux {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    pub fn register_channel(&mut self, id: u8, fec: &FecConfig, max_encoded_packet_size: usize) {
        let block_len = fec.source_symbols_per_block * fec.symbol_len;
        let oti = ObjectTransmissionInformation::new(
            block_len as u64,
            fec.symbol_len as u16,
            1,
            1,
            1,
        );
        self.channels.insert(
            id,
            ChannelEntry {
                channel: Mutex::new(Channel::new(max_encoded_packet_size)),
                fec: Mutex::new(None),
                oti,
            },
        );
    }

    /// Feeds one decrypted datagram through FEC reconstruction and, on a
    /// recovered source block, the channel's ordering state machine.
    /// `on_frame` is invoked once per completed codec frame recovered from
    /// the destuffer, tagged with the channel id it came from. `ep_index`
    /// identifies which endpoint the datagram arrived on, for the
    /// per-endpoint `last_sbn` stat (spec.md §3, Endpoint attributes).
    pub fn on_datagram(&self, buf: &[u8], ep_index: usize, stats: &Stats, mut on_frame: impl FnMut(u8, &[u8])) {
        if buf.len() <= HEADER_LEN {
            debug!(len = buf.len(), "dropping undersized datagram");
            return;
        }
        let channel_id = buf[0];
        let sbn = buf[1];
        let esi = u16::from_le_bytes([buf[2], buf[3]]) as u32;
        let payload = &buf[HEADER_LEN..];

        if let Some(ep) = stats.endpoints.get(ep_index) {
            ep.last_sbn.store(sbn as i32, std::sync::atomic::Ordering::Relaxed);
        }

        let Some(entry) = self.channels.get(&channel_id) else {
            debug!(channel_id, "dropping datagram for unknown channel");
            return;
        };

        let recovered = {
            let mut fec = entry.fec.lock();
            match fec.as_mut() {
                Some(state) if state.sbn == sbn => {}
                _ => {
                    *fec = Some(FecState {
                        sbn,
                        decoder: Decoder::new(entry.oti.clone()),
                    });
                }
            }
            let state = fec.as_mut().unwrap();
            let packet = EncodingPacket::new(PayloadId::new(sbn, esi), payload.to_vec());
            let result = state.decoder.decode(packet);
            if result.is_some() {
                *fec = None;
            }
            result
        };

        if let Some(block) = recovered {
            let mut channel = entry.channel.lock();
            channel.on_block(&block, sbn, stats, |frame| on_frame(channel_id, frame));
        }
    }
}

impl Default for Demux {
    fn default() -> Self {
        Self::new()
    }
}
