//! WebSocket telemetry server (spec.md §4.J). Ported from `monitor.cpp`'s
//! protobuf-over-uWebSockets design; `prost` + `tokio-tungstenite` are the
//! idiomatic Rust equivalents since nothing in the retrieval pack covers
//! wire-format telemetry serving directly.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use prost::Message;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::stats::{map_block_timing_ring, map_stream_meter_bins, Stats};

pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/monitor.rs"));
}

const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(50);

pub struct Monitor;

impl Monitor {
    /// Spawns the accept loop. At most the most-recently-connected observer
    /// is kept live; a new connection replaces whatever broadcaster task was
    /// already running, matching the original's single `wsClient` slot.
    pub fn serve(cfg: &MonitorConfig, stats: Arc<Stats>, cancel: tokio_util::sync::CancellationToken) {
        let port = cfg.ws_port;
        tokio::spawn(async move {
            let listener = match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, port, "monitor failed to bind");
                    return;
                }
            };
            info!(port, "monitor listening");

            let mut current: Option<tokio::task::JoinHandle<()>> = None;
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    a = listener.accept() => a,
                };
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "monitor accept error");
                        continue;
                    }
                };

                if let Some(old) = current.take() {
                    old.abort();
                }

                let stats = stats.clone();
                let cancel = cancel.clone();
                current = Some(tokio::spawn(async move {
                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            warn!(error = %e, %peer, "monitor websocket handshake failed");
                            return;
                        }
                    };
                    info!(%peer, "monitor observer connected");
                    broadcast_loop(ws, stats, cancel).await;
                }));
            }
        });
    }
}

async fn broadcast_loop(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    stats: Arc<Stats>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let snapshot = build_snapshot(&stats);
        let mut buf = Vec::with_capacity(snapshot.encoded_len());
        if snapshot.encode(&mut buf).is_err() {
            continue;
        }
        if ws.send(WsMessage::Binary(buf)).await.is_err() {
            break;
        }
    }
}

/// Reports each endpoint's last-seen SBN relative to endpoint 0's, wrapped
/// into `[-128, 127]`, matching `monitor.cpp`'s `statsLoop` (`relSbn =
/// lastSbn[i] - lastSbn[0]`, folded into the signed 8-bit range). Lets an
/// observer see path skew without needing the absolute SBN, which wraps.
fn relative_endpoint_sbns(stats: &Stats) -> Vec<i32> {
    let base = stats
        .endpoints
        .first()
        .map(|ep| ep.last_sbn.load(Ordering::Relaxed))
        .unwrap_or(0);
    stats
        .endpoints
        .iter()
        .map(|ep| {
            let mut rel = ep.last_sbn.load(Ordering::Relaxed) - base;
            if rel > 127 {
                rel -= 256;
            }
            if rel < -128 {
                rel += 256;
            }
            rel
        })
        .collect()
}

fn build_snapshot(stats: &Stats) -> pb::MonitorSnapshot {
    let endpoints = relative_endpoint_sbns(stats)
        .into_iter()
        .zip(stats.endpoints.iter())
        .map(|(last_relative_sbn, ep)| pb::EndpointStats {
            last_relative_sbn,
            open: ep.open.load(Ordering::Relaxed),
            bytes_out: ep.bytes_out.load(Ordering::Relaxed),
            bytes_in: ep.bytes_in.load(Ordering::Relaxed),
            send_congestion: ep.send_congestion.load(Ordering::Relaxed),
        })
        .collect();

    let audio_channels = stats
        .audio_channels
        .iter()
        .map(|ch| pb::AudioChannelStats {
            clipping_count: ch.clipping_count.load(Ordering::Relaxed),
            level_fast: ch.level_fast.load(),
            level_slow: ch.level_slow.load(),
        })
        .collect();

    let stream_meter_raw: Vec<u32> = stats
        .stream_meter_bins
        .iter()
        .map(|b| b.load(Ordering::Relaxed))
        .collect();

    let audio_stats = pb::AudioStats {
        stream_buffer_size: stats.stream_buffer_pos.load(Ordering::Relaxed),
        buffer_overrun_count: stats.buffer_overrun_count.load(Ordering::Relaxed),
        buffer_underrun_count: stats.buffer_underrun_count.load(Ordering::Relaxed),
        encode_thread_jitter_count: stats.encode_thread_jitter_count.load(Ordering::Relaxed),
        audio_loop_xrun_count: stats.audio_loop_xrun_count.load(Ordering::Relaxed),
        receiver_sync: stats.receiver_sync_filt.load(),
        audio_channel: audio_channels,
        stream_meter_bins: map_stream_meter_bins(&stream_meter_raw),
        opus_stats: Some(pb::OpusStats {
            codec_error_count: stats.codec_error_count.load(Ordering::Relaxed),
        }),
        pcm_stats: Some(pb::PcmStats {
            crc_fail_count: stats.crc_fail_count.load(Ordering::Relaxed),
        }),
    };

    let mux_channel = pb::MuxChannelStats {
        dup_block_count: stats.dup_block_count.load(Ordering::Relaxed),
        ooo_block_count: stats.ooo_block_count.load(Ordering::Relaxed),
        block_timing: map_block_timing_ring(&stats.block_timing_ring),
        endpoint: endpoints,
        audio_stats: Some(audio_stats),
    };

    pb::MonitorSnapshot {
        mux_channel: vec![mux_channel],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn relative_sbn_is_zero_for_endpoint_zero() {
        let stats = Stats::new(2, 0);
        stats.endpoints[0].last_sbn.store(200, Ordering::Relaxed);
        stats.endpoints[1].last_sbn.store(205, Ordering::Relaxed);
        assert_eq!(relative_endpoint_sbns(&stats), vec![0, 5]);
    }

    #[test]
    fn relative_sbn_wraps_across_256_boundary() {
        let stats = Stats::new(2, 0);
        stats.endpoints[0].last_sbn.store(254, Ordering::Relaxed);
        stats.endpoints[1].last_sbn.store(2, Ordering::Relaxed);
        // 2 - 254 = -252, folds into -252 + 256 = 4 (endpoint 1 is 4 ahead)
        assert_eq!(relative_endpoint_sbns(&stats), vec![0, 4]);
    }
}
