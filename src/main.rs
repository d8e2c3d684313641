//! Receiver entry point: loads configuration, brings up the secure tunnel,
//! endpoints, demultiplexer, codec, syncer, audio output and telemetry
//! server, then runs until interrupted.

mod audio_out;
mod channel;
mod codec;
mod config;
mod demux;
mod endpoint;
mod error;
mod monitor;
mod ring;
mod stats;
mod syncer;
mod tunnel;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::audio_out::AudioOut;
use crate::codec::Codec;
use crate::config::Config;
use crate::demux::Demux;
use crate::endpoint::EndpointSet;
use crate::error::ReceiverError;
use crate::monitor::Monitor;
use crate::ring::DecodeRing;
use crate::stats::Stats;
use crate::syncer::Syncer;
use crate::tunnel::Tunnel;

const RECEIVE_CHANNEL_ID: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "slipstream-rx", about = "Low-latency, loss-tolerant audio receiver")]
struct Cli {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

fn init_logging(cli: &Cli) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "slipstream-rx.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    guard
}

/// One decoded-and-resampled datagram's worth of work: codec decode plus
/// resampler enqueue, run synchronously on the task that received it. Opus
/// accumulates one mono sub-packet per channel before a full interleaved
/// frame is available; PCM always completes in a single call.
fn handle_recovered_frame(
    frame: &[u8],
    codec: &Mutex<Codec>,
    syncer: &Mutex<Syncer>,
    producer: &Mutex<crate::ring::RingProducer>,
    stats: &Stats,
    network_channel_count: usize,
) {
    {
        let fill = producer.lock().len();
        stats
            .stream_buffer_pos
            .store((fill / network_channel_count) as i32, std::sync::atomic::Ordering::Relaxed);
    }

    let mut codec = codec.lock();
    let samples = match codec.decode(frame, stats) {
        Ok(Some(samples)) => samples,
        Ok(None) => return,
        Err(e) => {
            error!(error = %e, "codec decode failed");
            // PCM length mismatches are dropped silently, matching the
            // original decodePacket's PCM path (only crcFailCount counts).
            if matches!(
                e,
                crate::error::CodecError::UnexpectedLength { .. } | crate::error::CodecError::Opus(_)
            ) {
                stats.codec_error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            return;
        }
    };
    crate::stats::update_audio_meters(stats, samples, network_channel_count);
    let audio_frame_size = samples.len() / network_channel_count;
    let mut syncer = syncer.lock();
    let mut producer = producer.lock();
    syncer.enqueue_buf(samples, audio_frame_size, &mut producer, stats);
}

#[tokio::main]
async fn main() -> Result<(), ReceiverError> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli);

    let config = Config::load(&cli.config)?;
    info!(path = %cli.config.display(), "configuration loaded");

    let stats = Arc::new(Stats::new(config.endpoints.len(), config.audio.network_channel_count));
    let tunnel = Arc::new(Tunnel::new(&config.root)?);
    let endpoints = Arc::new(EndpointSet::open(&config.endpoints)?);
    for ep in &stats.endpoints {
        ep.open.store(1, std::sync::atomic::Ordering::Relaxed);
    }

    let mut demux = Demux::new();
    demux.register_channel(RECEIVE_CHANNEL_ID, &config.fec, config.max_encoded_packet_size());
    let demux = Arc::new(demux);

    let codec = Arc::new(Mutex::new(Codec::new(&config.audio, config.audio_frame_size())?));

    let decode_ring_max_size = config.audio.network_channel_count * config.decode_ring_length();
    let ring = DecodeRing::new(decode_ring_max_size);
    let (mut producer, consumer) = ring.split();
    // Half-fill the ring with silence so the audio callback has margin to
    // drain before the syncer starts delivering real samples.
    for _ in 0..(decode_ring_max_size / 2) {
        producer.push(0.0);
    }
    let syncer = Arc::new(Mutex::new(Syncer::new(
        config.encoded_sample_rate(),
        config.audio.io_sample_rate as f64,
        config.audio_frame_size(),
        config.audio.network_channel_count,
        decode_ring_max_size,
    )?));
    let producer = Arc::new(Mutex::new(producer));

    let _audio_out = AudioOut::start(&config.audio, consumer, stats.clone())?;

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    Monitor::serve(&config.monitor, stats.clone(), cancel.clone());

    let network_channel_count = config.audio.network_channel_count;

    for i in 0..endpoints.len() {
        let endpoint = endpoints.get(i);
        let endpoints = endpoints.clone();
        let tunnel = tunnel.clone();
        let stats = stats.clone();
        let demux = demux.clone();
        let codec = codec.clone();
        let syncer = syncer.clone();
        let producer = producer.clone();
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let on_plaintext = {
                let demux = demux.clone();
                let stats = stats.clone();
                let codec = codec.clone();
                let syncer = syncer.clone();
                let producer = producer.clone();
                move |buf: &[u8], ep_index: usize| {
                    demux.on_datagram(buf, ep_index, &stats, |_channel_id, frame| {
                        handle_recovered_frame(
                            frame,
                            &codec,
                            &syncer,
                            &producer,
                            &stats,
                            network_channel_count,
                        );
                    });
                }
            };
            endpoint.recv_task(tunnel, endpoints, stats, cancel, on_plaintext).await;
        });
    }

    {
        let tunnel = tunnel.clone();
        let endpoints = endpoints.clone();
        let stats = stats.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            tunnel.tick_loop(&endpoints, &stats, &cancel).await;
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    cancel.cancel();

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "task join error during shutdown");
        }
    }

    Ok(())
}
