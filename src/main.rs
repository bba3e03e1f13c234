use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, info, warn};
use vidring::common::logger;
use vidring::common::types::AnyResult;
use vidring::configs::Config;
use vidring::video::VideoPipeline;
use vidring::video::constants::TRANSPORT_VIDEO_SKIP;
use vidring::video::decoder::LoopbackBackend;

const DEFAULT_SOAK_SECS: u64 = 10;

/// Synthetic access unit: a transport prefix followed by an Annex-B start
/// code and a keyframe every `gop` packets.
fn synthetic_packet(seq: u64, gop: u64, dest: &mut [u8]) {
    let skip = TRANSPORT_VIDEO_SKIP as usize;
    dest[..skip].fill(0);
    dest[skip..skip + 4].copy_from_slice(&[0, 0, 0, 1]);
    dest[skip + 4] = if seq % gop == 0 { 0x65 } else { 0x41 };
    for (i, b) in dest[skip + 5..].iter_mut().enumerate() {
        *b = (seq as usize).wrapping_add(i) as u8;
    }
}

fn main() -> AnyResult<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Using built-in defaults: {}", e);
            Config::default()
        }
    };
    logger::init(&config);

    let secs = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u64>())
        .transpose()?
        .unwrap_or(DEFAULT_SOAK_SECS);

    let pipeline = Arc::new(VideoPipeline::new(
        &config,
        Arc::new(LoopbackBackend::auto_cycle()),
    )?);
    pipeline.start();

    let fps = config.health.target_fps.max(1);
    let frame_interval = Duration::from_secs(1) / fps;
    let resolution = pipeline.format().resolution;
    // Roughly 0.1 bit per pixel, the ballpark of a phone-projection stream.
    let base_len = (resolution.pixels() / 80).max(64) as u32;

    info!(
        "Soak run: {}s at {} fps, ~{} byte packets for {}",
        secs, fps, base_len, resolution
    );

    let running = Arc::new(AtomicBool::new(true));
    let producer = {
        let pipeline = pipeline.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("vidring-producer".to_string())
            .spawn(move || {
                let mut rng = rand::thread_rng();
                let mut seq = 0u64;
                let mut next = Instant::now();
                while running.load(Ordering::Relaxed) {
                    let gop = fps as u64;
                    let size = if seq % gop == 0 { base_len * 4 } else { base_len };
                    let len = ((size as f64 * rng.gen_range(0.75..1.25)) as u32).max(64);
                    if let Err(e) = pipeline.submit(len, TRANSPORT_VIDEO_SKIP, |dest| {
                        synthetic_packet(seq, gop, dest);
                        Ok(())
                    }) {
                        warn!("Producer: packet {} rejected: {}", seq, e);
                    }
                    seq += 1;

                    next += frame_interval;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                }
                seq
            })?
    };

    thread::sleep(Duration::from_secs(secs));
    running.store(false, Ordering::Relaxed);
    let produced = match producer.join() {
        Ok(n) => n,
        Err(_) => {
            error!("Producer thread panicked");
            0
        }
    };

    pipeline.stop();
    let stats = pipeline.stats();
    vidring::log_println!(
        "Soak finished: produced {} packets, received {}, queued {}, decoded {}, dropped {}, resizes {}, corruptions {}",
        produced,
        stats.received,
        stats.queued,
        stats.decoded,
        stats.dropped,
        stats.ring_resizes,
        stats.ring_corruptions
    );

    Ok(())
}
