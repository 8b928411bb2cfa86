//! Subcommand implementations.

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use flatshm::name::{MUTEX_SUFFIX, READ_SUFFIX, SEQLOCK_SUFFIX, WRITE_SUFFIX};
use flatshm::{
    ChannelConfig, HandoffChannel, Image4kRgb, MutexChannel, SeqLockChannel, Semaphore,
    SharedSegment,
};

use crate::ChannelKind;

/// Poll interval for kinds without a blocking read.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

fn stamp(frame: &mut Image4kRgb, frame_number: u64) {
    frame.frame_number = frame_number;
    frame.fill((frame_number % 256) as u8);
    frame.timestamp = now_ns();
}

fn report(frame: &Image4kRgb) {
    let latency = Duration::from_nanos(now_ns().saturating_sub(frame.timestamp));
    tracing::info!(
        frame = frame.frame_number,
        latency = ?latency,
        first_pixel = ?frame.pixel(0, 0),
        "received frame"
    );
}

/// Write `frames` numbered frames, one every `interval_ms`.
pub fn produce(
    name: &str,
    kind: ChannelKind,
    frames: u64,
    interval_ms: u64,
    config: &ChannelConfig,
) -> Result<()> {
    let interval = Duration::from_millis(interval_ms);
    let mut frame = Image4kRgb::new_boxed();
    tracing::info!(name, ?kind, frames, "producing");

    let mut send_all = |send: &mut dyn FnMut(&Image4kRgb) -> flatshm::Result<()>| -> Result<()> {
        for frame_number in 1..=frames {
            stamp(&mut frame, frame_number);
            send(&frame).with_context(|| format!("failed to send frame {frame_number}"))?;
            tracing::debug!(frame = frame_number, "sent frame");
            if !interval.is_zero() {
                thread::sleep(interval);
            }
        }
        Ok(())
    };

    match kind {
        ChannelKind::Mutex => {
            let channel = MutexChannel::<Image4kRgb>::with_config(name, config)
                .with_context(|| format!("failed to open mutex channel {name}"))?;
            send_all(&mut |f: &Image4kRgb| channel.store(f))?;
            channel.close()?;
        }
        ChannelKind::Handoff => {
            let channel = HandoffChannel::<Image4kRgb>::with_config(name, config)
                .with_context(|| format!("failed to open handoff channel {name}"))?;
            send_all(&mut |f: &Image4kRgb| channel.produce(f))?;
            channel.close()?;
        }
        ChannelKind::Seqlock => {
            let channel = SeqLockChannel::<Image4kRgb>::with_config(name, config)
                .with_context(|| format!("failed to open seqlock channel {name}"))?;
            send_all(&mut |f: &Image4kRgb| {
                channel.store(f);
                Ok(())
            })?;
            channel.close()?;
        }
    }

    tracing::info!(name, frames, "producer finished");
    Ok(())
}

/// Read `frames` distinct frames and log their latency.
pub fn consume(name: &str, kind: ChannelKind, frames: u64, config: &ChannelConfig) -> Result<()> {
    let mut frame = Image4kRgb::new_boxed();
    let mut last_seen = 0;
    let mut received = 0;
    tracing::info!(name, ?kind, frames, "consuming");

    match kind {
        ChannelKind::Mutex => {
            let mut channel = MutexChannel::<Image4kRgb>::with_config(name, config)
                .with_context(|| format!("failed to open mutex channel {name}"))?;
            while received < frames {
                let handle = channel.load();
                if !handle.wait_snapshot() {
                    tracing::warn!(name, "snapshot not ready within timeout");
                    continue;
                }
                handle.copy_into(&mut frame);
                if frame.frame_number != last_seen && frame.frame_number != 0 {
                    last_seen = frame.frame_number;
                    received += 1;
                    report(&frame);
                } else {
                    thread::sleep(POLL_INTERVAL);
                }
            }
            channel.close()?;
        }
        ChannelKind::Handoff => {
            let channel = HandoffChannel::<Image4kRgb>::with_config(name, config)
                .with_context(|| format!("failed to open handoff channel {name}"))?;
            while received < frames {
                channel.consume_into(&mut frame)?;
                received += 1;
                report(&frame);
            }
            channel.close()?;
        }
        ChannelKind::Seqlock => {
            let channel = SeqLockChannel::<Image4kRgb>::with_config(name, config)
                .with_context(|| format!("failed to open seqlock channel {name}"))?;
            while received < frames {
                channel.load_into(&mut frame);
                if frame.frame_number != last_seen && frame.frame_number != 0 {
                    last_seen = frame.frame_number;
                    received += 1;
                    report(&frame);
                } else {
                    thread::sleep(POLL_INTERVAL);
                }
            }
            channel.close()?;
        }
    }

    tracing::info!(name, received, "consumer finished");
    Ok(())
}

/// Unlink every object name a channel of `kind` uses.
pub fn cleanup(name: &str, kind: ChannelKind) -> Result<()> {
    let (segment, semaphores): (String, Vec<String>) = match kind {
        ChannelKind::Mutex => (name.to_string(), vec![format!("{name}{MUTEX_SUFFIX}")]),
        ChannelKind::Handoff => (
            name.to_string(),
            vec![format!("{name}{READ_SUFFIX}"), format!("{name}{WRITE_SUFFIX}")],
        ),
        ChannelKind::Seqlock => (format!("{name}{SEQLOCK_SUFFIX}"), Vec::new()),
    };

    let removed = SharedSegment::unlink_name(&segment)
        .with_context(|| format!("failed to unlink segment {segment}"))?;
    tracing::info!(name = %segment, removed, "segment");

    for semaphore in &semaphores {
        let removed = Semaphore::unlink_name(semaphore)
            .with_context(|| format!("failed to unlink semaphore {semaphore}"))?;
        tracing::info!(name = %semaphore, removed, "semaphore");
    }
    Ok(())
}
