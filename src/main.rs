use dinoseq::{Engine, EngineConfig, EngineUpdate, MidiMessage, ring_sink};
use ringbuf::traits::Consumer;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let engine = Arc::new(Engine::new(config.clone())?);
    engine.song().set_length(8);
    engine.song().set_loop(Some(0), Some(4));

    let drums = engine.add_track("drums")?;
    drums.set_channel(9)?;
    let beat = drums.add_pattern("four on the floor", 1, 4)?;
    beat.add_note(0, 36, 110, 1)?;
    beat.add_note(2, 42, 80, 1)?;
    for bar in 0..4 {
        drums.place(beat.id(), bar)?;
    }

    let bass = engine.add_track("bass")?;
    let line = bass.add_pattern("line", 2, 4)?;
    line.add_note(0, 36, 100, 3)?;
    line.add_note(4, 43, 90, 2)?;
    bass.place(line.id(), 0)?;
    bass.place(line.id(), 2)?;

    let Some(mut driver) = engine.attach_driver() else {
        error!("could not attach a driver");
        return Ok(());
    };
    let handle = engine.spawn_housekeeping();
    let (mut sink, mut events) = ring_sink(4096);

    let running = Arc::new(AtomicBool::new(true));
    let block = Duration::from_secs_f64(f64::from(config.block_size) / f64::from(config.frame_rate));
    let driver_thread = {
        let running = running.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                driver.process(&mut sink);
                std::thread::sleep(block);
            }
            sink.dropped()
        })
    };

    engine.play();
    let deadline = std::time::Instant::now() + Duration::from_secs(6);
    while std::time::Instant::now() < deadline {
        while let Some(event) = events.try_pop() {
            let kind = match event.message {
                MidiMessage::NoteOn { .. } => "on",
                MidiMessage::NoteOff { .. } => "off",
                MidiMessage::ControlChange { .. } => "cc",
            };
            info!(port = %event.port, frame = event.frame, kind, bytes = ?event.message.to_bytes(), "midi");
        }
        while let Ok(update) = handle.update_rx.try_recv() {
            if let EngineUpdate::PlaybackState { rolling } = update {
                info!(rolling, "playback state");
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    engine.stop();
    std::thread::sleep(Duration::from_millis(50));
    running.store(false, Ordering::Relaxed);
    let dropped = driver_thread.join().unwrap_or_default();
    if dropped > 0 {
        error!(dropped, "events lost in the ring buffer");
    }
    handle.shutdown();
    info!(beat = engine.current_beat(), "done");
    Ok(())
}
