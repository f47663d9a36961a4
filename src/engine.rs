use crate::config::EngineConfig;
use crate::error::{ProjectError, RegistryError, SongError};
use crate::events::{EventSink, PortId};
use crate::project::SongRecord;
use crate::song::{Song, Track, TrackId};
use crate::sync::{RealtimeReader, Reclaimer};
use crate::timing::{
    BlockInfo, BlockReport, Registry, Scheduler, Sequencable, Transport, TransportClock,
};
use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Play,
    Stop,
    GoToBeat(f64),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    BeatChanged(f64),
    PlaybackState { rolling: bool },
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stops the housekeeping thread and waits for it.
    pub fn shutdown(mut self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The real-time half of the engine, handed to whatever runs the audio
/// callback.
pub struct RealtimeDriver {
    reader: RealtimeReader,
    scheduler: Scheduler,
    clock: TransportClock,
}

impl RealtimeDriver {
    /// One callback against the engine's own transport clock.
    pub fn process(&mut self, sink: &mut dyn EventSink) -> BlockReport {
        let block = self.clock.next_block();
        let cycle = self.reader.confirm();
        let report = self.scheduler.process(&cycle, block, sink);
        self.clock.apply(&block, &report);
        report
    }

    /// One callback for a host that keeps its own transport. The host is
    /// responsible for honouring the report's locate and stop requests.
    pub fn process_block(&mut self, block: BlockInfo, sink: &mut dyn EventSink) -> BlockReport {
        let cycle = self.reader.confirm();
        self.scheduler.process(&cycle, block, sink)
    }
}

pub struct Engine {
    config: EngineConfig,
    reclaimer: Reclaimer,
    song: Arc<Song>,
    registry: Arc<Registry>,
    transport: Arc<Transport>,
    track_ports: Mutex<HashMap<TrackId, PortId>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, SongError> {
        let reclaimer = Reclaimer::new();
        let song = Song::new(
            "untitled",
            config.song_length,
            config.initial_bpm,
            config.pattern_capacity,
            reclaimer.clone(),
        )?;
        Ok(Self::with_song(config, song, reclaimer))
    }

    /// Builds the song from a saved record and registers every track.
    pub fn from_record(config: EngineConfig, record: &SongRecord) -> Result<Self, ProjectError> {
        let reclaimer = Reclaimer::new();
        let song = record.to_song(config.pattern_capacity, reclaimer.clone())?;
        let engine = Self::with_song(config, song, reclaimer);
        for track in engine.song.tracks() {
            engine.register_track(track)?;
        }
        Ok(engine)
    }

    fn with_song(config: EngineConfig, song: Song, reclaimer: Reclaimer) -> Self {
        info!(
            frame_rate = config.frame_rate,
            block_size = config.block_size,
            max_ports = config.max_ports,
            "starting engine"
        );
        Self {
            registry: Arc::new(Registry::new(config.max_ports, reclaimer.clone())),
            song: Arc::new(song),
            transport: Arc::new(Transport::new()),
            track_ports: Mutex::new(HashMap::new()),
            reclaimer,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn song(&self) -> &Arc<Song> {
        &self.song
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Adds a track to the song and gives it its own output port.
    pub fn add_track(&self, name: impl Into<String>) -> Result<Arc<Track>, RegistryError> {
        let track = self.song.add_track(name);
        if let Err(err) = self.register_track(track.clone()) {
            self.song.remove_track(track.id());
            return Err(err);
        }
        Ok(track)
    }

    fn register_track(&self, track: Arc<Track>) -> Result<PortId, RegistryError> {
        let id = track.id();
        let port = self.registry.register(track)?;
        self.track_ports.lock().insert(id, port);
        Ok(port)
    }

    pub fn remove_track(&self, id: TrackId) -> bool {
        if let Some(port) = self.track_ports.lock().remove(&id) {
            self.registry.unregister(port);
        }
        self.song.remove_track(id).is_some()
    }

    pub fn track_port(&self, id: TrackId) -> Option<PortId> {
        self.track_ports.lock().get(&id).copied()
    }

    pub fn register(&self, item: Arc<dyn Sequencable>) -> Result<PortId, RegistryError> {
        self.registry.register(item)
    }

    pub fn unregister(&self, port: PortId) -> Option<Arc<dyn Sequencable>> {
        self.track_ports.lock().retain(|_, p| *p != port);
        self.registry.unregister(port)
    }

    /// Hands out the real-time half. Only one can exist at a time; dropping it
    /// makes room for the next.
    pub fn attach_driver(&self) -> Option<RealtimeDriver> {
        let reader = self.reclaimer.reader()?;
        info!("driver attached");
        Some(RealtimeDriver {
            reader,
            scheduler: Scheduler::new(self.song.clone(), self.registry.clone()),
            clock: TransportClock::new(
                self.transport.clone(),
                self.config.frame_rate,
                self.config.block_size,
            ),
        })
    }

    pub fn has_driver(&self) -> bool {
        self.reclaimer.has_reader()
    }

    fn require_driver(&self, command: &str) -> bool {
        if !self.has_driver() {
            warn!(command, "no driver attached, ignoring transport command");
            return false;
        }
        true
    }

    pub fn play(&self) {
        if self.require_driver("play") {
            debug!("transport start");
            self.transport.start();
        }
    }

    pub fn stop(&self) {
        if self.require_driver("stop") {
            debug!("transport stop");
            self.transport.stop();
        }
    }

    pub fn go_to_beat(&self, beat: f64) {
        if self.require_driver("go_to_beat") {
            let frame = self
                .song
                .tempo_map()
                .frame_at(beat.max(0.0), self.config.frame_rate)
                .round() as u64;
            debug!(beat, frame, "transport locate");
            self.transport.locate(frame);
        }
    }

    pub fn current_beat(&self) -> f64 {
        self.transport.beat()
    }

    pub fn is_rolling(&self) -> bool {
        self.transport.is_rolling()
    }

    /// Frees retired objects the driver can no longer see.
    pub fn collect_garbage(&self) -> usize {
        let freed = self.reclaimer.collect();
        if freed > 0 {
            trace!(freed, pending = self.reclaimer.pending(), "collected retired objects");
        }
        freed
    }

    /// Starts the thread that runs transport commands, collects garbage and
    /// reports position changes.
    pub fn spawn_housekeeping(self: &Arc<Self>) -> EngineHandle {
        let (command_tx, command_rx) = crossbeam::channel::unbounded();
        let (update_tx, update_rx) = crossbeam::channel::unbounded();
        let engine = self.clone();

        let thread = std::thread::spawn(move || {
            housekeeping_thread(engine, command_rx, update_tx);
        });

        EngineHandle {
            command_tx,
            update_rx,
            thread: Some(thread),
        }
    }
}

fn housekeeping_thread(
    engine: Arc<Engine>,
    command_rx: Receiver<EngineCommand>,
    update_tx: Sender<EngineUpdate>,
) {
    let ticker = crossbeam::channel::tick(engine.config.housekeeping_interval());
    let mut beat = engine.current_beat();
    let mut rolling = engine.is_rolling();
    info!("housekeeping started");

    loop {
        crossbeam::select! {
            recv(command_rx) -> command => match command {
                Ok(EngineCommand::Play) => engine.play(),
                Ok(EngineCommand::Stop) => engine.stop(),
                Ok(EngineCommand::GoToBeat(target)) => engine.go_to_beat(target),
                Ok(EngineCommand::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                engine.collect_garbage();

                let now = engine.current_beat();
                if now != beat {
                    beat = now;
                    let _ = update_tx.send(EngineUpdate::BeatChanged(now));
                }
                let now = engine.is_rolling();
                if now != rolling {
                    rolling = now;
                    let _ = update_tx.send(EngineUpdate::PlaybackState { rolling: now });
                }
            }
        }
    }
    info!("housekeeping stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MidiBlock;
    use std::time::Duration;

    fn engine() -> Arc<Engine> {
        let config = EngineConfig {
            frame_rate: 1000,
            block_size: 100,
            housekeeping_interval_ms: 1,
            ..EngineConfig::default()
        };
        Arc::new(Engine::new(config).unwrap())
    }

    #[test]
    fn transport_commands_are_inert_without_a_driver() {
        let engine = engine();
        engine.play();
        assert!(!engine.is_rolling());

        let driver = engine.attach_driver().unwrap();
        assert!(engine.attach_driver().is_none());
        engine.play();
        assert!(engine.is_rolling());

        drop(driver);
        engine.stop();
        assert!(engine.is_rolling());
        assert!(engine.attach_driver().is_some());
    }

    #[test]
    fn tracks_get_their_own_ports() {
        let engine = engine();
        let drums = engine.add_track("drums").unwrap();
        let bass = engine.add_track("bass").unwrap();
        assert_eq!(engine.track_port(drums.id()), Some(PortId(0)));
        assert_eq!(engine.track_port(bass.id()), Some(PortId(1)));
        assert!(matches!(
            engine.register(drums.clone()),
            Err(RegistryError::AlreadyRegistered(0))
        ));

        assert!(engine.remove_track(drums.id()));
        assert!(!engine.remove_track(drums.id()));
        assert_eq!(engine.registry().len(), 1);
        let keys = engine.add_track("keys").unwrap();
        assert_eq!(engine.track_port(keys.id()), Some(PortId(0)));
    }

    #[test]
    fn driver_follows_transport_requests() {
        let engine = engine();
        let mut driver = engine.attach_driver().unwrap();
        let mut sink = MidiBlock::new(4, 16);

        driver.process(&mut sink);
        assert_eq!(engine.current_beat(), 0.0);

        engine.play();
        engine.go_to_beat(2.0);
        let report = driver.process(&mut sink);
        assert_eq!(report.start, 2.0);
        let report = driver.process(&mut sink);
        assert!((report.start - 2.2).abs() < 1e-12);
        assert_eq!(engine.current_beat(), report.start);
    }

    #[test]
    fn housekeeping_runs_commands_and_reports_changes() {
        let engine = engine();
        let mut driver = engine.attach_driver().unwrap();
        let handle = engine.spawn_housekeeping();

        handle.command_tx.send(EngineCommand::Play).unwrap();
        let update = handle
            .update_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(update, EngineUpdate::PlaybackState { rolling: true });

        let mut sink = MidiBlock::new(1, 4);
        driver.process(&mut sink);
        driver.process(&mut sink);
        let update = handle
            .update_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(matches!(update, EngineUpdate::BeatChanged(beat) if beat > 0.0));
        handle.shutdown();
    }
}
