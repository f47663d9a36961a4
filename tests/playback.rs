use dinoseq::{
    Engine, EngineConfig, MidiMessage, PortEvent, PortId, RealtimeDriver, RingSink, SongRecord,
    ring_sink,
};
use ringbuf::HeapCons;
use ringbuf::traits::Consumer;
use std::sync::Arc;

// 1000 Hz, 100-frame blocks and 120 bpm: every block is a fifth of a beat
fn config() -> EngineConfig {
    EngineConfig {
        frame_rate: 1000,
        block_size: 100,
        ..EngineConfig::default()
    }
}

fn engine_with_keys() -> Arc<Engine> {
    let engine = Arc::new(Engine::new(config()).unwrap());
    engine.song().set_length(8);
    let keys = engine.add_track("keys").unwrap();
    keys.set_channel(1).unwrap();
    let pattern = keys.add_pattern("stab", 1, 4).unwrap();
    pattern.add_note(0, 60, 100, 2).unwrap();
    keys.place(pattern.id(), 0).unwrap();
    engine
}

fn run(driver: &mut RealtimeDriver, sink: &mut RingSink, blocks: usize) {
    for _ in 0..blocks {
        driver.process(sink);
    }
}

fn drain(events: &mut HeapCons<PortEvent>) -> Vec<PortEvent> {
    let mut out = Vec::new();
    while let Some(event) = events.try_pop() {
        out.push(event);
    }
    out
}

const ON: MidiMessage = MidiMessage::NoteOn {
    channel: 1,
    pitch: 60,
    velocity: 100,
};
const OFF: MidiMessage = MidiMessage::NoteOff {
    channel: 1,
    pitch: 60,
    velocity: 100,
};

#[test]
fn plays_a_note_at_the_right_frames() {
    let engine = engine_with_keys();
    let mut driver = engine.attach_driver().unwrap();
    let (mut sink, mut events) = ring_sink(64);

    engine.play();
    run(&mut driver, &mut sink, 5);
    let played: Vec<(u64, MidiMessage)> = drain(&mut events)
        .into_iter()
        .map(|event| (event.frame, event.message))
        .collect();
    assert_eq!(played, vec![(0, ON), (250, OFF)]);
    assert!((engine.current_beat() - 0.8).abs() < 1e-9);
}

#[test]
fn stopping_silences_every_port_once() {
    let engine = engine_with_keys();
    let mut driver = engine.attach_driver().unwrap();
    let (mut sink, mut events) = ring_sink(64);

    engine.play();
    run(&mut driver, &mut sink, 1);
    drain(&mut events);

    engine.stop();
    run(&mut driver, &mut sink, 3);
    let stopped = drain(&mut events);
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].port, PortId(0));
    assert_eq!(stopped[0].message, MidiMessage::all_notes_off(1));
}

#[test]
fn loops_back_to_the_loop_start() {
    let engine = engine_with_keys();
    engine.song().set_loop(Some(0), Some(1));
    let mut driver = engine.attach_driver().unwrap();
    let (mut sink, mut events) = ring_sink(64);

    engine.play();
    run(&mut driver, &mut sink, 12);
    let played = drain(&mut events);
    let count = |message: MidiMessage| played.iter().filter(|e| e.message == message).count();
    assert_eq!(count(ON), 3);
    assert_eq!(count(OFF), 2);
    assert_eq!(count(MidiMessage::all_notes_off(1)), 2);
    assert!(engine.current_beat() < 1.0);
}

#[test]
fn go_to_beat_relocates_playback() {
    let engine = engine_with_keys();
    let mut driver = engine.attach_driver().unwrap();
    let (mut sink, mut events) = ring_sink(64);

    engine.play();
    engine.go_to_beat(0.4);
    run(&mut driver, &mut sink, 1);
    let played = drain(&mut events);
    assert_eq!(played.len(), 1);
    assert_eq!(played[0].message, OFF);
    assert_eq!(played[0].frame, 250);
}

#[test]
fn reloaded_project_plays_the_same() {
    let saved = engine_with_keys();
    let text = SongRecord::from_song(saved.song()).to_ron().unwrap();

    let record = SongRecord::from_ron(&text).unwrap();
    let engine = Engine::from_record(config(), &record).unwrap();
    let mut driver = engine.attach_driver().unwrap();
    let (mut sink, mut events) = ring_sink(64);

    engine.play();
    run(&mut driver, &mut sink, 5);
    let played: Vec<MidiMessage> = drain(&mut events).into_iter().map(|e| e.message).collect();
    assert_eq!(played, vec![ON, OFF]);
}

#[test]
fn edits_reach_a_running_driver() {
    let engine = engine_with_keys();
    let mut driver = engine.attach_driver().unwrap();
    let (mut sink, mut events) = ring_sink(64);
    engine.play();
    run(&mut driver, &mut sink, 1);
    drain(&mut events);

    let keys = engine.song().tracks()[0].clone();
    let pattern = keys.patterns()[0].clone();
    pattern.add_note(3, 64, 90, 1).unwrap();
    engine.collect_garbage();

    run(&mut driver, &mut sink, 4);
    let played: Vec<MidiMessage> = drain(&mut events).into_iter().map(|e| e.message).collect();
    assert!(played.contains(&MidiMessage::NoteOn {
        channel: 1,
        pitch: 64,
        velocity: 90
    }));
}
