//! Record a session, then replay the artifact and rebuild the document
//! state a viewer would see.

use insider::{
    Document, PlaybackSignal, Player, Recording, RoomInfo, ServerEvent, SessionRecorder,
};

fn room() -> RoomInfo {
    RoomInfo {
        id: "replay".into(),
        name: "Replay".into(),
        room_type: "interview".into(),
        created_at: "2026-08-01T00:00:00Z".into(),
    }
}

#[test]
fn test_recording_replays_into_document_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = SessionRecorder::open(&dir.path().join("replay.log")).unwrap();

    let mut canonical = Document::new();
    canonical.insert(0, "hello");
    let first = canonical.flush_pending_patch().unwrap();
    recorder.record(&ServerEvent::ActiveFileContentPatched(first));

    std::thread::sleep(std::time::Duration::from_millis(3));
    canonical.insert(5, " world");
    let second = canonical.flush_pending_patch().unwrap();
    recorder.record(&ServerEvent::ActiveFileContentPatched(second));
    recorder.record(&ServerEvent::TerminalOutputted("$ done\n".into()));

    let bytes = recorder.finalize("test", room()).unwrap();

    let mut player = Player::new(Recording::decode(&bytes).unwrap());
    player.play();
    let signals = player.tick(60_000.0);
    assert!(player.is_finished());

    let mut replica = Document::new();
    let mut terminal = String::new();
    for signal in signals {
        let PlaybackSignal::Event(entry) = signal else {
            panic!("unexpected reset during forward playback");
        };
        match ServerEvent::from_recorded(&entry.event, &entry.args).unwrap() {
            ServerEvent::ActiveFileContentPatched(patch) => {
                replica.apply_patch(&patch).unwrap();
            }
            ServerEvent::TerminalOutputted(chunk) => terminal.push_str(&chunk),
            other => panic!("unexpected event in recording: {other:?}"),
        }
    }

    assert_eq!(replica.view(), "hello world");
    assert_eq!(terminal, "$ done\n");
}

#[test]
fn test_seek_back_rebuilds_partial_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = SessionRecorder::open(&dir.path().join("seek.log")).unwrap();

    let mut canonical = Document::new();
    for word in ["one ", "two ", "three "] {
        let at = canonical.len();
        canonical.insert(at, word);
        let patch = canonical.flush_pending_patch().unwrap();
        recorder.record(&ServerEvent::ActiveFileContentPatched(patch));
        std::thread::sleep(std::time::Duration::from_millis(3));
    }
    let bytes = recorder.finalize("test", room()).unwrap();
    let recording = Recording::decode(&bytes).unwrap();
    let second_ts = recording.recording[1].timestamp_ms;

    let mut player = Player::new(recording);
    player.play();
    player.tick(60_000.0);

    // Scrub back to just after the second patch.
    let signals = player.seek(second_ts);
    assert_eq!(signals[0], PlaybackSignal::Reset);

    let mut replica = Document::new();
    for signal in &signals[1..] {
        let PlaybackSignal::Event(entry) = signal else {
            panic!("double reset");
        };
        if let ServerEvent::ActiveFileContentPatched(patch) =
            ServerEvent::from_recorded(&entry.event, &entry.args).unwrap()
        {
            replica.apply_patch(&patch).unwrap();
        }
    }
    assert_eq!(replica.view(), "one two ");
}
