// End-to-end playback behaviour: record → save → load → play through an
// in-memory report sink, timing, spacing, and cancellation.

use std::time::Duration;

use keybridge::cancel::CancelFlag;
use keybridge::hid::testing::MockSink;
use keybridge::player::{PlayOptions, Player};
use keybridge::recorder::{Action, Recorder, Recording};

fn plain_opts() -> PlayOptions {
    PlayOptions {
        seed: Some(7),
        ..PlayOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn record_save_play_round_trip() {
    // Record: down A at t=0, up A at t=0.100.
    let mut rec = Recorder::new();
    rec.start(0.0);
    rec.on_down(4, 0.0);
    rec.on_up(4, 0.100);
    let actions = rec.into_actions();
    assert_eq!(actions.len(), 1);
    assert!((actions[0].press - 0.0).abs() < 1e-9);
    assert!((actions[0].dur - 0.100).abs() < 1e-9);

    // Save and reload.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x.json");
    Recording::from_actions(actions).save(&path).unwrap();
    let loaded = Recording::load(&path).unwrap().into_actions();
    assert_eq!(
        loaded,
        vec![Action {
            usage: 4,
            press: 0.0,
            dur: 0.100
        }]
    );

    // Play at speed 1 without jitter: press then release, 100 ms apart.
    let mut player = Player::new(MockSink::default());
    let start = tokio::time::Instant::now();
    let completed = player
        .play(&path, &plain_opts(), &CancelFlag::new(), None)
        .await
        .unwrap();
    assert!(completed);
    assert_eq!(start.elapsed(), Duration::from_millis(100));

    let reports = player.into_sink().reports;
    assert_eq!(reports[1], [0, 0, 4, 0, 0, 0, 0, 0]);
    assert_eq!(reports[2], [0u8; 8]);
}

#[tokio::test(start_paused = true)]
async fn same_key_spacing_holds_through_playback() {
    // Two taps on usage 30 closer together than the spacing floor.
    let actions = [
        Action { usage: 30, press: 0.0, dur: 0.005 },
        Action { usage: 30, press: 0.010, dur: 0.005 },
    ];
    let mut player = Player::new(MockSink::default());
    let start = tokio::time::Instant::now();
    let completed = player
        .play_actions(&actions, &plain_opts(), &CancelFlag::new(), None)
        .await
        .unwrap();
    assert!(completed);
    // press1@0 hold 5ms, spacing pushes press2 to release1 + 10ms = 15ms,
    // second release at 20ms.
    assert_eq!(start.elapsed(), Duration::from_millis(20));
}

#[tokio::test(start_paused = true)]
async fn playlist_plays_one_pick_per_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    for (i, usage) in [4u8, 5u8].iter().enumerate() {
        let path = dir.path().join(format!("r{i}.json"));
        Recording::from_actions(vec![Action {
            usage: *usage,
            press: 0.0,
            dur: 0.01,
        }])
        .save(&path)
        .unwrap();
        paths.push(path);
    }
    let opts = PlayOptions {
        loop_count: 4,
        seed: Some(3),
        ..PlayOptions::default()
    };
    let mut player = Player::new(MockSink::default());
    let completed = player
        .play_playlist(&paths, &opts, &CancelFlag::new(), None)
        .await
        .unwrap();
    assert!(completed);
    let reports = player.into_sink().reports;
    let presses = reports
        .iter()
        .filter(|r| r[2] == 4 || r[2] == 5)
        .count();
    assert_eq!(presses, 4);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_playback_releases_all_keys() {
    let actions = [Action { usage: 4, press: 0.0, dur: 10.0 }];
    let mut player = Player::new(MockSink::default());
    let cancel = CancelFlag::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let completed = player
        .play_actions(&actions, &plain_opts(), &cancel, None)
        .await
        .unwrap();
    assert!(!completed);
    let reports = player.into_sink().reports;
    assert_eq!(*reports.last().unwrap(), [0u8; 8]);
}

#[tokio::test(start_paused = true)]
async fn event_shape_recordings_play_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.json");
    std::fs::write(
        &path,
        r#"{"t0": 100.0, "events": [
            {"t": 100.0, "type": "down", "usage": 4},
            {"t": 100.1, "type": "up", "usage": 4}
        ]}"#,
    )
    .unwrap();

    let mut player = Player::new(MockSink::default());
    let start = tokio::time::Instant::now();
    let completed = player
        .play(&path, &plain_opts(), &CancelFlag::new(), None)
        .await
        .unwrap();
    assert!(completed);
    assert_eq!(start.elapsed(), Duration::from_millis(100));
}
