// Detector pipeline on synthetic minimap frames, and round-trip laws for
// the map / CV-item registries.

use keybridge::cv::detect::{testing::frame_with_discs, DetectorConfig, MinimapDetector};
use keybridge::cv::item::{CvItem, CvItemStore};
use keybridge::cv::map::{DeparturePoint, MapConfig, MapStore, RotationMode, ToleranceMode};

const YELLOW: [u8; 3] = [255, 255, 0];
const RED: [u8; 3] = [255, 0, 0];

#[test]
fn happy_path_on_synthetic_minimap() {
    // 340×86 black frame, one 8 px yellow disc at (170, 43), two 6 px red
    // discs elsewhere.
    let frame = frame_with_discs(
        340,
        86,
        &[
            (170, 43, 4, YELLOW),
            (60, 30, 3, RED),
            (250, 60, 3, RED),
        ],
    );
    let mut detector = MinimapDetector::new(DetectorConfig::default());
    let result = detector.detect(&frame);

    assert!(result.player.detected);
    assert!(
        (result.player.x - 170).abs() <= 2 && (result.player.y - 43).abs() <= 2,
        "player at ({}, {})",
        result.player.x,
        result.player.y
    );
    assert_eq!(result.other_players.count, 2);
    assert!(result.other_players.detected);
    assert!(result.timestamp > 0.0);
}

#[test]
fn detection_stays_inside_the_margin() {
    let mut cfg = DetectorConfig::default();
    cfg.temporal_smoothing = false;
    let mut detector = MinimapDetector::new(cfg);
    for (cx, cy) in [(3, 3), (336, 82), (170, 43)] {
        let frame = frame_with_discs(340, 86, &[(cx, cy, 4, YELLOW)]);
        let result = detector.detect(&frame);
        if result.player.detected {
            assert!(result.player.x >= 2 && result.player.x < 338);
            assert!(result.player.y >= 2 && result.player.y < 84);
        }
    }
}

#[test]
fn red_dots_do_not_become_the_player() {
    let frame = frame_with_discs(200, 100, &[(100, 50, 3, RED)]);
    let mut detector = MinimapDetector::new(DetectorConfig::default());
    let result = detector.detect(&frame);
    assert!(!result.player.detected);
    assert_eq!(result.other_players.count, 1);
}

fn sample_point(id: &str, x: i32, y: i32) -> DeparturePoint {
    DeparturePoint {
        id: id.into(),
        name: format!("point {id}"),
        x,
        y,
        order: 0,
        tolerance_mode: ToleranceMode::Both,
        tolerance_value: 5,
        created_at: 1.5,
        rotation_paths: vec!["rotations/a".into(), "rotations/b".into()],
        rotation_mode: RotationMode::Sequential,
        is_teleport_point: true,
        auto_play: false,
        pathfinding_sequence: Some("paths/to_portal".into()),
    }
}

#[test]
fn map_config_document_round_trip() {
    let mut config = MapConfig {
        name: "henesys".into(),
        tl_x: 100,
        tl_y: 60,
        width: 340,
        height: 86,
        created_at: 10.0,
        last_used_at: 20.0,
        is_active: false,
        departure_points: vec![sample_point("a", 30, 40)],
    };
    config.departure_points.push({
        let mut p = sample_point("b", 90, 40);
        p.order = 1;
        p
    });

    let json = serde_json::to_string(&config).unwrap();
    let back: MapConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(config, back);
}

#[test]
fn cv_item_document_round_trip() {
    let item = CvItem {
        name: "henesys farm".into(),
        map_config_name: Some("henesys".into()),
        pathfinding_config: serde_json::json!({
            "class_type": "magician",
            "teleport_skill": "W",
        }),
        departure_points: vec![sample_point("a", 30, 40)],
        created_at: 5.0,
        last_used_at: 6.0,
        is_active: true,
        description: "night farming".into(),
        tags: vec!["mage".into()],
    };
    let json = serde_json::to_string(&item).unwrap();
    let back: CvItem = serde_json::from_str(&json).unwrap();
    assert_eq!(item, back);
}

#[test]
fn registries_persist_through_files() {
    let dir = tempfile::tempdir().unwrap();

    let mut maps = MapStore::load(dir.path().join("maps.json"));
    maps.save(MapConfig {
        name: "henesys".into(),
        tl_x: 100,
        tl_y: 60,
        width: 340,
        height: 86,
        created_at: 0.0,
        last_used_at: 0.0,
        is_active: false,
        departure_points: vec![sample_point("a", 30, 40)],
    })
    .unwrap();

    let mut items = CvItemStore::load(dir.path().join("items.json"));
    items
        .save(CvItem {
            name: "farm".into(),
            map_config_name: Some("henesys".into()),
            pathfinding_config: serde_json::json!({"class_type": "other"}),
            departure_points: vec![sample_point("a", 30, 40)],
            created_at: 0.0,
            last_used_at: 0.0,
            is_active: false,
            description: String::new(),
            tags: Vec::new(),
        })
        .unwrap();
    items.activate("farm", &mut maps).unwrap();

    // Fresh loads observe the same state.
    let maps2 = MapStore::load(dir.path().join("maps.json"));
    let items2 = CvItemStore::load(dir.path().join("items.json"));
    assert_eq!(maps2.active().map(|m| m.name.as_str()), Some("henesys"));
    assert_eq!(items2.active().map(|i| i.name.as_str()), Some("farm"));
    assert_eq!(
        items2.active().unwrap().departure_points[0].rotation_paths,
        vec!["rotations/a".to_string(), "rotations/b".to_string()]
    );
}
