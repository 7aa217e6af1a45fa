// Cross-module sanity checks: chord handling feeding reports, recording
// listing, and the skills store driving the injector.

use std::collections::BTreeSet;

use keybridge::bridge::{BridgeAction, BridgeCore};
use keybridge::hid::build_report;
use keybridge::injector::SkillInjector;
use keybridge::keymap::{self, parse_hotkey};
use keybridge::recorder::{list_recordings_recursive, Action, Recording};
use keybridge::skills::{SkillConfig, SkillManager};

#[test]
fn bridge_strip_scenario() {
    // LCTRL+Q: the chord key must never appear in outgoing reports, and
    // the action fires on full release.
    let stop = parse_hotkey("LCTRL+Q").unwrap();
    let mut core = BridgeCore::new(stop, None, Vec::new());

    let mut reports: Vec<[u8; 8]> = Vec::new();
    let mut action = None;
    for (code, value) in [(29u16, 1), (16u16, 1), (16u16, 0), (29u16, 0)] {
        let step = core.step(code, value);
        if let Some((mask, keys)) = step.report {
            reports.push(build_report(mask, &keys));
        }
        if let Some(a) = step.action {
            // Action implies all-up on the wire.
            reports.push([0u8; 8]);
            action = Some(a);
        }
    }

    assert_eq!(action, Some(BridgeAction::Stop));
    assert_eq!(reports.len(), 4);
    let q_usage = keymap::name_to_usage("Q");
    for report in &reports {
        assert!(
            !report[2..].contains(&q_usage),
            "chord key leaked: {report:?}"
        );
    }
    // Three LCTRL-held reports, then all-up.
    assert_eq!(reports[0], [1, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(reports[1], [1, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(reports[2], [1, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(reports[3], [0u8; 8]);
}

#[test]
fn on_wire_report_bounds() {
    // At most six keys in the wire report, regardless of held-set size.
    let keys: BTreeSet<u8> = (4u8..30).collect();
    let report = build_report(0xFF, &keys);
    let non_zero = report[2..].iter().filter(|&&k| k != 0).count();
    assert_eq!(non_zero, 6);
    assert_eq!(report[0].count_ones() + 6, 14); // full mask + six keys
}

#[test]
fn recursive_listing_sorted_with_meta() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path();
    Recording::from_actions(vec![Action {
        usage: 4,
        press: 0.0,
        dur: 0.1,
    }])
    .save(base.join("b/inner.json"))
    .unwrap();
    Recording::from_actions(vec![])
        .save(base.join("a.json"))
        .unwrap();
    std::fs::write(base.join("junk.txt"), "ignored").unwrap();

    let entries = list_recordings_recursive(base);
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b/inner"]);
    let inner = &entries[1];
    assert_eq!(inner.meta.as_ref().and_then(|m| m.actions), Some(1));
    assert!(inner.size > 0);
}

#[test]
fn selected_skills_feed_the_injector() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = SkillManager::new(dir.path()).unwrap();
    let mut skill = SkillConfig {
        id: String::new(),
        name: "Haste".into(),
        keystroke: "Q".into(),
        cooldown: 5.0,
        key_replacement: false,
        replace_rate: 0.7,
        frozen_rotation_during_casting: false,
        is_selected: true,
        order: 0,
        group_id: None,
        delay_after: 0.0,
        cast_position: 0.3,
        skill_delay: 0.0,
        variant: "cd skill".into(),
        is_open: false,
        is_enabled: true,
    };
    skill = mgr.save(skill).unwrap();
    assert!(!skill.id.is_empty());

    let mut injector = SkillInjector::seeded(mgr.selected(), 11);
    assert!(!injector.is_empty());

    // Cooldown passed (initial delay ≤ 30 s), arrow transition, idle.
    assert!(injector.check_and_inject(&[], 40.0, &[]).is_none());
    assert!(injector
        .check_and_inject(&[keymap::USAGE_ARROW_RIGHT], 40.1, &[])
        .is_none());
    assert!(injector
        .check_and_inject(&[keymap::USAGE_ARROW_LEFT], 40.2, &[])
        .is_none());
    let cast = injector
        .check_and_inject(&[], 41.0, &[])
        .expect("cast after the arrow delay");
    assert_eq!(cast.usage, keymap::name_to_usage("Q"));
    assert!(cast.press_duration >= 0.1 && cast.press_duration < 0.15);
}
