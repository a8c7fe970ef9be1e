use std::{collections::BTreeMap, fs, thread, time::Duration};

use serde_json::{Value, json};

use teleop_sync::align::pipeline::{DiffFreqSink, INFO_FILE};
use teleop_sync::config::{AlignConfig, CollectConfig, GroupConfig, GroupKind, RigConfig};
use teleop_sync::data::collector::{Collector, SIDECAR_FILE};
use teleop_sync::data::sink::{EpisodeSink, EpisodeSource, GroupedJsonSink};
use teleop_sync::data::value::{FieldValue, now_ns};
use teleop_sync::engine::group::{Component, Rig};
use teleop_sync::error::{ConfigError, Error, PersistError};
use teleop_sync::sim::{ArmMotion, SimArm, SimCamera, demo_components};
use teleop_sync::utils::metrics::TickRecorder;

fn rig_config() -> RigConfig {
    RigConfig {
        groups: vec![
            GroupConfig::new("image", GroupKind::Sensor, 50.0),
            GroupConfig::new("arm", GroupKind::Controller, 200.0),
        ],
        ..RigConfig::default()
    }
}

fn align_config() -> AlignConfig {
    AlignConfig {
        cameras: vec!["cam_head".into(), "cam_wrist".into()],
        ..AlignConfig::default()
    }
}

fn collector(dir: &std::path::Path) -> Collector {
    Collector::new(CollectConfig {
        save_dir: dir.to_path_buf(),
        task_name: "rig".into(),
        ..CollectConfig::default()
    })
    .unwrap()
}

fn record(rig: &Rig, collector: &mut Collector, duration: Duration) -> std::path::PathBuf {
    rig.begin_episode();
    assert!(rig.is_collecting());
    thread::sleep(duration);
    let path = rig.finish_episode(collector).unwrap();
    assert!(!rig.is_collecting());
    path
}

#[test]
fn raw_episode_holds_every_stream_at_its_own_rate() {
    let dir = tempfile::tempdir().unwrap();
    let components = demo_components(&rig_config(), &align_config(), ArmMotion::Drifting { step: 0.01 });
    let mut rig = Rig::new(&rig_config(), components).unwrap();
    let mut collector = collector(dir.path());

    rig.start().unwrap();
    thread::sleep(Duration::from_millis(50));
    let path = record(&rig, &mut collector, Duration::from_millis(300));
    let reports = rig.stop().unwrap();

    let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let cams = doc["cam_head"]["timestamp"].as_array().unwrap().len();
    let arms = doc["left_arm"]["timestamp"].as_array().unwrap().len();
    assert_eq!(doc["cam_wrist"]["timestamp"].as_array().unwrap().len(), cams);
    assert!(cams >= 5, "only {cams} camera frames");
    assert!(arms > cams, "arm rate should exceed camera rate: {arms} vs {cams}");

    let sidecar: Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("rig").join(SIDECAR_FILE)).unwrap()).unwrap();
    assert_eq!(sidecar["image"], json!(["cam_head", "cam_wrist"]));
    assert_eq!(sidecar["arm"], json!(["left_arm", "right_arm"]));

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.ticks_failed == 0 && !r.halted));
}

#[test]
fn aligned_episode_of_a_holding_rig_collapses_to_one_frame() {
    let dir = tempfile::tempdir().unwrap();
    let components = demo_components(&rig_config(), &align_config(), ArmMotion::Holding);
    let recorder = TickRecorder::new();
    let mut rig = Rig::new(&rig_config(), components)
        .unwrap()
        .with_recorder(recorder.clone());
    let mut collector = collector(dir.path()).with_sink(Box::new(DiffFreqSink::new(align_config())));

    rig.start().unwrap();
    let path = record(&rig, &mut collector, Duration::from_millis(200));
    rig.stop().unwrap();

    assert!(path.ends_with("rig/episode0"));
    let info: Value = serde_json::from_str(&fs::read_to_string(path.join(INFO_FILE)).unwrap()).unwrap();
    assert_eq!(info["frames"], 1);
    assert!(recorder.pending() > 0);
}

#[test]
fn latest_values_are_split_by_group_kind() {
    let components = demo_components(&rig_config(), &align_config(), ArmMotion::Holding);
    let mut rig = Rig::new(&rig_config(), components).unwrap();
    rig.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    let (controllers, sensors) = rig.latest();
    rig.stop().unwrap();

    assert!(controllers.contains_key("left_arm") && controllers.contains_key("right_arm"));
    assert!(sensors.contains_key("cam_head") && sensors.contains_key("cam_wrist"));
    assert!(!sensors.contains_key("left_arm"));
}

#[test]
fn clean_discards_the_episode_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let components = demo_components(&rig_config(), &align_config(), ArmMotion::Holding);
    let mut rig = Rig::new(&rig_config(), components).unwrap();
    let collector = collector(dir.path());

    rig.start().unwrap();
    rig.begin_episode();
    thread::sleep(Duration::from_millis(100));
    rig.clean();
    assert!(rig.groups().iter().all(|g| g.buffer().get().unwrap().is_empty()));
    rig.stop().unwrap();
    assert_eq!(collector.episode_index(), 0);
}

fn boxed<C: Component>(c: C) -> Box<dyn Component> {
    Box::new(c)
}

#[test]
fn components_for_an_unconfigured_group_are_rejected() {
    let mut components = demo_components(&rig_config(), &align_config(), ArmMotion::Holding);
    components.insert("lidar".into(), vec![boxed(SimCamera::new("lidar_top"))]);
    assert!(matches!(
        Rig::new(&rig_config(), components),
        Err(ConfigError::UnknownGroup(g)) if g == "lidar"
    ));
}

#[test]
fn configured_group_without_components_is_rejected() {
    let mut components: BTreeMap<String, Vec<Box<dyn Component>>> = BTreeMap::new();
    components.insert("image".into(), vec![boxed(SimCamera::new("cam_head"))]);
    assert!(matches!(
        Rig::new(&rig_config(), components),
        Err(ConfigError::EmptyGroup(g)) if g == "arm"
    ));
}

#[test]
fn component_name_shared_across_groups_is_rejected() {
    let mut components: BTreeMap<String, Vec<Box<dyn Component>>> = BTreeMap::new();
    components.insert("image".into(), vec![boxed(SimCamera::new("left_arm"))]);
    components.insert("arm".into(), vec![boxed(SimArm::new("left_arm", ArmMotion::Holding))]);
    assert!(matches!(
        Rig::new(&rig_config(), components),
        Err(ConfigError::DuplicateComponent(c)) if c == "left_arm"
    ));
}

#[test]
fn zero_rate_group_is_rejected_before_any_thread_starts() {
    let mut config = rig_config();
    config.groups[1].hz = 0.0;
    let components = demo_components(&config, &align_config(), ArmMotion::Holding);
    assert!(matches!(
        Rig::new(&config, components),
        Err(ConfigError::InvalidFrequency { .. })
    ));
}

/// Fails its first write, then writes grouped containers.
#[derive(Default)]
struct FailOnceSink {
    failed: bool,
}

impl EpisodeSink for FailOnceSink {
    fn persist(&mut self, source: &dyn EpisodeSource, task_dir: &std::path::Path, index: u64) -> Result<std::path::PathBuf, Error> {
        if !self.failed {
            self.failed = true;
            return Err(PersistError::io(task_dir, std::io::Error::other("disk full")).into());
        }
        GroupedJsonSink.persist(source, task_dir, index)
    }
}

#[test]
fn failed_write_does_not_leak_frames_into_the_next_episode() {
    let dir = tempfile::tempdir().unwrap();
    let components = demo_components(&rig_config(), &align_config(), ArmMotion::Holding);
    let mut rig = Rig::new(&rig_config(), components).unwrap();
    let mut collector = collector(dir.path()).with_sink(Box::new(FailOnceSink::default()));
    let sidecar = dir.path().join("rig").join(SIDECAR_FILE);

    rig.start().unwrap();
    rig.begin_episode();
    thread::sleep(Duration::from_millis(150));
    assert!(rig.finish_episode(&mut collector).is_err());
    assert!(collector.is_empty());
    assert_eq!(collector.episode_index(), 0);
    assert!(!sidecar.exists());

    // keep the failed episode's frames well clear of the next one
    thread::sleep(Duration::from_millis(200));
    let began = now_ns();
    let path = record(&rig, &mut collector, Duration::from_millis(150));
    rig.stop().unwrap();

    assert!(path.ends_with("rig/0.json"));
    let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let stamps: Vec<FieldValue> = serde_json::from_value(doc["cam_head"]["timestamp"].clone()).unwrap();
    assert!(!stamps.is_empty());
    // one camera period plus capture jitter of slack
    let earliest = began - 25_000_000;
    for ts in stamps.iter().filter_map(FieldValue::as_i64) {
        assert!(ts >= earliest, "frame at {ts} predates the episode start {began}");
    }
}

#[test]
fn group_membership_is_recorded_once_per_task() {
    let dir = tempfile::tempdir().unwrap();
    let components = demo_components(&rig_config(), &align_config(), ArmMotion::Holding);
    let mut rig = Rig::new(&rig_config(), components).unwrap();
    let mut collector = collector(dir.path());

    rig.start().unwrap();
    record(&rig, &mut collector, Duration::from_millis(100));
    record(&rig, &mut collector, Duration::from_millis(100));
    rig.stop().unwrap();

    let sidecar: Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("rig").join(SIDECAR_FILE)).unwrap()).unwrap();
    assert_eq!(sidecar["image"], json!(["cam_head", "cam_wrist"]));
    assert_eq!(sidecar["arm"], json!(["left_arm", "right_arm"]));
    assert_eq!(sidecar["interval_episodes"], 2);
}
