//! Simulated cameras and arms for the demo rig and tests.
//! - Cameras emit a small synthetic RGB frame and a jittered capture timestamp.
//! - Arms emit 6 joint angles, a gripper value, 6-dof qpos and a timestamp; a drifting arm
//!   random-walks, a holding arm repeats its pose so the motion filters have work to do.

use std::collections::BTreeMap;

use rand::random_range;

use crate::config::{AlignConfig, RigConfig, GroupKind};
use crate::data::value::{FieldValue, Fields, TIMESTAMP_FIELD, now_ns};
use crate::engine::group::Component;

pub const ARM_DOF: usize = 6;

pub struct SimCamera {
    name: String,
    width: usize,
    height: usize,
    jitter_ns: i64,
    seq: u64,
}

impl SimCamera {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            width: 8,
            height: 6,
            jitter_ns: 500_000,
            seq: 0,
        }
    }

    pub fn with_resolution(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Capture-latency jitter added to each timestamp (uniform in `±jitter_ns`).
    pub fn with_jitter_ns(mut self, jitter_ns: i64) -> Self {
        self.jitter_ns = jitter_ns.max(0);
        self
    }
}

impl Component for SimCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample(&mut self) -> Fields {
        self.seq += 1;
        let shade = (self.seq % 256) as u8;
        let color: Vec<u8> = (0..self.width * self.height * 3)
            .map(|i| shade.wrapping_add(i as u8))
            .collect();
        let jitter = if self.jitter_ns > 0 {
            random_range(-self.jitter_ns..=self.jitter_ns)
        } else {
            0
        };
        let mut fields = Fields::new();
        fields.insert("color".into(), FieldValue::from(color));
        fields.insert(TIMESTAMP_FIELD.into(), FieldValue::Int(now_ns() + jitter));
        fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArmMotion {
    /// Random walk of at most `step` rad per joint per sample.
    Drifting { step: f64 },
    Holding,
}

pub struct SimArm {
    name: String,
    joints: [f64; ARM_DOF],
    gripper: f64,
    motion: ArmMotion,
}

impl SimArm {
    pub fn new(name: &str, motion: ArmMotion) -> Self {
        Self {
            name: name.to_string(),
            joints: [0.0; ARM_DOF],
            gripper: 0.0,
            motion,
        }
    }

    pub fn set_motion(&mut self, motion: ArmMotion) {
        self.motion = motion;
    }
}

impl Component for SimArm {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample(&mut self) -> Fields {
        if let ArmMotion::Drifting { step } = self.motion
            && step > 0.0
        {
            for joint in &mut self.joints {
                *joint += random_range(-step..step);
            }
            self.gripper = (self.gripper + random_range(-step..step)).clamp(0.0, 1.0);
        }
        let mut fields = Fields::new();
        fields.insert("joint".into(), FieldValue::from(self.joints));
        fields.insert("gripper".into(), FieldValue::Float(self.gripper));
        fields.insert("qpos".into(), FieldValue::from(self.joints));
        fields.insert(TIMESTAMP_FIELD.into(), FieldValue::Int(now_ns()));
        fields
    }
}

/// Components for every configured group: cameras of `align` in sensor groups, arms
/// of `align` in controller groups. The first sensor and first controller group get
/// them all.
pub fn demo_components(rig: &RigConfig, align: &AlignConfig, motion: ArmMotion) -> BTreeMap<String, Vec<Box<dyn Component>>> {
    let mut out: BTreeMap<String, Vec<Box<dyn Component>>> = BTreeMap::new();
    if let Some(group) = rig.groups.iter().find(|g| g.kind == GroupKind::Sensor) {
        let cameras = align
            .cameras
            .iter()
            .map(|c| Box::new(SimCamera::new(c)) as Box<dyn Component>)
            .collect();
        out.insert(group.name.clone(), cameras);
    }
    if let Some(group) = rig.groups.iter().find(|g| g.kind == GroupKind::Controller) {
        let arms = align
            .arms
            .iter()
            .map(|a| Box::new(SimArm::new(&a.stream, motion)) as Box<dyn Component>)
            .collect();
        out.insert(group.name.clone(), arms);
    }
    out
}
