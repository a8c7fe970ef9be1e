//! Node groups and the rig that owns them.
//!
//! A `NodeGroup` samples a set of components at one rate: one node per component
//! (entry nodes, writing into the group's `DataBuffer`) fanning into a single data node
//! (sink, calling `push()`). A `Rig` runs every configured group concurrently, shares one
//! collection gate between their buffers and drives the episode lifecycle.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

use log::{info, warn};
use serde_json::{Map, Value};

use crate::config::{GroupConfig, GroupKind, RigConfig};
use crate::data::buffer::{CollectGate, DataBuffer};
use crate::data::collector::Collector;
use crate::data::value::{Fields, Frame};
use crate::engine::node::{Node, Task, TaskError};
use crate::engine::scheduler::{FaultPolicy, Scheduler, SchedulerReport};
use crate::error::{ConfigError, EngineError, Error};
use crate::utils::metrics::{TickEvent, TickRecorder};

/// A sensor or controller sampled by a node.
///
/// `sample()` must stay bounded in time and absorb transient hardware errors by
/// returning partial or empty fields.
pub trait Component: Send + 'static {
    fn name(&self) -> &str;

    fn init(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    fn sample(&mut self) -> Fields;
}

/// Samples one component into the group buffer.
pub struct ComponentTask {
    component: Box<dyn Component>,
    buffer: Arc<DataBuffer>,
}

impl Task for ComponentTask {
    fn init(&mut self) -> Result<(), TaskError> {
        self.component.init()
    }

    fn step(&mut self) -> Result<(), TaskError> {
        let fields = self.component.sample();
        self.buffer.update(self.component.name(), fields);
        Ok(())
    }
}

/// Appends the tick's latest values to the history.
pub struct DataTask {
    buffer: Arc<DataBuffer>,
}

impl Task for DataTask {
    fn step(&mut self) -> Result<(), TaskError> {
        self.buffer.push();
        Ok(())
    }
}

pub struct NodeGroup {
    name: String,
    kind: GroupKind,
    buffer: Arc<DataBuffer>,
    components: Vec<String>,
    scheduler: Scheduler,
}

impl NodeGroup {
    pub fn new(
        config: &GroupConfig,
        components: Vec<Box<dyn Component>>,
        gate: CollectGate,
        policy: FaultPolicy,
        realtime: bool,
    ) -> Result<Self, ConfigError> {
        if components.is_empty() {
            return Err(ConfigError::EmptyGroup(config.name.clone()));
        }
        let mut names = BTreeSet::new();
        for component in &components {
            if !names.insert(component.name().to_string()) {
                return Err(ConfigError::DuplicateComponent(component.name().to_string()));
            }
        }

        let buffer = Arc::new(DataBuffer::new(config.name.clone(), gate));
        let data_node = Node::new(
            format!("{}_data", config.name),
            DataTask { buffer: buffer.clone() },
        );

        let mut component_names = Vec::with_capacity(components.len());
        let mut entry = Vec::with_capacity(components.len());
        for component in components {
            component_names.push(component.name().to_string());
            let node = Node::new(
                component.name().to_string(),
                ComponentTask {
                    component,
                    buffer: buffer.clone(),
                },
            );
            node.next_to(&data_node);
            entry.push(node);
        }

        let mut all = entry.clone();
        all.push(data_node.clone());
        let scheduler = Scheduler::new(config.name.clone(), entry, all, vec![data_node], config.hz)?
            .with_fault_policy(policy)
            .with_realtime_priority(realtime);

        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            buffer,
            components: component_names,
            scheduler,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn buffer(&self) -> &Arc<DataBuffer> {
        &self.buffer
    }

    pub fn component_names(&self) -> &[String] {
        &self.components
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// For driving a group on its own, outside a `Rig`.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }
}

/// Every node group of one acquisition rig.
pub struct Rig {
    groups: Vec<NodeGroup>,
    gate: CollectGate,
    recorder: Option<TickRecorder>,
    started: bool,
}

impl Rig {
    /// Builds one group per configured entry from `components` (group name -> components).
    ///
    /// Fails before any thread starts on an invalid frequency, a group without components,
    /// components for an unconfigured group, or a component name used twice.
    pub fn new(
        config: &RigConfig,
        mut components: BTreeMap<String, Vec<Box<dyn Component>>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(unknown) = components.keys().find(|k| config.group(k).is_none()) {
            return Err(ConfigError::UnknownGroup(unknown.clone()));
        }

        let gate = CollectGate::new();
        let mut seen = BTreeSet::new();
        let mut groups = Vec::with_capacity(config.groups.len());
        for group_config in &config.groups {
            let members = components.remove(&group_config.name).unwrap_or_default();
            for member in &members {
                if !seen.insert(member.name().to_string()) {
                    return Err(ConfigError::DuplicateComponent(member.name().to_string()));
                }
            }
            groups.push(NodeGroup::new(
                group_config,
                members,
                gate.clone(),
                config.fault_policy,
                config.realtime_priority,
            )?);
        }

        Ok(Self {
            groups,
            gate,
            recorder: None,
            started: false,
        })
    }

    /// Routes tick events of every scheduler (and episode writes) to `recorder`.
    pub fn with_recorder(mut self, recorder: TickRecorder) -> Self {
        for group in &mut self.groups {
            group.scheduler.set_recorder(recorder.clone());
        }
        self.recorder = Some(recorder);
        self
    }

    pub fn groups(&self) -> &[NodeGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&NodeGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn is_collecting(&self) -> bool {
        self.gate.is_open()
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted("rig".into()));
        }
        for group in &mut self.groups {
            group.scheduler.start()?;
        }
        self.started = true;
        info!("[Rig] started {} groups", self.groups.len());
        Ok(())
    }

    /// Discards anything buffered and opens the collection gate.
    pub fn begin_episode(&self) {
        for group in &self.groups {
            group.buffer.clear();
        }
        self.gate.open();
        info!("[Rig] collecting");
    }

    /// Closes the gate, waits out in-flight pushes, harvests every buffer into
    /// `collector` and writes the episode.
    ///
    /// Sensor groups are harvested as sensor-only frames, controller groups as
    /// controller-only frames. On a data or write error the episode is discarded, so
    /// the next episode never starts with leftover frames. Group membership goes into
    /// the sidecar only after a successful write.
    pub fn finish_episode(&self, collector: &mut Collector) -> Result<PathBuf, Error> {
        self.gate.close();
        for group in &self.groups {
            group.buffer.drain();
        }

        let mut harvested = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            match group.buffer.get() {
                Ok(frames) => harvested.push((group.kind, frames)),
                Err(e) => {
                    warn!("[Rig] group {} has inconsistent history: {}", group.name, e);
                    self.clear_buffers();
                    collector.abort();
                    return Err(e.into());
                }
            }
        }
        self.clear_buffers();

        for (kind, frames) in harvested {
            for frame in frames {
                match kind {
                    GroupKind::Sensor => collector.collect(None, Some(frame)),
                    GroupKind::Controller => collector.collect(Some(frame), None),
                }
            }
        }

        let episode = collector.episode_index();
        let frames = collector.len();
        let path = match collector.write(None) {
            Ok(path) => path,
            Err(e) => {
                warn!("[Rig] episode {} not written, discarding {} frames: {}", episode, frames, e);
                collector.abort();
                return Err(e);
            }
        };
        if let Err(e) = collector.record_extra_info(self.extra_info()) {
            warn!("[Rig] group membership not recorded: {}", e);
        }
        if let Some(rec) = &self.recorder {
            rec.record(TickEvent::EpisodeWritten { episode, frames });
        }
        Ok(path)
    }

    /// Latest controller and sensor values, for live preview or policy observations.
    pub fn latest(&self) -> (Frame, Frame) {
        let mut controllers = Frame::new();
        let mut sensors = Frame::new();
        for group in &self.groups {
            let target = match group.kind {
                GroupKind::Controller => &mut controllers,
                GroupKind::Sensor => &mut sensors,
            };
            target.extend(group.buffer.latest());
        }
        (controllers, sensors)
    }

    /// Stops collecting and drops anything buffered without writing it.
    pub fn clean(&self) {
        self.gate.close();
        for group in &self.groups {
            group.buffer.drain();
        }
        self.clear_buffers();
    }

    /// Stops every scheduler and collects their reports.
    pub fn stop(&mut self) -> Result<Vec<SchedulerReport>, EngineError> {
        self.gate.close();
        for group in &self.groups {
            group.scheduler.stop();
        }
        let mut reports = Vec::with_capacity(self.groups.len());
        for group in &mut self.groups {
            reports.push(group.scheduler.join()?);
        }
        self.started = false;
        info!("[Rig] stopped");
        Ok(reports)
    }

    /// Group name -> component names, merged into the episode sidecar.
    pub fn extra_info(&self) -> Map<String, Value> {
        self.groups
            .iter()
            .map(|g| (g.name.clone(), Value::from(g.components.clone())))
            .collect()
    }

    fn clear_buffers(&self) {
        for group in &self.groups {
            group.buffer.clear();
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        if self.started {
            for group in &self.groups {
                group.scheduler.stop();
            }
        }
    }
}
