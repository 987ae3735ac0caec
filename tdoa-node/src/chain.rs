//! chain.rs — DAG of processing components
//!
//! A processing chain is a directed acyclic graph over components keyed by
//! stable id. Edge insertion is cycle-checked and rolled back on failure, so
//! the graph can never become cyclic. `process` runs a memoized depth-first
//! traversal: each component is invoked at most once per call, disabled
//! components forward their input unchanged, and a component failure aborts
//! the traversal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::signal::Signal;

// ── Component configuration ───────────────────────────────────────────────────

/// Typed configuration value for a component parameter. Replaces the
/// string→string map: values are validated at construction, not at each read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ConfigValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

pub type ComponentConfig = HashMap<String, ConfigValue>;

// ── Component trait ───────────────────────────────────────────────────────────

/// One stage in a processing chain.
///
/// Lifecycle: created → `initialize` with a configuration → `process` called
/// repeatedly → `reset` between runs → dropped.
pub trait ProcessingComponent: Send {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    /// Validate and apply configuration. Unknown keys are a configuration
    /// error, matching the fail-at-construction contract.
    fn initialize(&mut self, config: &ComponentConfig) -> Result<()>;

    fn process(&mut self, input: Arc<Signal>) -> Result<Arc<Signal>>;

    fn reset(&mut self) {}

    fn is_enabled(&self) -> bool {
        true
    }

    fn set_enabled(&mut self, _enabled: bool) {}
}

// ── Edges ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEdge {
    pub source_id: String,
    pub target_id: String,
    pub label: String,
}

// ── Processing chain ──────────────────────────────────────────────────────────

pub struct ProcessingChain {
    name: String,
    components: HashMap<String, Box<dyn ProcessingComponent>>,
    edges: Vec<ChainEdge>,
}

impl ProcessingChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), components: HashMap::new(), edges: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_component(&mut self, component: Box<dyn ProcessingComponent>) -> Result<()> {
        let id = component.id().to_string();
        if self.components.contains_key(&id) {
            return Err(PipelineError::Configuration(format!(
                "component '{id}' already exists in chain '{}'",
                self.name
            )));
        }
        self.components.insert(id, component);
        Ok(())
    }

    /// Remove a component and every edge touching it.
    pub fn remove_component(&mut self, id: &str) -> Result<()> {
        if self.components.remove(id).is_none() {
            return Err(PipelineError::Configuration(format!("component '{id}' not found")));
        }
        self.edges.retain(|e| e.source_id != id && e.target_id != id);
        Ok(())
    }

    pub fn component_ids(&self) -> Vec<&str> {
        self.components.keys().map(String::as_str).collect()
    }

    pub fn edges(&self) -> &[ChainEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Connect `source → target`. Fails (leaving the chain unchanged) when
    /// either endpoint is missing, the edge already exists, or the edge would
    /// introduce a cycle.
    pub fn connect(&mut self, source_id: &str, target_id: &str, label: &str) -> Result<()> {
        if !self.components.contains_key(source_id) {
            return Err(PipelineError::Configuration(format!(
                "source component '{source_id}' not found"
            )));
        }
        if !self.components.contains_key(target_id) {
            return Err(PipelineError::Configuration(format!(
                "target component '{target_id}' not found"
            )));
        }
        if self.edges.iter().any(|e| e.source_id == source_id && e.target_id == target_id) {
            return Err(PipelineError::Configuration(format!(
                "edge '{source_id}' -> '{target_id}' already exists"
            )));
        }

        self.edges.push(ChainEdge {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            label: label.to_string(),
        });

        if self.has_cycle() {
            // Roll back the insertion that created the cycle.
            self.edges.pop();
            warn!(
                "edge '{source_id}' -> '{target_id}' would create a cycle in chain '{}'",
                self.name
            );
            return Err(PipelineError::Configuration(format!(
                "edge '{source_id}' -> '{target_id}' would create a cycle"
            )));
        }
        Ok(())
    }

    pub fn disconnect(&mut self, source_id: &str, target_id: &str) -> Result<()> {
        let before = self.edges.len();
        self.edges.retain(|e| !(e.source_id == source_id && e.target_id == target_id));
        if self.edges.len() == before {
            return Err(PipelineError::Configuration(format!(
                "edge '{source_id}' -> '{target_id}' not found"
            )));
        }
        Ok(())
    }

    /// Components with no incoming edges.
    pub fn source_ids(&self) -> Vec<String> {
        let targets: HashSet<&str> = self.edges.iter().map(|e| e.target_id.as_str()).collect();
        let mut ids: Vec<String> = self
            .components
            .keys()
            .filter(|id| !targets.contains(id.as_str()))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Components with no outgoing edges.
    pub fn sink_ids(&self) -> Vec<String> {
        let sources: HashSet<&str> = self.edges.iter().map(|e| e.source_id.as_str()).collect();
        let mut ids: Vec<String> = self
            .components
            .keys()
            .filter(|id| !sources.contains(id.as_str()))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.source_id == id)
            .map(|e| e.target_id.as_str())
            .collect()
    }

    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.target_id == id)
            .map(|e| e.source_id.as_str())
            .collect()
    }

    /// Check endpoints and acyclicity of the whole graph.
    pub fn validate(&self) -> Result<()> {
        for edge in &self.edges {
            if !self.components.contains_key(&edge.source_id) {
                return Err(PipelineError::Configuration(format!(
                    "edge source '{}' not found",
                    edge.source_id
                )));
            }
            if !self.components.contains_key(&edge.target_id) {
                return Err(PipelineError::Configuration(format!(
                    "edge target '{}' not found",
                    edge.target_id
                )));
            }
        }
        if self.has_cycle() {
            return Err(PipelineError::Configuration("chain contains a cycle".into()));
        }
        Ok(())
    }

    /// Run the signal through the chain starting at `start_id`, or at every
    /// source component when `start_id` is `None`.
    pub fn process(&mut self, signal: Arc<Signal>, start_id: Option<&str>) -> Result<Arc<Signal>> {
        if self.components.is_empty() {
            return Err(PipelineError::Precondition(format!("chain '{}' is empty", self.name)));
        }

        let start_ids: Vec<String> = match start_id {
            Some(id) => {
                if !self.components.contains_key(id) {
                    return Err(PipelineError::Configuration(format!(
                        "start component '{id}' not found"
                    )));
                }
                vec![id.to_string()]
            }
            None => {
                let sources = self.source_ids();
                if sources.is_empty() {
                    return Err(PipelineError::Precondition(format!(
                        "chain '{}' has no source components",
                        self.name
                    )));
                }
                sources
            }
        };

        let mut visited = HashSet::new();
        let mut result = signal;
        for id in start_ids {
            result = self.process_from(result, &id, &mut visited)?;
        }
        Ok(result)
    }

    pub fn reset(&mut self) {
        for component in self.components.values_mut() {
            component.reset();
        }
    }

    fn process_from(
        &mut self,
        signal: Arc<Signal>,
        id: &str,
        visited: &mut HashSet<String>,
    ) -> Result<Arc<Signal>> {
        // A DAG with converging paths may reach a component twice per call.
        if !visited.insert(id.to_string()) {
            return Ok(signal);
        }

        let component = self.components.get_mut(id).expect("endpoints validated on insert");
        let output = if component.is_enabled() {
            debug!("chain '{}': processing through '{id}'", self.name);
            component.process(signal)?
        } else {
            signal
        };

        let next: Vec<String> = self.successors(id).iter().map(|s| s.to_string()).collect();
        let mut result = output;
        for next_id in next {
            result = self.process_from(result, &next_id, visited)?;
        }
        Ok(result)
    }

    fn has_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        for id in self.components.keys() {
            if self.cycle_dfs(id, &mut visited, &mut stack) {
                return true;
            }
        }
        false
    }

    fn cycle_dfs(&self, id: &str, visited: &mut HashSet<String>, stack: &mut HashSet<String>) -> bool {
        if !visited.insert(id.to_string()) {
            return false;
        }
        stack.insert(id.to_string());
        for next in self.successors(id) {
            if stack.contains(next) {
                return true;
            }
            if !visited.contains(next) {
                let next = next.to_string();
                if self.cycle_dfs(&next, visited, stack) {
                    return true;
                }
            }
        }
        stack.remove(id);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SampleFormat;

    /// Multiplies every sample by a configured gain. Exercises the component
    /// lifecycle end to end.
    struct GainComponent {
        id: String,
        gain: f32,
        enabled: bool,
        calls: usize,
    }

    impl GainComponent {
        fn boxed(id: &str, gain: f32) -> Box<dyn ProcessingComponent> {
            Box::new(Self { id: id.to_string(), gain, enabled: true, calls: 0 })
        }
    }

    impl ProcessingComponent for GainComponent {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &str {
            "gain"
        }

        fn initialize(&mut self, config: &ComponentConfig) -> Result<()> {
            for (key, value) in config {
                match key.as_str() {
                    "gain" => {
                        self.gain = value.as_f64().ok_or_else(|| {
                            PipelineError::Configuration("gain must be numeric".into())
                        })? as f32;
                    }
                    "enabled" => {
                        self.enabled = value.as_bool().ok_or_else(|| {
                            PipelineError::Configuration("enabled must be a bool".into())
                        })?;
                    }
                    other => {
                        return Err(PipelineError::Configuration(format!(
                            "unknown gain parameter '{other}'"
                        )))
                    }
                }
            }
            Ok(())
        }

        fn process(&mut self, input: Arc<Signal>) -> Result<Arc<Signal>> {
            self.calls += 1;
            let mut out = input.clone_signal();
            let view = out
                .as_f32_mut()
                .ok_or_else(|| PipelineError::Precondition("gain needs ComplexFloat32".into()))?;
            for v in view.iter_mut() {
                *v *= self.gain;
            }
            Ok(Arc::new(out))
        }

        fn reset(&mut self) {
            self.calls = 0;
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }
    }

    fn unit_signal() -> Arc<Signal> {
        let mut s = Signal::new(SampleFormat::ComplexFloat32, 4);
        for v in s.as_f32_mut().unwrap() {
            *v = 1.0;
        }
        Arc::new(s)
    }

    fn three_stage_chain() -> ProcessingChain {
        let mut chain = ProcessingChain::new("test");
        chain.add_component(GainComponent::boxed("a", 2.0)).unwrap();
        chain.add_component(GainComponent::boxed("b", 3.0)).unwrap();
        chain.add_component(GainComponent::boxed("c", 5.0)).unwrap();
        chain.connect("a", "b", "iq").unwrap();
        chain.connect("b", "c", "iq").unwrap();
        chain
    }

    #[test]
    fn duplicate_component_id_rejected() {
        let mut chain = ProcessingChain::new("test");
        chain.add_component(GainComponent::boxed("a", 1.0)).unwrap();
        assert!(chain.add_component(GainComponent::boxed("a", 2.0)).is_err());
    }

    #[test]
    fn cycle_insertion_rolls_back() {
        let mut chain = three_stage_chain();
        let edges_before = chain.edges().len();
        let err = chain.connect("c", "a", "loop");
        assert!(err.is_err());
        assert_eq!(chain.edges().len(), edges_before, "failed edge must not persist");
        // Self-loop is also a cycle
        assert!(chain.connect("a", "a", "self").is_err());
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn linear_chain_applies_all_stages() {
        let mut chain = three_stage_chain();
        let out = chain.process(unit_signal(), None).unwrap();
        let v = out.as_f32().unwrap();
        assert!((v[0] - 30.0).abs() < 1e-6, "2 * 3 * 5 applied, got {}", v[0]);
    }

    #[test]
    fn disabled_component_forwards_input() {
        let mut chain = three_stage_chain();
        // Rebuild b as disabled via config
        chain.remove_component("b").unwrap();
        let b = GainComponent { id: "b".into(), gain: 3.0, enabled: false, calls: 0 };
        chain.add_component(Box::new(b)).unwrap();
        chain.connect("a", "b", "iq").unwrap();
        chain.connect("b", "c", "iq").unwrap();
        let out = chain.process(unit_signal(), None).unwrap();
        let v = out.as_f32().unwrap();
        assert!((v[0] - 10.0).abs() < 1e-6, "only 2 * 5 applied, got {}", v[0]);
    }

    #[test]
    fn diamond_graph_visits_each_component_once() {
        // a → b, a → c, b → d, c → d
        let mut chain = ProcessingChain::new("diamond");
        for (id, gain) in [("a", 2.0), ("b", 1.0), ("c", 1.0), ("d", 3.0)] {
            chain.add_component(GainComponent::boxed(id, gain)).unwrap();
        }
        chain.connect("a", "b", "").unwrap();
        chain.connect("a", "c", "").unwrap();
        chain.connect("b", "d", "").unwrap();
        chain.connect("c", "d", "").unwrap();
        assert_eq!(chain.source_ids(), vec!["a".to_string()]);
        assert_eq!(chain.sink_ids(), vec!["d".to_string()]);
        // d runs once: 2 * 1 * 3 (second path short-circuits at the memo)
        let out = chain.process(unit_signal(), None).unwrap();
        let v = out.as_f32().unwrap();
        assert!((v[0] - 6.0).abs() < 1e-6, "got {}", v[0]);
    }

    #[test]
    fn start_id_overrides_sources() {
        let mut chain = three_stage_chain();
        let out = chain.process(unit_signal(), Some("b")).unwrap();
        let v = out.as_f32().unwrap();
        assert!((v[0] - 15.0).abs() < 1e-6, "3 * 5 from b, got {}", v[0]);
        assert!(chain.process(unit_signal(), Some("nope")).is_err());
    }

    #[test]
    fn component_failure_aborts_traversal() {
        let mut chain = ProcessingChain::new("fail");
        chain.add_component(GainComponent::boxed("a", 2.0)).unwrap();
        // Int16 input makes the gain component fail its precondition
        let bad = Arc::new(Signal::new(SampleFormat::ComplexInt16, 4));
        assert!(chain.process(bad, None).is_err());
    }

    #[test]
    fn reset_clears_component_state() {
        let mut comp = GainComponent { id: "g".into(), gain: 2.0, enabled: true, calls: 0 };
        comp.process(unit_signal()).unwrap();
        comp.process(unit_signal()).unwrap();
        assert_eq!(comp.calls, 2);
        comp.reset();
        assert_eq!(comp.calls, 0);
    }

    #[test]
    fn initialize_validates_config_keys() {
        let mut comp = GainComponent { id: "g".into(), gain: 1.0, enabled: true, calls: 0 };
        let mut cfg = ComponentConfig::new();
        cfg.insert("gain".into(), ConfigValue::Float(4.0));
        assert!(comp.initialize(&cfg).is_ok());
        assert_eq!(comp.gain, 4.0);
        cfg.insert("bogus".into(), ConfigValue::Bool(true));
        assert!(comp.initialize(&cfg).is_err());
    }
}
