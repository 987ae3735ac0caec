//! # tdoa-node
//!
//! TDOA geolocation pipeline: estimates the 2-D position of a radio emitter
//! from signals captured by three or more spatially separated receivers.
//!
//! The measurement-and-estimation chain:
//! - [`time_base`]: GPS-disciplined clock (Kalman filter, Allan deviation,
//!   temperature compensation, holdover)
//! - [`protocol`] + [`transport`]: time-reference exchange between nodes over
//!   UDP with degraded-peer detection
//! - [`signal`]: typed I/Q buffers with format conversion and slicing
//! - [`engine`], [`chain`], [`resources`]: the parallel processing fabric
//!   (priority worker pool, component DAG, resource accounting)
//! - [`correlation`]: windowed cross-correlation with sub-sample peak
//!   interpolation
//! - [`extractor`]: per-pair delay measurement with clock correction and
//!   outlier rejection
//! - [`solver`]: iterative multilateration with GDOP and confidence ellipse

pub mod allan;
pub mod chain;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod gps;
pub mod kalman;
pub mod protocol;
pub mod resources;
pub mod signal;
pub mod solver;
pub mod temp_comp;
pub mod time_base;
pub mod transport;

use std::sync::Arc;

use tdoa_types::ResourceKind;

use config::NodeConfig;
use engine::ProcessingEngine;
use resources::ResourcePool;

/// The explicit context threaded through component constructors instead of
/// process-wide singletons: one engine and one resource pool per pipeline.
pub struct PipelineContext {
    pub engine: ProcessingEngine,
    pub resources: Arc<ResourcePool>,
}

impl PipelineContext {
    pub fn new(config: &NodeConfig) -> error::Result<Self> {
        let engine = ProcessingEngine::new(config.engine_config()?);
        let resources = Arc::new(ResourcePool::new());
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        resources.register(ResourceKind::Cpu, cores as f64)?;
        resources.register(ResourceKind::Memory, 4096.0)?;
        Ok(Self { engine, resources })
    }
}
