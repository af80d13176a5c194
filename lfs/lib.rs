#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod case;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda_backend;
pub mod data;
pub mod device;
pub mod engine;
pub mod pool;
pub mod progress;
pub mod rng;
pub mod simplex;
pub mod sort;
pub mod types;
pub mod weights;
pub mod work_area;

pub use config::LfsConfig;
pub use engine::{EngineOptions, Lfs, LfsError, RunSummary};
pub use types::{CaseOutcome, SolverKind, WeightBackend};
