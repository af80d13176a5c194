use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::case::{CaseOutcome, CaseReport};

/// Which linear-programming back end every work area instantiates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// The in-crate dense two-phase tableau.
    #[default]
    Tableau,
    /// Delegation to the `microlp` crate.
    Microlp,
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tableau => "tableau",
            Self::Microlp => "microlp",
        })
    }
}

/// Where case-similarity weights are computed from iteration 1 onwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WeightBackend {
    /// Inline on each worker thread.
    #[default]
    Cpu,
    /// The staged kernel sequence on the host-emulated device, behind the device queue.
    Device,
    /// The staged kernel sequence on a CUDA device (needs the `cuda` feature).
    Cuda,
}

impl fmt::Display for WeightBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Device => "device",
            Self::Cuda => "cuda",
        })
    }
}
