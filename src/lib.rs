// Sparse Predictive Hierarchies: online hierarchical sparse coding,
// prediction and actor-critic learning over column SDRs.

pub mod actor;
pub mod config;
pub mod csdr;
pub mod encoder;
pub mod error;
pub mod helpers;
pub mod hierarchy;
pub mod layer;
pub mod predictor;

pub use config::{HierarchyConfig, HierarchyDesc, IoDesc, IoType, LayerDesc};
pub use csdr::Csdr;
pub use error::{Result, SerializeError, SphError};
pub use helpers::Int3;
pub use hierarchy::{Hierarchy, IoParams, LayerParams, Params, Snapshot};
pub use layer::LayerState;
