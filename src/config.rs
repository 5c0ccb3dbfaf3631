// Config: structural IO and layer descriptors, construction-time settings.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SphError};
use crate::helpers::{arena_len, Int3};

/// Determines how the hierarchy processes a particular IO port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    /// Input-only port: encoded upward, never predicted.
    None = 0,
    /// A [`Predictor`](crate::predictor::Predictor) predicts this port's next value.
    #[default]
    Prediction = 1,
    /// An [`Actor`](crate::actor::Actor) proposes actions for this port.
    Action = 2,
}

impl TryFrom<u8> for IoType {
    type Error = u8;

    fn try_from(v: u8) -> std::result::Result<Self, u8> {
        match v {
            0 => Ok(IoType::None),
            1 => Ok(IoType::Prediction),
            2 => Ok(IoType::Action),
            other => Err(other),
        }
    }
}

/// Structural descriptor for one IO port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IoDesc {
    /// Spatial size `(x, y, z)`; `z` is the number of cells per column.
    pub size: Int3,
    pub io_type: IoType,
    /// Dendrites per cell for the predictor or actor policy head.
    pub num_dendrites_per_cell: usize,
    /// Radius from this port up into the bottom encoder.
    pub up_radius: i32,
    /// Radius from the bottom layer down to this port's predictor/actor.
    pub down_radius: i32,
    /// Number of value bins of the actor critic. Action ports only.
    pub value_size: usize,
    /// Dendrites per value bin of the actor critic. Action ports only.
    pub value_num_dendrites_per_cell: usize,
    /// Replay window of the actor. Action ports only.
    pub history_capacity: usize,
}

impl Default for IoDesc {
    fn default() -> Self {
        Self {
            size: Int3::new(4, 4, 16),
            io_type: IoType::Prediction,
            num_dendrites_per_cell: 4,
            up_radius: 2,
            down_radius: 2,
            value_size: 32,
            value_num_dendrites_per_cell: 4,
            history_capacity: 64,
        }
    }
}

impl IoDesc {
    pub fn check_in_range(&self, index: usize) -> Result<()> {
        let fail = |msg: String| Err(SphError::Config(format!("io_descs[{index}]: {msg}")));

        check_size("size", self.size).or_else(fail)?;

        if self.up_radius < 0 {
            return fail(format!("up_radius {} < 0", self.up_radius));
        }
        if self.down_radius < 0 {
            return fail(format!("down_radius {} < 0", self.down_radius));
        }
        if self.io_type != IoType::None && self.num_dendrites_per_cell < 2 {
            return fail("num_dendrites_per_cell < 2".into());
        }
        if self.io_type == IoType::Action {
            if self.value_size < 2 {
                return fail("value_size < 2".into());
            }
            if self.value_num_dendrites_per_cell < 2 {
                return fail("value_num_dendrites_per_cell < 2".into());
            }
            if self.history_capacity < 2 {
                return fail("history_capacity < 2".into());
            }
        }

        Ok(())
    }
}

/// Structural descriptor for one layer.
///
/// The bottom layer is driven by the IO ports and fires on every step: its
/// `ticks_per_update` is treated as 1 whatever the descriptor holds, and
/// only its `temporal_horizon` is used.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LayerDesc {
    pub hidden_size: Int3,
    /// Dendrites per cell for this layer's predictors of the layer below.
    pub num_dendrites_per_cell: usize,
    /// Feed-forward radius from the layer below into this encoder.
    pub up_radius: i32,
    /// Lateral radius of the encoder's self-connection; `None` disables it.
    pub recurrent_radius: Option<i32>,
    /// Feedback radius from this layer down to the layer below.
    pub down_radius: i32,
    /// Updates of the layer below between two updates of this layer.
    /// Ignored for the bottom layer, which always uses 1.
    pub ticks_per_update: usize,
    /// Number of past input states the encoder sees. At least
    /// `ticks_per_update`.
    pub temporal_horizon: usize,
}

impl Default for LayerDesc {
    fn default() -> Self {
        Self {
            hidden_size: Int3::new(4, 4, 16),
            num_dendrites_per_cell: 4,
            up_radius: 2,
            recurrent_radius: None,
            down_radius: 2,
            ticks_per_update: 2,
            temporal_horizon: 2,
        }
    }
}

impl LayerDesc {
    pub fn check_in_range(&self, index: usize) -> Result<()> {
        let fail = |msg: String| Err(SphError::Config(format!("layer_descs[{index}]: {msg}")));

        check_size("hidden_size", self.hidden_size).or_else(fail)?;

        if self.up_radius < 0 {
            return fail(format!("up_radius {} < 0", self.up_radius));
        }
        if self.down_radius < 0 {
            return fail(format!("down_radius {} < 0", self.down_radius));
        }
        if let Some(r) = self.recurrent_radius {
            if r < 0 {
                return fail(format!("recurrent_radius {r} < 0"));
            }
        }
        if self.num_dendrites_per_cell < 2 {
            return fail("num_dendrites_per_cell < 2".into());
        }
        if self.ticks_per_update < 1 {
            return fail("ticks_per_update < 1".into());
        }
        if self.temporal_horizon < self.ticks_per_update {
            return fail(format!(
                "temporal_horizon {} < ticks_per_update {}",
                self.temporal_horizon, self.ticks_per_update
            ));
        }

        Ok(())
    }
}

fn check_size(name: &str, size: Int3) -> std::result::Result<(), String> {
    if size.x < 1 || size.y < 1 || size.z < 1 {
        return Err(format!("{name} {size:?} has a component < 1"));
    }
    // CSDR indices are i32 and weight arenas are addressed with usize.
    if (size.x as i64) * (size.y as i64) * (size.z as i64) > i32::MAX as i64 {
        return Err(format!("{name} {size:?} is too large"));
    }
    Ok(())
}

/// Total arena entries for `num_hidden_cells * fan_out` targets over one
/// visible layer, or a configuration error on overflow.
pub(crate) fn arena_size(
    num_hidden_cells: usize,
    fan_out: usize,
    visible_size: Int3,
    radius: i32,
) -> Result<usize> {
    arena_len(num_hidden_cells, fan_out, visible_size, radius).ok_or_else(|| {
        SphError::Config(format!(
            "radius {radius} over visible size {visible_size:?} is not representable"
        ))
    })
}

/// Engine-wide configuration passed at construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HierarchyConfig {
    /// Seed of the hierarchy's private PCG stream (weight init, exploration,
    /// stochastic rounding, replay sampling).
    pub seed: u64,
    /// Size of a dedicated worker pool. `None` uses rayon's global pool.
    pub num_threads: Option<usize>,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            seed: 12345,
            num_threads: None,
        }
    }
}

impl HierarchyConfig {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    pub fn check_in_range(&self) -> Result<()> {
        if self.num_threads == Some(0) {
            return Err(SphError::Config("num_threads must be at least 1".into()));
        }
        Ok(())
    }
}

/// Complete construction input, loadable from JSON.
///
/// ```
/// use sph::config::HierarchyDesc;
///
/// let desc = HierarchyDesc::from_json_str(r#"{
///     "config": { "seed": 7 },
///     "io_descs": [ { "size": { "x": 1, "y": 1, "z": 32 } } ],
///     "layer_descs": [ { "ticks_per_update": 1, "temporal_horizon": 4 } ]
/// }"#).unwrap();
/// assert_eq!(desc.config.seed, 7);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HierarchyDesc {
    pub config: HierarchyConfig,
    pub io_descs: Vec<IoDesc>,
    pub layer_descs: Vec<LayerDesc>,
}

impl HierarchyDesc {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let desc: Self = serde_json::from_str(json)?;
        desc.validate()?;
        Ok(desc)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every descriptor and the cross-descriptor rules.
    pub fn validate(&self) -> Result<()> {
        validate_descs(&self.io_descs, &self.layer_descs)?;
        self.config.check_in_range()
    }
}

pub(crate) fn validate_descs(io_descs: &[IoDesc], layer_descs: &[LayerDesc]) -> Result<()> {
    if io_descs.is_empty() {
        return Err(SphError::Config("at least one IO descriptor is required".into()));
    }
    if layer_descs.is_empty() {
        return Err(SphError::Config("at least one layer descriptor is required".into()));
    }

    for (i, d) in io_descs.iter().enumerate() {
        d.check_in_range(i)?;
    }
    for (l, d) in layer_descs.iter().enumerate() {
        d.check_in_range(l)?;
    }

    Ok(())
}
