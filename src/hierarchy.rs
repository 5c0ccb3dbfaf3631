// Hierarchy: top-level orchestrator driving a stack of layers one step at a time.
#![allow(clippy::needless_range_loop)]

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::actor::{self, Actor};
use crate::config::{validate_descs, HierarchyConfig, HierarchyDesc, IoDesc, IoType, LayerDesc};
use crate::csdr;
use crate::encoder::{self, Encoder, VisibleLayerDesc};
use crate::error::{Result, SerializeError, SphError};
use crate::helpers::*;
use crate::layer::{check_arenas, Layer, LayerState};
use crate::predictor::{self, Predictor};

/// Magic number at the start of every serialized [`Hierarchy`].
/// Spells "SPHH" in ASCII.
const SERIAL_MAGIC: u32 = 0x48485053;

/// Magic number at the start of every state-only buffer. Spells "SPHS".
const STATE_MAGIC: u32 = 0x53485053;

/// Binary format version. Increment when the serialized layout changes.
const SERIAL_VERSION: u32 = 1;

/// Runtime hyperparameters for one layer.
///
/// May be adjusted between [`Hierarchy::step`] calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LayerParams {
    pub encoder: encoder::Params,
    /// Used by the predictors of layers above the bottom one.
    pub predictor: predictor::Params,
    /// Relative weight of the recurrent visible layer. Default: `0.5`.
    pub recurrent_importance: f32,
}

impl Default for LayerParams {
    fn default() -> Self {
        Self {
            encoder: encoder::Params::default(),
            predictor: predictor::Params::default(),
            recurrent_importance: 0.5,
        }
    }
}

/// Runtime hyperparameters for one IO port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IoParams {
    pub predictor: predictor::Params,
    pub actor: actor::Params,
    /// Weight of this port's history in the bottom encoder. Default: `1.0`.
    pub importance: f32,
}

impl Default for IoParams {
    fn default() -> Self {
        Self {
            predictor: predictor::Params::default(),
            actor: actor::Params::default(),
            importance: 1.0,
        }
    }
}

/// All runtime hyperparameters: one [`LayerParams`] per layer and one
/// [`IoParams`] per IO port. The vectors must keep the lengths they were
/// created with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Params {
    pub layers: Vec<LayerParams>,
    pub ios: Vec<IoParams>,
}

impl Params {
    pub fn new(num_layers: usize, num_io: usize) -> Self {
        Self {
            layers: vec![LayerParams::default(); num_layers],
            ios: vec![IoParams::default(); num_io],
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks lengths against the hierarchy and every value against its range.
    pub fn check(&self, num_layers: usize, num_io: usize) -> Result<()> {
        if self.layers.len() != num_layers {
            return Err(SphError::Params(format!(
                "{} layer params for {num_layers} layers",
                self.layers.len()
            )));
        }
        if self.ios.len() != num_io {
            return Err(SphError::Params(format!(
                "{} IO params for {num_io} IO ports",
                self.ios.len()
            )));
        }

        for (l, p) in self.layers.iter().enumerate() {
            let checked = p
                .encoder
                .check()
                .and_then(|_| p.predictor.check())
                .and_then(|_| check_importance("recurrent_importance", p.recurrent_importance));
            checked.map_err(|e| SphError::Params(format!("layer {l}: {e}")))?;
        }

        for (i, p) in self.ios.iter().enumerate() {
            let checked = p
                .predictor
                .check()
                .and_then(|_| p.actor.check())
                .and_then(|_| check_importance("importance", p.importance));
            checked.map_err(|e| SphError::Params(format!("IO {i}: {e}")))?;
        }

        Ok(())
    }
}

/// [`Params::check`] plus the limits that depend on the IO descriptors.
fn check_params(params: &Params, io_descs: &[IoDesc], num_layers: usize) -> Result<()> {
    params.check(num_layers, io_descs.len())?;

    for (i, (p, desc)) in params.ios.iter().zip(io_descs).enumerate() {
        // replay only starts once the history holds more than min_steps samples
        if desc.io_type == IoType::Action && p.actor.min_steps >= desc.history_capacity {
            return Err(SphError::Params(format!(
                "IO {i}: actor min_steps {} >= history_capacity {}",
                p.actor.min_steps, desc.history_capacity
            )));
        }
    }

    Ok(())
}

fn check_importance(name: &str, value: f32) -> std::result::Result<(), String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{name} {value} must be finite and >= 0"));
    }
    Ok(())
}

/// Owned checkpoint of a whole hierarchy (structure, weights, state and
/// params), taken by [`Hierarchy::snapshot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    data: Vec<u8>,
}

impl Snapshot {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// Everything a buffer decodes to, before a pool is attached.
struct Decoded {
    io_descs: Vec<IoDesc>,
    layer_descs: Vec<LayerDesc>,
    layers: Vec<Layer>,
    rng_state: u64,
    params: Params,
}

/// A stack of layers over a set of IO ports.
///
/// Every layer encodes upward; the bottom layer every step, the layers above
/// whenever the layer below has updated `ticks_per_update` times. Predictions
/// and actions then flow downward to the IO ports.
///
/// ```
/// use sph::{Hierarchy, HierarchyConfig, Int3, IoDesc, LayerDesc};
///
/// let io_descs = vec![IoDesc { size: Int3::new(1, 1, 8), ..Default::default() }];
/// let layer_descs = vec![LayerDesc { hidden_size: Int3::new(2, 2, 8), ..Default::default() }];
/// let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();
///
/// for t in 0..16 {
///     let input = vec![(t % 4) as i32];
///     h.step(&[&input], true, 0.0).unwrap();
/// }
/// assert_eq!(h.get_prediction_cis(0).unwrap().len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct Hierarchy {
    io_descs: Vec<IoDesc>,
    layer_descs: Vec<LayerDesc>,
    layers: Vec<Layer>,
    /// Per IO port: index into the bottom layer's predictors or actors.
    io_map: Vec<Option<usize>>,
    /// IO port of each bottom predictor.
    prediction_ios: Vec<usize>,
    /// IO port of each actor.
    action_ios: Vec<usize>,
    rng_state: u64,
    config: HierarchyConfig,
    pool: Option<Arc<rayon::ThreadPool>>,
    /// Tunables, validated at every step.
    pub params: Params,
}

fn build_pool(config: &HierarchyConfig) -> Result<Option<Arc<rayon::ThreadPool>>> {
    match config.num_threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
            Ok(Some(Arc::new(pool)))
        }
        None => Ok(None),
    }
}

fn io_routing(io_descs: &[IoDesc]) -> (Vec<Option<usize>>, Vec<usize>, Vec<usize>) {
    let mut io_map = Vec::with_capacity(io_descs.len());
    let mut prediction_ios = Vec::new();
    let mut action_ios = Vec::new();

    for (i, desc) in io_descs.iter().enumerate() {
        match desc.io_type {
            IoType::None => io_map.push(None),
            IoType::Prediction => {
                io_map.push(Some(prediction_ios.len()));
                prediction_ios.push(i);
            }
            IoType::Action => {
                io_map.push(Some(action_ios.len()));
                action_ios.push(i);
            }
        }
    }

    (io_map, prediction_ios, action_ios)
}

impl Hierarchy {
    /// Builds a hierarchy with random weights seeded from `config.seed`.
    pub fn init_random(
        io_descs: &[IoDesc],
        layer_descs: &[LayerDesc],
        config: &HierarchyConfig,
    ) -> Result<Self> {
        validate_descs(io_descs, layer_descs)?;
        config.check_in_range()?;
        check_arenas(io_descs, layer_descs)?;

        let pool = build_pool(config)?;
        let mut rng_state = rand_get_state(config.seed);

        let layers = (0..layer_descs.len())
            .map(|l| Layer::init_random(l, io_descs, layer_descs, &mut rng_state))
            .collect();

        // short replay windows start learning as soon as they can
        let mut params = Params::new(layer_descs.len(), io_descs.len());
        for (p, desc) in params.ios.iter_mut().zip(io_descs) {
            if desc.io_type == IoType::Action {
                p.actor.min_steps = p.actor.min_steps.min(desc.history_capacity - 1);
            }
        }

        let hierarchy = Self::assemble(
            Decoded {
                io_descs: io_descs.to_vec(),
                layer_descs: layer_descs.to_vec(),
                layers,
                rng_state,
                params,
            },
            config.clone(),
            pool,
        );

        info!(
            num_io = io_descs.len(),
            num_layers = layer_descs.len(),
            seed = config.seed,
            num_threads = ?config.num_threads,
            "hierarchy initialized"
        );

        Ok(hierarchy)
    }

    /// [`init_random`](Self::init_random) from a bundled descriptor.
    pub fn from_desc(desc: &HierarchyDesc) -> Result<Self> {
        Self::init_random(&desc.io_descs, &desc.layer_descs, &desc.config)
    }

    /// Decodes a buffer written by [`serialize`](Self::serialize).
    ///
    /// The RNG state comes from the buffer; only `config.num_threads` is used.
    pub fn from_buffer(data: &[u8], config: &HierarchyConfig) -> Result<Self> {
        config.check_in_range()?;
        let decoded = decode(data).inspect_err(|e| warn!(error = %e, "rejected hierarchy buffer"))?;
        let pool = build_pool(config)?;

        info!(
            num_io = decoded.io_descs.len(),
            num_layers = decoded.layer_descs.len(),
            bytes = data.len(),
            "hierarchy loaded"
        );

        Ok(Self::assemble(decoded, config.clone(), pool))
    }

    pub fn from_file(path: impl AsRef<Path>, config: &HierarchyConfig) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "reading hierarchy file");
        Self::from_buffer(&data, config)
    }

    fn assemble(
        decoded: Decoded,
        config: HierarchyConfig,
        pool: Option<Arc<rayon::ThreadPool>>,
    ) -> Self {
        let (io_map, prediction_ios, action_ios) = io_routing(&decoded.io_descs);

        Self {
            io_descs: decoded.io_descs,
            layer_descs: decoded.layer_descs,
            layers: decoded.layers,
            io_map,
            prediction_ios,
            action_ios,
            rng_state: decoded.rng_state,
            config,
            pool,
            params: decoded.params,
        }
    }

    /// Advances the hierarchy by one step, broadcasting `reward` to every
    /// Action port.
    pub fn step(&mut self, input_cis: &[&[i32]], learn_enabled: bool, reward: f32) -> Result<()> {
        let rewards = vec![reward; self.io_descs.len()];
        self.step_routed(input_cis, learn_enabled, &rewards, 0.0)
    }

    /// Advances the hierarchy by one step with one reward per IO port
    /// (entries of non-Action ports are ignored) and an imitation signal
    /// `mimic` added to the actors' policy updates.
    ///
    /// Nothing is modified when an error is returned.
    pub fn step_routed(
        &mut self,
        input_cis: &[&[i32]],
        learn_enabled: bool,
        rewards: &[f32],
        mimic: f32,
    ) -> Result<()> {
        self.validate_step(input_cis, rewards, mimic)?;

        match self.pool.clone() {
            Some(pool) => pool.install(|| self.run_step(input_cis, learn_enabled, rewards, mimic)),
            None => self.run_step(input_cis, learn_enabled, rewards, mimic),
        }

        trace!(
            learn_enabled,
            updated = self.layers.iter().filter(|layer| layer.updated).count(),
            "step"
        );

        Ok(())
    }

    fn validate_step(&self, input_cis: &[&[i32]], rewards: &[f32], mimic: f32) -> Result<()> {
        if input_cis.len() != self.io_descs.len() {
            return Err(SphError::InputCount {
                expected: self.io_descs.len(),
                got: input_cis.len(),
            });
        }
        for (io, (cis, desc)) in input_cis.iter().zip(&self.io_descs).enumerate() {
            csdr::validate(io, desc.size, cis)?;
        }

        if rewards.len() != self.io_descs.len() {
            return Err(SphError::Reward(format!(
                "expected {} rewards, got {}",
                self.io_descs.len(),
                rewards.len()
            )));
        }
        if let Some(io) = rewards.iter().position(|r| !r.is_finite()) {
            return Err(SphError::Reward(format!("reward for IO {io} is {}", rewards[io])));
        }
        if !mimic.is_finite() {
            return Err(SphError::Reward(format!("mimic is {mimic}")));
        }

        check_params(&self.params, &self.io_descs, self.layers.len())
    }

    fn run_step(&mut self, input_cis: &[&[i32]], learn_enabled: bool, rewards: &[f32], mimic: f32) {
        let num_layers = self.layers.len();

        for (io, cis) in input_cis.iter().enumerate() {
            self.layers[0].push_history(io, cis);
        }

        // up
        for l in 0..num_layers {
            let layer_params = &self.params.layers[l];
            let (lower, upper) = self.layers.split_at_mut(l + 1);
            let layer = &mut lower[l];

            layer.updated = l == 0 || layer.ticks >= layer.ticks_per_update;
            if !layer.updated {
                continue;
            }
            layer.ticks = 0;

            if l == 0 {
                let importances: FloatBuffer = self.params.ios.iter().map(|p| p.importance).collect();
                layer.encode(
                    learn_enabled,
                    &layer_params.encoder,
                    &importances,
                    layer_params.recurrent_importance,
                );
            } else {
                layer.encode(
                    learn_enabled,
                    &layer_params.encoder,
                    &[1.0],
                    layer_params.recurrent_importance,
                );
            }

            if let Some(next) = upper.first_mut() {
                next.push_history(0, layer.encoder.get_hidden_cis());
                next.ticks += 1;
            }
        }

        // down
        for l in (0..num_layers).rev() {
            if !self.layers[l].updated {
                continue;
            }

            let (lower, upper) = self.layers.split_at_mut(l + 1);
            let Layer {
                encoder,
                predictors,
                actors,
                histories,
                ..
            } = &mut lower[l];

            let mut inputs: Vec<&[i32]> = vec![encoder.get_hidden_cis()];
            if let Some(next) = upper.first() {
                inputs.push(next.feedback_cis());
            }

            if l == 0 {
                for (d, predictor) in predictors.iter_mut().enumerate() {
                    let io = self.prediction_ios[d];
                    let io_params = &self.params.ios[io].predictor;
                    if learn_enabled {
                        let base_state = rand_step(&mut self.rng_state) as u64;
                        predictor.learn(input_cis[io], base_state, io_params);
                    }
                    predictor.activate(&inputs, io_params);
                }

                for (a, actor) in actors.iter_mut().enumerate() {
                    let io = self.action_ios[a];
                    actor.step(
                        &inputs,
                        input_cis[io],
                        learn_enabled,
                        rewards[io],
                        mimic,
                        &self.params.ios[io].actor,
                        &mut self.rng_state,
                    );
                }
            } else {
                let layer_params = &self.params.layers[l].predictor;
                for (d, predictor) in predictors.iter_mut().enumerate() {
                    if learn_enabled {
                        let base_state = rand_step(&mut self.rng_state) as u64;
                        predictor.learn(histories[0].get(d), base_state, layer_params);
                    }
                    predictor.activate(&inputs, layer_params);
                }
            }
        }
    }

    /// Resets hidden states, histories, tick counters and actor replay
    /// buffers. Weights and params are kept.
    pub fn clear_state(&mut self) {
        for layer in &mut self.layers {
            layer.clear_state();
        }
        debug!("hierarchy state cleared");
    }

    // --- Persistence ---

    /// Structure, weights, state, RNG and params.
    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = VecWriter::new();
        writer.write_u32(SERIAL_MAGIC);
        writer.write_u32(SERIAL_VERSION);
        writer.write_u64(self.rng_state);
        write_descs(&mut writer, &self.io_descs, &self.layer_descs);

        for layer in &self.layers {
            layer.write(&mut writer);
        }

        write_params(&mut writer, &self.params);

        debug!(bytes = writer.data.len(), "hierarchy serialized");
        writer.data
    }

    /// Replaces this hierarchy with the one in `data`, keeping the thread
    /// pool. On error the hierarchy is unchanged.
    pub fn restore(&mut self, data: &[u8]) -> Result<()> {
        let decoded = decode(data).inspect_err(|e| warn!(error = %e, "rejected hierarchy buffer"))?;
        let pool = self.pool.take();
        let config = self.config.clone();
        *self = Self::assemble(decoded, config, pool);
        debug!(bytes = data.len(), "hierarchy restored");
        Ok(())
    }

    /// Transient state only: hidden CSDRs, histories, tick counters, actor
    /// replay buffers and the RNG.
    pub fn serialize_state(&self) -> Vec<u8> {
        let mut writer = VecWriter::new();
        writer.write_u32(STATE_MAGIC);
        writer.write_u32(SERIAL_VERSION);
        writer.write_u64(self.structure_fingerprint());
        writer.write_u64(self.rng_state);

        for layer in &self.layers {
            layer.write_state(&mut writer);
        }

        writer.data
    }

    /// Applies a buffer from [`serialize_state`](Self::serialize_state) of a
    /// hierarchy with the same structure. On error nothing changes.
    pub fn restore_state(&mut self, data: &[u8]) -> Result<()> {
        let result = self.decode_state(data);
        let (rng_state, layers) = result.inspect_err(|e| warn!(error = %e, "rejected state buffer"))?;
        self.rng_state = rng_state;
        self.layers = layers;
        debug!(bytes = data.len(), "hierarchy state restored");
        Ok(())
    }

    fn decode_state(&self, data: &[u8]) -> std::result::Result<(u64, Vec<Layer>), SerializeError> {
        let mut reader = SliceReader::new(data);
        read_header(&mut reader, STATE_MAGIC)?;

        let fingerprint = reader.read_u64()?;
        if fingerprint != self.structure_fingerprint() {
            return Err(SerializeError::StructureMismatch(format!(
                "fingerprint {fingerprint:#018x}, expected {:#018x}",
                self.structure_fingerprint()
            )));
        }

        let rng_state = reader.read_u64()?;
        let mut layers = self.layers.clone();
        for (l, layer) in layers.iter_mut().enumerate() {
            layer.read_state(&mut reader, &self.source_sizes(l))?;
        }
        expect_end(&reader)?;

        Ok((rng_state, layers))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = self.serialize();
        std::fs::write(path.as_ref(), &data)?;
        debug!(path = %path.as_ref().display(), bytes = data.len(), "hierarchy saved");
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            data: self.serialize(),
        }
    }

    /// Returns to the state captured by `snapshot`.
    pub fn rollback(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.restore(&snapshot.data)?;
        debug!("hierarchy rolled back");
        Ok(())
    }

    // FNV-1a over the serialized descriptors.
    fn structure_fingerprint(&self) -> u64 {
        let mut writer = VecWriter::new();
        write_descs(&mut writer, &self.io_descs, &self.layer_descs);
        writer.data.iter().fold(0xcbf29ce484222325u64, |hash, &b| {
            (hash ^ b as u64).wrapping_mul(0x100000001b3)
        })
    }

    fn source_sizes(&self, l: usize) -> Vec<Int3> {
        if l == 0 {
            self.io_descs.iter().map(|io| io.size).collect()
        } else {
            vec![self.layer_descs[l - 1].hidden_size]
        }
    }

    // --- Queries ---

    fn io_desc(&self, io: usize) -> Result<&IoDesc> {
        self.io_descs.get(io).ok_or(SphError::IndexOutOfRange {
            kind: "IO",
            index: io,
            count: self.io_descs.len(),
        })
    }

    fn layer(&self, l: usize) -> Result<&Layer> {
        self.layers.get(l).ok_or(SphError::IndexOutOfRange {
            kind: "layer",
            index: l,
            count: self.layers.len(),
        })
    }

    fn predictor(&self, io: usize) -> Result<Option<&Predictor>> {
        let desc = self.io_desc(io)?;
        Ok(match (desc.io_type, self.io_map[io]) {
            (IoType::Prediction, Some(d)) => Some(&self.layers[0].predictors[d]),
            _ => None,
        })
    }

    fn actor(&self, io: usize) -> Result<&Actor> {
        let desc = self.io_desc(io)?;
        match (desc.io_type, self.io_map[io]) {
            (IoType::Action, Some(a)) => Ok(&self.layers[0].actors[a]),
            (actual, _) => Err(SphError::WrongIoType {
                io,
                actual,
                required: "Action",
            }),
        }
    }

    fn wrong_for_prediction(&self, io: usize) -> SphError {
        SphError::WrongIoType {
            io,
            actual: self.io_descs[io].io_type,
            required: "Prediction or Action",
        }
    }

    /// Predicted next CSDR of a Prediction port, or the chosen action of an
    /// Action port.
    pub fn get_prediction_cis(&self, io: usize) -> Result<&[i32]> {
        if let Some(predictor) = self.predictor(io)? {
            return Ok(predictor.get_hidden_cis());
        }
        match self.io_descs[io].io_type {
            IoType::Action => Ok(self.actor(io)?.get_hidden_cis()),
            _ => Err(self.wrong_for_prediction(io)),
        }
    }

    /// Per-cell probabilities behind [`get_prediction_cis`](Self::get_prediction_cis).
    pub fn get_prediction_acts(&self, io: usize) -> Result<&[f32]> {
        if let Some(predictor) = self.predictor(io)? {
            return Ok(predictor.get_hidden_acts());
        }
        match self.io_descs[io].io_type {
            IoType::Action => Ok(self.actor(io)?.get_hidden_acts()),
            _ => Err(self.wrong_for_prediction(io)),
        }
    }

    /// Value estimate of every column of an Action port.
    pub fn get_prediction_values(&self, io: usize) -> Result<&[f32]> {
        Ok(self.actor(io)?.get_hidden_values())
    }

    /// Draws one cell per column from the prediction probabilities raised to
    /// `1 / temperature`. A temperature of `0` returns the most probable cells.
    pub fn sample_prediction(&self, io: usize, temperature: f32, seed: u64) -> Result<IntBuffer> {
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(SphError::Params(format!(
                "sampling temperature {temperature} must be finite and >= 0"
            )));
        }

        let acts = self.get_prediction_acts(io)?;
        let num_hc = self.io_descs[io].size.z as usize;
        let mut state = rand_get_state(seed);

        Ok(acts
            .chunks(num_hc)
            .map(|column| {
                if temperature == 0.0 {
                    return csdr::argmax(column) as i32;
                }

                let inv_temperature = 1.0 / temperature;
                let weights: FloatBuffer = column.iter().map(|p| p.max(0.0).powf(inv_temperature)).collect();
                let total: f32 = weights.iter().sum();
                if !total.is_finite() || total <= 0.0 {
                    return csdr::argmax(column) as i32;
                }

                let mut cusp = randf_step(&mut state) * total;
                for (ci, &w) in weights.iter().enumerate() {
                    if cusp < w {
                        return ci as i32;
                    }
                    cusp -= w;
                }
                (num_hc - 1) as i32
            })
            .collect())
    }

    /// Layer `l`'s current prediction of the hidden CSDR of layer `l - 1`.
    pub fn get_layer_prediction_cis(&self, l: usize) -> Result<&[i32]> {
        let layer = self.layer(l)?;
        if l == 0 {
            return Err(SphError::IndexOutOfRange {
                kind: "upper layer",
                index: l,
                count: self.layers.len(),
            });
        }
        Ok(layer.feedback_cis())
    }

    pub fn get_hidden_cis(&self, l: usize) -> Result<&[i32]> {
        Ok(self.layer(l)?.encoder.get_hidden_cis())
    }

    pub fn get_hidden_size(&self, l: usize) -> Result<Int3> {
        Ok(self.layer(l)?.encoder.get_hidden_size())
    }

    pub fn get_io_size(&self, io: usize) -> Result<Int3> {
        Ok(self.io_desc(io)?.size)
    }

    pub fn get_io_type(&self, io: usize) -> Result<IoType> {
        Ok(self.io_desc(io)?.io_type)
    }

    pub fn get_num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn get_num_io(&self) -> usize {
        self.io_descs.len()
    }

    pub fn get_io_descs(&self) -> &[IoDesc] {
        &self.io_descs
    }

    pub fn get_layer_descs(&self) -> &[LayerDesc] {
        &self.layer_descs
    }

    pub fn get_config(&self) -> &HierarchyConfig {
        &self.config
    }

    /// Updates of the layer below since layer `l` last fired.
    pub fn get_ticks(&self, l: usize) -> Result<usize> {
        Ok(self.layer(l)?.ticks)
    }

    /// `1` for the bottom layer, which fires every step.
    pub fn get_ticks_per_update(&self, l: usize) -> Result<usize> {
        Ok(self.layer(l)?.ticks_per_update)
    }

    /// Whether layer `l` fired on the last step.
    pub fn get_update(&self, l: usize) -> Result<bool> {
        Ok(self.layer(l)?.updated)
    }

    pub fn get_layer_state(&self, l: usize) -> Result<LayerState> {
        Ok(self.layer(l)?.state())
    }

    pub fn is_layer_recurrent(&self, l: usize) -> Result<bool> {
        Ok(self.layer(l)?.is_recurrent())
    }

    pub fn get_encoder(&self, l: usize) -> Result<&Encoder> {
        Ok(&self.layer(l)?.encoder)
    }

    pub fn get_num_encoder_visible_layers(&self, l: usize) -> Result<usize> {
        Ok(self.layer(l)?.encoder.get_num_visible_layers())
    }

    /// Radius of layer `l`'s first encoder visible layer.
    pub fn get_up_radius(&self, l: usize) -> Result<i32> {
        Ok(self.layer(l)?.encoder.get_visible_layer_desc(0).radius)
    }

    /// Radius of the predictor or actor `i` hanging off layer `l`. At the
    /// bottom `i` is an IO port, above it is a sub-tick.
    pub fn get_down_radius(&self, l: usize, i: usize) -> Result<i32> {
        let layer = self.layer(l)?;
        if l == 0 {
            if let Some(predictor) = self.predictor(i)? {
                return Ok(predictor.get_visible_layer_desc(0).radius);
            }
            return match self.io_descs[i].io_type {
                IoType::Action => Ok(self.actor(i)?.get_visible_layer_desc(0).radius),
                _ => Err(self.wrong_for_prediction(i)),
            };
        }

        layer
            .predictors
            .get(i)
            .map(|predictor| predictor.get_visible_layer_desc(0).radius)
            .ok_or(SphError::IndexOutOfRange {
                kind: "predictor",
                index: i,
                count: layer.predictors.len(),
            })
    }

    pub fn get_actor_history_capacity(&self, io: usize) -> Result<usize> {
        Ok(self.actor(io)?.get_history_capacity())
    }

    /// Weights of encoder cell `cell` (hidden position and cell index) over
    /// visible layer `vli`, scaled to `[0, 1]`, with the field's shape
    /// `(diam, diam, visible column size)`.
    pub fn get_encoder_receptive_field(&self, l: usize, vli: usize, cell: Int3) -> Result<(FloatBuffer, Int3)> {
        let encoder = &self.layer(l)?.encoder;

        check_visible_layer(vli, encoder.get_num_visible_layers())?;
        let hidden_cell_index = hidden_cell_index(cell, encoder.get_hidden_size())?;

        let field = encoder.receptive_field(vli, hidden_cell_index);
        Ok((field, field_shape(encoder.get_visible_layer_desc(vli))))
    }

    /// Net signed weight of predictor cell `cell` over visible layer `vli`,
    /// averaged over the cell's dendrites and scaled to `[-1, 1]`. The
    /// predictor is picked as in [`get_down_radius`](Self::get_down_radius).
    pub fn get_predictor_receptive_field(
        &self,
        l: usize,
        i: usize,
        vli: usize,
        cell: Int3,
    ) -> Result<(FloatBuffer, Int3)> {
        let layer = self.layer(l)?;
        let predictor = if l == 0 {
            self.predictor(i)?.ok_or(SphError::WrongIoType {
                io: i,
                actual: self.io_descs[i].io_type,
                required: "Prediction",
            })?
        } else {
            layer.predictors.get(i).ok_or(SphError::IndexOutOfRange {
                kind: "predictor",
                index: i,
                count: layer.predictors.len(),
            })?
        };

        check_visible_layer(vli, predictor.get_num_visible_layers())?;
        let hidden_cell_index = hidden_cell_index(cell, predictor.get_hidden_size())?;

        let field = predictor.receptive_field(vli, hidden_cell_index);
        Ok((field, field_shape(predictor.get_visible_layer_desc(vli))))
    }
}

fn check_visible_layer(vli: usize, count: usize) -> Result<()> {
    if vli >= count {
        return Err(SphError::IndexOutOfRange {
            kind: "visible layer",
            index: vli,
            count,
        });
    }
    Ok(())
}

// Flat index of `cell` (column position and cell) within `hidden_size`.
fn hidden_cell_index(cell: Int3, hidden_size: Int3) -> Result<usize> {
    let dims = Int2::new(hidden_size.x, hidden_size.y);
    let column = Int2::new(cell.x, cell.y);
    if !in_bounds0(column, dims) || cell.z < 0 || cell.z >= hidden_size.z {
        return Err(SphError::IndexOutOfRange {
            kind: "hidden cell",
            index: cell.z.max(0) as usize
                + hidden_size.z as usize * (cell.y.max(0) + cell.x.max(0) * hidden_size.y) as usize,
            count: hidden_size.num_cells(),
        });
    }
    Ok(cell.z as usize + hidden_size.z as usize * address2(column, dims))
}

fn field_shape(vld: &VisibleLayerDesc) -> Int3 {
    let diam = vld.radius * 2 + 1;
    Int3::new(diam, diam, vld.size.z)
}

fn read_header(reader: &mut dyn StreamReader, magic: u32) -> std::result::Result<(), SerializeError> {
    let found = reader.read_u32()?;
    if found != magic {
        return Err(SerializeError::BadMagic {
            found,
            expected: magic,
        });
    }

    let version = reader.read_u32()?;
    if version != SERIAL_VERSION {
        return Err(SerializeError::UnsupportedVersion {
            found: version,
            supported: SERIAL_VERSION,
        });
    }

    Ok(())
}

fn expect_end(reader: &SliceReader) -> std::result::Result<(), SerializeError> {
    match reader.remaining() {
        0 => Ok(()),
        n => Err(SerializeError::Corrupt(format!("{n} trailing bytes"))),
    }
}

fn decode(data: &[u8]) -> std::result::Result<Decoded, SerializeError> {
    let mut reader = SliceReader::new(data);
    read_header(&mut reader, SERIAL_MAGIC)?;

    let rng_state = reader.read_u64()?;
    let (io_descs, layer_descs) = read_descs(&mut reader)?;

    validate_descs(&io_descs, &layer_descs)
        .and_then(|_| check_arenas(&io_descs, &layer_descs))
        .map_err(|e| SerializeError::Corrupt(e.to_string()))?;

    let mut layers = Vec::with_capacity(layer_descs.len());
    for l in 0..layer_descs.len() {
        layers.push(Layer::read(l, &io_descs, &layer_descs, &mut reader)?);
    }

    let params = read_params(&mut reader, layer_descs.len(), io_descs.len())?;
    check_params(&params, &io_descs, layer_descs.len()).map_err(|e| SerializeError::Corrupt(e.to_string()))?;
    expect_end(&reader)?;

    Ok(Decoded {
        io_descs,
        layer_descs,
        layers,
        rng_state,
        params,
    })
}

// --- Descriptor and params streams ---

fn write_descs(writer: &mut dyn StreamWriter, io_descs: &[IoDesc], layer_descs: &[LayerDesc]) {
    writer.write_len(io_descs.len());
    for io in io_descs {
        writer.write_int3(io.size);
        writer.write_u8(io.io_type as u8);
        writer.write_len(io.num_dendrites_per_cell);
        writer.write_i32(io.up_radius);
        writer.write_i32(io.down_radius);
        writer.write_len(io.value_size);
        writer.write_len(io.value_num_dendrites_per_cell);
        writer.write_len(io.history_capacity);
    }

    writer.write_len(layer_descs.len());
    for ld in layer_descs {
        writer.write_int3(ld.hidden_size);
        writer.write_len(ld.num_dendrites_per_cell);
        writer.write_i32(ld.up_radius);
        writer.write_i32(ld.recurrent_radius.unwrap_or(-1));
        writer.write_i32(ld.down_radius);
        writer.write_len(ld.ticks_per_update);
        writer.write_len(ld.temporal_horizon);
    }
}

fn read_descs(
    reader: &mut dyn StreamReader,
) -> std::result::Result<(Vec<IoDesc>, Vec<LayerDesc>), SerializeError> {
    let num_io = reader.read_len()?;
    reader.ensure(num_io.saturating_mul(37))?;

    let mut io_descs = Vec::with_capacity(num_io);
    for _ in 0..num_io {
        let size = reader.read_int3()?;
        let io_type = IoType::try_from(reader.read_u8()?)
            .map_err(|v| SerializeError::Corrupt(format!("unknown IO type {v}")))?;

        io_descs.push(IoDesc {
            size,
            io_type,
            num_dendrites_per_cell: reader.read_len()?,
            up_radius: reader.read_i32()?,
            down_radius: reader.read_i32()?,
            value_size: reader.read_len()?,
            value_num_dendrites_per_cell: reader.read_len()?,
            history_capacity: reader.read_len()?,
        });
    }

    let num_layers = reader.read_len()?;
    reader.ensure(num_layers.saturating_mul(36))?;

    let mut layer_descs = Vec::with_capacity(num_layers);
    for _ in 0..num_layers {
        let hidden_size = reader.read_int3()?;
        let num_dendrites_per_cell = reader.read_len()?;
        let up_radius = reader.read_i32()?;
        let recurrent_radius = match reader.read_i32()? {
            -1 => None,
            r => Some(r),
        };

        layer_descs.push(LayerDesc {
            hidden_size,
            num_dendrites_per_cell,
            up_radius,
            recurrent_radius,
            down_radius: reader.read_i32()?,
            ticks_per_update: reader.read_len()?,
            temporal_horizon: reader.read_len()?,
        });
    }

    Ok((io_descs, layer_descs))
}

fn write_encoder_params(writer: &mut dyn StreamWriter, p: &encoder::Params) {
    writer.write_f32(p.choice);
    writer.write_f32(p.vigilance);
    writer.write_f32(p.lr);
    writer.write_f32(p.active_ratio);
    writer.write_i32(p.l_radius);
}

fn read_encoder_params(reader: &mut dyn StreamReader) -> std::result::Result<encoder::Params, SerializeError> {
    Ok(encoder::Params {
        choice: reader.read_f32()?,
        vigilance: reader.read_f32()?,
        lr: reader.read_f32()?,
        active_ratio: reader.read_f32()?,
        l_radius: reader.read_i32()?,
    })
}

fn write_predictor_params(writer: &mut dyn StreamWriter, p: &predictor::Params) {
    writer.write_f32(p.scale);
    writer.write_f32(p.lr);
}

fn read_predictor_params(reader: &mut dyn StreamReader) -> std::result::Result<predictor::Params, SerializeError> {
    Ok(predictor::Params {
        scale: reader.read_f32()?,
        lr: reader.read_f32()?,
    })
}

fn write_actor_params(writer: &mut dyn StreamWriter, p: &actor::Params) {
    writer.write_f32(p.vlr);
    writer.write_f32(p.plr);
    writer.write_f32(p.smoothing);
    writer.write_f32(p.discount);
    writer.write_f32(p.td_scale_decay);
    writer.write_f32(p.value_range);
    writer.write_f32(p.temperature);
    writer.write_f32(p.epsilon);
    writer.write_len(p.min_steps);
    writer.write_len(p.history_iters);
}

fn read_actor_params(reader: &mut dyn StreamReader) -> std::result::Result<actor::Params, SerializeError> {
    Ok(actor::Params {
        vlr: reader.read_f32()?,
        plr: reader.read_f32()?,
        smoothing: reader.read_f32()?,
        discount: reader.read_f32()?,
        td_scale_decay: reader.read_f32()?,
        value_range: reader.read_f32()?,
        temperature: reader.read_f32()?,
        epsilon: reader.read_f32()?,
        min_steps: reader.read_len()?,
        history_iters: reader.read_len()?,
    })
}

fn write_params(writer: &mut dyn StreamWriter, params: &Params) {
    for p in &params.layers {
        write_encoder_params(writer, &p.encoder);
        write_predictor_params(writer, &p.predictor);
        writer.write_f32(p.recurrent_importance);
    }
    for p in &params.ios {
        write_predictor_params(writer, &p.predictor);
        write_actor_params(writer, &p.actor);
        writer.write_f32(p.importance);
    }
}

fn read_params(
    reader: &mut dyn StreamReader,
    num_layers: usize,
    num_io: usize,
) -> std::result::Result<Params, SerializeError> {
    let mut params = Params {
        layers: Vec::with_capacity(num_layers),
        ios: Vec::with_capacity(num_io),
    };

    for _ in 0..num_layers {
        params.layers.push(LayerParams {
            encoder: read_encoder_params(reader)?,
            predictor: read_predictor_params(reader)?,
            recurrent_importance: reader.read_f32()?,
        });
    }
    for _ in 0..num_io {
        params.ios.push(IoParams {
            predictor: read_predictor_params(reader)?,
            actor: read_actor_params(reader)?,
            importance: reader.read_f32()?,
        });
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Hierarchy {
        let io_descs = vec![
            IoDesc {
                size: Int3::new(2, 2, 8),
                ..Default::default()
            },
            IoDesc {
                size: Int3::new(1, 1, 4),
                io_type: IoType::Action,
                value_size: 8,
                history_capacity: 24,
                ..Default::default()
            },
            IoDesc {
                size: Int3::new(1, 2, 3),
                io_type: IoType::None,
                ..Default::default()
            },
        ];
        let layer_descs = vec![
            LayerDesc {
                hidden_size: Int3::new(2, 2, 8),
                recurrent_radius: Some(1),
                ticks_per_update: 1,
                ..Default::default()
            },
            LayerDesc {
                hidden_size: Int3::new(2, 2, 8),
                ticks_per_update: 2,
                temporal_horizon: 2,
                ..Default::default()
            },
        ];
        Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::with_seed(5)).unwrap()
    }

    fn inputs(t: usize) -> (Vec<i32>, Vec<i32>, Vec<i32>) {
        (
            (0..4).map(|i| ((t + i) % 8) as i32).collect(),
            vec![(t % 4) as i32],
            vec![(t % 3) as i32, 0],
        )
    }

    fn run(h: &mut Hierarchy, steps: std::ops::Range<usize>) {
        for t in steps {
            let (a, b, c) = inputs(t);
            h.step(&[&a, &b, &c], true, 0.5).unwrap();
        }
    }

    #[test]
    fn params_match_structure() {
        let h = small();
        assert_eq!(h.params.layers.len(), 2);
        assert_eq!(h.params.ios.len(), 3);
        assert!(h.params.check(2, 3).is_ok());
        assert!(matches!(h.params.check(1, 3), Err(SphError::Params(_))));
    }

    #[test]
    fn params_reject_bad_values() {
        let mut params = Params::new(1, 1);
        params.ios[0].actor.epsilon = 1.5;
        assert!(params.check(1, 1).is_err());

        let mut params = Params::new(1, 1);
        params.layers[0].recurrent_importance = f32::NAN;
        assert!(params.check(1, 1).is_err());
    }

    #[test]
    fn params_json_round_trip() {
        let mut params = Params::new(2, 1);
        params.layers[1].encoder.lr = 0.25;
        params.ios[0].actor.temperature = 0.5;

        let json = params.to_json_string().unwrap();
        assert_eq!(Params::from_json_str(&json).unwrap(), params);
        assert!(Params::from_json_str(r#"{ "layers": [], "bogus": 1 }"#).is_err());
    }

    #[test]
    fn routing_follows_io_types() {
        let h = small();
        assert_eq!(h.io_map, vec![Some(0), Some(0), None]);
        assert_eq!(h.prediction_ios, vec![0]);
        assert_eq!(h.action_ios, vec![1]);
    }

    #[test]
    fn upper_layer_fires_every_other_step() {
        let mut h = small();
        for t in 0..6 {
            let (a, b, c) = inputs(t);
            h.step(&[&a, &b, &c], false, 0.0).unwrap();
            assert_eq!(h.get_layer_state(0).unwrap(), LayerState::TickUpdate);
            assert_eq!(h.get_update(1).unwrap(), t % 2 == 1);
            assert!(h.get_ticks(1).unwrap() < 2);
        }
    }

    #[test]
    fn invalid_step_changes_nothing() {
        let mut h = small();
        run(&mut h, 0..3);
        let before = h.serialize();

        let (a, b, c) = inputs(0);
        assert!(matches!(
            h.step(&[&a, &b], true, 0.0),
            Err(SphError::InputCount { expected: 3, got: 2 })
        ));

        let bad = vec![0, 0, 0, 9];
        assert!(matches!(
            h.step(&[&bad, &b, &c], true, 0.0),
            Err(SphError::InvalidCsdr { io: 0, column: 3, .. })
        ));

        assert!(matches!(h.step(&[&a, &b, &c], true, f32::NAN), Err(SphError::Reward(_))));
        assert!(matches!(
            h.step_routed(&[&a, &b, &c], true, &[0.0], 0.0),
            Err(SphError::Reward(_))
        ));

        h.params.layers.pop();
        assert!(matches!(h.step(&[&a, &b, &c], true, 0.0), Err(SphError::Params(_))));
        h.params.layers.push(LayerParams::default());

        assert_eq!(h.serialize(), before);
    }

    #[test]
    fn serialize_restore_continues_identically() {
        let mut h = small();
        run(&mut h, 0..5);

        let mut copy = Hierarchy::from_buffer(&h.serialize(), &HierarchyConfig::default()).unwrap();
        run(&mut h, 5..12);
        run(&mut copy, 5..12);

        assert_eq!(h.get_prediction_cis(0).unwrap(), copy.get_prediction_cis(0).unwrap());
        assert_eq!(h.get_prediction_cis(1).unwrap(), copy.get_prediction_cis(1).unwrap());
        assert_eq!(h.serialize(), copy.serialize());
    }

    #[test]
    fn restore_rejects_damaged_buffers() {
        let mut h = small();
        run(&mut h, 0..2);
        let good = h.serialize();

        let mut bad_magic = good.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(
            h.restore(&bad_magic),
            Err(SphError::Serialization(SerializeError::BadMagic { .. }))
        ));

        assert!(matches!(
            h.restore(&good[..good.len() / 2]),
            Err(SphError::Serialization(SerializeError::Truncated { .. }))
        ));

        let mut trailing = good.clone();
        trailing.push(0);
        assert!(matches!(
            h.restore(&trailing),
            Err(SphError::Serialization(SerializeError::Corrupt(_)))
        ));

        assert_eq!(h.serialize(), good);
    }

    #[test]
    fn state_round_trip_and_structure_check() {
        let mut h = small();
        run(&mut h, 0..4);
        let state = h.serialize_state();
        let prediction = h.get_prediction_cis(0).unwrap().to_vec();

        run(&mut h, 4..9);
        h.restore_state(&state).unwrap();
        assert_eq!(h.get_prediction_cis(0).unwrap(), &prediction[..]);

        let io_descs = vec![IoDesc {
            size: Int3::new(2, 2, 8),
            ..Default::default()
        }];
        let layer_descs = vec![LayerDesc {
            hidden_size: Int3::new(2, 2, 8),
            ticks_per_update: 1,
            ..Default::default()
        }];
        let mut other = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();
        assert!(matches!(
            other.restore_state(&state),
            Err(SphError::Serialization(SerializeError::StructureMismatch(_)))
        ));
    }

    #[test]
    fn snapshot_rollback() {
        let mut h = small();
        run(&mut h, 0..3);
        let snapshot = h.snapshot();
        h.params.ios[0].predictor.lr = 0.3;
        run(&mut h, 3..8);

        h.rollback(&snapshot).unwrap();
        assert_eq!(h.serialize(), snapshot.as_bytes());
        assert_eq!(h.params.ios[0].predictor.lr, predictor::Params::default().lr);
    }

    #[test]
    fn clear_state_resets_ticks_and_hidden() {
        let mut h = small();
        run(&mut h, 0..3);
        h.clear_state();
        assert_eq!(h.get_ticks(1).unwrap(), 0);
        assert!(h.get_hidden_cis(0).unwrap().iter().all(|&ci| ci == 0));
        assert_eq!(h.get_layer_state(1).unwrap(), LayerState::Idle);
    }

    #[test]
    fn queries_check_their_targets() {
        let h = small();
        assert!(matches!(
            h.get_hidden_cis(2),
            Err(SphError::IndexOutOfRange { kind: "layer", index: 2, count: 2 })
        ));
        assert!(matches!(h.get_prediction_cis(2), Err(SphError::WrongIoType { io: 2, .. })));
        assert!(matches!(h.get_prediction_values(0), Err(SphError::WrongIoType { io: 0, .. })));
        assert!(h.get_layer_prediction_cis(0).is_err());
        assert_eq!(h.get_layer_prediction_cis(1).unwrap().len(), 4);

        assert_eq!(h.get_num_encoder_visible_layers(0).unwrap(), 3 * 2 + 1);
        assert_eq!(h.get_up_radius(0).unwrap(), 2);
        assert_eq!(h.get_down_radius(0, 1).unwrap(), 2);
        assert_eq!(h.get_down_radius(1, 1).unwrap(), 2);
        assert!(h.get_down_radius(1, 2).is_err());
        assert_eq!(h.get_actor_history_capacity(1).unwrap(), 24);
        assert_eq!(h.get_ticks_per_update(0).unwrap(), 1);
        assert!(h.is_layer_recurrent(0).unwrap());
    }

    #[test]
    fn receptive_field_has_field_shape() {
        let h = small();
        let (field, shape) = h.get_encoder_receptive_field(0, 0, Int3::new(1, 1, 3)).unwrap();
        assert_eq!(shape, Int3::new(5, 5, 8));
        assert_eq!(field.len(), 5 * 5 * 8);
        assert!(field.iter().all(|&w| (0.0..=1.0).contains(&w)));

        assert!(h.get_encoder_receptive_field(0, 0, Int3::new(2, 0, 0)).is_err());
        assert!(h.get_encoder_receptive_field(0, 7, Int3::new(0, 0, 0)).is_err());
    }

    #[test]
    fn predictor_receptive_field_follows_down_radius() {
        let h = small();
        let (field, shape) = h.get_predictor_receptive_field(0, 0, 0, Int3::new(1, 0, 7)).unwrap();
        assert_eq!(shape, Int3::new(5, 5, 8));
        assert_eq!(field.len(), 5 * 5 * 8);
        assert!(field.iter().all(|&w| (-1.0..=1.0).contains(&w)));
        assert!(field.iter().any(|&w| w != 0.0));

        // layer 1 predicts layer 0's hidden state once per sub-tick
        let (upper, upper_shape) = h.get_predictor_receptive_field(1, 1, 0, Int3::new(0, 1, 0)).unwrap();
        assert_eq!(upper_shape, Int3::new(5, 5, 8));
        assert_eq!(upper.len(), 5 * 5 * 8);

        assert!(matches!(
            h.get_predictor_receptive_field(0, 1, 0, Int3::new(0, 0, 0)),
            Err(SphError::WrongIoType { io: 1, .. })
        ));
        assert!(matches!(
            h.get_predictor_receptive_field(1, 2, 0, Int3::new(0, 0, 0)),
            Err(SphError::IndexOutOfRange { kind: "predictor", .. })
        ));
        assert!(matches!(
            h.get_predictor_receptive_field(0, 0, 5, Int3::new(0, 0, 0)),
            Err(SphError::IndexOutOfRange { kind: "visible layer", .. })
        ));
        assert!(matches!(
            h.get_predictor_receptive_field(0, 0, 0, Int3::new(0, 0, 8)),
            Err(SphError::IndexOutOfRange { kind: "hidden cell", .. })
        ));
    }

    #[test]
    fn min_steps_must_fit_the_replay_window() {
        let mut h = small();
        assert_eq!(h.params.ios[1].actor.min_steps, 16);
        run(&mut h, 0..2);

        h.params.ios[1].actor.min_steps = 24;
        let (a, b, c) = inputs(2);
        let before = h.serialize();
        assert!(matches!(
            h.step(&[&a, &b, &c], true, 0.0),
            Err(SphError::Params(_))
        ));
        assert_eq!(h.serialize(), before);

        // min_steps on a port without an actor is unused
        h.params.ios[1].actor.min_steps = 23;
        h.params.ios[0].actor.min_steps = 1000;
        h.step(&[&a, &b, &c], true, 0.0).unwrap();
    }

    #[test]
    fn short_replay_window_lowers_default_min_steps() {
        let io_descs = vec![IoDesc {
            size: Int3::new(1, 1, 4),
            io_type: IoType::Action,
            value_size: 8,
            history_capacity: 6,
            ..Default::default()
        }];
        let layer_descs = vec![LayerDesc {
            hidden_size: Int3::new(2, 2, 8),
            ticks_per_update: 1,
            ..Default::default()
        }];
        let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();
        assert_eq!(h.params.ios[0].actor.min_steps, 5);
        h.step(&[&[1][..]], true, 1.0).unwrap();
    }

    #[test]
    fn zero_temperature_sample_is_argmax() {
        let mut h = small();
        run(&mut h, 0..4);

        let greedy = h.sample_prediction(0, 0.0, 1).unwrap();
        let expected: Vec<i32> = h
            .get_prediction_acts(0)
            .unwrap()
            .chunks(8)
            .map(|column| csdr::argmax(column) as i32)
            .collect();
        assert_eq!(greedy, expected);

        let sampled = h.sample_prediction(0, 1.0, 9).unwrap();
        assert_eq!(sampled, h.sample_prediction(0, 1.0, 9).unwrap());
        assert!(sampled.iter().all(|&ci| (0..8).contains(&ci)));
        assert!(h.sample_prediction(0, -1.0, 0).is_err());
    }
}
