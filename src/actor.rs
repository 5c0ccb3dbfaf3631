// Actor: distributional critic and dendritic softmax policy, trained by
// replaying a bounded window of past samples.
#![allow(clippy::needless_range_loop)]

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SerializeError;
use crate::helpers::*;

pub use crate::encoder::VisibleLayerDesc;

#[derive(Clone, Debug, PartialEq)]
pub struct VisibleLayer {
    pub value_weights: FloatBuffer,
    pub policy_weights: FloatBuffer,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistorySample {
    pub input_cis: Vec<IntBuffer>,
    /// Action actually taken in response to the previous sample's inputs.
    pub hidden_target_cis_prev: IntBuffer,
    pub hidden_values: FloatBuffer,
    pub reward: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Params {
    /// Value learning rate.
    pub vlr: f32,
    /// Policy learning rate.
    pub plr: f32,
    /// Blend of bootstrapped value into the n-step return.
    pub smoothing: f32,
    pub discount: f32,
    /// Decay of the running max of |TD error|.
    pub td_scale_decay: f32,
    /// Symlog range covered by the value bins.
    pub value_range: f32,
    /// Policy softmax temperature used when sampling actions.
    pub temperature: f32,
    /// Probability of replacing the sampled action with a uniform one.
    pub epsilon: f32,
    pub min_steps: usize,
    pub history_iters: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            vlr: 0.1,
            plr: 0.01,
            smoothing: 0.02,
            discount: 0.99,
            td_scale_decay: 0.999,
            value_range: 10.0,
            temperature: 1.0,
            epsilon: 0.0,
            min_steps: 16,
            history_iters: 8,
        }
    }
}

impl Params {
    pub(crate) fn check(&self) -> Result<(), String> {
        let values = [
            self.vlr,
            self.plr,
            self.smoothing,
            self.discount,
            self.td_scale_decay,
            self.value_range,
            self.temperature,
            self.epsilon,
        ];
        if !values.iter().all(|v| v.is_finite()) {
            return Err("actor params must be finite".into());
        }
        if self.vlr < 0.0 || self.plr < 0.0 {
            return Err("actor learning rates must be >= 0".into());
        }
        for (name, v) in [
            ("smoothing", self.smoothing),
            ("discount", self.discount),
            ("td_scale_decay", self.td_scale_decay),
            ("epsilon", self.epsilon),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("actor {name} {v} outside [0, 1]"));
            }
        }
        if self.value_range <= 0.0 {
            return Err(format!("actor value_range {} <= 0", self.value_range));
        }
        if self.temperature <= 0.0 {
            return Err(format!("actor temperature {} <= 0", self.temperature));
        }
        if self.min_steps < 1 {
            return Err("actor min_steps < 1".into());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Shape {
    hidden_size: Int3,
    value_size: usize,
    value_num_dendrites_per_cell: usize,
    policy_num_dendrites_per_cell: usize,
}

impl Shape {
    fn value_chunk(&self, block: usize) -> usize {
        self.value_num_dendrites_per_cell * self.value_size * block
    }

    fn policy_chunk(&self, block: usize) -> usize {
        self.policy_num_dendrites_per_cell * self.hidden_size.z as usize * block
    }
}

// Both heads of one column. Dendrite buffers hold sigmoid derivatives.
struct ColumnEval {
    value: f32,
    value_acts: FloatBuffer,
    value_dendrites: FloatBuffer,
    policy_logits: FloatBuffer,
    policy_acts: FloatBuffer,
    policy_dendrites: FloatBuffer,
}

fn softmax_in_place(acts: &mut [f32], max_activation: f32) {
    let mut total = 0.0f32;
    for act in acts.iter_mut() {
        *act = (*act - max_activation).exp();
        total += *act;
    }
    let total_inv = 1.0 / LIMIT_SMALL.max(total);
    for act in acts.iter_mut() {
        *act *= total_inv;
    }
}

// Activates `num_cells * nd` dendrites into signed-softplus cell logits.
fn dendrites_to_logits(dendrites: &mut [f32], nd: usize, scale: f32) -> FloatBuffer {
    let half = nd / 2;
    let activation_scale = (1.0 / nd as f32).sqrt();

    dendrites
        .chunks_mut(nd)
        .map(|cell| {
            let mut activation = 0.0f32;
            for (di, dendrite) in cell.iter_mut().enumerate() {
                let act = *dendrite * scale;
                *dendrite = sigmoidf(act);
                activation += softplusf(act) * dendrite_sign(di, half);
            }
            activation * activation_scale
        })
        .collect()
}

/// Evaluates one column; `weights` holds each visible layer's
/// `(value, policy)` block for that column.
fn evaluate_column(
    shape: Shape,
    descs: &[VisibleLayerDesc],
    weights: &[(&[f32], &[f32])],
    column_pos: Int2,
    input_cis: &[&[i32]],
    value_range: f32,
) -> ColumnEval {
    let num_hc = shape.hidden_size.z as usize;
    let nvd = shape.value_num_dendrites_per_cell;
    let npd = shape.policy_num_dendrites_per_cell;

    let mut value_dendrites = vec![0.0f32; shape.value_size * nvd];
    let mut policy_dendrites = vec![0.0f32; num_hc * npd];

    let mut count = 0usize;

    for (vli, vld) in descs.iter().enumerate() {
        let (value_weights, policy_weights) = weights[vli];
        let field = ReceptiveField::new(column_pos, shape.hidden_size, vld.size, vld.radius);
        count += field.count();

        let vl_input_cis = input_cis[vli];

        field.for_each_column(|visible_column_index, offset| {
            let local = field.local_index(offset, vl_input_cis[visible_column_index] as usize);

            let value_start = nvd * shape.value_size * local;
            for (d, act) in value_dendrites.iter_mut().enumerate() {
                *act += value_weights[value_start + d];
            }

            let policy_start = npd * num_hc * local;
            for (d, act) in policy_dendrites.iter_mut().enumerate() {
                *act += policy_weights[policy_start + d];
            }
        });
    }

    let dendrite_scale = (1.0 / count.max(1) as f32).sqrt();

    let mut value_acts = dendrites_to_logits(&mut value_dendrites, nvd, dendrite_scale);
    let max_value = value_acts.iter().copied().fold(LIMIT_MIN, f32::max);
    softmax_in_place(&mut value_acts, max_value);

    let smooth_index: f32 = value_acts
        .iter()
        .enumerate()
        .map(|(vac, &p)| p * vac as f32)
        .sum();
    let value = symexpf((smooth_index / (shape.value_size - 1) as f32 * 2.0 - 1.0) * value_range);

    let policy_logits = dendrites_to_logits(&mut policy_dendrites, npd, dendrite_scale);
    let max_policy = policy_logits.iter().copied().fold(LIMIT_MIN, f32::max);
    let mut policy_acts = policy_logits.clone();
    softmax_in_place(&mut policy_acts, max_policy);

    ColumnEval {
        value,
        value_acts,
        value_dendrites,
        policy_logits,
        policy_acts,
        policy_dendrites,
    }
}

// Samples from softmax(logits / temperature), or uniformly with probability epsilon.
fn select_action(logits: &[f32], params: &Params, state: &mut u64) -> usize {
    let num_hc = logits.len();

    if params.epsilon > 0.0 && randf_step(state) < params.epsilon {
        return rand_step(state) as usize % num_hc;
    }

    let max_logit = logits.iter().copied().fold(LIMIT_MIN, f32::max);
    let mut probs: FloatBuffer = logits.iter().map(|l| l / params.temperature).collect();
    softmax_in_place(&mut probs, max_logit / params.temperature);

    let cusp = randf_step(state);
    let mut sum_so_far = 0.0f32;
    for (hc, p) in probs.iter().enumerate() {
        sum_so_far += p;
        if sum_so_far >= cusp {
            return hc;
        }
    }
    num_hc - 1
}

#[derive(Clone, Debug, PartialEq)]
pub struct Actor {
    shape: Shape,
    history_size: usize,
    hidden_cis: IntBuffer,
    hidden_policy_acts: FloatBuffer,
    hidden_values: FloatBuffer,
    hidden_td_scales: FloatBuffer,
    history_samples: CircleBuffer<HistorySample>,
    visible_layers: Vec<VisibleLayer>,
    visible_layer_descs: Vec<VisibleLayerDesc>,
}

impl Actor {
    pub fn init_random(
        hidden_size: Int3,
        value_size: usize,
        value_num_dendrites_per_cell: usize,
        policy_num_dendrites_per_cell: usize,
        history_capacity: usize,
        visible_layer_descs: Vec<VisibleLayerDesc>,
        state: &mut u64,
    ) -> Self {
        let shape = Shape {
            hidden_size,
            value_size,
            value_num_dendrites_per_cell,
            policy_num_dendrites_per_cell,
        };

        let num_hidden_columns = hidden_size.num_columns();

        let visible_layers = visible_layer_descs
            .iter()
            .map(|vld| {
                let block = field_block_size(vld.size, vld.radius).unwrap_or(0);
                let mut noise = |n: usize| -> FloatBuffer {
                    (0..n)
                        .map(|_| randf_range_step(-INIT_WEIGHT_NOISEF, INIT_WEIGHT_NOISEF, state))
                        .collect()
                };

                VisibleLayer {
                    value_weights: noise(num_hidden_columns * shape.value_chunk(block)),
                    policy_weights: noise(num_hidden_columns * shape.policy_chunk(block)),
                }
            })
            .collect();

        let mut history_samples = CircleBuffer::new();
        history_samples.resize(history_capacity);
        for t in 0..history_capacity {
            *history_samples.get_mut(t) = HistorySample {
                input_cis: visible_layer_descs
                    .iter()
                    .map(|vld| vec![0; vld.size.num_columns()])
                    .collect(),
                hidden_target_cis_prev: vec![0; num_hidden_columns],
                hidden_values: vec![0.0; num_hidden_columns],
                reward: 0.0,
            };
        }

        Self {
            shape,
            history_size: 0,
            hidden_cis: vec![0; num_hidden_columns],
            hidden_policy_acts: vec![0.0; hidden_size.num_cells()],
            hidden_values: vec![0.0; num_hidden_columns],
            hidden_td_scales: vec![0.0; num_hidden_columns],
            history_samples,
            visible_layers,
            visible_layer_descs,
        }
    }

    fn column_weights(&self, hidden_column_index: usize) -> Vec<(&[f32], &[f32])> {
        self.visible_layers
            .iter()
            .zip(&self.visible_layer_descs)
            .map(|(vl, vld)| {
                let block = field_block_size(vld.size, vld.radius).unwrap_or(0);
                let vc = self.shape.value_chunk(block);
                let pc = self.shape.policy_chunk(block);
                (
                    &vl.value_weights[hidden_column_index * vc..(hidden_column_index + 1) * vc],
                    &vl.policy_weights[hidden_column_index * pc..(hidden_column_index + 1) * pc],
                )
            })
            .collect()
    }

    /// Chooses actions for `input_cis`, records the sample and, when
    /// `learn_enabled`, replays the history.
    ///
    /// `hidden_target_cis_prev` is the action the environment actually took
    /// since the last step, and `reward` the reward it earned.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        input_cis: &[&[i32]],
        hidden_target_cis_prev: &[i32],
        learn_enabled: bool,
        reward: f32,
        mimic: f32,
        params: &Params,
        state: &mut u64,
    ) {
        let num_hidden_columns = self.shape.hidden_size.num_columns();
        let num_hc = self.shape.hidden_size.z as usize;
        let base_state = rand_step(state) as u64;

        let actions: Vec<(i32, f32, FloatBuffer)> = (0..num_hidden_columns)
            .into_par_iter()
            .map(|i| {
                let eval = evaluate_column(
                    self.shape,
                    &self.visible_layer_descs,
                    &self.column_weights(i),
                    column_pos(i, self.shape.hidden_size),
                    input_cis,
                    params.value_range,
                );
                let mut column_rng = column_state(base_state, i);
                let action = select_action(&eval.policy_logits, params, &mut column_rng);
                (action as i32, eval.value, eval.policy_acts)
            })
            .collect();

        for (i, (action, value, policy_acts)) in actions.into_iter().enumerate() {
            self.hidden_cis[i] = action;
            self.hidden_values[i] = value;
            self.hidden_policy_acts[i * num_hc..(i + 1) * num_hc].copy_from_slice(&policy_acts);
        }

        self.history_samples.push_front();
        if self.history_size < self.history_samples.len() {
            self.history_size += 1;
        }

        {
            let sample = self.history_samples.front_mut();
            for (stored, input) in sample.input_cis.iter_mut().zip(input_cis) {
                stored.copy_from_slice(input);
            }
            sample.hidden_target_cis_prev.copy_from_slice(hidden_target_cis_prev);
            sample.hidden_values.copy_from_slice(&self.hidden_values);
            sample.reward = reward;
        }

        if learn_enabled && self.history_size > params.min_steps {
            for _ in 0..params.history_iters {
                let t = rand_step(state) as usize % (self.history_size - params.min_steps)
                    + params.min_steps;
                self.replay(t, mimic, params);
            }
        }
    }

    // One replay update of every column against history sample `t`.
    fn replay(&mut self, t: usize, mimic: f32, params: &Params) {
        let shape = self.shape;
        let num_hidden_columns = shape.hidden_size.num_columns();
        let num_hc = shape.hidden_size.z as usize;
        let nvd = shape.value_num_dendrites_per_cell;
        let npd = shape.policy_num_dendrites_per_cell;
        let half_value = nvd / 2;
        let half_policy = npd / 2;

        let history = &self.history_samples;
        let hidden_values = &self.hidden_values;
        let descs = &self.visible_layer_descs;

        let input_cis: Vec<&[i32]> = history.get(t).input_cis.iter().map(|v| v.as_slice()).collect();

        let mut buffers: Vec<&mut [f32]> = Vec::with_capacity(self.visible_layers.len() * 2);
        for vl in self.visible_layers.iter_mut() {
            buffers.push(vl.value_weights.as_mut_slice());
            buffers.push(vl.policy_weights.as_mut_slice());
        }

        split_columns(buffers, num_hidden_columns)
            .into_par_iter()
            .zip(self.hidden_td_scales.par_iter_mut())
            .enumerate()
            .for_each(|(i, (mut col_weights, td_scale))| {
                let pos = column_pos(i, shape.hidden_size);
                let target_ci = history.get(t - 1).hidden_target_cis_prev[i] as usize;

                let mut new_value = hidden_values[i];
                for t2 in 1..=t {
                    let bootstrap = history.get(t2).hidden_values[i];
                    let reward = history.get(t2 - 1).reward;
                    new_value = params.smoothing * bootstrap
                        + (1.0 - params.smoothing) * (reward + params.discount * new_value);
                }

                let eval = {
                    let views: Vec<(&[f32], &[f32])> = col_weights
                        .chunks(2)
                        .map(|pair| (&*pair[0], &*pair[1]))
                        .collect();
                    evaluate_column(shape, descs, &views, pos, &input_cis, params.value_range)
                };

                let td_error = new_value - eval.value;
                *td_scale = (*td_scale * params.td_scale_decay).max(td_error.abs());
                let scaled_td_error = td_error / LIMIT_SMALL.max(*td_scale);

                let policy_error_partial = params.plr * scaled_td_error + mimic;

                let smooth_new_value_index = (symlogf(new_value) / params.value_range * 0.5 + 0.5)
                    .clamp(0.0, 1.0)
                    * (shape.value_size - 1) as f32;

                let mut value_deltas = eval.value_dendrites;
                for vac in 0..shape.value_size {
                    let target = (1.0 - (vac as f32 - smooth_new_value_index).abs()).max(0.0);
                    let error = params.vlr * (target - eval.value_acts[vac]);
                    for di in 0..nvd {
                        value_deltas[vac * nvd + di] *= error * dendrite_sign(di, half_value);
                    }
                }

                let mut policy_deltas = eval.policy_dendrites;
                for hc in 0..num_hc {
                    let onehot = if hc == target_ci { 1.0 } else { 0.0 };
                    let error = policy_error_partial * (onehot - eval.policy_acts[hc]);
                    for di in 0..npd {
                        policy_deltas[hc * npd + di] *= error * dendrite_sign(di, half_policy);
                    }
                }

                for (vli, vld) in descs.iter().enumerate() {
                    let field = ReceptiveField::new(pos, shape.hidden_size, vld.size, vld.radius);
                    let vl_input_cis = input_cis[vli];
                    let (value_part, policy_part) = col_weights.split_at_mut(2 * vli + 1);
                    let value_weights: &mut [f32] = &mut value_part[2 * vli];
                    let policy_weights: &mut [f32] = &mut policy_part[0];

                    field.for_each_column(|visible_column_index, offset| {
                        let local = field.local_index(offset, vl_input_cis[visible_column_index] as usize);

                        let value_start = nvd * shape.value_size * local;
                        for (d, delta) in value_deltas.iter().enumerate() {
                            value_weights[value_start + d] += delta;
                        }

                        let policy_start = npd * num_hc * local;
                        for (d, delta) in policy_deltas.iter().enumerate() {
                            policy_weights[policy_start + d] += delta;
                        }
                    });
                }
            });
    }

    pub fn clear_state(&mut self) {
        self.hidden_cis.fill(0);
        self.hidden_values.fill(0.0);
        self.hidden_policy_acts.fill(0.0);
        self.history_size = 0;
    }

    pub fn get_hidden_cis(&self) -> &[i32] {
        &self.hidden_cis
    }

    /// Policy probabilities of the last step.
    pub fn get_hidden_acts(&self) -> &[f32] {
        &self.hidden_policy_acts
    }

    pub fn get_hidden_values(&self) -> &[f32] {
        &self.hidden_values
    }

    pub fn get_hidden_size(&self) -> Int3 {
        self.shape.hidden_size
    }

    pub fn get_history_capacity(&self) -> usize {
        self.history_samples.len()
    }

    pub fn get_history_size(&self) -> usize {
        self.history_size
    }

    pub fn get_num_visible_layers(&self) -> usize {
        self.visible_layers.len()
    }

    pub fn get_visible_layer_desc(&self, i: usize) -> &VisibleLayerDesc {
        &self.visible_layer_descs[i]
    }

    pub fn write(&self, writer: &mut dyn StreamWriter) {
        writer.write_int3(self.shape.hidden_size);
        writer.write_len(self.shape.value_size);
        writer.write_len(self.shape.value_num_dendrites_per_cell);
        writer.write_len(self.shape.policy_num_dendrites_per_cell);
        writer.write_len(self.history_samples.len());
        writer.write_len(self.visible_layers.len());

        for (vl, vld) in self.visible_layers.iter().zip(&self.visible_layer_descs) {
            writer.write_int3(vld.size);
            writer.write_i32(vld.radius);
            writer.write_f32_slice(&vl.value_weights);
            writer.write_f32_slice(&vl.policy_weights);
        }

        writer.write_f32_slice(&self.hidden_td_scales);
        self.write_state(writer);
    }

    pub fn read(reader: &mut dyn StreamReader) -> Result<Self, SerializeError> {
        let hidden_size = reader.read_size()?;
        let value_size = reader.read_len()?;
        let value_num_dendrites_per_cell = reader.read_len()?;
        let policy_num_dendrites_per_cell = reader.read_len()?;
        let history_capacity = reader.read_len()?;

        if value_size < 2 || value_num_dendrites_per_cell < 2 || policy_num_dendrites_per_cell < 2 {
            return Err(SerializeError::Corrupt("actor head sizes below 2".into()));
        }
        if history_capacity < 2 {
            return Err(SerializeError::Corrupt(format!(
                "actor history capacity {history_capacity}"
            )));
        }

        let shape = Shape {
            hidden_size,
            value_size,
            value_num_dendrites_per_cell,
            policy_num_dendrites_per_cell,
        };
        let num_hidden_columns = hidden_size.num_columns();

        let num_visible_layers = reader.read_len()?;
        reader.ensure(num_visible_layers.saturating_mul(16))?;

        let mut visible_layers = Vec::with_capacity(num_visible_layers);
        let mut visible_layer_descs = Vec::with_capacity(num_visible_layers);

        for _ in 0..num_visible_layers {
            let size = reader.read_size()?;
            let radius = reader.read_radius()?;
            let value_len = decoded_arena_len(
                num_hidden_columns * value_size,
                value_num_dendrites_per_cell,
                size,
                radius,
            )?;
            let policy_len = decoded_arena_len(
                hidden_size.num_cells(),
                policy_num_dendrites_per_cell,
                size,
                radius,
            )?;

            visible_layers.push(VisibleLayer {
                value_weights: reader.read_f32_vec(value_len)?,
                policy_weights: reader.read_f32_vec(policy_len)?,
            });
            visible_layer_descs.push(VisibleLayerDesc { size, radius });
        }

        let hidden_td_scales = reader.read_f32_vec(num_hidden_columns)?;

        // each history sample holds at least its target CSDR, values and reward
        reader.ensure(history_capacity.saturating_mul(num_hidden_columns * 8 + 4))?;

        let mut actor = Self::init_empty(shape, history_capacity, visible_layers, visible_layer_descs);
        actor.hidden_td_scales = hidden_td_scales;
        actor.read_state(reader)?;

        Ok(actor)
    }

    fn init_empty(
        shape: Shape,
        history_capacity: usize,
        visible_layers: Vec<VisibleLayer>,
        visible_layer_descs: Vec<VisibleLayerDesc>,
    ) -> Self {
        let num_hidden_columns = shape.hidden_size.num_columns();

        let mut history_samples: CircleBuffer<HistorySample> = CircleBuffer::new();
        history_samples.resize(history_capacity);
        for t in 0..history_capacity {
            let sample = history_samples.get_mut(t);
            sample.input_cis = visible_layer_descs
                .iter()
                .map(|vld| vec![0; vld.size.num_columns()])
                .collect();
            sample.hidden_target_cis_prev = vec![0; num_hidden_columns];
            sample.hidden_values = vec![0.0; num_hidden_columns];
        }

        Self {
            shape,
            history_size: 0,
            hidden_cis: vec![0; num_hidden_columns],
            hidden_policy_acts: vec![0.0; shape.hidden_size.num_cells()],
            hidden_values: vec![0.0; num_hidden_columns],
            hidden_td_scales: vec![0.0; num_hidden_columns],
            history_samples,
            visible_layers,
            visible_layer_descs,
        }
    }

    pub fn write_state(&self, writer: &mut dyn StreamWriter) {
        writer.write_i32_slice(&self.hidden_cis);
        writer.write_f32_slice(&self.hidden_policy_acts);
        writer.write_f32_slice(&self.hidden_values);
        writer.write_len(self.history_size);
        writer.write_len(self.history_samples.start);

        for t in 0..self.history_samples.len() {
            let sample = self.history_samples.get(t);
            for input in &sample.input_cis {
                writer.write_i32_slice(input);
            }
            writer.write_i32_slice(&sample.hidden_target_cis_prev);
            writer.write_f32_slice(&sample.hidden_values);
            writer.write_f32(sample.reward);
        }
    }

    pub fn read_state(&mut self, reader: &mut dyn StreamReader) -> Result<(), SerializeError> {
        let column_size = self.shape.hidden_size.z;

        reader.read_csdr_into(&mut self.hidden_cis, column_size)?;
        self.hidden_policy_acts = reader.read_f32_vec(self.hidden_policy_acts.len())?;
        self.hidden_values = reader.read_f32_vec(self.hidden_values.len())?;

        let capacity = self.history_samples.len();
        let history_size = reader.read_len()?;
        let start = reader.read_len()?;
        if history_size > capacity || start >= capacity {
            return Err(SerializeError::Corrupt(format!(
                "actor history size {history_size} / start {start} with capacity {capacity}"
            )));
        }
        self.history_size = history_size;
        self.history_samples.start = start;

        for t in 0..capacity {
            let sample = self.history_samples.get_mut(t);
            for (input, vld) in sample.input_cis.iter_mut().zip(&self.visible_layer_descs) {
                reader.read_csdr_into(input, vld.size.z)?;
            }
            reader.read_csdr_into(&mut sample.hidden_target_cis_prev, column_size)?;
            sample.hidden_values = reader.read_f32_vec(sample.hidden_values.len())?;
            sample.reward = reader.read_f32()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_actor(seed: u64) -> (Actor, u64) {
        let mut state = rand_get_state(seed);
        let actor = Actor::init_random(
            Int3::new(1, 1, 2),
            16,
            4,
            4,
            32,
            vec![VisibleLayerDesc {
                size: Int3::new(1, 1, 2),
                radius: 0,
            }],
            &mut state,
        );
        (actor, state)
    }

    #[test]
    fn actions_and_probabilities_are_well_formed() {
        let (mut actor, mut state) = make_actor(1);
        let params = Params::default();
        let input = [0];
        for _ in 0..10 {
            let prev = actor.get_hidden_cis().to_vec();
            actor.step(&[&input[..]], &prev, true, 0.0, 0.0, &params, &mut state);
            assert!((0..2).contains(&actor.get_hidden_cis()[0]));
            let sum: f32 = actor.get_hidden_acts().iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
        assert_eq!(actor.get_history_size(), 10);
    }

    #[test]
    fn full_epsilon_explores_both_actions() {
        let (mut actor, mut state) = make_actor(2);
        let params = Params {
            epsilon: 1.0,
            ..Default::default()
        };
        let input = [1];
        let mut seen = [false; 2];
        for _ in 0..50 {
            let prev = actor.get_hidden_cis().to_vec();
            actor.step(&[&input[..]], &prev, false, 0.0, 0.0, &params, &mut state);
            seen[actor.get_hidden_cis()[0] as usize] = true;
        }
        assert_eq!(seen, [true, true]);
    }

    #[test]
    fn low_temperature_sampling_is_greedy() {
        let logits = [0.1, 0.9, 0.3];
        let params = Params {
            temperature: 0.001,
            ..Default::default()
        };
        let mut state = rand_get_state(3);
        for _ in 0..20 {
            assert_eq!(select_action(&logits, &params, &mut state), 1);
        }
    }

    #[test]
    fn rewarded_action_becomes_preferred() {
        let (mut actor, mut state) = make_actor(4);
        let params = Params {
            discount: 0.0,
            plr: 0.1,
            ..Default::default()
        };
        let input = [0];
        let mut chosen_one = 0;
        let mut reward = 0.0;
        for step in 0..1500 {
            let taken = actor.get_hidden_cis().to_vec();
            actor.step(&[&input[..]], &taken, true, reward, 0.0, &params, &mut state);
            reward = if actor.get_hidden_cis()[0] == 1 { 1.0 } else { 0.0 };
            if step >= 1000 && actor.get_hidden_cis()[0] == 1 {
                chosen_one += 1;
            }
        }
        assert!(chosen_one > 250, "action 1 chosen {chosen_one} / 500 times");
    }

    #[test]
    fn clear_state_empties_history_but_keeps_weights() {
        let (mut actor, mut state) = make_actor(5);
        let input = [1];
        for _ in 0..5 {
            let prev = actor.get_hidden_cis().to_vec();
            actor.step(&[&input[..]], &prev, false, 1.0, 0.0, &Params::default(), &mut state);
        }
        let weights = actor.visible_layers.clone();
        actor.clear_state();
        assert_eq!(actor.get_history_size(), 0);
        assert_eq!(actor.visible_layers, weights);
    }

    #[test]
    fn write_then_read_preserves_actor() {
        let (mut actor, mut state) = make_actor(6);
        let input = [1];
        for _ in 0..40 {
            let prev = actor.get_hidden_cis().to_vec();
            actor.step(&[&input[..]], &prev, true, 0.5, 0.0, &Params::default(), &mut state);
        }

        let mut w = VecWriter::new();
        actor.write(&mut w);
        let decoded = Actor::read(&mut SliceReader::new(&w.data)).unwrap();
        assert_eq!(decoded, actor);
    }

    #[test]
    fn params_check_rejects_bad_exploration() {
        assert!(Params::default().check().is_ok());
        for bad in [
            Params {
                epsilon: 1.5,
                ..Default::default()
            },
            Params {
                temperature: 0.0,
                ..Default::default()
            },
            Params {
                discount: -0.1,
                ..Default::default()
            },
        ] {
            assert!(bad.check().is_err());
        }
    }
}
