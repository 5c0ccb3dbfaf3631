// Predictor: next-step CSDR prediction with multi-dendrite perceptrons.
#![allow(clippy::needless_range_loop)]

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SerializeError;
use crate::helpers::*;

pub use crate::encoder::VisibleLayerDesc;

#[derive(Clone, Debug, PartialEq)]
pub struct VisibleLayer {
    pub weights: SByteBuffer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Params {
    /// Dendrite activation scale.
    pub scale: f32,
    pub lr: f32,
}

impl Default for Params {
    fn default() -> Self {
        Self { scale: 8.0, lr: 0.1 }
    }
}

impl Params {
    pub(crate) fn check(&self) -> Result<(), String> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(format!("predictor scale {} must be finite and > 0", self.scale));
        }
        if !self.lr.is_finite() || self.lr < 0.0 {
            return Err(format!("predictor lr {} must be finite and >= 0", self.lr));
        }
        Ok(())
    }
}

// Per-column forward outputs, copied back in column order.
struct ColumnActivation {
    hidden_ci: i32,
    hidden_acts: FloatBuffer,
    dendrite_acts: FloatBuffer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Predictor {
    hidden_size: Int3,
    num_dendrites_per_cell: usize,
    hidden_cis: IntBuffer,
    hidden_acts: FloatBuffer,
    /// Sigmoid of each dendrite's last activation, used as its derivative.
    dendrite_acts: FloatBuffer,
    /// Inputs seen by the last `activate`, consumed by the next `learn`.
    input_cis: Vec<IntBuffer>,
    visible_layers: Vec<VisibleLayer>,
    visible_layer_descs: Vec<VisibleLayerDesc>,
}

impl Predictor {
    pub fn init_random(
        hidden_size: Int3,
        num_dendrites_per_cell: usize,
        visible_layer_descs: Vec<VisibleLayerDesc>,
        state: &mut u64,
    ) -> Self {
        let num_hidden_columns = hidden_size.num_columns();
        let num_hidden_cells = hidden_size.num_cells();
        let num_dendrites = num_hidden_cells * num_dendrites_per_cell;

        let visible_layers = visible_layer_descs
            .iter()
            .map(|vld| {
                let block = field_block_size(vld.size, vld.radius).unwrap_or(0);

                VisibleLayer {
                    weights: (0..num_dendrites * block)
                        .map(|_| {
                            ((rand_step(state) % (INIT_WEIGHT_NOISEI + 1)) as i32
                                - INIT_WEIGHT_NOISEI as i32 / 2) as i8
                        })
                        .collect(),
                }
            })
            .collect();

        let input_cis = visible_layer_descs
            .iter()
            .map(|vld| vec![0; vld.size.num_columns()])
            .collect();

        Self {
            hidden_size,
            num_dendrites_per_cell,
            hidden_cis: vec![0; num_hidden_columns],
            hidden_acts: vec![0.0; num_hidden_cells],
            dendrite_acts: vec![0.0; num_dendrites],
            input_cis,
            visible_layers,
            visible_layer_descs,
        }
    }

    fn column_activation(&self, hidden_column_index: usize, params: &Params) -> ColumnActivation {
        let column_pos = column_pos(hidden_column_index, self.hidden_size);

        let num_hc = self.hidden_size.z as usize;
        let nd = self.num_dendrites_per_cell;

        let mut dendrite_acts = vec![0.0f32; num_hc * nd];
        let mut hidden_acts = vec![0.0f32; num_hc];

        let mut count = 0usize;

        for (vli, vl) in self.visible_layers.iter().enumerate() {
            let vld = &self.visible_layer_descs[vli];

            let field = ReceptiveField::new(column_pos, self.hidden_size, vld.size, vld.radius);
            let block = field.diam * field.diam * vld.size.z as usize;
            count += field.count();

            let vl_input_cis = &self.input_cis[vli];

            field.for_each_column(|visible_column_index, offset| {
                let in_ci = vl_input_cis[visible_column_index] as usize;
                let wi_start = nd * num_hc * (field.local_index(offset, in_ci) + block * hidden_column_index);

                for (d, act) in dendrite_acts.iter_mut().enumerate() {
                    *act += vl.weights[wi_start + d] as f32;
                }
            });
        }

        let half_num = nd / 2;
        let dendrite_scale = (1.0 / count.max(1) as f32).sqrt() / 127.0 * params.scale;
        let activation_scale = (1.0 / nd as f32).sqrt();

        let mut max_index = 0usize;
        let mut max_activation = LIMIT_MIN;

        for hc in 0..num_hc {
            let dendrites = &mut dendrite_acts[hc * nd..(hc + 1) * nd];

            let mut activation = 0.0f32;

            for (di, dendrite) in dendrites.iter_mut().enumerate() {
                let act = *dendrite * dendrite_scale;
                *dendrite = sigmoidf(act);
                activation += softplusf(act) * dendrite_sign(di, half_num);
            }

            activation *= activation_scale;
            hidden_acts[hc] = activation;

            if activation > max_activation {
                max_activation = activation;
                max_index = hc;
            }
        }

        let mut total = 0.0f32;
        for act in hidden_acts.iter_mut() {
            *act = (*act - max_activation).exp();
            total += *act;
        }
        let total_inv = 1.0 / LIMIT_SMALL.max(total);
        for act in hidden_acts.iter_mut() {
            *act *= total_inv;
        }

        ColumnActivation {
            hidden_ci: max_index as i32,
            hidden_acts,
            dendrite_acts,
        }
    }

    /// Predicts from `input_cis` (one CSDR per visible layer) and keeps the
    /// inputs for the next [`Self::learn`].
    pub fn activate(&mut self, input_cis: &[&[i32]], params: &Params) {
        for (stored, input) in self.input_cis.iter_mut().zip(input_cis) {
            stored.copy_from_slice(input);
        }

        let num_hidden_columns = self.hidden_size.num_columns();
        let num_hc = self.hidden_size.z as usize;
        let nd = self.num_dendrites_per_cell;

        let columns: Vec<ColumnActivation> = (0..num_hidden_columns)
            .into_par_iter()
            .map(|i| self.column_activation(i, params))
            .collect();

        for (i, column) in columns.into_iter().enumerate() {
            self.hidden_cis[i] = column.hidden_ci;
            self.hidden_acts[i * num_hc..(i + 1) * num_hc].copy_from_slice(&column.hidden_acts);
            self.dendrite_acts[i * num_hc * nd..(i + 1) * num_hc * nd]
                .copy_from_slice(&column.dendrite_acts);
        }
    }

    /// Moves the last prediction toward `hidden_target_cis`.
    ///
    /// `base_state` seeds the per-column rounding streams.
    pub fn learn(&mut self, hidden_target_cis: &[i32], base_state: u64, params: &Params) {
        let num_hidden_columns = self.hidden_size.num_columns();
        let hidden_size = self.hidden_size;
        let num_hc = hidden_size.z as usize;
        let nd = self.num_dendrites_per_cell;
        let half_num = nd / 2;

        let hidden_acts = &self.hidden_acts;
        let dendrite_acts = &self.dendrite_acts;
        let input_cis = &self.input_cis;
        let descs = &self.visible_layer_descs;

        let weights: Vec<&mut [i8]> = self
            .visible_layers
            .iter_mut()
            .map(|vl| vl.weights.as_mut_slice())
            .collect();

        split_columns(weights, num_hidden_columns)
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut col_weights)| {
                let pos = column_pos(i, hidden_size);
                let target_ci = hidden_target_cis[i] as usize;
                let mut state = column_state(base_state, i);

                let cells = i * num_hc;
                let mut deltas = vec![0i32; num_hc * nd];

                for hc in 0..num_hc {
                    let target = if hc == target_ci { 1.0 } else { 0.0 };
                    let error = params.lr * 127.0 * (target - hidden_acts[cells + hc]);

                    for di in 0..nd {
                        deltas[hc * nd + di] = rand_roundf_step(
                            error * dendrite_sign(di, half_num) * dendrite_acts[(cells + hc) * nd + di],
                            &mut state,
                        );
                    }
                }

                for (vli, vld) in descs.iter().enumerate() {
                    let field = ReceptiveField::new(pos, hidden_size, vld.size, vld.radius);
                    let w: &mut [i8] = &mut col_weights[vli];
                    let vl_input_cis = &input_cis[vli];

                    field.for_each_column(|visible_column_index, offset| {
                        let in_ci = vl_input_cis[visible_column_index] as usize;
                        let wi_start = nd * num_hc * field.local_index(offset, in_ci);

                        for (d, &delta) in deltas.iter().enumerate() {
                            let wi = wi_start + d;
                            w[wi] = (w[wi] as i32 + delta).clamp(-127, 127) as i8;
                        }
                    });
                }
            });
    }

    pub fn clear_state(&mut self) {
        self.hidden_cis.fill(0);
        self.hidden_acts.fill(0.0);
        self.dendrite_acts.fill(0.0);
        for input in &mut self.input_cis {
            input.fill(0);
        }
    }

    pub fn get_hidden_cis(&self) -> &[i32] {
        &self.hidden_cis
    }

    /// Per-cell probabilities of the last prediction.
    pub fn get_hidden_acts(&self) -> &[f32] {
        &self.hidden_acts
    }

    pub fn get_hidden_size(&self) -> Int3 {
        self.hidden_size
    }

    pub fn get_num_dendrites_per_cell(&self) -> usize {
        self.num_dendrites_per_cell
    }

    pub fn get_num_visible_layers(&self) -> usize {
        self.visible_layers.len()
    }

    pub fn get_visible_layer(&self, i: usize) -> &VisibleLayer {
        &self.visible_layers[i]
    }

    pub fn get_visible_layer_desc(&self, i: usize) -> &VisibleLayerDesc {
        &self.visible_layer_descs[i]
    }

    /// Net signed weight of `hidden_cell_index` over visible layer `i`, one
    /// entry per field slot (`offset.y + diam * (offset.x + diam * in_ci)`),
    /// averaged over the cell's dendrites and scaled to `[-1, 1]`.
    pub fn receptive_field(&self, i: usize, hidden_cell_index: usize) -> FloatBuffer {
        let num_hc = self.hidden_size.z as usize;
        let nd = self.num_dendrites_per_cell;
        let half = nd / 2;
        let vld = &self.visible_layer_descs[i];
        let weights = &self.visible_layers[i].weights;
        let block = field_block_size(vld.size, vld.radius).unwrap_or(0);

        let column = hidden_cell_index / num_hc;
        let hc = hidden_cell_index % num_hc;

        (0..block)
            .map(|local| {
                let start = nd * (hc + num_hc * (local + block * column));
                let net: f32 = (0..nd)
                    .map(|di| weights[start + di] as f32 * dendrite_sign(di, half))
                    .sum();
                (net / (127.0 * nd as f32)).clamp(-1.0, 1.0)
            })
            .collect()
    }

    pub fn write(&self, writer: &mut dyn StreamWriter) {
        writer.write_int3(self.hidden_size);
        writer.write_len(self.num_dendrites_per_cell);
        writer.write_len(self.visible_layers.len());

        for (vl, vld) in self.visible_layers.iter().zip(&self.visible_layer_descs) {
            writer.write_int3(vld.size);
            writer.write_i32(vld.radius);
            writer.write_i8_slice(&vl.weights);
        }

        self.write_state(writer);
    }

    pub fn read(reader: &mut dyn StreamReader) -> Result<Self, SerializeError> {
        let hidden_size = reader.read_size()?;
        let num_dendrites_per_cell = reader.read_len()?;
        if num_dendrites_per_cell < 2 {
            return Err(SerializeError::Corrupt(format!(
                "predictor with {num_dendrites_per_cell} dendrites per cell"
            )));
        }

        let num_hidden_cells = hidden_size.num_cells();
        let num_visible_layers = reader.read_len()?;
        reader.ensure(num_visible_layers.saturating_mul(16))?;

        let mut visible_layers = Vec::with_capacity(num_visible_layers);
        let mut visible_layer_descs = Vec::with_capacity(num_visible_layers);

        for _ in 0..num_visible_layers {
            let size = reader.read_size()?;
            let radius = reader.read_radius()?;
            let weights_size = decoded_arena_len(num_hidden_cells, num_dendrites_per_cell, size, radius)?;

            visible_layers.push(VisibleLayer {
                weights: reader.read_i8_vec(weights_size)?,
            });
            visible_layer_descs.push(VisibleLayerDesc { size, radius });
        }

        let mut predictor = Self {
            hidden_size,
            num_dendrites_per_cell,
            hidden_cis: vec![0; hidden_size.num_columns()],
            hidden_acts: vec![0.0; num_hidden_cells],
            dendrite_acts: vec![0.0; num_hidden_cells * num_dendrites_per_cell],
            input_cis: visible_layer_descs
                .iter()
                .map(|vld| vec![0; vld.size.num_columns()])
                .collect(),
            visible_layers,
            visible_layer_descs,
        };
        predictor.read_state(reader)?;

        Ok(predictor)
    }

    pub fn write_state(&self, writer: &mut dyn StreamWriter) {
        writer.write_i32_slice(&self.hidden_cis);
        writer.write_f32_slice(&self.hidden_acts);
        writer.write_f32_slice(&self.dendrite_acts);
        for input in &self.input_cis {
            writer.write_i32_slice(input);
        }
    }

    pub fn read_state(&mut self, reader: &mut dyn StreamReader) -> Result<(), SerializeError> {
        reader.read_csdr_into(&mut self.hidden_cis, self.hidden_size.z)?;
        self.hidden_acts = reader.read_f32_vec(self.hidden_acts.len())?;
        self.dendrite_acts = reader.read_f32_vec(self.dendrite_acts.len())?;
        for (input, vld) in self.input_cis.iter_mut().zip(&self.visible_layer_descs) {
            reader.read_csdr_into(input, vld.size.z)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_predictor(seed: u64) -> Predictor {
        let mut state = rand_get_state(seed);
        Predictor::init_random(
            Int3::new(1, 1, 4),
            4,
            vec![VisibleLayerDesc {
                size: Int3::new(1, 1, 4),
                radius: 0,
            }],
            &mut state,
        )
    }

    #[test]
    fn activations_form_a_distribution() {
        let mut p = make_predictor(1);
        let input = [2];
        p.activate(&[&input[..]], &Params::default());

        let sum: f32 = p.get_hidden_acts().iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert!((0..4).contains(&p.get_hidden_cis()[0]));
    }

    #[test]
    fn learns_a_fixed_mapping() {
        let mut p = make_predictor(2);
        let params = Params::default();
        // input i predicts (i + 1) % 4
        for t in 0..400u64 {
            let input = [(t % 4) as i32];
            let target = [((t + 1) % 4) as i32];
            p.activate(&[&input[..]], &params);
            p.learn(&target, t, &params);
        }

        for ci in 0..4 {
            let input = [ci];
            p.activate(&[&input[..]], &params);
            assert_eq!(p.get_hidden_cis()[0], (ci + 1) % 4);
        }
    }

    #[test]
    fn learning_is_reproducible_for_a_seed() {
        let mut a = make_predictor(3);
        let mut b = make_predictor(3);
        let params = Params::default();
        for t in 0..20u64 {
            let input = [(t % 4) as i32];
            a.activate(&[&input[..]], &params);
            b.activate(&[&input[..]], &params);
            a.learn(&[1], 99 + t, &params);
            b.learn(&[1], 99 + t, &params);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn write_then_read_preserves_state() {
        let mut p = make_predictor(4);
        let input = [1];
        p.activate(&[&input[..]], &Params::default());

        let mut w = VecWriter::new();
        p.write(&mut w);
        let decoded = Predictor::read(&mut SliceReader::new(&w.data)).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn read_state_rejects_out_of_range_inputs() {
        let mut p = make_predictor(5);
        let mut w = VecWriter::new();
        p.write_state(&mut w);
        let len = w.data.len();
        // last i32 is the stored input cell
        w.data[len - 4..].copy_from_slice(&9i32.to_le_bytes());
        assert!(matches!(
            p.read_state(&mut SliceReader::new(&w.data)),
            Err(SerializeError::Corrupt(_))
        ));
    }
}
