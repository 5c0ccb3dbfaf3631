// Sparse coder: ART-style competitive encoding of input CSDRs into a hidden CSDR.
#![allow(clippy::needless_range_loop)]

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SerializeError;
use crate::helpers::*;

#[derive(Clone, Debug, PartialEq)]
pub struct VisibleLayerDesc {
    pub size: Int3,
    pub radius: i32,
}

impl Default for VisibleLayerDesc {
    fn default() -> Self {
        Self {
            size: Int3::new(4, 4, 16),
            radius: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VisibleLayer {
    pub weights: ByteBuffer,
    pub hidden_totals: IntBuffer,
    pub importance: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Params {
    /// Choice parameter of the ART activation.
    pub choice: f32,
    /// Minimum match for a committed cell to win.
    pub vigilance: f32,
    pub lr: f32,
    /// Maximum fraction of stronger neighbours a column tolerates and still learns.
    pub active_ratio: f32,
    /// Lateral inhibition radius, in hidden columns.
    pub l_radius: i32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            choice: 0.01,
            vigilance: 0.9,
            lr: 0.5,
            active_ratio: 0.1,
            l_radius: 2,
        }
    }
}

impl Params {
    pub(crate) fn check(&self) -> Result<(), String> {
        let finite = [self.choice, self.vigilance, self.lr, self.active_ratio]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err("encoder params must be finite".into());
        }
        if self.choice <= 0.0 {
            return Err(format!("encoder choice {} <= 0", self.choice));
        }
        if !(0.0..=1.0).contains(&self.vigilance) {
            return Err(format!("encoder vigilance {} outside [0, 1]", self.vigilance));
        }
        if !(0.0..=1.0).contains(&self.lr) {
            return Err(format!("encoder lr {} outside [0, 1]", self.lr));
        }
        if !(0.0..=1.0).contains(&self.active_ratio) {
            return Err(format!("encoder active_ratio {} outside [0, 1]", self.active_ratio));
        }
        if self.l_radius < 0 {
            return Err(format!("encoder l_radius {} < 0", self.l_radius));
        }
        Ok(())
    }
}

// Outcome of one column's competition.
struct ColumnWinner {
    hidden_ci: i32,
    learn_flag: u8,
    comparison: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Encoder {
    hidden_size: Int3,
    hidden_cis: IntBuffer,
    hidden_learn_flags: ByteBuffer,
    hidden_committed_flags: ByteBuffer,
    hidden_comparisons: FloatBuffer,
    visible_layers: Vec<VisibleLayer>,
    visible_layer_descs: Vec<VisibleLayerDesc>,
}

impl Encoder {
    /// Builds an encoder with small random weights drawn from `state`.
    ///
    /// Arena sizes must already have been checked by the caller.
    pub fn init_random(
        hidden_size: Int3,
        visible_layer_descs: Vec<VisibleLayerDesc>,
        state: &mut u64,
    ) -> Self {
        let num_hidden_columns = hidden_size.num_columns();
        let num_hidden_cells = hidden_size.num_cells();

        let visible_layers = visible_layer_descs
            .iter()
            .map(|vld| {
                let block = field_block_size(vld.size, vld.radius).unwrap_or(0);

                VisibleLayer {
                    weights: (0..num_hidden_cells * block)
                        .map(|_| (rand_step(state) % INIT_WEIGHT_NOISEI) as u8)
                        .collect(),
                    hidden_totals: vec![0; num_hidden_cells],
                    importance: 1.0,
                }
            })
            .collect();

        Self {
            hidden_size,
            hidden_cis: vec![0; num_hidden_columns],
            hidden_learn_flags: vec![0; num_hidden_columns],
            hidden_committed_flags: vec![0; num_hidden_cells],
            hidden_comparisons: vec![0.0; num_hidden_columns],
            visible_layers,
            visible_layer_descs,
        }
    }

    fn column_winner(
        &self,
        hidden_column_index: usize,
        input_cis: &[&[i32]],
        params: &Params,
    ) -> ColumnWinner {
        let column_pos = column_pos(hidden_column_index, self.hidden_size);
        let num_hc = self.hidden_size.z as usize;
        let hidden_cells_start = hidden_column_index * num_hc;
        let num_vl = self.visible_layers.len();

        let mut count_except = 0.0f32;
        let mut count_all = 0.0f32;

        // local_sums[vli * num_hc + hc]
        let mut local_sums = vec![0i32; num_vl * num_hc];

        for vli in 0..num_vl {
            let vl = &self.visible_layers[vli];
            let vld = &self.visible_layer_descs[vli];

            let field = ReceptiveField::new(column_pos, self.hidden_size, vld.size, vld.radius);
            let block = field.diam * field.diam * vld.size.z as usize;

            let sub_count = field.count() as f32;
            count_except += vl.importance * sub_count * (vld.size.z - 1) as f32;
            count_all += vl.importance * sub_count * vld.size.z as f32;

            let sums = &mut local_sums[vli * num_hc..(vli + 1) * num_hc];
            let vl_input_cis = input_cis[vli];

            field.for_each_column(|visible_column_index, offset| {
                let in_ci = vl_input_cis[visible_column_index] as usize;
                let wi_start = num_hc * (field.local_index(offset, in_ci) + block * hidden_column_index);

                for (hc, sum) in sums.iter_mut().enumerate() {
                    *sum += vl.weights[wi_start + hc] as i32;
                }
            });
        }

        let byte_inv = 1.0 / 255.0;

        let mut max_index: i32 = -1;
        // below zero so a cell with zero activation can still win
        let mut max_activation = LIMIT_MIN;
        let mut max_complete_index = 0usize;
        let mut max_complete_activation = LIMIT_MIN;

        for hc in 0..num_hc {
            let hidden_cell_index = hc + hidden_cells_start;

            let mut sum = 0.0f32;
            let mut total = 0.0f32;

            for vli in 0..num_vl {
                let vl = &self.visible_layers[vli];
                let influence = vl.importance * byte_inv;
                sum += local_sums[vli * num_hc + hc] as f32 * influence;
                total += vl.hidden_totals[hidden_cell_index] as f32 * influence;
            }

            let complemented = sum - total + count_except;
            let match_val = if count_except > 0.0 {
                complemented / count_except
            } else {
                0.0
            };
            let activation = complemented / (params.choice + count_all - total);

            let committed = self.hidden_committed_flags[hidden_cell_index] != 0;

            if (!committed || match_val >= params.vigilance) && activation > max_activation {
                max_activation = activation;
                max_index = hc as i32;
            }

            if activation > max_complete_activation {
                max_complete_activation = activation;
                max_complete_index = hc;
            }
        }

        if max_index == -1 {
            ColumnWinner {
                hidden_ci: max_complete_index as i32,
                learn_flag: 0,
                comparison: 0.0,
            }
        } else {
            ColumnWinner {
                hidden_ci: max_index,
                learn_flag: 1,
                comparison: max_complete_activation,
            }
        }
    }

    /// Encodes `input_cis` (one CSDR per visible layer) and, when
    /// `learn_enabled`, reinforces the winning cells.
    pub fn step(&mut self, input_cis: &[&[i32]], learn_enabled: bool, params: &Params) {
        let num_hidden_columns = self.hidden_size.num_columns();

        let winners: Vec<ColumnWinner> = (0..num_hidden_columns)
            .into_par_iter()
            .map(|i| self.column_winner(i, input_cis, params))
            .collect();

        for (i, winner) in winners.into_iter().enumerate() {
            self.hidden_cis[i] = winner.hidden_ci;
            self.hidden_learn_flags[i] = winner.learn_flag;
            self.hidden_comparisons[i] = winner.comparison;
        }

        if learn_enabled {
            self.learn(input_cis, params);
        }
    }

    fn inhibited(&self, hidden_column_index: usize, params: &Params) -> bool {
        let pos = column_pos(hidden_column_index, self.hidden_size);
        let dims = Int2::new(self.hidden_size.x, self.hidden_size.y);
        let own = self.hidden_comparisons[hidden_column_index];

        let mut num_higher = 0usize;
        let mut count = 1usize;

        for dcx in -params.l_radius..=params.l_radius {
            for dcy in -params.l_radius..=params.l_radius {
                if dcx == 0 && dcy == 0 {
                    continue;
                }
                let other = Int2::new(pos.x + dcx, pos.y + dcy);
                if in_bounds0(other, dims) {
                    if self.hidden_comparisons[address2(other, dims)] >= own {
                        num_higher += 1;
                    }
                    count += 1;
                }
            }
        }

        num_higher as f32 / count as f32 > params.active_ratio
    }

    fn learn(&mut self, input_cis: &[&[i32]], params: &Params) {
        let num_hidden_columns = self.hidden_size.num_columns();
        let num_hc = self.hidden_size.z as usize;

        let learners: Vec<bool> = (0..num_hidden_columns)
            .map(|i| self.hidden_learn_flags[i] != 0 && !self.inhibited(i, params))
            .collect();

        let hidden_size = self.hidden_size;
        let hidden_cis = &self.hidden_cis;
        let descs = &self.visible_layer_descs;

        let (weights, totals): (Vec<&mut [u8]>, Vec<&mut [i32]>) = self
            .visible_layers
            .iter_mut()
            .map(|vl| (vl.weights.as_mut_slice(), vl.hidden_totals.as_mut_slice()))
            .unzip();

        split_columns(weights, num_hidden_columns)
            .into_par_iter()
            .zip(split_columns(totals, num_hidden_columns))
            .zip(self.hidden_committed_flags.par_chunks_mut(num_hc))
            .enumerate()
            .filter(|(i, _)| learners[*i])
            .for_each(|(i, ((mut col_weights, mut col_totals), committed))| {
                let pos = column_pos(i, hidden_size);
                let hidden_ci = hidden_cis[i] as usize;
                let rate = if committed[hidden_ci] != 0 { params.lr } else { 1.0 };

                for (vli, vld) in descs.iter().enumerate() {
                    let field = ReceptiveField::new(pos, hidden_size, vld.size, vld.radius);
                    let w: &mut [u8] = &mut col_weights[vli];
                    let total = &mut col_totals[vli][hidden_ci];
                    let vl_input_cis = input_cis[vli];

                    field.for_each_column(|visible_column_index, offset| {
                        let in_ci = vl_input_cis[visible_column_index] as usize;
                        let wi = hidden_ci + num_hc * field.local_index(offset, in_ci);

                        let w_old = w[wi];
                        let delta = ceilf_to_i32(rate * (255.0 - w_old as f32));
                        w[wi] = (w_old as i32 + delta).min(255) as u8;
                        *total += w[wi] as i32 - w_old as i32;
                    });
                }

                committed[hidden_ci] = 1;
            });
    }

    pub fn clear_state(&mut self) {
        self.hidden_cis.fill(0);
        self.hidden_learn_flags.fill(0);
        self.hidden_comparisons.fill(0.0);
    }

    pub fn get_hidden_cis(&self) -> &[i32] {
        &self.hidden_cis
    }

    pub fn get_hidden_size(&self) -> Int3 {
        self.hidden_size
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

    pub fn set_importance(&mut self, i: usize, importance: f32) {
        self.visible_layers[i].importance = importance;
    }

    /// Weights of `hidden_cell_index` over visible layer `i`, scaled to
    /// `[0, 1]` and laid out as `offset.y + diam * (offset.x + diam * in_ci)`.
    pub fn receptive_field(&self, i: usize, hidden_cell_index: usize) -> FloatBuffer {
        let num_hc = self.hidden_size.z as usize;
        let vld = &self.visible_layer_descs[i];
        let weights = &self.visible_layers[i].weights;
        let block = field_block_size(vld.size, vld.radius).unwrap_or(0);

        let column = hidden_cell_index / num_hc;
        let hc = hidden_cell_index % num_hc;

        (0..block)
            .map(|local| weights[hc + num_hc * (local + block * column)] as f32 / 255.0)
            .collect()
    }

    pub fn write(&self, writer: &mut dyn StreamWriter) {
        writer.write_int3(self.hidden_size);
        writer.write_u8_slice(&self.hidden_committed_flags);
        writer.write_len(self.visible_layers.len());

        for (vl, vld) in self.visible_layers.iter().zip(&self.visible_layer_descs) {
            writer.write_int3(vld.size);
            writer.write_i32(vld.radius);
            writer.write_u8_slice(&vl.weights);
            writer.write_i32_slice(&vl.hidden_totals);
            writer.write_f32(vl.importance);
        }

        self.write_state(writer);
    }

    pub fn read(reader: &mut dyn StreamReader) -> Result<Self, SerializeError> {
        let hidden_size = reader.read_size()?;

        let num_hidden_columns = hidden_size.num_columns();
        let num_hidden_cells = hidden_size.num_cells();

        let hidden_committed_flags = reader.read_u8_vec(num_hidden_cells)?;

        let num_visible_layers = reader.read_len()?;
        // every visible layer carries at least its size, radius and importance
        reader.ensure(num_visible_layers.saturating_mul(20))?;

        let mut visible_layers = Vec::with_capacity(num_visible_layers);
        let mut visible_layer_descs = Vec::with_capacity(num_visible_layers);

        for _ in 0..num_visible_layers {
            let size = reader.read_size()?;
            let radius = reader.read_radius()?;
            let weights_size = decoded_arena_len(num_hidden_cells, 1, size, radius)?;

            let weights = reader.read_u8_vec(weights_size)?;
            let hidden_totals = reader.read_i32_vec(num_hidden_cells)?;
            let importance = reader.read_f32()?;

            visible_layers.push(VisibleLayer {
                weights,
                hidden_totals,
                importance,
            });
            visible_layer_descs.push(VisibleLayerDesc { size, radius });
        }

        let mut encoder = Self {
            hidden_size,
            hidden_cis: vec![0; num_hidden_columns],
            hidden_learn_flags: vec![0; num_hidden_columns],
            hidden_committed_flags,
            hidden_comparisons: vec![0.0; num_hidden_columns],
            visible_layers,
            visible_layer_descs,
        };
        encoder.read_state(reader)?;

        Ok(encoder)
    }

    pub fn write_state(&self, writer: &mut dyn StreamWriter) {
        writer.write_i32_slice(&self.hidden_cis);
        writer.write_u8_slice(&self.hidden_learn_flags);
        writer.write_f32_slice(&self.hidden_comparisons);
    }

    pub fn read_state(&mut self, reader: &mut dyn StreamReader) -> Result<(), SerializeError> {
        reader.read_csdr_into(&mut self.hidden_cis, self.hidden_size.z)?;

        let learn_flags = reader.read_u8_vec(self.hidden_learn_flags.len())?;
        if learn_flags.iter().any(|&f| f > 1) {
            return Err(SerializeError::Corrupt("encoder learn flag above 1".into()));
        }
        self.hidden_learn_flags = learn_flags;
        self.hidden_comparisons = reader.read_f32_vec(self.hidden_comparisons.len())?;

        Ok(())
    }
}
