// Layer: encoder over a window of past inputs, plus the predictors and
// actors that decode its hidden state.

use crate::actor::Actor;
use crate::config::{arena_size, IoDesc, IoType, LayerDesc};
use crate::encoder::{self, Encoder, VisibleLayerDesc};
use crate::error::{Result, SerializeError};
use crate::helpers::*;
use crate::predictor::Predictor;

/// Whether a layer recomputed on the last step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerState {
    /// Waiting for enough updates of the layer below.
    Idle,
    /// Encoded, predicted and (if enabled) learned on the last step.
    TickUpdate,
}

/// Visible layers of layer `l`'s encoder: `temporal_horizon` past states of
/// each source (every IO port at the bottom, the layer below otherwise),
/// followed by the optional recurrent input.
pub(crate) fn encoder_visible_layers(
    l: usize,
    io_descs: &[IoDesc],
    layer_descs: &[LayerDesc],
) -> Vec<VisibleLayerDesc> {
    let desc = &layer_descs[l];
    let mut vlds = Vec::new();

    if l == 0 {
        for io in io_descs {
            for _ in 0..desc.temporal_horizon {
                vlds.push(VisibleLayerDesc {
                    size: io.size,
                    radius: io.up_radius,
                });
            }
        }
    } else {
        for _ in 0..desc.temporal_horizon {
            vlds.push(VisibleLayerDesc {
                size: layer_descs[l - 1].hidden_size,
                radius: desc.up_radius,
            });
        }
    }

    if let Some(radius) = desc.recurrent_radius {
        vlds.push(VisibleLayerDesc {
            size: desc.hidden_size,
            radius,
        });
    }

    vlds
}

/// Visible layers of a predictor or actor hanging off layer `l`: its hidden
/// state, plus feedback from the layer above when there is one.
pub(crate) fn decoder_visible_layers(
    l: usize,
    radius: i32,
    layer_descs: &[LayerDesc],
) -> Vec<VisibleLayerDesc> {
    let own = VisibleLayerDesc {
        size: layer_descs[l].hidden_size,
        radius,
    };

    if l + 1 < layer_descs.len() {
        vec![own.clone(), own]
    } else {
        vec![own]
    }
}

/// Rejects descriptor sets whose weight arenas would not fit in memory.
pub(crate) fn check_arenas(io_descs: &[IoDesc], layer_descs: &[LayerDesc]) -> Result<()> {
    for l in 0..layer_descs.len() {
        let hidden_cells = layer_descs[l].hidden_size.num_cells();
        for vld in encoder_visible_layers(l, io_descs, layer_descs) {
            arena_size(hidden_cells, 1, vld.size, vld.radius)?;
        }

        if l > 0 {
            let target = layer_descs[l - 1].hidden_size;
            for vld in decoder_visible_layers(l, layer_descs[l].down_radius, layer_descs) {
                arena_size(target.num_cells(), layer_descs[l].num_dendrites_per_cell, vld.size, vld.radius)?;
            }
        }
    }

    for io in io_descs {
        let vlds = decoder_visible_layers(0, io.down_radius, layer_descs);
        match io.io_type {
            IoType::None => {}
            IoType::Prediction => {
                for vld in &vlds {
                    arena_size(io.size.num_cells(), io.num_dendrites_per_cell, vld.size, vld.radius)?;
                }
            }
            IoType::Action => {
                for vld in &vlds {
                    arena_size(io.size.num_cells(), io.num_dendrites_per_cell, vld.size, vld.radius)?;
                    arena_size(
                        io.size.num_columns() * io.value_size,
                        io.value_num_dendrites_per_cell,
                        vld.size,
                        vld.radius,
                    )?;
                }
            }
        }
    }

    Ok(())
}

fn new_history(len: usize, num_columns: usize) -> CircleBuffer<IntBuffer> {
    let mut history = CircleBuffer::new();
    history.resize(len);
    for t in 0..len {
        *history.get_mut(t) = vec![0; num_columns];
    }
    history
}

#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub(crate) encoder: Encoder,
    /// Bottom layer: one per Prediction port. Above: one per sub-tick of the
    /// layer below.
    pub(crate) predictors: Vec<Predictor>,
    /// Bottom layer only: one per Action port.
    pub(crate) actors: Vec<Actor>,
    /// Most recent first; one per encoder input source.
    pub(crate) histories: Vec<CircleBuffer<IntBuffer>>,
    pub(crate) hidden_cis_prev: IntBuffer,
    pub(crate) ticks: usize,
    pub(crate) ticks_per_update: usize,
    pub(crate) updated: bool,
    temporal_horizon: usize,
    recurrent: bool,
}

impl Layer {
    /// Builds layer `l`. Descriptors must already be validated.
    pub(crate) fn init_random(
        l: usize,
        io_descs: &[IoDesc],
        layer_descs: &[LayerDesc],
        state: &mut u64,
    ) -> Self {
        let desc = &layer_descs[l];

        let encoder = Encoder::init_random(
            desc.hidden_size,
            encoder_visible_layers(l, io_descs, layer_descs),
            state,
        );

        let mut predictors = Vec::new();
        let mut actors = Vec::new();
        let histories;

        if l == 0 {
            for io in io_descs {
                let vlds = decoder_visible_layers(0, io.down_radius, layer_descs);
                match io.io_type {
                    IoType::None => {}
                    IoType::Prediction => predictors.push(Predictor::init_random(
                        io.size,
                        io.num_dendrites_per_cell,
                        vlds,
                        state,
                    )),
                    IoType::Action => actors.push(Actor::init_random(
                        io.size,
                        io.value_size,
                        io.value_num_dendrites_per_cell,
                        io.num_dendrites_per_cell,
                        io.history_capacity,
                        vlds,
                        state,
                    )),
                }
            }

            histories = io_descs
                .iter()
                .map(|io| new_history(desc.temporal_horizon, io.size.num_columns()))
                .collect();
        } else {
            let below = layer_descs[l - 1].hidden_size;
            for _ in 0..desc.ticks_per_update {
                predictors.push(Predictor::init_random(
                    below,
                    desc.num_dendrites_per_cell,
                    decoder_visible_layers(l, desc.down_radius, layer_descs),
                    state,
                ));
            }

            histories = vec![new_history(desc.temporal_horizon, below.num_columns())];
        }

        Self {
            encoder,
            predictors,
            actors,
            histories,
            hidden_cis_prev: vec![0; desc.hidden_size.num_columns()],
            ticks: 0,
            ticks_per_update: if l == 0 { 1 } else { desc.ticks_per_update },
            updated: false,
            temporal_horizon: desc.temporal_horizon,
            recurrent: desc.recurrent_radius.is_some(),
        }
    }

    pub(crate) fn push_history(&mut self, source: usize, cis: &[i32]) {
        let history = &mut self.histories[source];
        history.push_front();
        history.front_mut().copy_from_slice(cis);
    }

    /// Encodes the history window. `importances` holds one weight per history
    /// source.
    pub(crate) fn encode(
        &mut self,
        learn_enabled: bool,
        params: &encoder::Params,
        importances: &[f32],
        recurrent_importance: f32,
    ) {
        for (source, &importance) in importances.iter().enumerate() {
            for t in 0..self.temporal_horizon {
                self.encoder
                    .set_importance(source * self.temporal_horizon + t, importance);
            }
        }

        if self.recurrent {
            self.hidden_cis_prev.copy_from_slice(self.encoder.get_hidden_cis());
            let last = self.encoder.get_num_visible_layers() - 1;
            self.encoder.set_importance(last, recurrent_importance);
        }

        let mut inputs: Vec<&[i32]> = Vec::with_capacity(self.encoder.get_num_visible_layers());
        for history in &self.histories {
            for t in 0..self.temporal_horizon {
                inputs.push(history.get(t));
            }
        }
        if self.recurrent {
            inputs.push(&self.hidden_cis_prev);
        }

        self.encoder.step(&inputs, learn_enabled, params);
    }

    /// This layer's prediction of the next hidden state of the layer below,
    /// for the current sub-tick.
    pub(crate) fn feedback_cis(&self) -> &[i32] {
        let d = (self.ticks_per_update - 1).saturating_sub(self.ticks);
        self.predictors[d].get_hidden_cis()
    }

    pub fn state(&self) -> LayerState {
        if self.updated {
            LayerState::TickUpdate
        } else {
            LayerState::Idle
        }
    }

    pub fn get_temporal_horizon(&self) -> usize {
        self.temporal_horizon
    }

    pub fn is_recurrent(&self) -> bool {
        self.recurrent
    }

    pub(crate) fn clear_state(&mut self) {
        self.encoder.clear_state();
        for predictor in &mut self.predictors {
            predictor.clear_state();
        }
        for actor in &mut self.actors {
            actor.clear_state();
        }
        for history in &mut self.histories {
            for t in 0..history.len() {
                history.get_mut(t).fill(0);
            }
            history.start = 0;
        }
        self.hidden_cis_prev.fill(0);
        self.ticks = 0;
        self.updated = false;
    }

    pub(crate) fn write(&self, writer: &mut dyn StreamWriter) {
        self.encoder.write(writer);
        for predictor in &self.predictors {
            predictor.write(writer);
        }
        for actor in &self.actors {
            actor.write(writer);
        }
        self.write_local_state(writer);
    }

    /// Decodes layer `l` and checks it against the structure `io_descs` and
    /// `layer_descs` describe.
    pub(crate) fn read(
        l: usize,
        io_descs: &[IoDesc],
        layer_descs: &[LayerDesc],
        reader: &mut dyn StreamReader,
    ) -> std::result::Result<Self, SerializeError> {
        let desc = &layer_descs[l];
        let mismatch = |what: &str| SerializeError::Corrupt(format!("layer {l}: {what} does not match its descriptor"));

        let encoder = Encoder::read(reader)?;
        let expected = encoder_visible_layers(l, io_descs, layer_descs);
        if encoder.get_hidden_size() != desc.hidden_size
            || encoder.get_num_visible_layers() != expected.len()
            || (0..expected.len()).any(|i| *encoder.get_visible_layer_desc(i) != expected[i])
        {
            return Err(mismatch("encoder"));
        }

        // (target size, dendrites, visible layers) of every expected predictor
        let mut predictor_shapes = Vec::new();
        let mut actor_descs = Vec::new();
        let num_predictors;

        if l == 0 {
            for io in io_descs {
                match io.io_type {
                    IoType::None => {}
                    IoType::Prediction => predictor_shapes.push((
                        io.size,
                        io.num_dendrites_per_cell,
                        decoder_visible_layers(0, io.down_radius, layer_descs),
                    )),
                    IoType::Action => actor_descs.push(io),
                }
            }
            num_predictors = predictor_shapes.len();
        } else {
            predictor_shapes.push((
                layer_descs[l - 1].hidden_size,
                desc.num_dendrites_per_cell,
                decoder_visible_layers(l, desc.down_radius, layer_descs),
            ));
            num_predictors = desc.ticks_per_update;
            // a serialized predictor is never shorter than its header
            reader.ensure(num_predictors.saturating_mul(20))?;
        }

        let mut predictors = Vec::with_capacity(num_predictors);
        for d in 0..num_predictors {
            let (size, num_dendrites, vlds) = &predictor_shapes[d.min(predictor_shapes.len() - 1)];
            let predictor = Predictor::read(reader)?;
            if predictor.get_hidden_size() != *size
                || predictor.get_num_dendrites_per_cell() != *num_dendrites
                || predictor.get_num_visible_layers() != vlds.len()
                || (0..vlds.len()).any(|i| *predictor.get_visible_layer_desc(i) != vlds[i])
            {
                return Err(mismatch("predictor"));
            }
            predictors.push(predictor);
        }

        let mut actors = Vec::with_capacity(actor_descs.len());
        for io in actor_descs {
            let actor = Actor::read(reader)?;
            let vlds = decoder_visible_layers(0, io.down_radius, layer_descs);
            if actor.get_hidden_size() != io.size
                || actor.get_history_capacity() != io.history_capacity
                || actor.get_num_visible_layers() != vlds.len()
                || (0..vlds.len()).any(|i| *actor.get_visible_layer_desc(i) != vlds[i])
            {
                return Err(mismatch("actor"));
            }
            actors.push(actor);
        }

        let source_sizes: Vec<Int3> = if l == 0 {
            io_descs.iter().map(|io| io.size).collect()
        } else {
            vec![layer_descs[l - 1].hidden_size]
        };
        let history_bytes = source_sizes
            .iter()
            .map(|size| size.num_columns().saturating_mul(4).saturating_mul(desc.temporal_horizon))
            .fold(0usize, usize::saturating_add);
        reader.ensure(history_bytes)?;

        let histories = if l == 0 {
            io_descs
                .iter()
                .map(|io| new_history(desc.temporal_horizon, io.size.num_columns()))
                .collect()
        } else {
            vec![new_history(
                desc.temporal_horizon,
                layer_descs[l - 1].hidden_size.num_columns(),
            )]
        };

        let mut layer = Self {
            encoder,
            predictors,
            actors,
            histories,
            hidden_cis_prev: vec![0; desc.hidden_size.num_columns()],
            ticks: 0,
            ticks_per_update: if l == 0 { 1 } else { desc.ticks_per_update },
            updated: false,
            temporal_horizon: desc.temporal_horizon,
            recurrent: desc.recurrent_radius.is_some(),
        };

        layer.read_local_state(reader, &source_sizes)?;

        Ok(layer)
    }

    // Tick counter, histories and recurrent input.
    fn write_local_state(&self, writer: &mut dyn StreamWriter) {
        writer.write_len(self.ticks);
        writer.write_u8(self.updated as u8);
        writer.write_i32_slice(&self.hidden_cis_prev);
        for history in &self.histories {
            writer.write_len(history.start);
            for t in 0..history.len() {
                writer.write_i32_slice(&history.data[t]);
            }
        }
    }

    fn read_local_state(
        &mut self,
        reader: &mut dyn StreamReader,
        source_sizes: &[Int3],
    ) -> std::result::Result<(), SerializeError> {
        let ticks = reader.read_len()?;
        if ticks >= self.ticks_per_update {
            return Err(SerializeError::Corrupt(format!(
                "tick counter {ticks} with {} ticks per update",
                self.ticks_per_update
            )));
        }
        self.ticks = ticks;
        self.updated = reader.read_u8()? != 0;
        reader.read_csdr_into(&mut self.hidden_cis_prev, self.encoder.get_hidden_size().z)?;

        for (history, size) in self.histories.iter_mut().zip(source_sizes) {
            let start = reader.read_len()?;
            if start >= history.len() {
                return Err(SerializeError::Corrupt(format!("history start {start}")));
            }
            history.start = start;
            for entry in history.data.iter_mut() {
                reader.read_csdr_into(entry, size.z)?;
            }
        }

        Ok(())
    }

    pub(crate) fn write_state(&self, writer: &mut dyn StreamWriter) {
        self.encoder.write_state(writer);
        for predictor in &self.predictors {
            predictor.write_state(writer);
        }
        for actor in &self.actors {
            actor.write_state(writer);
        }
        self.write_local_state(writer);
    }

    pub(crate) fn read_state(
        &mut self,
        reader: &mut dyn StreamReader,
        source_sizes: &[Int3],
    ) -> std::result::Result<(), SerializeError> {
        self.encoder.read_state(reader)?;
        for predictor in &mut self.predictors {
            predictor.read_state(reader)?;
        }
        for actor in &mut self.actors {
            actor.read_state(reader)?;
        }
        self.read_local_state(reader, source_sizes)
    }
}
