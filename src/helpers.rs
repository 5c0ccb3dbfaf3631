// Shared numeric helpers, PCG random streams, ring buffer and binary streams.

use serde::{Deserialize, Serialize};

use crate::error::SerializeError;

// --- Constants ---

pub const LIMIT_MIN: f32 = -999999.0;
pub const LIMIT_SMALL: f32 = 0.000001;

pub const RAND_SUBSEED_OFFSET: u64 = 12345;
pub const INIT_WEIGHT_NOISEI: u32 = 8;
pub const INIT_WEIGHT_NOISEF: f32 = 0.01;

pub const SOFTPLUS_LIMIT: f32 = 4.0;

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const PCG_INCREMENT: u64 = 1442695040888963407;
pub const RAND_MAX: u32 = 0x00ffffff;

// --- Type aliases ---

pub type ByteBuffer = Vec<u8>;
pub type SByteBuffer = Vec<i8>;
pub type IntBuffer = Vec<i32>;
pub type FloatBuffer = Vec<f32>;

// --- Vector types ---

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Int2 {
    pub x: i32,
    pub y: i32,
}

impl Int2 {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Spatial size or position `(x, y, z)`; for CSDR shapes `z` is the number
/// of cells per column.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Int3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Int3 {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Number of columns (`x * y`).
    pub fn num_columns(&self) -> usize {
        (self.x.max(0) as usize) * (self.y.max(0) as usize)
    }

    /// Number of cells (`x * y * z`).
    pub fn num_cells(&self) -> usize {
        self.num_columns() * self.z.max(0) as usize
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct Float2 {
    pub x: f32,
    pub y: f32,
}

impl Float2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

// --- Math helpers ---

pub fn sigmoidf(x: f32) -> f32 {
    x.tanh() * 0.5 + 0.5
}

pub fn symlogf(x: f32) -> f32 {
    ((x > 0.0) as i32 as f32 * 2.0 - 1.0) * (x.abs() + 1.0).ln()
}

pub fn symexpf(x: f32) -> f32 {
    ((x > 0.0) as i32 as f32 * 2.0 - 1.0) * (x.abs().exp() - 1.0)
}

pub fn softplusf(x: f32) -> f32 {
    let in_range = if x < SOFTPLUS_LIMIT { 1.0f32 } else { 0.0f32 };
    (1.0 + (x * in_range).exp()).ln() * in_range + x * (1.0 - in_range)
}

pub fn ceilf_to_i32(x: f32) -> i32 {
    x.ceil() as i32
}

/// `+1` for the upper half of a dendrite bundle, `-1` for the lower half.
#[inline]
pub fn dendrite_sign(di: usize, half: usize) -> f32 {
    if di >= half {
        1.0
    } else {
        -1.0
    }
}

// --- Bounds checking ---

pub fn in_bounds0(pos: Int2, upper_bound: Int2) -> bool {
    pos.x >= 0 && pos.x < upper_bound.x && pos.y >= 0 && pos.y < upper_bound.y
}

// --- Projections ---

pub fn project(pos: Int2, to_scalars: Float2) -> Int2 {
    Int2::new(
        ((pos.x as f32 + 0.5) * to_scalars.x) as i32,
        ((pos.y as f32 + 0.5) * to_scalars.y) as i32,
    )
}

// --- Addressing (row-major) ---

pub fn address2(pos: Int2, dims: Int2) -> usize {
    (pos.y + pos.x * dims.y) as usize
}

pub fn address3(pos: Int3, dims: Int3) -> usize {
    (pos.z + dims.z * (pos.y + dims.y * pos.x)) as usize
}

/// Inverse of [`address2`] for a hidden column index.
pub fn column_pos(index: usize, size: Int3) -> Int2 {
    Int2::new(
        (index / size.y as usize) as i32,
        (index % size.y as usize) as i32,
    )
}

// --- Receptive fields ---

/// The clipped square of visible columns a hidden column connects to.
///
/// Weights of a hidden column are stored contiguously, addressed by
/// `offset.y + diam * (offset.x + diam * visible_cell)` inside the column's
/// block (see [`ReceptiveField::local_index`]).
#[derive(Clone, Copy, Debug)]
pub struct ReceptiveField {
    pub diam: usize,
    pub lower: Int2,
    pub iter_lower: Int2,
    pub iter_upper: Int2,
    pub visible_size: Int3,
}

impl ReceptiveField {
    pub fn new(column_pos: Int2, hidden_size: Int3, visible_size: Int3, radius: i32) -> Self {
        let h_to_v = Float2::new(
            visible_size.x as f32 / hidden_size.x as f32,
            visible_size.y as f32 / hidden_size.y as f32,
        );
        let visible_center = project(column_pos, h_to_v);
        let lower = Int2::new(visible_center.x - radius, visible_center.y - radius);

        Self {
            diam: (radius * 2 + 1) as usize,
            lower,
            iter_lower: Int2::new(lower.x.max(0), lower.y.max(0)),
            iter_upper: Int2::new(
                (visible_center.x + radius).min(visible_size.x - 1),
                (visible_center.y + radius).min(visible_size.y - 1),
            ),
            visible_size,
        }
    }

    /// Number of visible columns inside the clipped field.
    pub fn count(&self) -> usize {
        ((self.iter_upper.x - self.iter_lower.x + 1).max(0)
            * (self.iter_upper.y - self.iter_lower.y + 1).max(0)) as usize
    }

    /// Visits `(visible_column_index, field_offset_partial)` for every column
    /// in the field. Multiply in the input cell with [`Self::local_index`].
    pub fn for_each_column(&self, mut f: impl FnMut(usize, Int2)) {
        let visible_dims = Int2::new(self.visible_size.x, self.visible_size.y);
        for ix in self.iter_lower.x..=self.iter_upper.x {
            for iy in self.iter_lower.y..=self.iter_upper.y {
                let visible_column_index = address2(Int2::new(ix, iy), visible_dims);
                f(
                    visible_column_index,
                    Int2::new(ix - self.lower.x, iy - self.lower.y),
                );
            }
        }
    }

    /// Index of `(offset, in_ci)` inside one hidden column's weight block,
    /// before multiplying by the per-entry fan-out (cells, dendrites).
    #[inline]
    pub fn local_index(&self, offset: Int2, in_ci: usize) -> usize {
        offset.y as usize + self.diam * (offset.x as usize + self.diam * in_ci)
    }
}

/// Number of weight entries one hidden column holds for a visible layer,
/// before fan-out. `None` on overflow.
pub fn field_block_size(visible_size: Int3, radius: i32) -> Option<usize> {
    let diam = usize::try_from(radius).ok()?.checked_mul(2)?.checked_add(1)?;
    diam.checked_mul(diam)?
        .checked_mul(usize::try_from(visible_size.z).ok()?)
}

/// Arena length for `num_cells * fan_out` targets over one visible layer.
/// `None` when it would not fit in memory addressing.
pub fn arena_len(num_cells: usize, fan_out: usize, visible_size: Int3, radius: i32) -> Option<usize> {
    field_block_size(visible_size, radius)?
        .checked_mul(num_cells)?
        .checked_mul(fan_out)
        .filter(|&n| n <= isize::MAX as usize / 4)
}

/// Splits each buffer into `num_columns` equal contiguous chunks and regroups
/// them per column, so per-column learning can run in parallel over disjoint
/// mutable slices.
pub fn split_columns<'a, T>(buffers: Vec<&'a mut [T]>, num_columns: usize) -> Vec<Vec<&'a mut [T]>> {
    let mut columns: Vec<Vec<&'a mut [T]>> = (0..num_columns)
        .map(|_| Vec::with_capacity(buffers.len()))
        .collect();

    for buffer in buffers {
        let chunk = (buffer.len() / num_columns.max(1)).max(1);
        for (column, part) in columns.iter_mut().zip(buffer.chunks_mut(chunk)) {
            column.push(part);
        }
    }

    columns
}

// --- PCG32 RNG ---

pub fn rand_get_state(seed: u64) -> u64 {
    let state = seed.wrapping_add(PCG_INCREMENT);
    state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(PCG_INCREMENT)
}

#[inline]
fn rotr32(x: u32, r: u32) -> u32 {
    x >> r | x << (r.wrapping_neg() & 31)
}

pub fn rand_step(state: &mut u64) -> u32 {
    let x = *state;
    let count = (x >> 59) as u32;
    *state = x.wrapping_mul(PCG_MULTIPLIER).wrapping_add(PCG_INCREMENT);
    let x = x ^ (x >> 18);
    rotr32((x >> 27) as u32, count)
}

pub fn randf_step(state: &mut u64) -> f32 {
    (rand_step(state) % RAND_MAX) as f32 / RAND_MAX as f32
}

pub fn randf_range_step(low: f32, high: f32, state: &mut u64) -> f32 {
    low + (high - low) * randf_step(state)
}

pub fn rand_roundf_step(x: f32, state: &mut u64) -> i32 {
    let i = x as i32;
    let abs_rem = (x - i as f32).abs();
    let s = if x > 0.0 { 1i32 } else { -1i32 };
    i + if randf_step(state) < abs_rem { s } else { 0 }
}

/// Independent sub-stream for one hidden column of a pass.
#[inline]
pub fn column_state(base_state: u64, column: usize) -> u64 {
    rand_get_state(base_state.wrapping_add(column as u64 * RAND_SUBSEED_OFFSET))
}

// --- CircleBuffer ---

#[derive(Clone, Debug, PartialEq)]
pub struct CircleBuffer<T> {
    pub data: Vec<T>,
    pub start: usize,
}

impl<T: Default + Clone> CircleBuffer<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            start: 0,
        }
    }

    pub fn resize(&mut self, size: usize) {
        self.data.resize(size, T::default());
    }

    pub fn push_front(&mut self) {
        if self.data.is_empty() {
            return;
        }
        if self.start == 0 {
            self.start = self.data.len() - 1;
        } else {
            self.start -= 1;
        }
    }

    pub fn front(&self) -> &T {
        &self.data[self.start]
    }

    pub fn front_mut(&mut self) -> &mut T {
        &mut self.data[self.start]
    }

    pub fn get(&self, index: usize) -> &T {
        &self.data[(self.start + index) % self.data.len()]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        let len = self.data.len();
        &mut self.data[(self.start + index) % len]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<T: Default + Clone> Default for CircleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

// --- Serialization traits ---

pub trait StreamWriter {
    fn write_bytes(&mut self, data: &[u8]);

    fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    fn write_len(&mut self, v: usize) {
        self.write_u32(v as u32);
    }

    fn write_i32_slice(&mut self, slice: &[i32]) {
        for &v in slice {
            self.write_i32(v);
        }
    }

    fn write_f32_slice(&mut self, slice: &[f32]) {
        for &v in slice {
            self.write_f32(v);
        }
    }

    fn write_u8_slice(&mut self, slice: &[u8]) {
        self.write_bytes(slice);
    }

    fn write_i8_slice(&mut self, slice: &[i8]) {
        let bytes: Vec<u8> = slice.iter().map(|&v| v as u8).collect();
        self.write_bytes(&bytes);
    }

    fn write_int3(&mut self, v: Int3) {
        self.write_i32(v.x);
        self.write_i32(v.y);
        self.write_i32(v.z);
    }
}

/// Fallible little-endian reader. Every read checks the remaining length so
/// corrupt or truncated buffers surface as [`SerializeError`] instead of
/// panics or huge allocations.
pub trait StreamReader {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), SerializeError>;

    fn remaining(&self) -> usize;

    /// Fails with [`SerializeError::Truncated`] unless `len` more bytes exist.
    fn ensure(&self, len: usize) -> Result<(), SerializeError> {
        if len > self.remaining() {
            return Err(SerializeError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    fn read_i32(&mut self) -> Result<i32, SerializeError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u32(&mut self) -> Result<u32, SerializeError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64, SerializeError> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_f32(&mut self) -> Result<f32, SerializeError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    fn read_u8(&mut self) -> Result<u8, SerializeError> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    fn read_len(&mut self) -> Result<usize, SerializeError> {
        Ok(self.read_u32()? as usize)
    }

    fn read_i32_vec(&mut self, len: usize) -> Result<IntBuffer, SerializeError> {
        self.ensure(len.saturating_mul(4))?;
        (0..len).map(|_| self.read_i32()).collect()
    }

    fn read_f32_vec(&mut self, len: usize) -> Result<FloatBuffer, SerializeError> {
        self.ensure(len.saturating_mul(4))?;
        (0..len).map(|_| self.read_f32()).collect()
    }

    fn read_u8_vec(&mut self, len: usize) -> Result<ByteBuffer, SerializeError> {
        self.ensure(len)?;
        let mut v = vec![0u8; len];
        self.read_bytes(&mut v)?;
        Ok(v)
    }

    fn read_i8_vec(&mut self, len: usize) -> Result<SByteBuffer, SerializeError> {
        Ok(self.read_u8_vec(len)?.into_iter().map(|b| b as i8).collect())
    }

    /// Reads a CSDR of `size` and rejects out-of-range cell indices.
    fn read_csdr(&mut self, size: Int3) -> Result<IntBuffer, SerializeError> {
        let cis = self.read_i32_vec(size.num_columns())?;
        if let Some(bad) = cis.iter().find(|&&ci| ci < 0 || ci >= size.z) {
            return Err(SerializeError::Corrupt(format!(
                "cell index {bad} outside column size {}",
                size.z
            )));
        }
        Ok(cis)
    }

    /// Reads into an existing CSDR buffer, keeping its length.
    fn read_csdr_into(&mut self, dst: &mut [i32], column_size: i32) -> Result<(), SerializeError> {
        let cis = self.read_i32_vec(dst.len())?;
        if let Some(bad) = cis.iter().find(|&&ci| ci < 0 || ci >= column_size) {
            return Err(SerializeError::Corrupt(format!(
                "cell index {bad} outside column size {column_size}"
            )));
        }
        dst.copy_from_slice(&cis);
        Ok(())
    }

    fn read_int3(&mut self) -> Result<Int3, SerializeError> {
        let x = self.read_i32()?;
        let y = self.read_i32()?;
        let z = self.read_i32()?;
        Ok(Int3::new(x, y, z))
    }

    /// Reads a structural size; every component must be positive.
    fn read_size(&mut self) -> Result<Int3, SerializeError> {
        let size = self.read_int3()?;
        if size.x < 1 || size.y < 1 || size.z < 1 {
            return Err(SerializeError::Corrupt(format!("invalid size {size:?}")));
        }
        if (size.x as i64) * (size.y as i64) * (size.z as i64) > i32::MAX as i64 {
            return Err(SerializeError::Corrupt(format!("size {size:?} too large")));
        }
        Ok(size)
    }

    fn read_radius(&mut self) -> Result<i32, SerializeError> {
        let radius = self.read_i32()?;
        if radius < 0 {
            return Err(SerializeError::Corrupt(format!("negative radius {radius}")));
        }
        Ok(radius)
    }
}

/// [`arena_len`] for decoding: overflow is reported as corruption.
pub fn decoded_arena_len(
    num_cells: usize,
    fan_out: usize,
    visible_size: Int3,
    radius: i32,
) -> Result<usize, SerializeError> {
    arena_len(num_cells, fan_out, visible_size, radius).ok_or_else(|| {
        SerializeError::Corrupt(format!(
            "radius {radius} over {visible_size:?} is not representable"
        ))
    })
}

// --- Vec-based stream implementations ---

#[derive(Debug, Default)]
pub struct VecWriter {
    pub data: Vec<u8>,
}

impl VecWriter {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }
}

impl StreamWriter for VecWriter {
    fn write_bytes(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }
}

pub struct SliceReader<'a> {
    pub data: &'a [u8],
    pub pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl StreamReader for SliceReader<'_> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), SerializeError> {
        self.ensure(buf.len())?;
        let end = self.pos + buf.len();
        buf.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
