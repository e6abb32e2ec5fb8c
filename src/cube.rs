//! The 3-D data cube container.
//!
//! A cube owns a dense, contiguous sample array (x fastest, then y, then z)
//! together with its FITS header. The element type is a runtime tag with one
//! vector variant per supported FITS data type; voxel access goes through a
//! match on that tag, with implicit casts to `f64`/`i64` at the accessor
//! boundary just like the rest of the pipeline expects.
//!
//! Masks are ordinary cubes too: the detection mask is a `u8` cube holding
//! 0/1, the label mask an `i32` cube holding 0 for background, positive
//! source labels, and -1 as a transient marker during linking and growing.

use anyhow::{bail, ensure, Result};
use rayon::prelude::*;

use crate::header::Header;
use crate::stats::{self, FluxRange, NoiseStatistic, Real};

/// Supported cube element types, mirroring FITS BITPIX.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DataType {
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    pub fn from_bitpix(bitpix: i64) -> Result<Self> {
        Ok(match bitpix {
            8 => DataType::U8,
            16 => DataType::I16,
            32 => DataType::I32,
            64 => DataType::I64,
            -32 => DataType::F32,
            -64 => DataType::F64,
            other => bail!("invalid BITPIX value {other}"),
        })
    }

    pub fn bitpix(self) -> i64 {
        match self {
            DataType::U8 => 8,
            DataType::I16 => 16,
            DataType::I32 => 32,
            DataType::I64 => 64,
            DataType::F32 => -32,
            DataType::F64 => -64,
        }
    }

    pub fn word_size(self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::I16 => 2,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

/// The sample storage, tagged by element type.
#[derive(Clone, Debug)]
pub enum CubeData {
    U8(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl CubeData {
    pub fn zeros(dtype: DataType, size: usize) -> Self {
        match dtype {
            DataType::U8 => CubeData::U8(vec![0; size]),
            DataType::I16 => CubeData::I16(vec![0; size]),
            DataType::I32 => CubeData::I32(vec![0; size]),
            DataType::I64 => CubeData::I64(vec![0; size]),
            DataType::F32 => CubeData::F32(vec![0.0; size]),
            DataType::F64 => CubeData::F64(vec![0.0; size]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CubeData::U8(v) => v.len(),
            CubeData::I16(v) => v.len(),
            CubeData::I32(v) => v.len(),
            CubeData::I64(v) => v.len(),
            CubeData::F32(v) => v.len(),
            CubeData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DataType {
        match self {
            CubeData::U8(_) => DataType::U8,
            CubeData::I16(_) => DataType::I16,
            CubeData::I32(_) => DataType::I32,
            CubeData::I64(_) => DataType::I64,
            CubeData::F32(_) => DataType::F32,
            CubeData::F64(_) => DataType::F64,
        }
    }
}

macro_rules! with_float {
    ($data:expr, $slice:ident => $body:expr) => {
        match $data {
            CubeData::F32($slice) => { type Elem = f32; $body }
            CubeData::F64($slice) => { type Elem = f64; $body }
            _ => bail!("operation requires a floating-point cube"),
        }
    };
}

#[derive(Clone, Debug)]
pub struct Cube {
    nx: usize,
    ny: usize,
    nz: usize,
    data: CubeData,
    pub header: Header,
}

impl Cube {
    /// A zero-initialised cube with a minimal header.
    pub fn blank(nx: usize, ny: usize, nz: usize, dtype: DataType) -> Self {
        let size = nx * ny * nz;

        Cube {
            nx,
            ny,
            nz,
            data: CubeData::zeros(dtype, size),
            header: Header::new(dtype.bitpix() as i32, &[nx, ny, nz]),
        }
    }

    /// Assemble a cube from parts produced by the loader.
    pub fn from_parts(nx: usize, ny: usize, nz: usize, data: CubeData, header: Header) -> Result<Self> {
        ensure!(
            nx * ny * nz == data.len(),
            "axis sizes {}x{}x{} do not match data size {}",
            nx,
            ny,
            nz,
            data.len()
        );

        Ok(Cube { nx, ny, nz, data, header })
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn ny(&self) -> usize {
        self.ny
    }

    pub fn nz(&self) -> usize {
        self.nz
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn word_size(&self) -> usize {
        self.dtype().word_size()
    }

    pub fn data(&self) -> &CubeData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut CubeData {
        &mut self.data
    }

    pub fn same_shape(&self, other: &Cube) -> bool {
        self.nx == other.nx && self.ny == other.ny && self.nz == other.nz
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(x < self.nx && y < self.ny && z < self.nz, "voxel index out of range");
        x + self.nx * (y + self.ny * z)
    }

    #[inline]
    pub fn coords(&self, index: usize) -> (usize, usize, usize) {
        let x = index % self.nx;
        let y = (index / self.nx) % self.ny;
        let z = index / (self.nx * self.ny);
        (x, y, z)
    }

    /// Read one sample, cast to `f64`.
    #[inline]
    pub fn get_flt(&self, x: usize, y: usize, z: usize) -> f64 {
        let i = self.index(x, y, z);

        match &self.data {
            CubeData::U8(v) => v[i] as f64,
            CubeData::I16(v) => v[i] as f64,
            CubeData::I32(v) => v[i] as f64,
            CubeData::I64(v) => v[i] as f64,
            CubeData::F32(v) => v[i] as f64,
            CubeData::F64(v) => v[i],
        }
    }

    /// Read one sample, cast to `i64` (floats truncate).
    #[inline]
    pub fn get_int(&self, x: usize, y: usize, z: usize) -> i64 {
        let i = self.index(x, y, z);

        match &self.data {
            CubeData::U8(v) => v[i] as i64,
            CubeData::I16(v) => v[i] as i64,
            CubeData::I32(v) => v[i] as i64,
            CubeData::I64(v) => v[i],
            CubeData::F32(v) => v[i] as i64,
            CubeData::F64(v) => v[i] as i64,
        }
    }

    /// Write one sample, cast to the cube's element type.
    #[inline]
    pub fn set_flt(&mut self, x: usize, y: usize, z: usize, value: f64) {
        let i = self.index(x, y, z);

        match &mut self.data {
            CubeData::U8(v) => v[i] = value as u8,
            CubeData::I16(v) => v[i] = value as i16,
            CubeData::I32(v) => v[i] = value as i32,
            CubeData::I64(v) => v[i] = value as i64,
            CubeData::F32(v) => v[i] = value as f32,
            CubeData::F64(v) => v[i] = value,
        }
    }

    #[inline]
    pub fn set_int(&mut self, x: usize, y: usize, z: usize, value: i64) {
        let i = self.index(x, y, z);

        match &mut self.data {
            CubeData::U8(v) => v[i] = value as u8,
            CubeData::I16(v) => v[i] = value as i16,
            CubeData::I32(v) => v[i] = value as i32,
            CubeData::I64(v) => v[i] = value,
            CubeData::F32(v) => v[i] = value as f32,
            CubeData::F64(v) => v[i] = value as f64,
        }
    }

    #[inline]
    pub fn add_flt(&mut self, x: usize, y: usize, z: usize, value: f64) {
        let current = self.get_flt(x, y, z);
        self.set_flt(x, y, z, current + value);
    }

    #[inline]
    pub fn add_int(&mut self, x: usize, y: usize, z: usize, value: i64) {
        let current = self.get_int(x, y, z);
        self.set_int(x, y, z, current + value);
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            CubeData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            CubeData::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.data {
            CubeData::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u8_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.data {
            CubeData::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            CubeData::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32_mut(&mut self) -> Option<&mut [i32]> {
        match &mut self.data {
            CubeData::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Fill a floating-point cube with a constant.
    pub fn fill_flt(&mut self, value: f64) -> Result<()> {
        with_float!(&mut self.data, v => {
            let value = Elem::of(value);
            v.par_iter_mut().for_each(|s| *s = value);
            Ok(())
        })
    }

    /// Multiply every sample of a floating-point cube by a constant.
    pub fn multiply_const(&mut self, factor: f64) -> Result<()> {
        with_float!(&mut self.data, v => {
            let factor = Elem::of(factor);
            v.par_iter_mut().for_each(|s| *s = *s * factor);
            Ok(())
        })
    }

    /// Add a constant to every sample of a floating-point cube.
    pub fn add_const(&mut self, summand: f64) -> Result<()> {
        with_float!(&mut self.data, v => {
            let summand = Elem::of(summand);
            v.par_iter_mut().for_each(|s| *s = *s + summand);
            Ok(())
        })
    }

    /// Divide this cube voxel-wise by `divisor`. Division by zero yields NaN.
    pub fn divide(&mut self, divisor: &Cube) -> Result<()> {
        ensure!(self.same_shape(divisor), "cannot divide cubes of different shape");
        ensure!(
            self.dtype().is_float() && divisor.dtype().is_float(),
            "cube division requires floating-point cubes"
        );

        for i in 0..self.data_size() {
            let (x, y, z) = self.coords(i);
            let d = divisor.get_flt(x, y, z);
            let v = self.get_flt(x, y, z);
            self.set_flt(x, y, z, if d == 0.0 { f64::NAN } else { v / d });
        }

        Ok(())
    }

    /// Multiply this cube voxel-wise by the square root of `weights`.
    pub fn apply_weights(&mut self, weights: &Cube) -> Result<()> {
        ensure!(self.same_shape(weights), "weights cube has different shape");
        ensure!(
            self.dtype().is_float() && weights.dtype().is_float(),
            "weight application requires floating-point cubes"
        );

        for i in 0..self.data_size() {
            let (x, y, z) = self.coords(i);
            let w = weights.get_flt(x, y, z);
            let v = self.get_flt(x, y, z);
            self.set_flt(x, y, z, v * w.sqrt());
        }

        Ok(())
    }

    /// Set `mask` to 1 wherever `|data| > threshold`. The fast path requires
    /// a `u8` mask and a floating-point data cube.
    pub fn mask_by_threshold(&self, mask: &mut Cube, threshold: f64) -> Result<()> {
        ensure!(self.same_shape(mask), "data and mask cubes have different shape");
        // A NaN threshold (failed noise measurement) must pass through; the
        // comparisons below then simply never trigger.
        ensure!(!(threshold < 0.0), "negative mask threshold");

        match (&self.data, &mut mask.data) {
            (CubeData::F32(data), CubeData::U8(m)) => {
                let threshold = threshold as f32;
                m.par_iter_mut().zip(data.par_iter()).for_each(|(m, &v)| {
                    if v.abs() > threshold {
                        *m = 1;
                    }
                });
            }
            (CubeData::F64(data), CubeData::U8(m)) => {
                m.par_iter_mut().zip(data.par_iter()).for_each(|(m, &v)| {
                    if v.abs() > threshold {
                        *m = 1;
                    }
                });
            }
            _ => {
                for i in 0..self.data_size() {
                    let (x, y, z) = self.coords(i);
                    if self.get_flt(x, y, z).abs() > threshold {
                        mask.set_int(x, y, z, 1);
                    }
                }
            }
        }

        Ok(())
    }

    /// Replace every sample under a non-zero mask voxel with `value`, keeping
    /// the sample's sign.
    pub fn set_masked_8(&mut self, mask: &Cube, value: f64) -> Result<()> {
        ensure!(self.same_shape(mask), "data and mask cubes have different shape");
        let Some(m) = mask.as_u8() else {
            bail!("set_masked_8 requires an 8-bit mask");
        };

        with_float!(&mut self.data, v => {
            let value = Elem::of(value);
            v.par_iter_mut().zip(m.par_iter()).for_each(|(s, &flag)| {
                if flag > 0 {
                    *s = value.copysign(*s);
                }
            });
            Ok(())
        })
    }

    /// Propagate NaN voxels from `source` into this cube.
    pub fn copy_blanked(&mut self, source: &Cube) -> Result<()> {
        ensure!(self.same_shape(source), "cubes have different shape");

        match (&mut self.data, &source.data) {
            (CubeData::F32(dst), CubeData::F32(src)) => {
                dst.par_iter_mut().zip(src.par_iter()).for_each(|(d, &s)| {
                    if s.is_nan() {
                        *d = f32::NAN;
                    }
                });
            }
            (CubeData::F64(dst), CubeData::F64(src)) => {
                dst.par_iter_mut().zip(src.par_iter()).for_each(|(d, &s)| {
                    if s.is_nan() {
                        *d = f64::NAN;
                    }
                });
            }
            _ => bail!("blank propagation requires matching floating-point cubes"),
        }

        Ok(())
    }

    /// Replace every non-zero entry of a 32-bit mask with `value`.
    pub fn reset_mask_32(&mut self, value: i32) -> Result<()> {
        let Some(m) = self.as_i32_mut() else {
            bail!("reset_mask_32 requires a 32-bit mask");
        };

        m.par_iter_mut().for_each(|v| {
            if *v != 0 {
                *v = value;
            }
        });

        Ok(())
    }

    /// Relabel a 32-bit mask: each positive label `l` becomes `map[l - 1]`;
    /// labels beyond the map become 0.
    pub fn filter_mask_32(&mut self, map: &[i32]) -> Result<()> {
        let Some(m) = self.as_i32_mut() else {
            bail!("filter_mask_32 requires a 32-bit mask");
        };

        m.par_iter_mut().for_each(|v| {
            if *v > 0 {
                *v = map.get(*v as usize - 1).copied().unwrap_or(0);
            }
        });

        Ok(())
    }

    /// Transfer an 8-bit detection mask into this 32-bit mask, writing
    /// `value` wherever the source is positive. Returns the voxel count.
    pub fn copy_mask_8_to_32(&mut self, source: &Cube, value: i32) -> Result<usize> {
        ensure!(self.same_shape(source), "mask cubes have different shape");
        let Some(src) = source.as_u8() else {
            bail!("source mask must be of 8-bit type");
        };
        let Some(dst) = self.as_i32_mut() else {
            bail!("target mask must be of 32-bit type");
        };

        let count = dst
            .par_iter_mut()
            .zip(src.par_iter())
            .map(|(d, &s)| {
                if s > 0 {
                    *d = value;
                    1usize
                } else {
                    0
                }
            })
            .sum();

        Ok(count)
    }

    /// Measure the cube's noise level with the given statistic, sampling
    /// every `cadence`-th voxel over the requested flux range.
    pub fn measure_rms(&self, statistic: NoiseStatistic, cadence: usize, range: FluxRange) -> Result<f64> {
        with_float!(&self.data, v => Ok(measure_rms_slice(v, statistic, cadence, range)))
    }

    /// Convolve every spectrum (along z) with a zero-extended boxcar of the
    /// given radius. NaN samples are treated as zero.
    pub fn boxcar_filter_z(&mut self, radius: usize) -> Result<()> {
        ensure!(self.dtype().is_float(), "spectral smoothing requires a floating-point cube");

        if radius == 0 || self.nz < 2 {
            return Ok(());
        }

        let (nx, ny, nz) = (self.nx, self.ny, self.nz);

        with_float!(&mut self.data, v => {
            boxcar_z_slice(v, nx * ny, nz, radius);
            Ok(())
        })
    }

    /// Smooth every spatial plane with an approximate 2-D Gaussian of the
    /// given standard deviation (in pixels).
    pub fn gaussian_filter_xy(&mut self, sigma: f64) -> Result<()> {
        ensure!(self.dtype().is_float(), "spatial smoothing requires a floating-point cube");

        if sigma <= 0.0 {
            return Ok(());
        }

        let (radius, n_iter) = stats::optimal_filter_size(sigma);
        let (nx, ny) = (self.nx, self.ny);

        with_float!(&mut self.data, v => {
            v.par_chunks_mut(nx * ny)
                .for_each(|plane| stats::filter_gauss_2d(plane, nx, ny, n_iter, radius));
            Ok(())
        })
    }
}

/// Boxcar-filter every spectrum of a flat cube array along z. Spectra are
/// strided by the plane size, so each one is gathered into a thread-local
/// buffer, filtered, and the results scattered back in a serial pass.
fn boxcar_z_slice<T: Real>(data: &mut [T], plane: usize, nz: usize, radius: usize) {
    let filtered: Vec<Vec<T>> = (0..plane)
        .into_par_iter()
        .map_init(
            || (vec![T::zero(); nz], vec![T::zero(); nz + 2 * radius]),
            |(spectrum, scratch), xy| {
                for z in 0..nz {
                    spectrum[z] = data[xy + plane * z];
                }

                stats::filter_boxcar_1d(spectrum, scratch, radius);
                spectrum.clone()
            },
        )
        .collect();

    for (xy, spectrum) in filtered.iter().enumerate() {
        for z in 0..nz {
            data[xy + plane * z] = spectrum[z];
        }
    }
}

pub fn measure_rms_slice<T: Real>(
    data: &[T],
    statistic: NoiseStatistic,
    cadence: usize,
    range: FluxRange,
) -> f64 {
    match statistic {
        NoiseStatistic::Std => stats::std_dev_val(data, 0.0, cadence, range),
        NoiseStatistic::Mad => {
            stats::MAD_TO_STD * stats::mad_val(data, T::zero(), cadence, range).as_f64()
        }
        NoiseStatistic::Gauss => stats::gaufit(data, cadence, range),
    }
}

/// Clamp an inclusive region `(x_min, x_max, y_min, y_max, z_min, z_max)` to
/// the given axis sizes, returning the clamped bounds.
pub fn clamp_region(region: [usize; 6], nx: usize, ny: usize, nz: usize) -> Result<[usize; 6]> {
    let [x_min, x_max, y_min, y_max, z_min, z_max] = region;
    let x_max = x_max.min(nx.saturating_sub(1));
    let y_max = y_max.min(ny.saturating_sub(1));
    let z_max = z_max.min(nz.saturating_sub(1));

    ensure!(
        x_min <= x_max && y_min <= y_max && z_min <= z_max,
        "illegal region: minimum exceeds maximum after clamping"
    );

    Ok([x_min, x_max, y_min, y_max, z_min, z_max])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_is_zeroed() {
        let cube = Cube::blank(4, 3, 2, DataType::F32);
        assert_eq!(cube.data_size(), 24);
        assert_eq!(cube.get_flt(3, 2, 1), 0.0);
        assert_eq!(cube.header.get_int("NAXIS1"), 4);
        assert_eq!(cube.header.get_int("BITPIX"), -32);
    }

    #[test]
    fn accessors_cast_between_int_and_float() {
        let mut cube = Cube::blank(2, 2, 2, DataType::I16);
        cube.set_flt(0, 0, 0, 3.7);
        assert_eq!(cube.get_int(0, 0, 0), 3);

        cube.set_int(1, 1, 1, -5);
        assert_eq!(cube.get_flt(1, 1, 1), -5.0);
    }

    #[test]
    fn storage_order_is_x_fastest() {
        let cube = Cube::blank(3, 4, 5, DataType::F64);
        assert_eq!(cube.index(1, 0, 0), 1);
        assert_eq!(cube.index(0, 1, 0), 3);
        assert_eq!(cube.index(0, 0, 1), 12);
        assert_eq!(cube.coords(17), (2, 1, 1));
    }

    #[test]
    fn arithmetic_requires_float() {
        let mut cube = Cube::blank(2, 2, 1, DataType::I32);
        assert!(cube.fill_flt(1.0).is_err());
        assert!(cube.multiply_const(2.0).is_err());

        let mut cube = Cube::blank(2, 2, 1, DataType::F32);
        cube.fill_flt(3.0).unwrap();
        cube.multiply_const(2.0).unwrap();
        cube.add_const(1.0).unwrap();
        assert_eq!(cube.get_flt(1, 1, 0), 7.0);
    }

    #[test]
    fn divide_by_zero_yields_nan() {
        let mut data = Cube::blank(2, 1, 1, DataType::F32);
        data.fill_flt(6.0).unwrap();

        let mut divisor = Cube::blank(2, 1, 1, DataType::F32);
        divisor.set_flt(0, 0, 0, 2.0);

        data.divide(&divisor).unwrap();
        assert_eq!(data.get_flt(0, 0, 0), 3.0);
        assert!(data.get_flt(1, 0, 0).is_nan());
    }

    #[test]
    fn weights_scale_by_square_root() {
        let mut data = Cube::blank(2, 1, 1, DataType::F32);
        data.fill_flt(3.0).unwrap();

        let mut weights = Cube::blank(2, 1, 1, DataType::F32);
        weights.set_flt(0, 0, 0, 4.0);
        weights.set_flt(1, 0, 0, 1.0);

        data.apply_weights(&weights).unwrap();
        assert_eq!(data.get_flt(0, 0, 0), 6.0);
        assert_eq!(data.get_flt(1, 0, 0), 3.0);
    }

    #[test]
    fn threshold_masking() {
        let mut data = Cube::blank(3, 1, 1, DataType::F32);
        data.set_flt(0, 0, 0, 5.0);
        data.set_flt(1, 0, 0, -5.0);
        data.set_flt(2, 0, 0, 1.0);

        let mut mask = Cube::blank(3, 1, 1, DataType::U8);
        data.mask_by_threshold(&mut mask, 2.0).unwrap();

        assert_eq!(mask.get_int(0, 0, 0), 1);
        assert_eq!(mask.get_int(1, 0, 0), 1);
        assert_eq!(mask.get_int(2, 0, 0), 0);
    }

    #[test]
    fn set_masked_keeps_sign() {
        let mut data = Cube::blank(2, 1, 1, DataType::F32);
        data.set_flt(0, 0, 0, -9.0);
        data.set_flt(1, 0, 0, 9.0);

        let mut mask = Cube::blank(2, 1, 1, DataType::U8);
        mask.set_int(0, 0, 0, 1);
        mask.set_int(1, 0, 0, 1);

        data.set_masked_8(&mask, 2.5).unwrap();
        assert_eq!(data.get_flt(0, 0, 0), -2.5);
        assert_eq!(data.get_flt(1, 0, 0), 2.5);
    }

    #[test]
    fn mask_transfer_and_relabel() {
        let mut mask8 = Cube::blank(2, 2, 1, DataType::U8);
        mask8.set_int(0, 0, 0, 1);
        mask8.set_int(1, 1, 0, 1);

        let mut mask32 = Cube::blank(2, 2, 1, DataType::I32);
        let count = mask32.copy_mask_8_to_32(&mask8, -1).unwrap();
        assert_eq!(count, 2);
        assert_eq!(mask32.get_int(0, 0, 0), -1);

        mask32.reset_mask_32(7).unwrap();
        assert_eq!(mask32.get_int(0, 0, 0), 7);
        assert_eq!(mask32.get_int(1, 0, 0), 0);

        let mut labels = Cube::blank(2, 1, 1, DataType::I32);
        labels.set_int(0, 0, 0, 1);
        labels.set_int(1, 0, 0, 3);
        labels.filter_mask_32(&[5, 0, 2]).unwrap();
        assert_eq!(labels.get_int(0, 0, 0), 5);
        assert_eq!(labels.get_int(1, 0, 0), 2);
    }

    #[test]
    fn copy_blanked_propagates_nan() {
        let mut src = Cube::blank(2, 1, 1, DataType::F32);
        src.set_flt(0, 0, 0, f64::NAN);

        let mut dst = Cube::blank(2, 1, 1, DataType::F32);
        dst.fill_flt(1.0).unwrap();
        dst.copy_blanked(&src).unwrap();

        assert!(dst.get_flt(0, 0, 0).is_nan());
        assert_eq!(dst.get_flt(1, 0, 0), 1.0);
    }

    #[test]
    fn region_clamping() {
        let region = clamp_region([0, 100, 2, 100, 0, 100], 10, 10, 5).unwrap();
        assert_eq!(region, [0, 9, 2, 9, 0, 4]);

        assert!(clamp_region([8, 3, 0, 9, 0, 4], 10, 10, 5).is_err());
    }
}
