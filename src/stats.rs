//! NaN-aware statistics and filtering primitives.
//!
//! Everything downstream of the cube loader funnels through this module:
//! noise estimators for the finder, the separable smoothing filters, and the
//! second-moment fits used during parameterisation. All routines silently
//! skip NaN samples and report failure by returning NaN rather than an
//! error, so callers must be prepared to handle non-finite results.
//!
//! The heavy routines are generic over [`Real`] so that both `f32` and `f64`
//! cubes share one implementation.

use num_traits::Float;
use std::ops::AddAssign;
use tracing::warn;

/// Conversion factor between the median absolute deviation and the standard
/// deviation of a Gaussian distribution, 1 / Φ⁻¹(3/4).
pub const MAD_TO_STD: f64 = 1.482602218505602;

/// Number of bins used for the histogram-based Gaussian noise fit.
const GAUFIT_BINS: usize = 101;

/// Boxcar iteration bounds for the iterated-boxcar Gaussian approximation.
const BOXCAR_MIN_ITER: usize = 3;
const BOXCAR_MAX_ITER: usize = 6;

/// Floating-point sample type of a data cube (`f32` or `f64`).
pub trait Real: Float + AddAssign + Send + Sync + 'static {
    fn as_f64(self) -> f64;
    fn of(v: f64) -> Self;
}

impl Real for f32 {
    fn as_f64(self) -> f64 {
        self as f64
    }

    fn of(v: f64) -> Self {
        v as f32
    }
}

impl Real for f64 {
    fn as_f64(self) -> f64 {
        self
    }

    fn of(v: f64) -> Self {
        v
    }
}

/// Which part of the flux distribution a noise measurement may draw from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FluxRange {
    Negative,
    Full,
    Positive,
}

impl FluxRange {
    /// Whether a sample participates in a measurement over this range.
    /// The one-sided ranges reject NaN implicitly through the comparison.
    pub fn accepts<T: Real>(self, value: T) -> bool {
        match self {
            FluxRange::Negative => value < T::zero(),
            FluxRange::Full => !value.is_nan(),
            FluxRange::Positive => value > T::zero(),
        }
    }
}

/// Statistic used to estimate the noise level.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NoiseStatistic {
    Std,
    Mad,
    Gauss,
}

/// Maximum and minimum of the data, ignoring NaN. Returns `(NaN, NaN)` when
/// no finite-or-infinite sample exists.
pub fn max_min<T: Real>(data: &[T]) -> (T, T) {
    let mut max = T::nan();
    let mut min = T::nan();

    for &v in data {
        if v.is_nan() {
            continue;
        }

        if max.is_nan() || v > max {
            max = v;
        }

        if min.is_nan() || v < min {
            min = v;
        }
    }

    (max, min)
}

/// Sum of all non-NaN samples; NaN when there are none.
pub fn sum<T: Real>(data: &[T]) -> f64 {
    summation(data, false)
}

/// Mean of all non-NaN samples; NaN when there are none.
pub fn mean<T: Real>(data: &[T]) -> f64 {
    summation(data, true)
}

fn summation<T: Real>(data: &[T], mean: bool) -> f64 {
    let mut result = 0.0;
    let mut counter = 0usize;

    for &v in data {
        if !v.is_nan() {
            result += v.as_f64();
            counter += 1;
        }
    }

    if counter == 0 {
        return f64::NAN;
    }

    if mean {
        result / counter as f64
    } else {
        result
    }
}

/// Second, third and fourth moment of the data about `value`, ignoring NaN.
pub fn moments<T: Real>(data: &[T], value: f64) -> (f64, f64, f64) {
    let mut m2 = 0.0;
    let mut m3 = 0.0;
    let mut m4 = 0.0;
    let mut counter = 0usize;

    for &v in data {
        if v.is_nan() {
            continue;
        }

        let d = v.as_f64() - value;
        let d2 = d * d;
        m2 += d2;
        m3 += d2 * d;
        m4 += d2 * d2;
        counter += 1;
    }

    if counter == 0 {
        return (f64::NAN, f64::NAN, f64::NAN);
    }

    let n = counter as f64;
    (m2 / n, m3 / n, m4 / n)
}

/// Standard deviation about `value`, sampling every `cadence`-th element and
/// restricting to the requested flux range. NaN if no sample qualifies.
pub fn std_dev_val<T: Real>(data: &[T], value: f64, cadence: usize, range: FluxRange) -> f64 {
    let cadence = cadence.max(1);
    let mut result = 0.0;
    let mut counter = 0usize;

    for &v in data.iter().step_by(cadence) {
        if range.accepts(v) {
            let d = v.as_f64() - value;
            result += d * d;
            counter += 1;
        }
    }

    if counter == 0 {
        f64::NAN
    } else {
        (result / counter as f64).sqrt()
    }
}

/// In-place Hoare-style partial sort: afterwards `data[n]` holds the n-th
/// order statistic, everything before it is `<=` and everything after `>=`.
/// Not NaN-safe; the caller must filter NaN beforehand.
pub fn nth_element<T: Real>(data: &mut [T], n: usize) -> T {
    assert!(n < data.len(), "nth_element index out of range");

    let mut l: isize = 0;
    let mut m: isize = data.len() as isize - 1;

    while l < m {
        let value = data[n];
        let mut i = l;
        let mut j = m;

        loop {
            while data[i as usize] < value {
                i += 1;
            }

            while value < data[j as usize] {
                j -= 1;
            }

            if i <= j {
                data.swap(i as usize, j as usize);
                i += 1;
                j -= 1;
            }

            if i > j {
                break;
            }
        }

        if j < n as isize {
            l = i;
        }

        if (n as isize) < i {
            m = j;
        }
    }

    data[n]
}

/// Exact median of `data` (which gets partially sorted). For even sizes the
/// result is the mean of the two central order statistics unless `fast` is
/// set, in which case the upper one is returned. NaN for empty input.
pub fn median<T: Real>(data: &mut [T], fast: bool) -> T {
    let size = data.len();

    if size == 0 {
        return T::nan();
    }

    let value = nth_element(data, size / 2);

    if size % 2 == 1 || fast {
        return value;
    }

    // Largest element of the lower half; nth_element left it in data[..n/2].
    let mut lower = data[0];
    for &v in &data[..size / 2] {
        if v > lower {
            lower = v;
        }
    }

    (value + lower) / T::of(2.0)
}

/// Median absolute deviation about `value` with cadence and flux-range
/// semantics matching [`std_dev_val`].
pub fn mad_val<T: Real>(data: &[T], value: T, cadence: usize, range: FluxRange) -> T {
    let cadence = cadence.max(1);
    let capacity = if range == FluxRange::Full {
        data.len() / cadence
    } else {
        data.len() / (2 * cadence)
    };
    let capacity = capacity.max(1);

    let mut buffer = Vec::with_capacity(capacity);

    for &v in data.iter().step_by(cadence) {
        if buffer.len() >= capacity {
            break;
        }

        if range.accepts(v) {
            buffer.push((v - value).abs());
        }
    }

    median(&mut buffer, false)
}

/// Robust noise estimate from the negative tail of the flux distribution:
/// `MAD_TO_STD * median(|negatives|)`. NaN when no negative samples exist.
pub fn robust_noise<T: Real>(data: &[T]) -> T {
    let mut negatives: Vec<T> = data.iter().copied().filter(|v| *v < T::zero()).collect();

    if negatives.is_empty() {
        return T::nan();
    }

    let n = negatives.len();
    let value = nth_element(&mut negatives, n / 2);
    T::of(-MAD_TO_STD) * value
}

/// Histogram of the samples within `[data_min, data_max]` at the given
/// cadence. Out-of-range and NaN samples are dropped.
fn create_histogram<T: Real>(
    data: &[T],
    n_bins: usize,
    data_min: T,
    data_max: T,
    cadence: usize,
) -> Vec<usize> {
    let mut histogram = vec![0usize; n_bins];
    let slope = (n_bins - 1) as f64 / (data_max - data_min).as_f64();
    let offset = 0.5 - slope * data_min.as_f64();

    for &v in data.iter().step_by(cadence.max(1)) {
        if v >= data_min && v <= data_max {
            let bin = (slope * v.as_f64() + offset) as usize;
            histogram[bin.min(n_bins - 1)] += 1;
        }
    }

    histogram
}

/// Noise estimate from a Gaussian fit to the flux histogram, carried out as
/// a linear regression of `ln(count)` against squared bin offset. The
/// histogram is regenerated once so that its second moment covers a fifth of
/// the bin range, which is where the fit is best conditioned. Returns NaN
/// when the data do not straddle zero as required by `range`.
pub fn gaufit<T: Real>(data: &[T], cadence: usize, range: FluxRange) -> f64 {
    let (mut data_max, mut data_min) = max_min(data);

    if !(data_min.as_f64() < 0.0) || !(data_max.as_f64() > 0.0) {
        warn!("Gaussian fit failed: data do not straddle zero.");
        return f64::NAN;
    }

    let origin = match range {
        FluxRange::Negative => {
            data_max = T::zero();
            GAUFIT_BINS - 1
        }
        FluxRange::Positive => {
            data_min = T::zero();
            0
        }
        FluxRange::Full => {
            let limit = data_min.abs().min(data_max.abs());
            data_min = -limit;
            data_max = limit;
            GAUFIT_BINS / 2
        }
    };

    // Second moment of the initial histogram, in bins.
    let histogram = create_histogram(data, GAUFIT_BINS, data_min, data_max, cadence);
    let mut mom0 = 0.0;
    let mut mom1 = 0.0;

    for (i, &h) in histogram.iter().enumerate() {
        mom0 += h as f64;
        mom1 += (h * i) as f64;
    }

    if mom0 == 0.0 {
        return f64::NAN;
    }

    mom1 /= mom0;

    let mut mom2 = 0.0;
    for (i, &h) in histogram.iter().enumerate() {
        mom2 += h as f64 * (mom1 - i as f64) * (mom1 - i as f64);
    }
    mom2 = (mom2 / mom0).sqrt();

    // Rescale the histogram range so the second moment covers 1/5 of it.
    let scale = mom2 * 5.0 / GAUFIT_BINS as f64;
    match range {
        FluxRange::Negative => data_min = data_min * T::of(scale),
        FluxRange::Positive => data_max = data_max * T::of(scale),
        FluxRange::Full => {
            data_min = data_min * T::of(scale);
            data_max = data_max * T::of(scale);
        }
    }

    let histogram = create_histogram(data, GAUFIT_BINS, data_min, data_max, cadence);

    // Linear regression of ln(h) against squared offset from the origin bin,
    // excluding the first and last bin to avoid edge pile-up.
    let mut mean_x = 0.0;
    let mut mean_y = 0.0;
    let mut counter = 0usize;

    for i in 1..GAUFIT_BINS - 1 {
        if histogram[i] > 0 {
            let ii = i as f64 - origin as f64;
            mean_x += ii * ii;
            mean_y += (histogram[i] as f64).ln();
            counter += 1;
        }
    }

    if counter == 0 {
        return f64::NAN;
    }

    mean_x /= counter as f64;
    mean_y /= counter as f64;

    let mut upper_sum = 0.0;
    let mut lower_sum = 0.0;

    for i in 1..GAUFIT_BINS - 1 {
        if histogram[i] > 0 {
            let ii = i as f64 - origin as f64;
            let x = ii * ii;
            let y = (histogram[i] as f64).ln();
            upper_sum += (x - mean_x) * (y - mean_y);
            lower_sum += (x - mean_x) * (x - mean_x);
        }
    }

    (-0.5 * lower_sum / upper_sum).sqrt() * (data_max - data_min).as_f64()
        / (GAUFIT_BINS - 1) as f64
}

/// Zero-extended boxcar filter of half-width `radius` applied in place.
/// NaN samples contribute as zero. `scratch` must hold at least
/// `data.len() + 2 * radius` elements. Runs in O(N) through a running-sum
/// recurrence rather than a per-sample window loop.
pub fn filter_boxcar_1d<T: Real>(data: &mut [T], scratch: &mut [T], radius: usize) {
    let size = data.len();

    if size == 0 {
        return;
    }

    let filter_size = 2 * radius + 1;
    let inv_filter_size = T::of(1.0 / filter_size as f64);
    assert!(scratch.len() >= size + 2 * radius, "boxcar scratch too small");

    for i in 0..size {
        scratch[radius + i] = if data[i].is_nan() { T::zero() } else { data[i] };
    }

    for i in 0..radius {
        scratch[i] = T::zero();
        scratch[size + radius + i] = T::zero();
    }

    let mut acc = T::zero();
    for i in 0..filter_size {
        acc += scratch[size - 1 + i];
    }
    data[size - 1] = acc * inv_filter_size;

    for i in (0..size - 1).rev() {
        data[i] = data[i + 1] + (scratch[i] - scratch[filter_size + i]) * inv_filter_size;
    }
}

/// Approximate 2-D Gaussian smoothing of a single image plane by `n_iter`
/// passes of a 1-D boxcar along x and then along y. The plane is stored
/// row-major with x contiguous.
pub fn filter_gauss_2d<T: Real>(plane: &mut [T], nx: usize, ny: usize, n_iter: usize, radius: usize) {
    assert_eq!(plane.len(), nx * ny, "plane size mismatch");

    if nx == 0 || ny == 0 {
        return;
    }

    let mut row_scratch = vec![T::zero(); nx + 2 * radius];

    for row in plane.chunks_exact_mut(nx) {
        for _ in 0..n_iter {
            filter_boxcar_1d(row, &mut row_scratch, radius);
        }
    }

    // Columns are strided, so gather each into a contiguous buffer first.
    let mut column = vec![T::zero(); ny];
    let mut col_scratch = vec![T::zero(); ny + 2 * radius];

    for x in 0..nx {
        for y in 0..ny {
            column[y] = plane[x + nx * y];
        }

        for _ in 0..n_iter {
            filter_boxcar_1d(&mut column, &mut col_scratch, radius);
        }

        for y in 0..ny {
            plane[x + nx * y] = column[y];
        }
    }
}

/// Boxcar radius and iteration count whose iterated application best
/// approximates a Gaussian of standard deviation `sigma`.
pub fn optimal_filter_size(sigma: f64) -> (usize, usize) {
    let mut best_radius = 0usize;
    let mut best_iter = 0usize;
    let mut best_diff = -1.0;

    for n in BOXCAR_MIN_ITER..=BOXCAR_MAX_ITER {
        let radius = (3.0 * sigma * sigma / n as f64 + 0.25).sqrt() - 0.5;
        let diff = (radius - (radius + 0.5).floor()).abs();

        if best_diff < 0.0 || diff < best_diff {
            best_diff = diff;
            best_iter = n;
            best_radius = (radius + 0.5) as usize;
        }
    }

    (best_radius.max(1), best_iter)
}

/// Subtract a shifted copy of the data from itself:
/// `data[i] -= data[i - shift]` for `i >= shift`. A shift of zero or beyond
/// the array length leaves the data unchanged.
pub fn shift_and_subtract<T: Real>(data: &mut [T], shift: usize) {
    if shift == 0 || shift >= data.len() {
        return;
    }

    for i in (shift..data.len()).rev() {
        data[i] = data[i] - data[i - shift];
    }
}

/// Result of the two second-moment ellipse fits to a moment-0 map.
#[derive(Copy, Clone, Debug, Default)]
pub struct EllipseFit {
    pub ell_maj: f64,
    pub ell_min: f64,
    pub ell_pa: f64,
    pub ell3s_maj: f64,
    pub ell3s_min: f64,
    pub ell3s_pa: f64,
}

/// Fit two ellipses to a moment-0 map about the given centroid: one
/// flux-weighted over all positive pixels, one equal-weighted over pixels
/// brighter than `3 * rms * sqrt(count)`. Position angles are in degrees in
/// `[-90, 90)` with zero pointing up, relative to the pixel grid.
pub fn moment_ellipse_fit(
    moment_map: &ndarray::Array2<f64>,
    count_map: &ndarray::Array2<usize>,
    centroid_x: f64,
    centroid_y: f64,
    rms: f64,
) -> EllipseFit {
    let mut mom_x = 0.0;
    let mut mom_y = 0.0;
    let mut mom_xy = 0.0;
    let mut flux_sum = 0.0;
    let mut mom3s_x = 0.0;
    let mut mom3s_y = 0.0;
    let mut mom3s_xy = 0.0;
    let mut count3s = 0.0;

    for ((y, x), &value) in moment_map.indexed_iter() {
        if value <= 0.0 {
            continue;
        }

        let dx = x as f64 - centroid_x;
        let dy = y as f64 - centroid_y;

        mom_x += dx * dx * value;
        mom_y += dy * dy * value;
        mom_xy += dx * dy * value;
        flux_sum += value;

        if value > 3.0 * rms * (count_map[(y, x)] as f64).sqrt() {
            mom3s_x += dx * dx;
            mom3s_y += dy * dy;
            mom3s_xy += dx * dy;
            count3s += 1.0;
        }
    }

    let mut fit = EllipseFit::default();

    if flux_sum > 0.0 {
        let (maj, min, pa) = ellipse_from_moments(mom_x / flux_sum, mom_y / flux_sum, mom_xy / flux_sum);
        fit.ell_maj = maj;
        fit.ell_min = min;
        fit.ell_pa = pa;
    }

    if count3s > 0.0 {
        let (maj, min, pa) = ellipse_from_moments(mom3s_x / count3s, mom3s_y / count3s, mom3s_xy / count3s);
        fit.ell3s_maj = maj;
        fit.ell3s_min = min;
        fit.ell3s_pa = pa;
    }

    fit
}

fn ellipse_from_moments(mom_x: f64, mom_y: f64, mom_xy: f64) -> (f64, f64, f64) {
    let root = ((mom_x - mom_y) * (mom_x - mom_y) + 4.0 * mom_xy * mom_xy).sqrt();
    let maj = (2.0 * (mom_x + mom_y + root)).sqrt();
    let min = (2.0 * (mom_x + mom_y - root)).sqrt();

    // Astronomer convention: PA in degrees, 0 pointing up.
    let mut pa = 0.5 * (2.0 * mom_xy).atan2(mom_x - mom_y) * 180.0 / std::f64::consts::PI - 90.0;
    while pa < -90.0 {
        pa += 180.0;
    }

    (maj, min, pa)
}

/// Line widths at 20% and 50% of the spectrum peak, measured by moving
/// inwards from both ends with linear interpolation between channels.
/// Returns `(w20, w50)`; a failed measurement yields zero.
pub fn spectral_line_width(spectrum: &[f64]) -> (f64, f64) {
    let maximum = spectrum.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let w20 = line_width_at(spectrum, 0.2 * maximum);
    let w50 = line_width_at(spectrum, 0.5 * maximum);
    (w20, w50)
}

fn line_width_at(spectrum: &[f64], level: f64) -> f64 {
    let size = spectrum.len();
    let Some(lower) = spectrum.iter().position(|&s| s >= level) else {
        warn!("Failed to measure line width.");
        return 0.0;
    };

    let mut width = lower as f64;
    if lower > 0 {
        width -= (spectrum[lower] - level) / (spectrum[lower] - spectrum[lower - 1]);
    }

    // The upper crossing must exist because the lower one did.
    let upper = size - 1 - spectrum.iter().rev().position(|&s| s >= level).unwrap_or(0);
    width = upper as f64 - width;
    if upper < size - 1 {
        width += (spectrum[upper] - level) / (spectrum[upper] - spectrum[upper + 1]);
    }

    width
}

/// Position angle of the kinematic major axis from per-channel centroids,
/// via flux-weighted Deming (orthogonal) regression with `weight = sum²`.
/// Channels with non-positive `sum` are skipped. The angle is corrected to
/// point towards the upper end of the channel range and reported in degrees
/// within `[0, 360)`, zero pointing up.
pub fn kin_maj_axis(
    centroid_x: &[f64],
    centroid_y: &[f64],
    sum: &[f64],
    first: usize,
    last: usize,
) -> f64 {
    let mut sum_w = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;

    for i in 0..sum.len() {
        if sum[i] > 0.0 {
            let weight = sum[i] * sum[i];
            sum_w += weight;
            sum_x += weight * centroid_x[i];
            sum_y += weight * centroid_y[i];
        }
    }

    sum_x /= sum_w;
    sum_y /= sum_w;

    let mut sum_xx = 0.0;
    let mut sum_yy = 0.0;
    let mut sum_xy = 0.0;

    for i in 0..sum.len() {
        if sum[i] > 0.0 {
            let weight = sum[i] * sum[i];
            sum_xx += weight * (centroid_x[i] - sum_x) * (centroid_x[i] - sum_x);
            sum_yy += weight * (centroid_y[i] - sum_y) * (centroid_y[i] - sum_y);
            sum_xy += weight * (centroid_x[i] - sum_x) * (centroid_y[i] - sum_y);
        }
    }

    let slope = (sum_yy - sum_xx + ((sum_yy - sum_xx) * (sum_yy - sum_xx) + 4.0 * sum_xy * sum_xy).sqrt())
        / (2.0 * sum_xy);
    let mut pa = slope.atan();

    // Flip towards the side of the source at the upper end of the channel range.
    let full_angle = (centroid_y[last] - centroid_y[first]).atan2(centroid_x[last] - centroid_x[first]);
    let difference = (full_angle.sin() * pa.cos() - full_angle.cos() * pa.sin())
        .atan2(full_angle.cos() * pa.cos() + full_angle.sin() * pa.sin())
        .abs();

    if difference > std::f64::consts::FRAC_PI_2 {
        pa += std::f64::consts::PI;
    }

    pa = 180.0 * pa / std::f64::consts::PI - 90.0;
    while pa < 0.0 {
        pa += 360.0;
    }
    while pa >= 360.0 {
        pa -= 360.0;
    }

    pa
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn max_min_skips_nan() {
        let data = [f32::NAN, 3.0, -2.0, f32::NAN, 7.5];
        let (max, min) = max_min(&data);
        assert_eq!(max, 7.5);
        assert_eq!(min, -2.0);

        let all_nan = [f32::NAN; 4];
        let (max, min) = max_min(&all_nan);
        assert!(max.is_nan() && min.is_nan());
    }

    #[test]
    fn mean_and_sum_ignore_nan() {
        let data = [1.0f64, f64::NAN, 3.0];
        assert_eq!(sum(&data), 4.0);
        assert_eq!(mean(&data), 2.0);
        assert!(mean(&[f64::NAN]).is_nan());
    }

    #[test]
    fn std_dev_val_respects_range() {
        let data = [-2.0f64, -1.0, 1.0, 2.0];
        let neg = std_dev_val(&data, 0.0, 1, FluxRange::Negative);
        assert!((neg - (2.5f64).sqrt()).abs() < 1e-12);
        let full = std_dev_val(&data, 0.0, 1, FluxRange::Full);
        assert!((full - (2.5f64).sqrt()).abs() < 1e-12);
        assert!(std_dev_val(&data, 0.0, 1, FluxRange::Positive) > 0.0);
        assert!(std_dev_val(&[f64::NAN], 0.0, 1, FluxRange::Full).is_nan());
    }

    #[test]
    fn nth_element_partitions() {
        let mut data = [9.0f32, 1.0, 8.0, 2.0, 7.0, 3.0, 6.0, 4.0, 5.0];
        let k = 4;
        let value = nth_element(&mut data, k);
        assert_eq!(value, 5.0);

        for i in 0..k {
            assert!(data[i] <= data[k]);
        }
        for i in k..data.len() {
            assert!(data[i] >= data[k]);
        }
    }

    #[test]
    fn median_even_and_odd() {
        let mut odd = [3.0f64, 1.0, 2.0];
        assert_eq!(median(&mut odd, false), 2.0);

        let mut even = [4.0f64, 1.0, 3.0, 2.0];
        assert_eq!(median(&mut even, false), 2.5);

        let mut empty: [f64; 0] = [];
        assert!(median(&mut empty, false).is_nan());
    }

    #[test]
    fn robust_noise_recovers_sigma() {
        let mut rng = StdRng::seed_from_u64(42);
        let sigma = 1.5f64;

        // Approximate Gaussian via the central limit theorem; good enough
        // for a few-percent tolerance on the median of the negative tail.
        let data: Vec<f64> = (0..200_000)
            .map(|_| {
                let s: f64 = (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0;
                s * sigma
            })
            .collect();

        let noise = robust_noise(&data);
        assert!((noise - sigma).abs() / sigma < 0.02, "noise = {noise}");
    }

    #[test]
    fn gaufit_recovers_sigma() {
        let mut rng = StdRng::seed_from_u64(7);
        let sigma = 2.0f64;
        let data: Vec<f64> = (0..200_000)
            .map(|_| {
                let s: f64 = (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0;
                s * sigma
            })
            .collect();

        let fitted = gaufit(&data, 1, FluxRange::Full);
        assert!((fitted - sigma).abs() / sigma < 0.1, "fitted = {fitted}");

        // Strictly positive data cannot be fitted.
        assert!(gaufit(&[1.0f64, 2.0, 3.0], 1, FluxRange::Full).is_nan());
    }

    #[test]
    fn boxcar_zero_padding() {
        let mut data = [1.0f64, 2.0, 3.0, 4.0, 5.0];
        let mut scratch = vec![0.0f64; data.len() + 2];
        filter_boxcar_1d(&mut data, &mut scratch, 1);
        let expected = [1.0, 2.0, 3.0, 4.0, 3.0];

        for (a, b) in data.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12, "{data:?}");
        }
    }

    #[test]
    fn boxcar_radius_zero_is_identity() {
        let mut data = [0.5f32, -1.5, 2.5];
        let mut scratch = vec![0.0f32; 3];
        filter_boxcar_1d(&mut data, &mut scratch, 0);
        assert_eq!(data, [0.5, -1.5, 2.5]);
    }

    #[test]
    fn double_boxcar_is_triangular() {
        // Two passes of a radius-1 boxcar over an impulse give a triangular
        // kernel of half-width 2: (1, 2, 3, 2, 1) / 9.
        let mut data = [0.0f64; 7];
        data[3] = 1.0;
        let mut scratch = vec![0.0f64; 9];

        filter_boxcar_1d(&mut data, &mut scratch, 1);
        filter_boxcar_1d(&mut data, &mut scratch, 1);

        let expected = [0.0, 1.0 / 9.0, 2.0 / 9.0, 3.0 / 9.0, 2.0 / 9.0, 1.0 / 9.0, 0.0];
        for (a, b) in data.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12, "{data:?}");
        }
    }

    #[test]
    fn central_moments() {
        let data = [1.0f64, f64::NAN, 3.0];
        let (m2, m3, m4) = moments(&data, 2.0);
        assert_eq!(m2, 1.0);
        assert_eq!(m3, 0.0);
        assert_eq!(m4, 1.0);

        let (m2, _, _) = moments::<f64>(&[], 0.0);
        assert!(m2.is_nan());
    }

    #[test]
    fn boxcar_treats_nan_as_zero() {
        let mut data = [3.0f64, f64::NAN, 3.0];
        let mut scratch = vec![0.0f64; 5];
        filter_boxcar_1d(&mut data, &mut scratch, 1);
        assert!((data[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn gauss_2d_preserves_total_flux_away_from_edges() {
        let nx = 21;
        let ny = 21;
        let mut plane = vec![0.0f64; nx * ny];
        plane[10 + nx * 10] = 1.0;

        filter_gauss_2d(&mut plane, nx, ny, 3, 2);

        let total: f64 = plane.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "total = {total}");
        // The peak must have spread out.
        assert!(plane[10 + nx * 10] < 0.1);
    }

    #[test]
    fn optimal_filter_size_bounds() {
        for sigma in [0.5, 1.0, 2.0, 5.0] {
            let (radius, n_iter) = optimal_filter_size(sigma);
            assert!(radius >= 1);
            assert!((BOXCAR_MIN_ITER..=BOXCAR_MAX_ITER).contains(&n_iter));
        }
    }

    #[test]
    fn shift_and_subtract_basics() {
        let mut data = [1.0f64, 2.0, 4.0, 7.0];
        shift_and_subtract(&mut data, 1);
        assert_eq!(data, [1.0, 1.0, 2.0, 3.0]);

        let mut data = [1.0f64, 2.0];
        shift_and_subtract(&mut data, 5);
        assert_eq!(data, [1.0, 2.0]);
    }

    #[test]
    fn line_widths_with_interpolation() {
        // Triangle peaking at channel 2 with value 1.0.
        let spectrum = [0.0, 0.5, 1.0, 0.5, 0.0];
        let (w20, w50) = spectral_line_width(&spectrum);
        assert!(w50 > 0.0 && w20 > w50);

        let flat = [0.0, 0.0, 0.0];
        let (w20, _) = spectral_line_width(&flat);
        // A flat zero spectrum peaks at zero everywhere; width spans it all.
        assert!(w20 >= 0.0);
    }

    #[test]
    fn kinematic_axis_of_straight_line() {
        // Centroids moving straight up in y: PA should be 0 (pointing up).
        let cx = [5.0, 5.0, 5.0, 5.0];
        let cy = [1.0, 2.0, 3.0, 4.0];
        let sum = [1.0, 1.0, 1.0, 1.0];
        let pa = kin_maj_axis(&cx, &cy, &sum, 0, 3);
        assert!(pa.abs() < 1e-6 || (pa - 360.0).abs() < 1e-6, "pa = {pa}");
    }

    #[test]
    fn ellipse_fit_of_round_source() {
        let mut map = ndarray::Array2::<f64>::zeros((11, 11));
        let mut counts = ndarray::Array2::<usize>::zeros((11, 11));

        for y in 0..11usize {
            for x in 0..11usize {
                let dx = x as f64 - 5.0;
                let dy = y as f64 - 5.0;
                let r2 = dx * dx + dy * dy;
                if r2 <= 9.0 {
                    map[(y, x)] = (-r2 / 4.0).exp();
                    counts[(y, x)] = 1;
                }
            }
        }

        let fit = moment_ellipse_fit(&map, &counts, 5.0, 5.0, 1e-6);
        assert!(fit.ell_maj > 0.0);
        // Circular source: major and minor axes agree closely.
        assert!((fit.ell_maj - fit.ell_min).abs() < 0.1 * fit.ell_maj);
    }
}
