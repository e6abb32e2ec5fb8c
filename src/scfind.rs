//! The Smooth + Clip source finder.
//!
//! The finder runs the data cube through every combination of spatial
//! Gaussian and spectral boxcar kernel requested by the user. For each
//! kernel pair it smooths a copy of the original cube, re-measures the
//! noise, and ORs every voxel whose absolute value exceeds the threshold
//! into the shared detection mask. Voxels already detected by an earlier
//! kernel can be replaced by a fixed multiple of the original noise level
//! before smoothing, which stops bright sources from bleeding into their
//! surroundings at the cost of a small positive flux bias.
//!
//! A plain threshold finder without any smoothing is also provided.

use anyhow::{ensure, Result};
use tracing::info;

use crate::cube::Cube;
use crate::noise::{self, LocalNoiseSettings, ScaleNoiseMode};
use crate::stats::{FluxRange, NoiseStatistic};

/// Voxel sample target for noise measurements; the sampling cadence is the
/// cube size divided by this.
pub const NOISE_SAMPLE_SIZE: usize = 999_983;

/// Conversion between the FWHM and standard deviation of a Gaussian.
const FWHM_CONST: f64 = 2.354820045030949; // 2 sqrt(2 ln 2)

/// S+C finder settings.
#[derive(Clone, Debug)]
pub struct ScfindSettings {
    /// Spatial kernel FWHMs in pixels; 0 disables spatial smoothing.
    pub kernels_xy: Vec<f64>,
    /// Spectral boxcar widths in channels; 0 disables spectral smoothing.
    /// Non-zero values must be odd.
    pub kernels_z: Vec<usize>,
    /// Detection threshold in multiples of the noise level.
    pub threshold: f64,
    /// Replacement value for detected voxels in units of the original rms;
    /// negative disables replacement.
    pub replacement: f64,
    pub statistic: NoiseStatistic,
    pub range: FluxRange,
    /// Optional per-iteration noise scaling applied to the smoothed copy.
    pub scale_noise: ScaleNoiseMode,
    pub scale_noise_statistic: NoiseStatistic,
    pub scale_noise_range: FluxRange,
    pub local_noise: LocalNoiseSettings,
}

impl Default for ScfindSettings {
    fn default() -> Self {
        ScfindSettings {
            kernels_xy: vec![0.0, 3.0, 6.0],
            kernels_z: vec![0, 3, 7, 15],
            threshold: 5.0,
            replacement: 2.0,
            statistic: NoiseStatistic::Mad,
            range: FluxRange::Negative,
            scale_noise: ScaleNoiseMode::None,
            scale_noise_statistic: NoiseStatistic::Mad,
            scale_noise_range: FluxRange::Negative,
            local_noise: LocalNoiseSettings::default(),
        }
    }
}

/// Sampling cadence for noise measurements, adjusted so that it is never an
/// exact multiple of the x-axis size (which would sample a single column).
pub fn noise_cadence(data_size: usize, nx: usize) -> usize {
    let mut cadence = data_size / NOISE_SAMPLE_SIZE;

    if cadence < 2 {
        cadence = 1;
    } else if nx > 0 && cadence % nx == 0 {
        cadence -= 1;
    }

    cadence
}

/// Run the S+C finder, ORing detections into an 8-bit mask cube. The mask
/// is monotone non-decreasing: a voxel detected by one kernel stays
/// detected.
pub fn run_scfind(data: &Cube, mask: &mut Cube, settings: &ScfindSettings) -> Result<()> {
    ensure!(
        data.dtype().is_float(),
        "the S+C finder can only be applied to floating-point data"
    );
    ensure!(
        mask.as_u8().is_some(),
        "the detection mask must be of 8-bit integer type"
    );
    ensure!(data.same_shape(mask), "data cube and mask cube have different sizes");
    ensure!(
        !settings.kernels_xy.is_empty() && !settings.kernels_z.is_empty(),
        "invalid spatial or spectral kernel list"
    );
    ensure!(settings.threshold >= 0.0, "negative flux threshold encountered");

    for &k in &settings.kernels_z {
        ensure!(k == 0 || k % 2 == 1, "spectral kernel sizes must be odd");
    }

    let cadence = noise_cadence(data.data_size(), data.nx());
    info!("Using a stride of {cadence} in noise measurement.");

    let rms = data.measure_rms(settings.statistic, cadence, settings.range)?;

    for &kernel_xy in &settings.kernels_xy {
        for &kernel_z in &settings.kernels_z {
            info!("Smoothing kernel: [{kernel_xy:.1}] x [{kernel_z}]");

            if kernel_xy == 0.0 && kernel_z == 0 {
                // No smoothing; threshold the original cube directly.
                info!("Noise level: {rms:.3e}");
                data.mask_by_threshold(mask, settings.threshold * rms)?;
                continue;
            }

            let mut smoothed = data.clone();

            // Replace previously detected voxels before smoothing.
            if settings.replacement >= 0.0 {
                smoothed.set_masked_8(mask, settings.replacement * rms)?;
            }

            if kernel_xy > 0.0 {
                smoothed.gaussian_filter_xy(kernel_xy / FWHM_CONST)?;
            }

            if kernel_z > 0 {
                smoothed.boxcar_filter_z(kernel_z / 2)?;
            }

            // The filters treated NaN as zero; restore the original blanks.
            smoothed.copy_blanked(data)?;

            match settings.scale_noise {
                ScaleNoiseMode::None => {}
                ScaleNoiseMode::Spectral => {
                    info!("Correcting for noise variations along the spectral axis.");
                    noise::scale_noise_spec(
                        &mut smoothed,
                        settings.scale_noise_statistic,
                        settings.scale_noise_range,
                    )?;
                }
                ScaleNoiseMode::Local => {
                    info!("Correcting for local noise variations.");
                    noise::scale_noise_local(
                        &mut smoothed,
                        settings.scale_noise_statistic,
                        settings.scale_noise_range,
                        settings.local_noise,
                    )?;
                }
            }

            let rms_smooth = smoothed.measure_rms(settings.statistic, cadence, settings.range)?;
            info!("Noise level: {rms_smooth:.3e}");

            smoothed.mask_by_threshold(mask, settings.threshold * rms_smooth)?;
        }
    }

    Ok(())
}

/// Run a plain threshold finder: mask every voxel whose absolute value
/// exceeds the threshold, which is multiplied by the measured noise level
/// unless `absolute` is set.
pub fn run_threshold(
    data: &Cube,
    mask: &mut Cube,
    absolute: bool,
    mut threshold: f64,
    statistic: NoiseStatistic,
    range: FluxRange,
) -> Result<()> {
    ensure!(
        data.dtype().is_float(),
        "the threshold finder can only be applied to floating-point data"
    );
    ensure!(
        mask.as_u8().is_some(),
        "the detection mask must be of 8-bit integer type"
    );
    ensure!(data.same_shape(mask), "data cube and mask cube have different sizes");
    ensure!(threshold >= 0.0, "negative flux threshold encountered");

    if !absolute {
        let cadence = noise_cadence(data.data_size(), data.nx());
        let rms = data.measure_rms(statistic, cadence, range)?;
        info!("Noise level: {rms:.3e} (using stride of {cadence})");
        threshold *= rms;
    }

    data.mask_by_threshold(mask, threshold)
}

/// Parse a comma-separated kernel list such as `"0, 3, 6"` into numbers.
pub fn parse_kernels_flt(spec: &str) -> Result<Vec<f64>> {
    spec.split(',')
        .map(|tok| {
            tok.trim()
                .parse::<f64>()
                .map_err(|_| anyhow::anyhow!("invalid kernel specification `{tok}`"))
        })
        .collect()
}

/// Parse a comma-separated list of spectral kernel sizes.
pub fn parse_kernels_int(spec: &str) -> Result<Vec<usize>> {
    spec.split(',')
        .map(|tok| {
            tok.trim()
                .parse::<usize>()
                .map_err(|_| anyhow::anyhow!("invalid kernel specification `{tok}`"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::DataType;

    /// A cube of alternating +/- noise with a bright blob in the middle.
    fn test_cube(n: usize, sigma: f64, peak: f64) -> Cube {
        let mut cube = Cube::blank(n, n, n, DataType::F32);
        let c = n as f64 / 2.0 - 0.5;

        for z in 0..n {
            for y in 0..n {
                for x in 0..n {
                    let sign = if (x + y + z) % 2 == 0 { 1.0 } else { -1.0 };
                    let r2 = (x as f64 - c).powi(2) + (y as f64 - c).powi(2) + (z as f64 - c).powi(2);
                    let value = sigma * sign + peak * (-r2 / 8.0).exp();
                    cube.set_flt(x, y, z, value);
                }
            }
        }

        cube
    }

    #[test]
    fn all_nan_cube_yields_empty_mask() {
        let mut cube = Cube::blank(16, 16, 16, DataType::F32);
        cube.fill_flt(f64::NAN).unwrap();

        let mut mask = Cube::blank(16, 16, 16, DataType::U8);
        let settings = ScfindSettings {
            statistic: NoiseStatistic::Std,
            range: FluxRange::Full,
            ..ScfindSettings::default()
        };

        run_scfind(&cube, &mut mask, &settings).unwrap();
        assert!(mask.as_u8().unwrap().iter().all(|&m| m == 0));
    }

    #[test]
    fn gaussian_blob_is_detected() {
        let cube = test_cube(32, 0.5, 10.0);
        let mut mask = Cube::blank(32, 32, 32, DataType::U8);

        let settings = ScfindSettings {
            kernels_xy: vec![0.0, 3.0],
            kernels_z: vec![0, 3],
            threshold: 3.0,
            replacement: 2.0,
            statistic: NoiseStatistic::Std,
            range: FluxRange::Full,
            ..ScfindSettings::default()
        };

        run_scfind(&cube, &mut mask, &settings).unwrap();

        // The centre voxel and its surroundings must be detected.
        assert_eq!(mask.get_int(15, 15, 15), 1);
        assert_eq!(mask.get_int(16, 16, 16), 1);

        // A corner voxel must not.
        assert_eq!(mask.get_int(0, 0, 0), 0);
    }

    #[test]
    fn mask_is_monotone_across_kernels() {
        let cube = test_cube(24, 0.5, 8.0);
        let mut mask_single = Cube::blank(24, 24, 24, DataType::U8);
        let mut mask_multi = Cube::blank(24, 24, 24, DataType::U8);

        let mut settings = ScfindSettings {
            kernels_xy: vec![0.0],
            kernels_z: vec![0],
            threshold: 4.0,
            statistic: NoiseStatistic::Std,
            range: FluxRange::Full,
            ..ScfindSettings::default()
        };
        run_scfind(&cube, &mut mask_single, &settings).unwrap();

        settings.kernels_xy = vec![0.0, 3.0];
        settings.kernels_z = vec![0, 3];
        run_scfind(&cube, &mut mask_multi, &settings).unwrap();

        let single = mask_single.as_u8().unwrap();
        let multi = mask_multi.as_u8().unwrap();

        for (s, m) in single.iter().zip(multi.iter()) {
            assert!(m >= s, "multi-kernel mask lost a detection");
        }
    }

    #[test]
    fn threshold_finder_absolute_mode() {
        let mut cube = Cube::blank(4, 4, 1, DataType::F32);
        cube.set_flt(2, 2, 0, 9.0);
        cube.set_flt(1, 1, 0, -9.0);

        let mut mask = Cube::blank(4, 4, 1, DataType::U8);
        run_threshold(&cube, &mut mask, true, 5.0, NoiseStatistic::Std, FluxRange::Full).unwrap();

        assert_eq!(mask.get_int(2, 2, 0), 1);
        assert_eq!(mask.get_int(1, 1, 0), 1);
        assert_eq!(mask.get_int(0, 0, 0), 0);
    }

    #[test]
    fn even_spectral_kernels_are_rejected() {
        let cube = Cube::blank(8, 8, 8, DataType::F32);
        let mut mask = Cube::blank(8, 8, 8, DataType::U8);

        let settings = ScfindSettings {
            kernels_z: vec![0, 4],
            ..ScfindSettings::default()
        };

        assert!(run_scfind(&cube, &mut mask, &settings).is_err());
    }

    #[test]
    fn kernel_list_parsing() {
        assert_eq!(parse_kernels_flt("0, 3,6").unwrap(), vec![0.0, 3.0, 6.0]);
        assert_eq!(parse_kernels_int("0,3, 7, 15").unwrap(), vec![0, 3, 7, 15]);
        assert!(parse_kernels_flt("0, x").is_err());
        assert!(parse_kernels_int("3.5").is_err());
    }

    #[test]
    fn cadence_avoids_x_axis_multiples() {
        assert_eq!(noise_cadence(100, 10), 1);

        // A cadence that would land on a multiple of nx gets nudged.
        let data_size = NOISE_SAMPLE_SIZE * 10;
        let cadence = noise_cadence(data_size, 5);
        assert!(cadence % 5 != 0);
    }
}
