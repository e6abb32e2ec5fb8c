//! Noise normalisation.
//!
//! Two flavours: a per-plane global mode that divides every spectral channel
//! map by its own rms, and a local mode that measures the rms in a running
//! window on a coarse grid and divides the cube by the (optionally
//! bilinearly interpolated) noise cube. The local mode returns the noise
//! cube so the caller can write it out.

use anyhow::{bail, ensure, Result};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::cube::{measure_rms_slice, Cube, CubeData};
use crate::stats::{FluxRange, NoiseStatistic, Real};

/// Noise scaling mode selected in the configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScaleNoiseMode {
    None,
    Spectral,
    Local,
}

/// Settings for the local (windowed) mode. Window and grid sizes are forced
/// odd; zero values select the defaults (window 25/15, grid half-window).
#[derive(Copy, Clone, Debug)]
pub struct LocalNoiseSettings {
    pub window_xy: usize,
    pub window_z: usize,
    pub grid_xy: usize,
    pub grid_z: usize,
    pub interpolate: bool,
}

impl Default for LocalNoiseSettings {
    fn default() -> Self {
        LocalNoiseSettings {
            window_xy: 25,
            window_z: 15,
            grid_xy: 0,
            grid_z: 0,
            interpolate: false,
        }
    }
}

/// Divide each spectral plane of the cube by its own rms. Planes whose rms
/// is zero or NaN are left untouched; their count is reported.
pub fn scale_noise_spec(cube: &mut Cube, statistic: NoiseStatistic, range: FluxRange) -> Result<()> {
    ensure!(cube.dtype().is_float(), "cannot run noise scaling on an integer cube");

    info!("Dividing by noise in each image plane.");

    let plane = cube.nx() * cube.ny();
    let skipped = match cube.data_mut() {
        CubeData::F32(v) => scale_planes(v, plane, statistic, range),
        CubeData::F64(v) => scale_planes(v, plane, statistic, range),
        _ => unreachable!(),
    };

    if skipped > 0 {
        warn!("Noise level of {skipped} plane(s) could not be measured; left unscaled.");
    }

    Ok(())
}

fn scale_planes<T: Real>(
    data: &mut [T],
    plane: usize,
    statistic: NoiseStatistic,
    range: FluxRange,
) -> usize {
    let skipped = AtomicUsize::new(0);

    data.par_chunks_mut(plane).for_each(|p| {
        let rms = measure_rms_slice(p, statistic, 1, range);

        if rms > 0.0 && rms.is_finite() {
            let rms = T::of(rms);
            for s in p.iter_mut() {
                *s = *s / rms;
            }
        } else {
            skipped.fetch_add(1, Ordering::Relaxed);
        }
    });

    skipped.into_inner()
}

/// Divide the cube by its local noise level, measured in a running window
/// centred on a coarse grid of anchor positions. Returns the noise cube.
pub fn scale_noise_local(
    cube: &mut Cube,
    statistic: NoiseStatistic,
    range: FluxRange,
    settings: LocalNoiseSettings,
) -> Result<Cube> {
    ensure!(cube.dtype().is_float(), "cannot run noise scaling on an integer cube");

    // Window sizes: defaults, then force odd.
    let window_xy = make_odd(if settings.window_xy == 0 { 25 } else { settings.window_xy });
    let window_z = make_odd(if settings.window_z == 0 { 15 } else { settings.window_z });

    // Grid sizes: half the window by default, at least 1, then force odd.
    let grid_xy = make_odd((if settings.grid_xy == 0 { window_xy / 2 } else { settings.grid_xy }).max(1));
    let grid_z = make_odd((if settings.grid_z == 0 { window_z / 2 } else { settings.grid_z }).max(1));

    info!("Local noise scaling: grid {grid_xy} x {grid_z}, window {window_xy} x {window_z}.");

    let (nx, ny, nz) = (cube.nx(), cube.ny(), cube.nz());
    let dtype = cube.dtype();

    let noise_data = match cube.data_mut() {
        CubeData::F32(v) => CubeData::F32(scale_noise_local_impl(
            v, nx, ny, nz, statistic, range, window_xy, window_z, grid_xy, grid_z,
            settings.interpolate,
        )),
        CubeData::F64(v) => CubeData::F64(scale_noise_local_impl(
            v, nx, ny, nz, statistic, range, window_xy, window_z, grid_xy, grid_z,
            settings.interpolate,
        )),
        _ => bail!("cannot run noise scaling on an integer cube"),
    };

    let mut noise_cube = Cube::from_parts(nx, ny, nz, noise_data, cube.header.clone())?;
    noise_cube.header.set_int("BITPIX", dtype.bitpix());
    Ok(noise_cube)
}

fn make_odd(value: usize) -> usize {
    value + 1 - value % 2
}

/// Anchor positions along one axis: spacing `grid`, centred such that the
/// outermost grid cells cover the axis edges symmetrically.
fn grid_anchors(size: usize, grid: usize) -> Vec<usize> {
    let cells = (size + grid - 1) / grid;
    let start = (size - grid * (cells - 1)) / 2;
    (0..cells).map(|i| start + i * grid).collect()
}

#[allow(clippy::too_many_arguments)]
fn scale_noise_local_impl<T: Real>(
    data: &mut [T],
    nx: usize,
    ny: usize,
    nz: usize,
    statistic: NoiseStatistic,
    range: FluxRange,
    window_xy: usize,
    window_z: usize,
    grid_xy: usize,
    grid_z: usize,
    interpolate: bool,
) -> Vec<T> {
    let radius_grid_xy = grid_xy / 2;
    let radius_grid_z = grid_z / 2;
    let radius_window_xy = window_xy / 2;
    let radius_window_z = window_z / 2;

    let anchors_x = grid_anchors(nx, grid_xy);
    let anchors_y = grid_anchors(ny, grid_xy);
    let anchors_z = grid_anchors(nz, grid_z);

    // Measure the rms in a window around every grid anchor. Each anchor is
    // independent, so this parallelises over the full anchor set with a
    // freshly allocated window buffer per task.
    let n_anchor_x = anchors_x.len();
    let n_anchor_y = anchors_y.len();
    let n_anchors = n_anchor_x * n_anchor_y * anchors_z.len();

    let anchor_rms: Vec<f64> = (0..n_anchors)
        .into_par_iter()
        .map(|a| {
            let xi = a % n_anchor_x;
            let yi = (a / n_anchor_x) % n_anchor_y;
            let zi = a / (n_anchor_x * n_anchor_y);
            let (x, y, z) = (anchors_x[xi], anchors_y[yi], anchors_z[zi]);

            let x1 = x.saturating_sub(radius_window_xy);
            let x2 = (x + radius_window_xy).min(nx - 1);
            let y1 = y.saturating_sub(radius_window_xy);
            let y2 = (y + radius_window_xy).min(ny - 1);
            let z1 = z.saturating_sub(radius_window_z);
            let z2 = (z + radius_window_z).min(nz - 1);

            let mut window = Vec::with_capacity((x2 - x1 + 1) * (y2 - y1 + 1) * (z2 - z1 + 1));

            for zz in z1..=z2 {
                for yy in y1..=y2 {
                    for xx in x1..=x2 {
                        let v = data[xx + nx * (yy + ny * zz)];
                        if !v.is_nan() {
                            window.push(v);
                        }
                    }
                }
            }

            if window.is_empty() {
                f64::NAN
            } else {
                measure_rms_slice(&window, statistic, 1, range)
            }
        })
        .collect();

    // Fill each grid cell of the noise cube with its anchor's rms. The cells
    // tile the cube, so this is a direct anchor-index lookup per voxel.
    let x_cell = cell_index_map(nx, &anchors_x, radius_grid_xy);
    let y_cell = cell_index_map(ny, &anchors_y, radius_grid_xy);
    let z_cell = cell_index_map(nz, &anchors_z, radius_grid_z);

    let mut noise: Vec<T> = vec![T::nan(); data.len()];

    noise
        .par_chunks_mut(nx * ny)
        .enumerate()
        .for_each(|(z, plane)| {
            let zi = z_cell[z];

            for y in 0..ny {
                let yi = y_cell[y];

                for x in 0..nx {
                    let rms = anchor_rms[x_cell[x] + n_anchor_x * (yi + n_anchor_y * zi)];
                    plane[x + nx * y] = T::of(rms);
                }
            }
        });

    if interpolate && (grid_xy > 1 || grid_z > 1) {
        info!("Interpolating noise values.");

        // Along z first, at anchor columns only.
        if grid_z > 1 {
            for &y in &anchors_y {
                for &x in &anchors_x {
                    for pair in anchors_z.windows(2) {
                        let (z0, z2) = (pair[0], pair[1]);
                        let s0 = noise[x + nx * (y + ny * z0)].as_f64();
                        let s2 = noise[x + nx * (y + ny * z2)].as_f64();

                        if s0.is_nan() || s2.is_nan() {
                            continue;
                        }

                        for z1 in z0 + 1..z2 {
                            let value = s0 + (s2 - s0) * (z1 - z0) as f64 / (z2 - z0) as f64;
                            noise[x + nx * (y + ny * z1)] = T::of(value);
                        }
                    }
                }
            }
        }

        // Then within each spatial plane: along y at anchor columns, then
        // along x for every row between the outermost anchors.
        if grid_xy > 1 {
            let anchors_x = &anchors_x;
            let anchors_y = &anchors_y;

            noise.par_chunks_mut(nx * ny).for_each(|plane| {
                for &x in anchors_x.iter() {
                    for pair in anchors_y.windows(2) {
                        let (y0, y2) = (pair[0], pair[1]);
                        let s0 = plane[x + nx * y0].as_f64();
                        let s2 = plane[x + nx * y2].as_f64();

                        if s0.is_nan() || s2.is_nan() {
                            continue;
                        }

                        for y1 in y0 + 1..y2 {
                            let value = s0 + (s2 - s0) * (y1 - y0) as f64 / (y2 - y0) as f64;
                            plane[x + nx * y1] = T::of(value);
                        }
                    }
                }

                let y_first = anchors_y[0];
                let y_last = anchors_y[anchors_y.len() - 1];

                for y in y_first..=y_last {
                    for pair in anchors_x.windows(2) {
                        let (x0, x2) = (pair[0], pair[1]);
                        let s0 = plane[x0 + nx * y].as_f64();
                        let s2 = plane[x2 + nx * y].as_f64();

                        if s0.is_nan() || s2.is_nan() {
                            continue;
                        }

                        for x1 in x0 + 1..x2 {
                            let value = s0 + (s2 - s0) * (x1 - x0) as f64 / (x2 - x0) as f64;
                            plane[x1 + nx * y] = T::of(value);
                        }
                    }
                }
            });
        }
    }

    // Divide the data by the noise cube; non-positive noise blanks the voxel.
    data.par_iter_mut().zip(noise.par_iter()).for_each(|(d, &n)| {
        if n > T::zero() {
            *d = *d / n;
        } else {
            *d = T::nan();
        }
    });

    noise
}

/// For each position along an axis, the index of the grid anchor whose cell
/// contains it. Cells tile the axis; positions beyond the outermost cell
/// boundaries clamp to the nearest anchor.
fn cell_index_map(size: usize, anchors: &[usize], radius: usize) -> Vec<usize> {
    let mut map = vec![usize::MAX; size];

    for (i, &a) in anchors.iter().enumerate() {
        for p in a.saturating_sub(radius)..=(a + radius).min(size - 1) {
            map[p] = i;
        }
    }

    // Clamp uncovered edges (possible when the grid radius truncates).
    let mut last = 0;
    for v in map.iter_mut() {
        if *v == usize::MAX {
            *v = last;
        } else {
            last = *v;
        }
    }

    map
}
