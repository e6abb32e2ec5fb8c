//! Mask growing (dilation) in the spatial plane and along the spectral axis.
//!
//! Each source's mask is grown outwards iteratively: in the spatial plane
//! with a circular disc whose radius increases by one pixel per iteration,
//! along the spectral axis by one channel per iteration. Candidate voxels
//! are first marked with the transient value -1 so an iteration can be
//! rolled back; an iteration is kept when the flux it adds exceeds the
//! relative threshold (for negative sources the flux must decrease
//! instead). A negative threshold requests a single unconditional dilation
//! by the maximum radius. Accepted growth is written back to the catalog:
//! fluxes, pixel count, bounding box and quality flags all update.

use anyhow::{ensure, Context, Result};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::cube::Cube;
use crate::linker::{FLAG_BLANK_NEIGHBOUR, FLAG_SOURCE_CONTACT, FLAG_SPATIAL_EDGE, FLAG_SPECTRAL_EDGE};

/// Per-source state while growing; committed to the catalog at the end.
#[derive(Clone, Debug)]
struct GrowState {
    src_id: i64,
    x_min: usize,
    x_max: usize,
    y_min: usize,
    y_max: usize,
    z_min: usize,
    z_max: usize,
    n_pix: usize,
    f_sum: f64,
    f_min: f64,
    f_max: f64,
    flag: i64,
}

impl GrowState {
    fn from_source(src: &crate::source::Source) -> Result<Self> {
        Ok(GrowState {
            src_id: src.get_par_int("id").context("source ID missing from catalogue")?,
            x_min: src.get_par_int("x_min").context("x_min missing")? as usize,
            x_max: src.get_par_int("x_max").context("x_max missing")? as usize,
            y_min: src.get_par_int("y_min").context("y_min missing")? as usize,
            y_max: src.get_par_int("y_max").context("y_max missing")? as usize,
            z_min: src.get_par_int("z_min").context("z_min missing")? as usize,
            z_max: src.get_par_int("z_max").context("z_max missing")? as usize,
            n_pix: src.get_par_int("n_pix").context("n_pix missing")? as usize,
            f_sum: src.get_par_flt("f_sum").context("f_sum missing")?,
            f_min: src.get_par_flt("f_min").context("f_min missing")?,
            f_max: src.get_par_flt("f_max").context("f_max missing")?,
            flag: src.get_par_int("flag").unwrap_or(0),
        })
    }

    fn write_back(&self, src: &mut crate::source::Source) {
        src.set_par_flt("f_min", self.f_min, None, None);
        src.set_par_flt("f_max", self.f_max, None, None);
        src.set_par_flt("f_sum", self.f_sum, None, None);
        src.set_par_int("x_min", self.x_min as i64, None, None);
        src.set_par_int("x_max", self.x_max as i64, None, None);
        src.set_par_int("y_min", self.y_min as i64, None, None);
        src.set_par_int("y_max", self.y_max as i64, None, None);
        src.set_par_int("z_min", self.z_min as i64, None, None);
        src.set_par_int("z_max", self.z_max as i64, None, None);
        src.set_par_int("n_pix", self.n_pix as i64, None, None);
        src.set_par_int("flag", self.flag, None, None);
    }

    fn validate(&self, cube: &Cube) -> Result<()> {
        ensure!(
            self.x_min <= self.x_max && self.y_min <= self.y_max && self.z_min <= self.z_max,
            "illegal source bounding box: minimum exceeds maximum"
        );
        ensure!(
            self.x_max < cube.nx() && self.y_max < cube.ny() && self.z_max < cube.nz(),
            "source bounding box outside data cube boundaries"
        );
        Ok(())
    }
}

/// Grow the masks of all catalogued sources in the spatial plane, driven by
/// the integrated-flux convergence criterion.
pub fn dilate_mask_xy(
    data: &Cube,
    mask: &mut Cube,
    catalog: &mut Catalog,
    iter_max: usize,
    threshold: f64,
) -> Result<()> {
    ensure!(data.dtype().is_float(), "data cube must be of floating-point type");
    ensure!(mask.as_i32().is_some(), "mask must be of 32-bit integer type");
    ensure!(data.same_shape(mask), "data cube and mask cube have different sizes");
    ensure!(
        iter_max < data.nx() || iter_max < data.ny(),
        "maximum number of iterations exceeds spatial axis size"
    );

    if catalog.is_empty() {
        warn!("No sources in catalogue; skipping mask dilation.");
        return Ok(());
    }

    for i in 0..catalog.len() {
        let mut state = GrowState::from_source(catalog.get(i).expect("index in range"))?;
        state.validate(data)?;

        if threshold < 0.0 {
            // Single-shot dilation by the maximum radius.
            let trial = grow_xy(data, mask, &state, iter_max);
            promote(mask, &trial, state.src_id);
            state = trial;
        } else {
            let is_negative = state.f_sum < 0.0;

            for radius in 1..=iter_max {
                let trial = grow_xy(data, mask, &state, radius);
                let df_sum = trial.f_sum - state.f_sum;

                debug!(
                    "Source {}: iteration {radius}: df = {df_sum:.3} ({:.3}%)",
                    state.src_id,
                    100.0 * df_sum / state.f_sum
                );

                let keep = if is_negative {
                    df_sum < threshold * state.f_sum
                } else {
                    df_sum > threshold * state.f_sum
                };

                if keep {
                    promote(mask, &trial, state.src_id);
                    state = trial;
                } else {
                    rollback(mask, &trial);
                    break;
                }
            }
        }

        state.write_back(catalog.get_mut(i).expect("index in range"));
    }

    Ok(())
}

/// Trial-grow one source by a circular disc of the given radius in every
/// spatial plane of its bounding box. New voxels are marked -1 in the mask;
/// the returned state carries the updated aggregates.
fn grow_xy(data: &Cube, mask: &mut Cube, state: &GrowState, radius: usize) -> GrowState {
    let mut trial = state.clone();
    let radius2 = (radius * radius) as f64;
    let (nx, ny) = (data.nx(), data.ny());

    for z in state.z_min..=state.z_max {
        for y in state.y_min..=state.y_max {
            for x in state.x_min..=state.x_max {
                if mask.get_int(x, y, z) != state.src_id {
                    continue;
                }

                if x < radius || x + radius >= nx || y < radius || y + radius >= ny {
                    trial.flag |= FLAG_SPATIAL_EDGE;
                }

                let xx_min = x.saturating_sub(radius);
                let xx_max = (x + radius).min(nx - 1);
                let yy_min = y.saturating_sub(radius);
                let yy_max = (y + radius).min(ny - 1);

                for yy in yy_min..=yy_max {
                    for xx in xx_min..=xx_max {
                        let dx = xx as f64 - x as f64;
                        let dy = yy as f64 - y as f64;

                        if dx * dx + dy * dy > radius2 {
                            continue;
                        }

                        let id = mask.get_int(xx, yy, z);

                        if id == 0 {
                            let value = data.get_flt(xx, yy, z);

                            if !value.is_nan() {
                                mask.set_int(xx, yy, z, -1);
                                trial.f_sum += value;
                                trial.f_min = trial.f_min.min(value);
                                trial.f_max = trial.f_max.max(value);
                                trial.x_min = trial.x_min.min(xx);
                                trial.x_max = trial.x_max.max(xx);
                                trial.y_min = trial.y_min.min(yy);
                                trial.y_max = trial.y_max.max(yy);
                                trial.n_pix += 1;
                            } else {
                                trial.flag |= FLAG_BLANK_NEIGHBOUR;
                            }
                        } else if id > 0 && id != state.src_id {
                            trial.flag |= FLAG_SOURCE_CONTACT;
                        }
                    }
                }
            }
        }
    }

    trial
}

/// Promote the transient -1 voxels inside the trial bounding box to the
/// source's label.
fn promote(mask: &mut Cube, trial: &GrowState, src_id: i64) {
    for z in trial.z_min..=trial.z_max {
        for y in trial.y_min..=trial.y_max {
            for x in trial.x_min..=trial.x_max {
                if mask.get_int(x, y, z) == -1 {
                    mask.set_int(x, y, z, src_id);
                }
            }
        }
    }
}

/// Reset the transient -1 voxels inside the trial bounding box to
/// background.
fn rollback(mask: &mut Cube, trial: &GrowState) {
    for z in trial.z_min..=trial.z_max {
        for y in trial.y_min..=trial.y_max {
            for x in trial.x_min..=trial.x_max {
                if mask.get_int(x, y, z) == -1 {
                    mask.set_int(x, y, z, 0);
                }
            }
        }
    }
}

/// Grow the masks of all catalogued sources along the spectral axis, one
/// channel per iteration in both directions.
pub fn dilate_mask_z(
    data: &Cube,
    mask: &mut Cube,
    catalog: &mut Catalog,
    iter_max: usize,
    threshold: f64,
) -> Result<()> {
    ensure!(data.dtype().is_float(), "data cube must be of floating-point type");
    ensure!(mask.as_i32().is_some(), "mask must be of 32-bit integer type");
    ensure!(data.same_shape(mask), "data cube and mask cube have different sizes");
    ensure!(
        iter_max < data.nz(),
        "maximum number of iterations exceeds spectral axis size"
    );

    if catalog.is_empty() {
        warn!("No sources in catalogue; skipping mask dilation.");
        return Ok(());
    }

    let nz = data.nz();

    for i in 0..catalog.len() {
        let mut state = GrowState::from_source(catalog.get(i).expect("index in range"))?;
        state.validate(data)?;

        let is_negative = state.f_sum < 0.0;

        for iter in 0..iter_max {
            let mut trial = state.clone();
            let mut df_sum = 0.0;

            for z in state.z_min..=state.z_max {
                for y in state.y_min..=state.y_max {
                    for x in state.x_min..=state.x_max {
                        if mask.get_int(x, y, z) != state.src_id {
                            continue;
                        }

                        // One channel down.
                        if z > 0 {
                            df_sum += try_mark_z(data, mask, &mut trial, state.src_id, x, y, z - 1);
                        } else {
                            trial.flag |= FLAG_SPECTRAL_EDGE;
                        }

                        // One channel up.
                        if z + 1 < nz {
                            df_sum += try_mark_z(data, mask, &mut trial, state.src_id, x, y, z + 1);
                        } else {
                            trial.flag |= FLAG_SPECTRAL_EDGE;
                        }
                    }
                }
            }

            let keep = threshold < 0.0
                || (is_negative && df_sum < threshold * state.f_sum)
                || (!is_negative && df_sum > threshold * state.f_sum);

            if keep {
                trial.f_sum += df_sum;

                // Commit the new channels, updating min/max and pixel count.
                for z in trial.z_min..=trial.z_max {
                    for y in trial.y_min..=trial.y_max {
                        for x in trial.x_min..=trial.x_max {
                            if mask.get_int(x, y, z) == -1 {
                                mask.set_int(x, y, z, state.src_id);
                                let value = data.get_flt(x, y, z);
                                trial.f_min = trial.f_min.min(value);
                                trial.f_max = trial.f_max.max(value);
                                trial.n_pix += 1;
                            }
                        }
                    }
                }

                debug!(
                    "Source {}: iteration {}: df = {df_sum:.3}",
                    state.src_id,
                    iter + 1
                );
                state = trial;
            } else {
                rollback(mask, &trial);
                break;
            }
        }

        state.write_back(catalog.get_mut(i).expect("index in range"));
    }

    Ok(())
}

/// Inspect one spectral neighbour; marks it -1 and returns its flux
/// contribution when it is unclaimed and finite, otherwise updates flags
/// and returns zero.
fn try_mark_z(
    data: &Cube,
    mask: &mut Cube,
    trial: &mut GrowState,
    src_id: i64,
    x: usize,
    y: usize,
    z: usize,
) -> f64 {
    let id = mask.get_int(x, y, z);

    if id == 0 {
        let value = data.get_flt(x, y, z);

        if !value.is_nan() {
            mask.set_int(x, y, z, -1);
            trial.z_min = trial.z_min.min(z);
            trial.z_max = trial.z_max.max(z);
            return value;
        }

        trial.flag |= FLAG_BLANK_NEIGHBOUR;
    } else if id > 0 && id != src_id {
        trial.flag |= FLAG_SOURCE_CONTACT;
    }

    0.0
}
