//! Connected-component linking of detected voxels.
//!
//! The linker turns the raw detection mask into a set of labelled sources.
//! Detected voxels start out as -1 in the 32-bit label mask; the cube is
//! scanned in reverse order and every still-unlabelled voxel seeds an
//! iterative flood fill over an explicit heap-allocated stack. Neighbours
//! are defined by an anisotropic ellipsoid with the user's merging radii,
//! evaluated with integer cross-multiplication to stay exact. Sources
//! failing the size gates (or the positivity test) are erased on the fly
//! and their label is reused, so accepted labels end up dense in `1..=N`.

use anyhow::{bail, ensure, Result};
use tracing::info;

use crate::catalog::Catalog;
use crate::cube::Cube;
use crate::source::Source;

/// Quality flag bits shared by the linker, the mask grower and the
/// parameteriser.
pub const FLAG_SPATIAL_EDGE: i64 = 1;
pub const FLAG_SPECTRAL_EDGE: i64 = 2;
pub const FLAG_BLANK_NEIGHBOUR: i64 = 4;
pub const FLAG_SOURCE_CONTACT: i64 = 8;

/// Linker settings. A zero maximum size disables that upper bound.
#[derive(Clone, Debug)]
pub struct LinkerSettings {
    pub radius_x: usize,
    pub radius_y: usize,
    pub radius_z: usize,
    pub min_size_x: usize,
    pub min_size_y: usize,
    pub min_size_z: usize,
    pub max_size_x: usize,
    pub max_size_y: usize,
    pub max_size_z: usize,
    /// Discard sources with negative total flux.
    pub positivity: bool,
    /// Global rms by which fluxes are normalised; 1 disables normalisation.
    pub rms: f64,
}

impl Default for LinkerSettings {
    fn default() -> Self {
        LinkerSettings {
            radius_x: 1,
            radius_y: 1,
            radius_z: 1,
            min_size_x: 5,
            min_size_y: 5,
            min_size_z: 5,
            max_size_x: 0,
            max_size_y: 0,
            max_size_z: 0,
            positivity: false,
            rms: 1.0,
        }
    }
}

/// Running per-label aggregates collected during the flood fill.
#[derive(Clone, Debug)]
pub struct LinkerParEntry {
    pub label: i32,
    pub x_min: usize,
    pub x_max: usize,
    pub y_min: usize,
    pub y_max: usize,
    pub z_min: usize,
    pub z_max: usize,
    pub n_pix: usize,
    pub f_min: f64,
    pub f_max: f64,
    pub f_sum: f64,
    pub flag: i64,
}

impl LinkerParEntry {
    fn new(label: i32, x: usize, y: usize, z: usize, flux: f64, flag: i64) -> Self {
        LinkerParEntry {
            label,
            x_min: x,
            x_max: x,
            y_min: y,
            y_max: y,
            z_min: z,
            z_max: z,
            n_pix: 1,
            f_min: flux,
            f_max: flux,
            f_sum: flux,
            flag,
        }
    }

    fn update(&mut self, x: usize, y: usize, z: usize, flux: f64) {
        self.x_min = self.x_min.min(x);
        self.x_max = self.x_max.max(x);
        self.y_min = self.y_min.min(y);
        self.y_max = self.y_max.max(y);
        self.z_min = self.z_min.min(z);
        self.z_max = self.z_max.max(z);
        self.n_pix += 1;
        self.f_min = self.f_min.min(flux);
        self.f_max = self.f_max.max(flux);
        self.f_sum += flux;
    }

    /// Pixel extent along an axis (0 = x, 1 = y, 2 = z).
    pub fn size(&self, axis: usize) -> usize {
        match axis {
            0 => self.x_max - self.x_min + 1,
            1 => self.y_max - self.y_min + 1,
            _ => self.z_max - self.z_min + 1,
        }
    }
}

/// Growable table of per-label parameters, indexed by `label - 1`.
#[derive(Clone, Debug, Default)]
pub struct LinkerPar {
    entries: Vec<LinkerParEntry>,
}

impl LinkerPar {
    pub fn push(&mut self, entry: LinkerParEntry) {
        self.entries.push(entry);
    }

    /// Remove the most recent entry (used for rejected labels).
    pub fn pop(&mut self) -> Option<LinkerParEntry> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LinkerParEntry] {
        &self.entries
    }

    fn last_mut(&mut self) -> &mut LinkerParEntry {
        self.entries.last_mut().expect("linker parameter table is empty")
    }

    /// Build the initial source catalogue from the accepted labels.
    pub fn make_catalog(&self, unit_flux: &str) -> Catalog {
        let mut catalog = Catalog::new();

        for entry in &self.entries {
            let mut src = Source::new(&format!("{}", entry.label));

            src.set_par_int("id", entry.label as i64, Some(""), Some("meta.id"));
            src.set_par_flt(
                "x",
                (entry.x_min + entry.x_max) as f64 / 2.0,
                Some("pix"),
                Some("pos.cartesian.x"),
            );
            src.set_par_flt(
                "y",
                (entry.y_min + entry.y_max) as f64 / 2.0,
                Some("pix"),
                Some("pos.cartesian.y"),
            );
            src.set_par_flt(
                "z",
                (entry.z_min + entry.z_max) as f64 / 2.0,
                Some("pix"),
                Some("pos.cartesian.z"),
            );
            src.set_par_int("x_min", entry.x_min as i64, Some("pix"), Some("pos.cartesian.x;stat.min"));
            src.set_par_int("x_max", entry.x_max as i64, Some("pix"), Some("pos.cartesian.x;stat.max"));
            src.set_par_int("y_min", entry.y_min as i64, Some("pix"), Some("pos.cartesian.y;stat.min"));
            src.set_par_int("y_max", entry.y_max as i64, Some("pix"), Some("pos.cartesian.y;stat.max"));
            src.set_par_int("z_min", entry.z_min as i64, Some("pix"), Some("pos.cartesian.z;stat.min"));
            src.set_par_int("z_max", entry.z_max as i64, Some("pix"), Some("pos.cartesian.z;stat.max"));
            src.set_par_int("n_pix", entry.n_pix as i64, Some(""), Some("meta.number;instr.pixel"));
            src.set_par_flt("f_min", entry.f_min, Some(unit_flux), Some("phot.flux.density;stat.min"));
            src.set_par_flt("f_max", entry.f_max, Some(unit_flux), Some("phot.flux.density;stat.max"));
            src.set_par_flt("f_sum", entry.f_sum, Some(unit_flux), Some("phot.flux"));
            src.set_par_int("flag", entry.flag, Some(""), Some("meta.code.qual"));

            catalog.push(src);
        }

        catalog
    }
}

/// Link detected voxels into labelled sources. The mask must be a 32-bit
/// cube whose non-zero voxels mark detections; they are reset to -1 before
/// the scan. Returns the per-label parameter table; the mask ends up
/// holding the accepted labels.
pub fn run_linker(data: &Cube, mask: &mut Cube, settings: &LinkerSettings) -> Result<LinkerPar> {
    ensure!(
        data.dtype().is_float(),
        "data cube must be of floating-point type for linking"
    );
    ensure!(mask.as_i32().is_some(), "linker will only accept 32-bit integer masks");
    ensure!(data.same_shape(mask), "data cube and mask cube have different sizes");

    info!(
        "Linker settings: radii {}, {}, {}; minimum size {} x {} x {}; keep negative: {}.",
        settings.radius_x,
        settings.radius_y,
        settings.radius_z,
        settings.min_size_x,
        settings.min_size_y,
        settings.min_size_z,
        !settings.positivity
    );

    mask.reset_mask_32(-1)?;

    let (nx, ny, nz) = (mask.nx(), mask.ny(), mask.nz());
    let max_x = nx.saturating_sub(1);
    let max_y = ny.saturating_sub(1);
    let max_z = nz.saturating_sub(1);
    let rms_inv = 1.0 / settings.rms;

    let mut lpar = LinkerPar::default();
    let mut label: i32 = 1;
    let mut stack: Vec<usize> = Vec::new();

    for z in (0..nz).rev() {
        for y in (0..ny).rev() {
            for x in (0..nx).rev() {
                if mask.get_int(x, y, z) >= 0 {
                    continue;
                }

                let flux = data.get_flt(x, y, z);

                if !flux.is_finite() {
                    mask.set_int(x, y, z, 0);
                    continue;
                }

                mask.set_int(x, y, z, label as i64);

                let mut flag = 0i64;
                if x == 0 || x == max_x || y == 0 || y == max_y {
                    flag |= FLAG_SPATIAL_EDGE;
                }
                if z == 0 || z == max_z {
                    flag |= FLAG_SPECTRAL_EDGE;
                }

                lpar.push(LinkerParEntry::new(label, x, y, z, flux * rms_inv, flag));

                stack.clear();
                stack.push(mask.index(x, y, z));
                process_stack(data, mask, &mut stack, settings, label, &mut lpar, rms_inv);

                let entry = lpar.entries.last().expect("entry just pushed");
                let rejected = entry.size(0) < settings.min_size_x
                    || entry.size(1) < settings.min_size_y
                    || entry.size(2) < settings.min_size_z
                    || (settings.max_size_x > 0 && entry.size(0) > settings.max_size_x)
                    || (settings.max_size_y > 0 && entry.size(1) > settings.max_size_y)
                    || (settings.max_size_z > 0 && entry.size(2) > settings.max_size_z)
                    || (settings.positivity && entry.f_sum < 0.0);

                if rejected {
                    // Erase the label from its bounding box and reuse it.
                    let e = entry.clone();

                    for zz in e.z_min..=e.z_max {
                        for yy in e.y_min..=e.y_max {
                            for xx in e.x_min..=e.x_max {
                                if mask.get_int(xx, yy, zz) == label as i64 {
                                    mask.set_int(xx, yy, zz, 0);
                                }
                            }
                        }
                    }

                    lpar.pop();
                } else {
                    let entry = lpar.last_mut();

                    if entry.x_min == 0 || entry.x_max == max_x || entry.y_min == 0 || entry.y_max == max_y {
                        entry.flag |= FLAG_SPATIAL_EDGE;
                    }
                    if entry.z_min == 0 || entry.z_max == max_z {
                        entry.flag |= FLAG_SPECTRAL_EDGE;
                    }

                    label = match label.checked_add(1) {
                        Some(next) => next,
                        None => bail!("too many sources for 32-bit signed integer mask"),
                    };
                }
            }
        }
    }

    info!("Linker found {} source(s).", lpar.len());
    Ok(lpar)
}

/// Flood-fill from the voxels on the stack, labelling every detected
/// neighbour inside the merging ellipsoid and pushing it in turn. Writes
/// are confined to the current label, so the whole fill is serial by
/// construction.
fn process_stack(
    data: &Cube,
    mask: &mut Cube,
    stack: &mut Vec<usize>,
    settings: &LinkerSettings,
    label: i32,
    lpar: &mut LinkerPar,
    rms_inv: f64,
) {
    let (nx, ny, nz) = (mask.nx(), mask.ny(), mask.nz());
    let rx = settings.radius_x;
    let ry = settings.radius_y;
    let rz = settings.radius_z;

    // Ellipsoid test by cross-multiplication: dx²·ry²·rz² + dy²·rx²·rz² +
    // dz²·rx²·ry² <= rx²·ry²·rz², all in exact integer arithmetic.
    let rx2 = (rx * rx) as u64;
    let ry2 = (ry * ry) as u64;
    let rz2 = (rz * rz) as u64;
    let r_yz = ry2 * rz2;
    let r_xz = rx2 * rz2;
    let r_xy = rx2 * ry2;
    let r_xyz = rx2 * r_yz;

    while let Some(index) = stack.pop() {
        let (x, y, z) = mask.coords(index);

        let x1 = x.saturating_sub(rx);
        let y1 = y.saturating_sub(ry);
        let z1 = z.saturating_sub(rz);
        let x2 = (x + rx).min(nx - 1);
        let y2 = (y + ry).min(ny - 1);
        let z2 = (z + rz).min(nz - 1);

        for zz in z1..=z2 {
            let dz = z.abs_diff(zz) as u64;
            let dz2 = dz * dz * r_xy;

            for yy in y1..=y2 {
                let dy = y.abs_diff(yy) as u64;
                let dy2 = dy * dy * r_xz;

                for xx in x1..=x2 {
                    let dx = x.abs_diff(xx) as u64;
                    let dx2 = dx * dx * r_yz;

                    if dx2 + dy2 + dz2 > r_xyz {
                        continue;
                    }

                    let flux = data.get_flt(xx, yy, zz);

                    if !flux.is_finite() {
                        mask.set_int(xx, yy, zz, 0);
                        lpar.last_mut().flag |= FLAG_BLANK_NEIGHBOUR;
                        continue;
                    }

                    if mask.get_int(xx, yy, zz) == -1 {
                        mask.set_int(xx, yy, zz, label as i64);
                        lpar.last_mut().update(xx, yy, zz, flux * rms_inv);
                        stack.push(mask.index(xx, yy, zz));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::DataType;

    fn blob_cube(n: usize, blob: &[(usize, usize, usize, f64)]) -> (Cube, Cube) {
        let mut data = Cube::blank(n, n, n, DataType::F32);
        let mut mask = Cube::blank(n, n, n, DataType::I32);

        for &(x, y, z, v) in blob {
            data.set_flt(x, y, z, v);
            mask.set_int(x, y, z, 1);
        }

        (data, mask)
    }

    #[test]
    fn single_blob_yields_one_label() {
        let voxels: Vec<_> = (4..7)
            .flat_map(|z| (4..7).flat_map(move |y| (4..7).map(move |x| (x, y, z, 1.0))))
            .collect();
        let (data, mut mask) = blob_cube(12, &voxels);

        let settings = LinkerSettings {
            min_size_x: 2,
            min_size_y: 2,
            min_size_z: 2,
            ..LinkerSettings::default()
        };

        let lpar = run_linker(&data, &mut mask, &settings).unwrap();
        assert_eq!(lpar.len(), 1);

        let entry = &lpar.entries()[0];
        assert_eq!(entry.label, 1);
        assert_eq!(entry.n_pix, 27);
        assert_eq!((entry.x_min, entry.x_max), (4, 6));
        assert!((entry.f_sum - 27.0).abs() < 1e-9);

        // All blob voxels carry label 1.
        assert_eq!(mask.get_int(5, 5, 5), 1);
    }

    #[test]
    fn size_gate_rejects_small_blob() {
        let voxels: Vec<_> = (4..6)
            .flat_map(|z| (4..6).flat_map(move |y| (4..6).map(move |x| (x, y, z, 1.0))))
            .collect();
        let (data, mut mask) = blob_cube(10, &voxels);

        let settings = LinkerSettings {
            min_size_x: 3,
            min_size_y: 1,
            min_size_z: 1,
            ..LinkerSettings::default()
        };

        let lpar = run_linker(&data, &mut mask, &settings).unwrap();
        assert!(lpar.is_empty());
        assert!(mask.as_i32().unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn labels_are_dense_after_rejection() {
        // Two small blobs (rejected) and one larger one (kept).
        let mut voxels = vec![(0, 0, 0, 1.0)];
        voxels.extend((6..9).flat_map(|z| (6..9).flat_map(move |y| (6..9).map(move |x| (x, y, z, 2.0)))));
        voxels.push((11, 11, 11, 1.0));

        let (data, mut mask) = blob_cube(12, &voxels);

        let settings = LinkerSettings {
            min_size_x: 2,
            min_size_y: 2,
            min_size_z: 2,
            ..LinkerSettings::default()
        };

        let lpar = run_linker(&data, &mut mask, &settings).unwrap();
        assert_eq!(lpar.len(), 1);
        assert_eq!(lpar.entries()[0].label, 1);
        assert_eq!(mask.get_int(7, 7, 7), 1);
        assert_eq!(mask.get_int(0, 0, 0), 0);
        assert_eq!(mask.get_int(11, 11, 11), 0);
    }

    #[test]
    fn positivity_gate_drops_negative_sources() {
        let voxels: Vec<_> = (2..5)
            .flat_map(|z| (2..5).flat_map(move |y| (2..5).map(move |x| (x, y, z, -1.0))))
            .collect();
        let (data, mut mask) = blob_cube(8, &voxels);

        let settings = LinkerSettings {
            min_size_x: 1,
            min_size_y: 1,
            min_size_z: 1,
            positivity: true,
            ..LinkerSettings::default()
        };

        let lpar = run_linker(&data, &mut mask, &settings).unwrap();
        assert!(lpar.is_empty());
    }

    #[test]
    fn merging_radius_joins_nearby_voxels() {
        // Two voxels two pixels apart in x: joined with radius 2, separate
        // (and then size-rejected) with radius 1.
        let voxels = vec![(3, 3, 3, 1.0), (5, 3, 3, 1.0)];

        let (data, mut mask) = blob_cube(8, &voxels);
        let settings = LinkerSettings {
            radius_x: 2,
            min_size_x: 3,
            min_size_y: 1,
            min_size_z: 1,
            ..LinkerSettings::default()
        };

        let lpar = run_linker(&data, &mut mask, &settings).unwrap();
        assert_eq!(lpar.len(), 1);
        assert_eq!(lpar.entries()[0].n_pix, 2);
        assert_eq!(lpar.entries()[0].size(0), 3);
    }

    #[test]
    fn non_finite_seeds_are_unmasked() {
        let mut data = Cube::blank(6, 6, 6, DataType::F32);
        let mut mask = Cube::blank(6, 6, 6, DataType::I32);
        data.set_flt(2, 2, 2, f64::NAN);
        mask.set_int(2, 2, 2, 1);

        let settings = LinkerSettings {
            min_size_x: 1,
            min_size_y: 1,
            min_size_z: 1,
            ..LinkerSettings::default()
        };

        let lpar = run_linker(&data, &mut mask, &settings).unwrap();
        assert!(lpar.is_empty());
        assert_eq!(mask.get_int(2, 2, 2), 0);
    }

    #[test]
    fn boundary_flags_are_set() {
        let voxels: Vec<_> = (0..3)
            .flat_map(|z| (0..3).flat_map(move |y| (0..3).map(move |x| (x, y, z, 1.0))))
            .collect();
        let (data, mut mask) = blob_cube(8, &voxels);

        let settings = LinkerSettings {
            min_size_x: 2,
            min_size_y: 2,
            min_size_z: 2,
            ..LinkerSettings::default()
        };

        let lpar = run_linker(&data, &mut mask, &settings).unwrap();
        assert_eq!(lpar.len(), 1);
        let flag = lpar.entries()[0].flag;
        assert!(flag & FLAG_SPATIAL_EDGE != 0);
        assert!(flag & FLAG_SPECTRAL_EDGE != 0);
    }

    #[test]
    fn catalog_carries_linker_parameters() {
        let voxels: Vec<_> = (3..6)
            .flat_map(|z| (3..6).flat_map(move |y| (3..6).map(move |x| (x, y, z, 0.5))))
            .collect();
        let (data, mut mask) = blob_cube(10, &voxels);

        let settings = LinkerSettings {
            min_size_x: 2,
            min_size_y: 2,
            min_size_z: 2,
            ..LinkerSettings::default()
        };

        let lpar = run_linker(&data, &mut mask, &settings).unwrap();
        let catalog = lpar.make_catalog("Jy/beam");

        assert_eq!(catalog.len(), 1);
        let src = catalog.get(0).unwrap();
        assert_eq!(src.get_par_int("id").unwrap(), 1);
        assert_eq!(src.get_par_int("n_pix").unwrap(), 27);
        assert!((src.get_par_flt("f_sum").unwrap() - 13.5).abs() < 1e-9);
    }
}
