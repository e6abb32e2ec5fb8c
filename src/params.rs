//! Source parameterisation.
//!
//! For every source in the catalogue this module measures, over the voxels
//! carrying the source's label: integrated and extreme fluxes, the
//! flux-weighted centroid, the local noise level (from the mask-free voxels
//! inside the same bounding box), statistical uncertainties, moment-map
//! ellipse fits, w20/w50 line widths, and the kinematic major axis. When a
//! valid WCS is present the centroid is also converted to world coordinates
//! and a source name is synthesised from them.
//!
//! Negative sources are measured on their inverted flux and the sign
//! restored on output, so all shape measurements behave identically for
//! emission and absorption.

use anyhow::{ensure, Context, Result};
use ndarray::Array2;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::cube::Cube;
use crate::header::Header;
use crate::stats::{self, FluxRange, MAD_TO_STD};
use crate::wcs::{Wcs, WcsInfo};

/// Measure all derived parameters for every source in the catalogue and
/// update the catalogue entries in place.
pub fn parameterise(
    data: &Cube,
    mask: &Cube,
    catalog: &mut Catalog,
    use_wcs: bool,
    physical: bool,
    prefix: &str,
) -> Result<()> {
    ensure!(
        data.dtype().is_float(),
        "parameterisation only possible with floating-point data"
    );
    ensure!(mask.as_i32().is_some(), "mask must be of 32-bit integer type");
    ensure!(data.same_shape(mask), "data cube and mask cube have different sizes");
    ensure!(!catalog.is_empty(), "no sources in catalogue; nothing to parameterise");

    info!("Found {} source(s) in need of parameterisation.", catalog.len());

    let info = WcsInfo::from_header(&data.header);
    let wcs = if use_wcs { Wcs::from_header(&data.header) } else { None };
    let physical = physical && info.supports_physical();

    if physical {
        info!("Attempting to measure parameters in physical units.");
    }

    for i in 0..catalog.len() {
        let src = catalog.get(i).expect("index in range");
        let src_id = src.get_par_int("id").context("source ID missing from catalogue")?;
        ensure!(src_id > 0, "source ID missing from catalogue; cannot parameterise");

        let n_pix = src.get_par_int("n_pix").unwrap_or(0) as usize;
        let x_min = src.get_par_int("x_min").context("x_min missing")? as usize;
        let x_max = src.get_par_int("x_max").context("x_max missing")? as usize;
        let y_min = src.get_par_int("y_min").context("y_min missing")? as usize;
        let y_max = src.get_par_int("y_max").context("y_max missing")? as usize;
        let z_min = src.get_par_int("z_min").context("z_min missing")? as usize;
        let z_max = src.get_par_int("z_max").context("z_max missing")? as usize;

        ensure!(
            x_min <= x_max && y_min <= y_max && z_min <= z_max,
            "illegal source bounding box: minimum exceeds maximum"
        );
        ensure!(
            x_max < data.nx() && y_max < data.ny() && z_max < data.nz(),
            "source bounding box outside data cube boundaries"
        );

        let nx = x_max - x_min + 1;
        let ny = y_max - y_min + 1;
        let nz = z_max - z_min + 1;

        let is_negative = src.get_par_flt("f_sum").unwrap_or(0.0) < 0.0;
        let sign = if is_negative { -1.0 } else { 1.0 };

        // First pass: fluxes, centroid, moment map, spectrum, background.
        let mut f_sum = 0.0;
        let mut f_min = f64::INFINITY;
        let mut f_max = f64::NEG_INFINITY;
        let mut pos_x = 0.0;
        let mut pos_y = 0.0;
        let mut pos_z = 0.0;
        let mut sum_pos = 0.0;

        let mut moment_map = Array2::<f64>::zeros((ny, nx));
        let mut count_map = Array2::<usize>::zeros((ny, nx));
        let mut spectrum = vec![0.0f64; nz];
        let mut background: Vec<f64> = Vec::new();

        for z in z_min..=z_max {
            for y in y_min..=y_max {
                for x in x_min..=x_max {
                    let id = mask.get_int(x, y, z);
                    let value = sign * data.get_flt(x, y, z);

                    if id == src_id {
                        f_sum += value;
                        f_min = f_min.min(value);
                        f_max = f_max.max(value);

                        moment_map[(y - y_min, x - x_min)] += value;
                        count_map[(y - y_min, x - x_min)] += 1;
                        spectrum[z - z_min] += value;

                        if value > 0.0 {
                            pos_x += value * x as f64;
                            pos_y += value * y as f64;
                            pos_z += value * z as f64;
                            sum_pos += value;
                        }
                    } else if id == 0 {
                        background.push(value);
                    }
                }
            }
        }

        pos_x /= sum_pos;
        pos_y /= sum_pos;
        pos_z /= sum_pos;

        // Local noise from the non-source voxels of the bounding box.
        let mut rms = 0.0;
        if background.is_empty() {
            warn!("Failed to measure local noise level for source {src_id}.");
        } else {
            rms = MAD_TO_STD * stats::mad_val(&background, 0.0, 1, FluxRange::Full);
        }

        // Second pass: positional variances and per-channel centroids for
        // the kinematic axis (restricted to voxels above 3 sigma).
        let mut err_x = 0.0;
        let mut err_y = 0.0;
        let mut err_z = 0.0;
        let mut kpa_cen_x = vec![0.0f64; nz];
        let mut kpa_cen_y = vec![0.0f64; nz];
        let mut kpa_sum = vec![0.0f64; nz];
        let mut kpa_first = nz - 1;
        let mut kpa_last = 0usize;
        let mut kpa_counter = 0usize;

        for z in z_min..=z_max {
            for y in y_min..=y_max {
                for x in x_min..=x_max {
                    if mask.get_int(x, y, z) != src_id {
                        continue;
                    }

                    let value = sign * data.get_flt(x, y, z);

                    if value > 0.0 {
                        err_x += (x as f64 - pos_x) * (x as f64 - pos_x);
                        err_y += (y as f64 - pos_y) * (y as f64 - pos_y);
                        err_z += (z as f64 - pos_z) * (z as f64 - pos_z);
                    }

                    if value > 3.0 * rms {
                        kpa_cen_x[z - z_min] += value * x as f64;
                        kpa_cen_y[z - z_min] += value * y as f64;
                        kpa_sum[z - z_min] += value;
                    }
                }
            }

            if kpa_sum[z - z_min] > 0.0 {
                kpa_cen_x[z - z_min] /= kpa_sum[z - z_min];
                kpa_cen_y[z - z_min] /= kpa_sum[z - z_min];
                kpa_counter += 1;
                kpa_first = kpa_first.min(z - z_min);
                kpa_last = kpa_last.max(z - z_min);
            }
        }

        let kin_pa = if kpa_counter < 2 {
            warn!("Failed to determine kinematic major axis for source {src_id}: emission too faint.");
            -1.0
        } else {
            if kpa_counter == 2 {
                warn!("Kinematic major axis for source {src_id} based on just 2 data points.");
            }
            stats::kin_maj_axis(&kpa_cen_x, &kpa_cen_y, &kpa_sum, kpa_first, kpa_last)
        };

        let fit = stats::moment_ellipse_fit(
            &moment_map,
            &count_map,
            pos_x - x_min as f64,
            pos_y - y_min as f64,
            rms,
        );

        let (w20, w50) = stats::spectral_line_width(&spectrum);

        let err_x = err_x.sqrt() * rms / sum_pos;
        let err_y = err_y.sqrt() * rms / sum_pos;
        let err_z = err_z.sqrt() * rms / sum_pos;
        let err_f_sum = rms * (n_pix as f64).sqrt();

        // WCS conversion and source name.
        let mut longitude = 0.0;
        let mut latitude = 0.0;
        let mut spectral = 0.0;
        let source_name = match &wcs {
            Some(wcs) => {
                let (lon, lat, spec) = wcs.pixel_to_world(pos_x, pos_y, pos_z);
                longitude = lon;
                latitude = lat;
                spectral = spec;
                create_source_name(&data.header, prefix, lon, lat, &info.label_lon)
            }
            None => format!("{prefix}-{src_id:04}"),
        };

        // Restore the sign convention for negative sources.
        let (f_min, f_max, f_sum) = if is_negative {
            (-f_max, -f_min, -f_sum)
        } else {
            (f_min, f_max, f_sum)
        };

        let src = catalog.get_mut(i).expect("index in range");
        src.set_identifier(&source_name);
        src.set_par_flt("x", pos_x, Some("pix"), Some("pos.cartesian.x"));
        src.set_par_flt("y", pos_y, Some("pix"), Some("pos.cartesian.y"));
        src.set_par_flt("z", pos_z, Some("pix"), Some("pos.cartesian.z"));
        src.set_par_flt("rms", rms, Some(&info.unit_flux_dens), Some("instr.det.noise"));
        src.set_par_flt(
            "f_min",
            f_min,
            Some(&info.unit_flux_dens),
            Some("phot.flux.density;stat.min"),
        );
        src.set_par_flt(
            "f_max",
            f_max,
            Some(&info.unit_flux_dens),
            Some("phot.flux.density;stat.max"),
        );

        if physical {
            src.set_par_flt(
                "f_sum",
                f_sum * info.chan_size / info.beam_area,
                Some(&info.unit_flux),
                Some("phot.flux"),
            );
            src.set_par_flt("w20", w20 * info.chan_size, Some(&info.unit_spec), Some("spect.line.width"));
            src.set_par_flt("w50", w50 * info.chan_size, Some(&info.unit_spec), Some("spect.line.width"));
        } else {
            src.set_par_flt("f_sum", f_sum, Some(&info.unit_flux_dens), Some("phot.flux"));
            src.set_par_flt("w20", w20, Some("pix"), Some("spect.line.width"));
            src.set_par_flt("w50", w50, Some("pix"), Some("spect.line.width"));
        }

        src.set_par_flt("ell_maj", fit.ell_maj, Some("pix"), Some("phys.angSize"));
        src.set_par_flt("ell_min", fit.ell_min, Some("pix"), Some("phys.angSize"));
        src.set_par_flt("ell_pa", fit.ell_pa, Some("deg"), Some("pos.posAng"));
        src.set_par_flt("ell3s_maj", fit.ell3s_maj, Some("pix"), Some("phys.angSize"));
        src.set_par_flt("ell3s_min", fit.ell3s_min, Some("pix"), Some("phys.angSize"));
        src.set_par_flt("ell3s_pa", fit.ell3s_pa, Some("deg"), Some("pos.posAng"));
        src.set_par_flt("kin_pa", kin_pa, Some("deg"), Some("pos.posAng"));

        if physical {
            let beam_root = info.beam_area.sqrt();
            src.set_par_flt("err_x", err_x * beam_root, Some("pix"), Some("stat.error;pos.cartesian.x"));
            src.set_par_flt("err_y", err_y * beam_root, Some("pix"), Some("stat.error;pos.cartesian.y"));
            src.set_par_flt("err_z", err_z * beam_root, Some("pix"), Some("stat.error;pos.cartesian.z"));
            src.set_par_flt(
                "err_f_sum",
                err_f_sum * info.chan_size / beam_root,
                Some(&info.unit_flux),
                Some("stat.error;phot.flux"),
            );
        } else {
            src.set_par_flt("err_x", err_x, Some("pix"), Some("stat.error;pos.cartesian.x"));
            src.set_par_flt("err_y", err_y, Some("pix"), Some("stat.error;pos.cartesian.y"));
            src.set_par_flt("err_z", err_z, Some("pix"), Some("stat.error;pos.cartesian.z"));
            src.set_par_flt(
                "err_f_sum",
                err_f_sum,
                Some(&info.unit_flux_dens),
                Some("stat.error;phot.flux"),
            );
        }

        if wcs.is_some() {
            let label_lon = info.label_lon.clone();
            let label_lat = info.label_lat.clone();
            let label_spec = info.label_spec.clone();
            src.set_par_flt(&label_lon, longitude, Some(&info.unit_lon), Some(&info.ucd_lon));
            src.set_par_flt(&label_lat, latitude, Some(&info.unit_lat), Some(&info.ucd_lat));
            src.set_par_flt(&label_spec, spectral, Some(&info.unit_spec), Some(&info.ucd_spec));
        }
    }

    Ok(())
}

/// Synthesise a source name from its world coordinates.
///
/// Equatorial positions become `prefix (J|B)hhmmss.ss±ddmmss.s`, Besselian
/// when the equinox predates 2000. The `WALLABY` prefix selects the survey's
/// truncated `Jhhmmss±ddmmss` convention. Galactic positions become
/// `prefix Glll.llll±dd.dddd`; anything else drops the letter.
pub fn create_source_name(
    header: &Header,
    prefix: &str,
    longitude: f64,
    latitude: f64,
    label_lon: &str,
) -> String {
    let prefix = if prefix.is_empty() { "SoFiA" } else { prefix };
    let mut name = format!("{prefix} ");

    if label_lon == "ra" {
        let mut equinox = header.get_flt("EQUINOX");
        if equinox.is_nan() {
            equinox = header.get_flt("EPOCH");
        }

        // Julian equinox is the default; Besselian assumed before 2000.
        name.push(if equinox < 2000.0 { 'B' } else { 'J' });

        let ra = longitude / 15.0;
        let rah = ra.floor();
        let ram = (60.0 * (ra - rah)).floor();
        let ras = 3600.0 * (ra - rah - ram / 60.0);

        let de = latitude.abs();
        let ded = de.floor();
        let dem = (60.0 * (de - ded)).floor();
        let des = 3600.0 * (de - ded - dem / 60.0);

        let truncated = prefix == "WALLABY";

        name.push_str(&format!("{:02}{:02}", rah as i32, ram as i32));
        if truncated {
            name.push_str(&format!("{:02}", ras as i32));
        } else {
            name.push_str(&format!("{ras:05.2}"));
        }

        name.push(if latitude < 0.0 { '-' } else { '+' });
        name.push_str(&format!("{:02}{:02}", ded as i32, dem as i32));
        if truncated {
            name.push_str(&format!("{:02}", des as i32));
        } else {
            name.push_str(&format!("{des:04.1}"));
        }
    } else if label_lon == "l" {
        name.push('G');
        name.push_str(&format!("{longitude:08.4}"));
        name.push(if latitude < 0.0 { '-' } else { '+' });
        name.push_str(&format!("{:07.4}", latitude.abs()));
    } else {
        name.push_str(&format!("{longitude:08.4}"));
        name.push(if latitude < 0.0 { '-' } else { '+' });
        name.push_str(&format!("{:07.4}", latitude.abs()));
    }

    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::DataType;
    use crate::linker::{run_linker, LinkerSettings};

    fn gaussian_blob_cube(n: usize) -> (Cube, Cube, Catalog) {
        let mut data = Cube::blank(n, n, n, DataType::F32);
        let mut mask = Cube::blank(n, n, n, DataType::I32);
        let c = n as f64 / 2.0 - 0.5;

        for z in 0..n {
            for y in 0..n {
                for x in 0..n {
                    let r2 = (x as f64 - c).powi(2) + (y as f64 - c).powi(2) + (z as f64 - c).powi(2);
                    let value = 10.0 * (-r2 / 8.0).exp();
                    data.set_flt(x, y, z, value);

                    if value > 1.0 {
                        mask.set_int(x, y, z, 1);
                    }
                }
            }
        }

        let settings = LinkerSettings {
            min_size_x: 2,
            min_size_y: 2,
            min_size_z: 2,
            ..LinkerSettings::default()
        };

        let lpar = run_linker(&data, &mut mask, &settings).unwrap();
        let catalog = lpar.make_catalog("Jy/beam");
        (data, mask, catalog)
    }

    #[test]
    fn centroid_lands_on_blob_centre() {
        let (data, mask, mut catalog) = gaussian_blob_cube(32);

        parameterise(&data, &mask, &mut catalog, false, false, "SoFiA").unwrap();

        let src = catalog.get(0).unwrap();
        let x = src.get_par_flt("x").unwrap();
        let y = src.get_par_flt("y").unwrap();
        let z = src.get_par_flt("z").unwrap();

        assert!((x - 15.5).abs() < 0.5, "x = {x}");
        assert!((y - 15.5).abs() < 0.5, "y = {y}");
        assert!((z - 15.5).abs() < 0.5, "z = {z}");
        assert!(src.get_par_flt("f_sum").unwrap() > 0.0);

        // Without WCS the identifier falls back to prefix-NNNN.
        assert_eq!(src.identifier(), "SoFiA-0001");
    }

    #[test]
    fn round_source_has_equal_axes() {
        let (data, mask, mut catalog) = gaussian_blob_cube(32);
        parameterise(&data, &mask, &mut catalog, false, false, "SoFiA").unwrap();

        let src = catalog.get(0).unwrap();
        let maj = src.get_par_flt("ell_maj").unwrap();
        let min = src.get_par_flt("ell_min").unwrap();

        assert!(maj > 0.0);
        assert!((maj - min).abs() < 0.2 * maj, "maj = {maj}, min = {min}");

        // A spherical source has line widths too.
        assert!(src.get_par_flt("w50").unwrap() > 0.0);
        assert!(src.get_par_flt("w20").unwrap() >= src.get_par_flt("w50").unwrap());
    }

    #[test]
    fn negative_source_fluxes_are_inverted_on_output() {
        let (mut data, mask, mut catalog) = gaussian_blob_cube(24);

        data.multiply_const(-1.0).unwrap();
        for src in catalog.iter_mut() {
            let f = src.get_par_flt("f_sum").unwrap();
            src.set_par_flt("f_sum", -f, None, None);
        }

        parameterise(&data, &mask, &mut catalog, false, false, "SoFiA").unwrap();

        let src = catalog.get(0).unwrap();
        assert!(src.get_par_flt("f_sum").unwrap() < 0.0);
        assert!(src.get_par_flt("f_min").unwrap() < 0.0);
        assert!(src.get_par_flt("f_max").unwrap() <= 0.0);
    }

    #[test]
    fn equatorial_name_synthesis() {
        let mut header = Header::new(-32, &[4, 4, 4]);
        header.set_flt("EQUINOX", 2000.0);

        // RA 12h34m56.7s = 188.73625 deg, Dec -1d02m03.4s.
        let ra = (12.0 + 34.0 / 60.0 + 56.7 / 3600.0) * 15.0;
        let dec = -(1.0 + 2.0 / 60.0 + 3.4 / 3600.0);

        let name = create_source_name(&header, "SoFiA", ra, dec, "ra");
        assert_eq!(name, "SoFiA J123456.70-010203.4");

        // WALLABY truncates the seconds.
        let name = create_source_name(&header, "WALLABY", ra, dec, "ra");
        assert_eq!(name, "WALLABY J123456-010203");

        // Pre-2000 equinox switches to Besselian.
        header.set_flt("EQUINOX", 1950.0);
        let name = create_source_name(&header, "SoFiA", ra, dec, "ra");
        assert!(name.starts_with("SoFiA B"));
    }

    #[test]
    fn galactic_name_synthesis() {
        let header = Header::new(-32, &[4, 4, 4]);
        let name = create_source_name(&header, "SoFiA", 123.4567, -2.3456, "l");
        assert_eq!(name, "SoFiA G123.4567-02.3456");
    }
}
