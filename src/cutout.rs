//! Per-source data products: moment maps, cubelets and spectra.
//!
//! For each retained source this module cuts the data and mask cubes down
//! to the source's bounding box (plus an optional margin), derives moment
//! maps and an integrated spectrum from the masked voxels, and writes the
//! lot to disk as FITS files and a whitespace-separated spectrum table. The
//! same moment-map machinery also produces the global maps of the full
//! cube, and the global label mask can be flattened into a 2-D image.

use anyhow::{ensure, Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::cube::{Cube, DataType};
use crate::fits;
use crate::wcs::{beam_area, Wcs};

/// Moment maps derived from a masked cube. Moments 1 and 2 and the channel
/// count map only exist for cubes with more than one channel.
pub struct Moments {
    pub mom0: Cube,
    pub mom1: Option<Cube>,
    pub mom2: Option<Cube>,
    pub chan: Option<Cube>,
}

/// Create moment maps from all voxels with a non-zero mask value. With
/// `use_wcs` the spectral axis is converted to world coordinates and the
/// moment-0 map scaled by the channel width; channel numbers are used
/// otherwise. With `positive` only positive fluxes contribute to moments 1
/// and 2, which stops large negative noise excursions from corrupting the
/// velocity field.
pub fn create_moments(
    data: &Cube,
    mask: &Cube,
    obj_name: Option<&str>,
    use_wcs: bool,
    positive: bool,
) -> Result<Moments> {
    ensure!(
        data.dtype().is_float(),
        "moment maps only possible with floating-point data"
    );
    ensure!(data.same_shape(mask), "data cube and mask cube have different sizes");

    let (nx, ny, nz) = (data.nx(), data.ny(), data.nz());
    let is_3d = nz > 1;

    if !is_3d {
        warn!("Image is not 3D; moments 1 and 2 will not be created.");
    }

    let wcs = if use_wcs && is_3d { Wcs::from_header(&data.header) } else { None };

    // Flux unit bookkeeping for the map headers.
    let mut unit_flux_dens = data.header.get_str("BUNIT").trim().to_owned();
    if unit_flux_dens == "JY/BEAM" || unit_flux_dens == "Jy/Beam" {
        unit_flux_dens = "Jy/beam".to_owned();
    }

    let mut unit_spec = data.header.get_str("CUNIT3").trim().to_owned();
    if unit_spec.is_empty() && is_3d {
        if data.header.value_starts_with("CTYPE3", "FREQ") {
            unit_spec = "Hz".to_owned();
        } else if ["VRAD", "VOPT", "VELO", "FELO"]
            .iter()
            .any(|t| data.header.value_starts_with("CTYPE3", t))
        {
            unit_spec = "m/s".to_owned();
        } else {
            warn!("Unsupported CTYPE3 value. Supported: FREQ, VRAD, VOPT, VELO.");
        }
    }

    let mut mom0 = Cube::blank(nx, ny, 1, DataType::F32);
    data.header.copy_wcs(&mut mom0.header);
    data.header.copy_misc(&mut mom0.header, true, true);

    if wcs.is_some() {
        mom0.header.set_str("BUNIT", &format!("{unit_flux_dens}*{unit_spec}"));
    }

    if let Some(name) = obj_name {
        mom0.header.set_str("OBJECT", name);
    }

    if !is_3d {
        // A single-plane cube only gets a moment-0 map.
        for y in 0..ny {
            for x in 0..nx {
                if mask.get_int(x, y, 0) != 0 {
                    mom0.add_flt(x, y, 0, data.get_flt(x, y, 0));
                }
            }
        }

        return Ok(Moments {
            mom0,
            mom1: None,
            mom2: None,
            chan: None,
        });
    }

    let mut mom1 = mom0.clone();
    let mut mom2 = mom0.clone();
    let mut sum_pos = mom0.clone();

    let mut chan = Cube::blank(nx, ny, 1, DataType::I32);
    data.header.copy_wcs(&mut chan.header);
    data.header.copy_misc(&mut chan.header, false, true);
    chan.header.set_str("BUNIT", " ");
    if let Some(name) = obj_name {
        chan.header.set_str("OBJECT", name);
    }

    mom1.header.set_str("BUNIT", if wcs.is_some() { unit_spec.as_str() } else { " " });
    mom2.header.set_str("BUNIT", if wcs.is_some() { unit_spec.as_str() } else { " " });

    // Moments 0 and 1 plus channel counts. Accumulation runs serially over
    // channels so repeated runs are bit-identical.
    for z in 0..nz {
        let spectral = match &wcs {
            Some(wcs) => wcs.spectral_value(z as f64),
            None => z as f64,
        };

        for y in 0..ny {
            for x in 0..nx {
                if mask.get_int(x, y, z) == 0 {
                    continue;
                }

                let flux = data.get_flt(x, y, z);
                mom0.add_flt(x, y, 0, flux);
                chan.add_int(x, y, 0, 1);

                if !positive || flux > 0.0 {
                    mom1.add_flt(x, y, 0, flux * spectral);
                    sum_pos.add_flt(x, y, 0, flux);
                }
            }
        }
    }

    // Normalise moment 1 by the summed flux.
    for y in 0..ny {
        for x in 0..nx {
            let flux = sum_pos.get_flt(x, y, 0);

            if flux > 0.0 {
                let value = mom1.get_flt(x, y, 0) / flux;
                mom1.set_flt(x, y, 0, value);
            } else {
                mom1.set_flt(x, y, 0, f64::NAN);
            }
        }
    }

    // Moment 2 about the moment-1 velocity.
    for z in 0..nz {
        let spectral = match &wcs {
            Some(wcs) => wcs.spectral_value(z as f64),
            None => z as f64,
        };

        for y in 0..ny {
            for x in 0..nx {
                if mask.get_int(x, y, z) == 0 {
                    continue;
                }

                let flux = data.get_flt(x, y, z);

                if !positive || flux > 0.0 {
                    let velo = mom1.get_flt(x, y, 0) - spectral;
                    mom2.add_flt(x, y, 0, velo * velo * flux);
                }
            }
        }
    }

    for y in 0..ny {
        for x in 0..nx {
            let flux = sum_pos.get_flt(x, y, 0);
            let sigma = mom2.get_flt(x, y, 0);

            if flux > 0.0 && sigma > 0.0 {
                mom2.set_flt(x, y, 0, (sigma / flux).sqrt());
            } else {
                mom2.set_flt(x, y, 0, f64::NAN);
            }
        }
    }

    if wcs.is_some() {
        let chan_width = data.header.get_flt("CDELT3").abs();
        if !chan_width.is_nan() {
            mom0.multiply_const(chan_width)?;
        }
    }

    Ok(Moments {
        mom0,
        mom1: Some(mom1),
        mom2: Some(mom2),
        chan: Some(chan),
    })
}

/// Flatten a 3-D label mask onto the spatial plane: each pixel takes the
/// label of its highest non-zero channel.
pub fn mask_2d(mask: &Cube) -> Cube {
    let (nx, ny, nz) = (mask.nx(), mask.ny(), mask.nz());
    let mut image = Cube::blank(nx, ny, 1, mask.dtype());

    mask.header.copy_wcs(&mut image.header);
    mask.header.copy_misc(&mut image.header, true, true);

    for y in 0..ny {
        for x in 0..nx {
            for z in (0..nz).rev() {
                let value = mask.get_int(x, y, z);

                if value != 0 {
                    image.set_int(x, y, 0, value);
                    break;
                }
            }
        }
    }

    image
}

/// Write cubelets, masklets, moment maps and integrated spectra for every
/// source in the catalogue. File names follow
/// `{base}_{id}_{cube,mask,mom0,mom1,mom2,chan}.fits` and
/// `{base}_{id}_spec.txt`.
#[allow(clippy::too_many_arguments)]
pub fn create_cubelets(
    data: &Cube,
    mask: &Cube,
    catalog: &Catalog,
    basename: &str,
    overwrite: bool,
    use_wcs: bool,
    physical: bool,
    margin: usize,
) -> Result<()> {
    ensure!(
        data.dtype().is_float(),
        "cubelets only possible with floating-point data"
    );
    ensure!(data.same_shape(mask), "data cube and mask cube have different sizes");
    ensure!(!catalog.is_empty(), "empty source catalogue provided");

    let wcs = if use_wcs { Wcs::from_header(&data.header) } else { None };

    // Flux unit and beam correction.
    let mut unit_flux = data.header.get_str("BUNIT").trim().to_owned();
    if unit_flux.is_empty() {
        warn!("No flux unit (BUNIT) defined in header.");
        unit_flux = "???".to_owned();
    }
    if unit_flux == "JY/BEAM" || unit_flux == "Jy/Beam" {
        unit_flux = "Jy/beam".to_owned();
    }

    let mut beam = 1.0;
    if physical && unit_flux == "Jy/beam" {
        let area = beam_area(&data.header);
        if !area.is_nan() {
            beam = area;
            unit_flux = "Jy".to_owned();
        }
    }

    // Spectral axis labelling for the spectrum files.
    let mut label_spec = data.header.get_str("CTYPE3");
    let mut unit_spec = data.header.get_str("CUNIT3").trim().to_owned();

    if unit_spec.is_empty() {
        if data.header.value_starts_with("CTYPE3", "FREQ") {
            label_spec = "Frequency".to_owned();
            unit_spec = "Hz".to_owned();
        } else if ["VRAD", "VOPT", "VELO", "FELO"]
            .iter()
            .any(|t| data.header.value_starts_with("CTYPE3", t))
        {
            label_spec = "Velocity".to_owned();
            unit_spec = "m/s".to_owned();
        } else {
            warn!("Unsupported CTYPE3 value. Supported: FREQ, VRAD, VOPT, VELO.");
            unit_spec = "???".to_owned();
        }
    }

    for src in catalog.iter() {
        let src_id = src.get_par_int("id").context("source ID missing from catalogue")?;
        ensure!(src_id > 0, "source ID missing from catalogue; cannot create cubelets");

        let mut x_min = src.get_par_int("x_min").context("x_min missing")? as usize;
        let mut x_max = src.get_par_int("x_max").context("x_max missing")? as usize;
        let mut y_min = src.get_par_int("y_min").context("y_min missing")? as usize;
        let mut y_max = src.get_par_int("y_max").context("y_max missing")? as usize;
        let mut z_min = src.get_par_int("z_min").context("z_min missing")? as usize;
        let mut z_max = src.get_par_int("z_max").context("z_max missing")? as usize;

        ensure!(
            x_min <= x_max && y_min <= y_max && z_min <= z_max,
            "illegal source bounding box: minimum exceeds maximum"
        );
        ensure!(
            x_max < data.nx() && y_max < data.ny() && z_max < data.nz(),
            "source bounding box outside data cube boundaries"
        );

        if margin > 0 {
            x_min = x_min.saturating_sub(margin);
            y_min = y_min.saturating_sub(margin);
            z_min = z_min.saturating_sub(margin);
            x_max = (x_max + margin).min(data.nx() - 1);
            y_max = (y_max + margin).min(data.ny() - 1);
            z_max = (z_max + margin).min(data.nz() - 1);
        }

        let nx = x_max - x_min + 1;
        let ny = y_max - y_min + 1;
        let nz = z_max - z_min + 1;

        // Cut out the data and per-source mask, shifting the WCS reference.
        let mut cubelet = Cube::blank(nx, ny, nz, data.dtype());
        data.header.copy_wcs(&mut cubelet.header);
        cubelet.header.adjust_wcs_to_subregion(x_min, y_min, z_min);
        data.header.copy_misc(&mut cubelet.header, true, true);
        cubelet.header.set_str("OBJECT", src.identifier());

        let mut masklet = Cube::blank(nx, ny, nz, DataType::U8);
        data.header.copy_wcs(&mut masklet.header);
        masklet.header.adjust_wcs_to_subregion(x_min, y_min, z_min);
        masklet.header.set_str("BUNIT", " ");
        masklet.header.set_str("OBJECT", src.identifier());

        let mut spectrum = vec![0.0f64; nz];
        let mut pixcount = vec![0usize; nz];

        for z in z_min..=z_max {
            for y in y_min..=y_max {
                for x in x_min..=x_max {
                    let value = data.get_flt(x, y, z);
                    cubelet.set_flt(x - x_min, y - y_min, z - z_min, value);

                    if mask.get_int(x, y, z) == src_id {
                        masklet.set_int(x - x_min, y - y_min, z - z_min, 1);
                        spectrum[z - z_min] += value;
                        pixcount[z - z_min] += 1;
                    }
                }
            }
        }

        let moments = create_moments(&cubelet, &masklet, Some(src.identifier()), use_wcs, false)?;

        let file = |suffix: &str| format!("{basename}_{src_id}_{suffix}");

        fits::write_cube(&cubelet, Path::new(&file("cube.fits")), overwrite)?;
        fits::write_cube(&masklet, Path::new(&file("mask.fits")), overwrite)?;
        fits::write_cube(&moments.mom0, Path::new(&file("mom0.fits")), overwrite)?;

        if let Some(mom1) = &moments.mom1 {
            fits::write_cube(mom1, Path::new(&file("mom1.fits")), overwrite)?;
        }

        if let Some(mom2) = &moments.mom2 {
            fits::write_cube(mom2, Path::new(&file("mom2.fits")), overwrite)?;
        }

        if let Some(chan) = &moments.chan {
            fits::write_cube(chan, Path::new(&file("chan.fits")), overwrite)?;
        }

        let spec_path = file("spec.txt");
        info!("Creating text file {spec_path}.");
        write_spectrum(
            Path::new(&spec_path),
            overwrite,
            wcs.as_ref(),
            &label_spec,
            &unit_spec,
            &unit_flux,
            z_min,
            &spectrum,
            &pixcount,
            beam,
        )?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_spectrum(
    path: &Path,
    overwrite: bool,
    wcs: Option<&Wcs>,
    label_spec: &str,
    unit_spec: &str,
    unit_flux: &str,
    z_min: usize,
    spectrum: &[f64],
    pixcount: &[usize],
    beam: f64,
) -> Result<()> {
    if !overwrite && path.exists() {
        anyhow::bail!("output file {} already exists", path.display());
    }

    let mut out = String::new();
    out.push_str("# Integrated source spectrum\n");
    out.push_str(concat!("# Creator: cubefind ", env!("CARGO_PKG_VERSION"), "\n"));
    out.push_str("#\n# Description of columns:\n#\n");
    out.push_str("# - Channel       Spectral channel number.\n#\n");
    out.push_str("# - Spectral      Spectral coordinate corresponding to the channel number\n");
    out.push_str("#                 as described by the WCS information in the header.\n#\n");
    out.push_str("# - Flux density  Sum of flux density values of all spatial pixels covered\n");
    out.push_str("#                 by the source in that channel. If the unit is Jy, the\n");
    out.push_str("#                 flux density has already been corrected for the solid\n");
    out.push_str("#                 angle of the beam.\n#\n");
    out.push_str("# - Pixels        Number of spatial pixels covered by the source in that\n");
    out.push_str("#                 channel.\n#\n");
    out.push_str("# Note that the spectral column is only present if WCS conversion was\n");
    out.push_str("# explicitly requested when running the pipeline.\n#\n#\n");

    if wcs.is_some() {
        let _ = writeln!(out, "#{:>9}{:>18}{:>18}{:>10}", "Channel", label_spec, "Flux density", "Pixels");
        let _ = writeln!(out, "#{:>9}{:>18}{:>18}{:>10}", "-", unit_spec, unit_flux, "-");
    } else {
        let _ = writeln!(out, "#{:>9}{:>18}{:>10}", "Channel", "Flux density", "Pixels");
        let _ = writeln!(out, "#{:>9}{:>18}{:>10}", "-", unit_flux, "-");
    }
    out.push_str("#\n");

    for (j, (&flux, &count)) in spectrum.iter().zip(pixcount.iter()).enumerate() {
        let channel = j + z_min;

        match wcs {
            Some(wcs) => {
                let spectral = wcs.spectral_value(channel as f64);
                let _ = writeln!(
                    out,
                    "{:>10}{:>18.7e}{:>18.7e}{:>10}",
                    channel,
                    spectral,
                    flux / beam,
                    count
                );
            }
            None => {
                let _ = writeln!(out, "{:>10}{:>18.7e}{:>10}", channel, flux / beam, count);
            }
        }
    }

    std::fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::{run_linker, LinkerSettings};

    fn masked_cube() -> (Cube, Cube, Catalog) {
        let mut data = Cube::blank(10, 10, 6, DataType::F32);
        let mut mask = Cube::blank(10, 10, 6, DataType::I32);

        for z in 2..5 {
            for y in 3..7 {
                for x in 3..7 {
                    data.set_flt(x, y, z, (z - 1) as f64);
                    mask.set_int(x, y, z, 1);
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
    fn moment_maps_accumulate_flux() {
        let (data, mask, _) = masked_cube();
        let moments = create_moments(&data, &mask, Some("test"), false, false).unwrap();

        // Inside the source footprint: flux 1 + 2 + 3 over three channels.
        assert_eq!(moments.mom0.get_flt(4, 4, 0), 6.0);
        assert_eq!(moments.mom0.get_flt(0, 0, 0), 0.0);

        let chan = moments.chan.as_ref().unwrap();
        assert_eq!(chan.get_int(4, 4, 0), 3);
        assert_eq!(chan.get_int(0, 0, 0), 0);

        // Moment 1 is the flux-weighted mean channel: (2 + 6 + 12) / 6.
        let mom1 = moments.mom1.as_ref().unwrap();
        assert!((mom1.get_flt(4, 4, 0) - 20.0 / 6.0).abs() < 1e-6);
        assert!(mom1.get_flt(0, 0, 0).is_nan());

        assert_eq!(moments.mom0.header.get_str("OBJECT"), "test");
    }

    #[test]
    fn flat_mask_takes_highest_channel_label() {
        let mut mask = Cube::blank(4, 4, 3, DataType::I32);
        mask.set_int(1, 1, 0, 1);
        mask.set_int(1, 1, 2, 2);
        mask.set_int(2, 2, 1, 3);

        let image = mask_2d(&mask);
        assert_eq!(image.nz(), 1);
        assert_eq!(image.get_int(1, 1, 0), 2);
        assert_eq!(image.get_int(2, 2, 0), 3);
        assert_eq!(image.get_int(0, 0, 0), 0);
    }

    #[test]
    fn cubelets_are_written_per_source() {
        let (data, mask, catalog) = masked_cube();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("test").to_str().unwrap().to_owned();

        create_cubelets(&data, &mask, &catalog, &base, true, false, false, 1).unwrap();

        for suffix in ["cube", "mask", "mom0", "mom1", "mom2", "chan"] {
            let path = dir.path().join(format!("test_1_{suffix}.fits"));
            assert!(path.exists(), "{suffix} missing");
        }

        let spec_path = dir.path().join("test_1_spec.txt");
        let text = std::fs::read_to_string(&spec_path).unwrap();
        assert!(text.starts_with("# Integrated source spectrum"));

        // With a margin of 1 the cubelet spans channels 1-5.
        let cubelet = fits::read_cube(&dir.path().join("test_1_cube.fits"), None).unwrap();
        assert_eq!(cubelet.nz(), 5);

        // The spectrum covers the margin channels too, with zero pixels
        // outside the source.
        let data_lines: Vec<&str> = text.lines().filter(|l| !l.starts_with('#') && !l.is_empty()).collect();
        assert_eq!(data_lines.len(), 5);
        assert!(data_lines[0].trim_start().starts_with('1'));
    }

    #[test]
    fn masklet_matches_source_footprint() {
        let (data, mask, catalog) = masked_cube();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("m").to_str().unwrap().to_owned();

        create_cubelets(&data, &mask, &catalog, &base, true, false, false, 0).unwrap();

        let masklet = fits::read_cube(&dir.path().join("m_1_mask.fits"), None).unwrap();
        assert_eq!((masklet.nx(), masklet.ny(), masklet.nz()), (4, 4, 3));
        assert_eq!(masklet.get_int(0, 0, 0), 1);
    }
}
