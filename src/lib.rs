//! cubefind: a source finder for 3-D spectral-line data cubes
//!
//! The pipeline takes a calibrated FITS cube and produces a catalogue of
//! detected sources plus per-source data products. The heavy lifting is a
//! chain of independent engines, each in its own module:
//!
//! 1. optional noise normalisation ([`noise`]),
//! 2. the multi-kernel Smooth+Clip finder ([`scfind`]) emitting an 8-bit
//!    detection mask,
//! 3. connected-component linking with anisotropic merging radii
//!    ([`linker`]) emitting a 32-bit label mask,
//! 4. flux-driven mask growing ([`dilation`]),
//! 5. per-source parameterisation ([`params`]),
//! 6. catalogue and cut-out output ([`catalog`], [`cutout`]).
//!
//! [`Pipeline`] wires the stages together according to the parameter file;
//! everything is equally usable as a library.

use anyhow::{ensure, Context, Result};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use tracing::info;

pub mod catalog;
pub mod config;
pub mod cube;
pub mod cutout;
pub mod dilation;
pub mod fits;
pub mod header;
pub mod linker;
pub mod noise;
pub mod params;
pub mod scfind;
pub mod source;
pub mod stats;
pub mod wcs;

use crate::catalog::CatalogFormat;
use crate::config::Parameters;
use crate::cube::{Cube, DataType};
use crate::noise::ScaleNoiseMode;

/// Initialise the global log subscriber. Safe to call more than once; only
/// the first call takes effect, which keeps tests and library consumers
/// from tripping over each other.
pub fn init_logging(quiet: bool) {
    static INIT: OnceCell<()> = OnceCell::new();

    INIT.get_or_init(|| {
        let default = if quiet { "warn" } else { "info" };

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
            )
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    });
}

/// The full detection pipeline, driven by a [`Parameters`] set.
pub struct Pipeline {
    par: Parameters,
}

impl Pipeline {
    pub fn new(par: Parameters) -> Self {
        Pipeline { par }
    }

    /// Run every configured stage. On success all requested output products
    /// have been written.
    pub fn run(&self) -> Result<()> {
        let par = &self.par;
        ensure!(
            !par.input.data.as_os_str().is_empty(),
            "no input cube given; set input.data or pass --input"
        );

        let region = par.region()?;
        let base: PathBuf = par.output_base()?;
        let base_str = base.to_string_lossy().into_owned();
        let overwrite = par.output.overwrite;

        // Load the data cube.
        let mut data = fits::read_cube(&par.input.data, region)?;
        ensure!(
            data.dtype().is_float(),
            "input cube must be of floating-point type (integer cubes are only \
             supported with BSCALE/BZERO rescaling)"
        );

        // Optional noise normalisation of the input cube.
        match par.scale_noise_mode()? {
            ScaleNoiseMode::None => {}
            ScaleNoiseMode::Spectral => {
                noise::scale_noise_spec(
                    &mut data,
                    config::parse_statistic(&par.scale_noise.statistic)?,
                    config::parse_flux_range(&par.scale_noise.flux_range)?,
                )?;
            }
            ScaleNoiseMode::Local => {
                let noise_cube = noise::scale_noise_local(
                    &mut data,
                    config::parse_statistic(&par.scale_noise.statistic)?,
                    config::parse_flux_range(&par.scale_noise.flux_range)?,
                    par.local_noise_settings(),
                )?;

                if par.output.write_noise {
                    fits::write_cube(
                        &noise_cube,
                        &PathBuf::from(format!("{base_str}_noise.fits")),
                        overwrite,
                    )?;
                }
            }
        }

        // Detection: S+C finder and/or the plain threshold finder.
        ensure!(
            par.scfind.enable || par.threshold.enable,
            "no source finder enabled; enable scfind or threshold"
        );

        let mut mask8 = Cube::blank(data.nx(), data.ny(), data.nz(), DataType::U8);

        if par.scfind.enable {
            scfind::run_scfind(&data, &mut mask8, &par.scfind_settings()?)?;
        }

        if par.threshold.enable {
            scfind::run_threshold(
                &data,
                &mut mask8,
                par.threshold.absolute,
                par.threshold.value,
                config::parse_statistic(&par.threshold.statistic)?,
                config::parse_flux_range(&par.threshold.flux_range)?,
            )?;
        }

        // Linking.
        let mut mask = Cube::blank(data.nx(), data.ny(), data.nz(), DataType::I32);
        data.header.copy_wcs(&mut mask.header);
        let detected = mask.copy_mask_8_to_32(&mask8, -1)?;
        drop(mask8);

        info!("{detected} voxel(s) detected by the finder.");

        let lpar = linker::run_linker(&data, &mut mask, &par.linker_settings())?;
        let flux_unit = data.header.get_str("BUNIT");
        let mut sources = lpar.make_catalog(&flux_unit);

        if sources.is_empty() {
            info!("No sources left after linking; no catalogue will be written.");

            if par.output.write_mask {
                self.write_masks(&mask, &base_str, overwrite)?;
            }

            return Ok(());
        }

        // Mask growing.
        if par.dilation.enable {
            if par.dilation.iterations_xy > 0 {
                dilation::dilate_mask_xy(
                    &data,
                    &mut mask,
                    &mut sources,
                    par.dilation.iterations_xy,
                    par.dilation.threshold,
                )?;
            }

            if par.dilation.iterations_z > 0 {
                dilation::dilate_mask_z(
                    &data,
                    &mut mask,
                    &mut sources,
                    par.dilation.iterations_z,
                    par.dilation.threshold,
                )?;
            }
        }

        // Parameterisation.
        params::parameterise(
            &data,
            &mask,
            &mut sources,
            par.parameter.wcs,
            par.parameter.physical,
            &par.parameter.prefix,
        )?;

        // Sub-region reads report coordinates relative to the full cube.
        if let Some([x_min, _, y_min, _, z_min, _]) = region {
            for src in sources.iter_mut() {
                src.offset_xyz(x_min, y_min, z_min);
            }
        }

        // Output products.
        if par.output.write_catalog {
            for format in par.catalog_formats()? {
                let extension = match format {
                    CatalogFormat::Ascii => "txt",
                    CatalogFormat::Xml => "xml",
                    CatalogFormat::Sql => "sql",
                };
                let path = PathBuf::from(format!("{base_str}_cat.{extension}"));
                sources.save(&path, format, overwrite)?;
            }
        }

        if par.output.write_mask {
            self.write_masks(&mask, &base_str, overwrite)?;
        }

        if par.output.write_moments {
            let moments =
                cutout::create_moments(&data, &mask, None, par.parameter.wcs, false)?;
            fits::write_cube(&moments.mom0, &PathBuf::from(format!("{base_str}_mom0.fits")), overwrite)?;

            if let Some(mom1) = &moments.mom1 {
                fits::write_cube(mom1, &PathBuf::from(format!("{base_str}_mom1.fits")), overwrite)?;
            }

            if let Some(mom2) = &moments.mom2 {
                fits::write_cube(mom2, &PathBuf::from(format!("{base_str}_mom2.fits")), overwrite)?;
            }

            if let Some(chan) = &moments.chan {
                fits::write_cube(chan, &PathBuf::from(format!("{base_str}_chan.fits")), overwrite)?;
            }
        }

        if par.output.write_cubelets {
            let cubelet_dir = PathBuf::from(format!("{base_str}_cubelets"));
            std::fs::create_dir_all(&cubelet_dir)
                .with_context(|| format!("failed to create {}", cubelet_dir.display()))?;

            let stem = base
                .file_name()
                .context("cannot derive a cubelet base name")?
                .to_string_lossy()
                .into_owned();
            let cubelet_base = cubelet_dir.join(stem).to_string_lossy().into_owned();

            cutout::create_cubelets(
                &data,
                &mask,
                &sources,
                &cubelet_base,
                overwrite,
                par.parameter.wcs,
                par.parameter.physical,
                par.output.margin_cubelets,
            )?;
        }

        info!("Pipeline finished.");
        Ok(())
    }

    fn write_masks(&self, mask: &Cube, base: &str, overwrite: bool) -> Result<()> {
        fits::write_cube(mask, &PathBuf::from(format!("{base}_mask.fits")), overwrite)?;

        let flat = cutout::mask_2d(mask);
        fits::write_cube(&flat, &PathBuf::from(format!("{base}_mask-2d.fits")), overwrite)?;
        Ok(())
    }
}
