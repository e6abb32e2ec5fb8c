//! Command-line options and the parameter file.
//!
//! All pipeline behaviour is driven by a TOML parameter file whose sections
//! mirror the pipeline stages (`[scfind]`, `[linker]`, `[dilation]`, ...).
//! Every option has a default, so an empty file runs the standard S+C
//! pipeline. A handful of common options can be overridden from the command
//! line without touching the file.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::catalog::CatalogFormat;
use crate::linker::LinkerSettings;
use crate::noise::{LocalNoiseSettings, ScaleNoiseMode};
use crate::scfind::{parse_kernels_flt, parse_kernels_int, ScfindSettings};
use crate::stats::{FluxRange, NoiseStatistic};

#[derive(Debug, Parser)]
#[command(name = "cubefind", about = "Source finder for 3-D spectral-line data cubes.")]
pub struct Opt {
    /// Parameter file (TOML). Optional; defaults apply without one.
    #[arg(value_parser)]
    pub parfile: Option<PathBuf>,

    #[arg(short, long)]
    /// Input data cube, overriding `input.data`.
    pub input: Option<PathBuf>,

    #[arg(short, long)]
    /// Output directory, overriding `output.directory`.
    pub output_directory: Option<PathBuf>,

    #[arg(long)]
    /// Detection threshold, overriding `scfind.threshold`.
    pub threshold: Option<f64>,

    #[arg(long)]
    /// Spatial kernels as a comma-separated FWHM list, e.g. `0,3,6`.
    pub kernels_xy: Option<String>,

    #[arg(long)]
    /// Spectral kernels as a comma-separated list of odd widths, e.g. `0,3,7`.
    pub kernels_z: Option<String>,

    #[arg(short, long)]
    /// Only print warnings and errors.
    pub quiet: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Parameters {
    pub input: InputOptions,
    #[serde(rename = "scaleNoise")]
    pub scale_noise: ScaleNoiseOptions,
    pub scfind: ScfindOptions,
    pub threshold: ThresholdOptions,
    pub linker: LinkerOptions,
    pub dilation: DilationOptions,
    pub parameter: ParameterOptions,
    pub output: OutputOptions,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputOptions {
    /// Path of the input FITS cube (plain or gzip).
    pub data: PathBuf,
    /// Optional sub-region `[x_min, x_max, y_min, y_max, z_min, z_max]`.
    pub region: Option<Vec<usize>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScaleNoiseOptions {
    /// `none`, `spectral` or `local`.
    pub mode: String,
    pub statistic: String,
    #[serde(rename = "fluxRange")]
    pub flux_range: String,
    #[serde(rename = "windowXY")]
    pub window_xy: usize,
    #[serde(rename = "windowZ")]
    pub window_z: usize,
    #[serde(rename = "gridXY")]
    pub grid_xy: usize,
    #[serde(rename = "gridZ")]
    pub grid_z: usize,
    pub interpolate: bool,
}

impl Default for ScaleNoiseOptions {
    fn default() -> Self {
        ScaleNoiseOptions {
            mode: "none".to_owned(),
            statistic: "mad".to_owned(),
            flux_range: "negative".to_owned(),
            window_xy: 25,
            window_z: 15,
            grid_xy: 0,
            grid_z: 0,
            interpolate: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScfindOptions {
    pub enable: bool,
    #[serde(rename = "kernelsXY")]
    pub kernels_xy: Vec<f64>,
    #[serde(rename = "kernelsZ")]
    pub kernels_z: Vec<usize>,
    pub threshold: f64,
    pub replacement: f64,
    pub statistic: String,
    #[serde(rename = "fluxRange")]
    pub flux_range: String,
}

impl Default for ScfindOptions {
    fn default() -> Self {
        ScfindOptions {
            enable: true,
            kernels_xy: vec![0.0, 3.0, 6.0],
            kernels_z: vec![0, 3, 7, 15],
            threshold: 5.0,
            replacement: 2.0,
            statistic: "mad".to_owned(),
            flux_range: "negative".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdOptions {
    pub enable: bool,
    pub value: f64,
    pub absolute: bool,
    pub statistic: String,
    #[serde(rename = "fluxRange")]
    pub flux_range: String,
}

impl Default for ThresholdOptions {
    fn default() -> Self {
        ThresholdOptions {
            enable: false,
            value: 5.0,
            absolute: false,
            statistic: "mad".to_owned(),
            flux_range: "negative".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkerOptions {
    #[serde(rename = "radiusXY")]
    pub radius_xy: usize,
    #[serde(rename = "radiusZ")]
    pub radius_z: usize,
    #[serde(rename = "minSizeXY")]
    pub min_size_xy: usize,
    #[serde(rename = "minSizeZ")]
    pub min_size_z: usize,
    #[serde(rename = "maxSizeXY")]
    pub max_size_xy: usize,
    #[serde(rename = "maxSizeZ")]
    pub max_size_z: usize,
    pub positivity: bool,
}

impl Default for LinkerOptions {
    fn default() -> Self {
        LinkerOptions {
            radius_xy: 1,
            radius_z: 1,
            min_size_xy: 5,
            min_size_z: 5,
            max_size_xy: 0,
            max_size_z: 0,
            positivity: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DilationOptions {
    pub enable: bool,
    #[serde(rename = "iterationsXY")]
    pub iterations_xy: usize,
    #[serde(rename = "iterationsZ")]
    pub iterations_z: usize,
    pub threshold: f64,
}

impl Default for DilationOptions {
    fn default() -> Self {
        DilationOptions {
            enable: false,
            iterations_xy: 10,
            iterations_z: 5,
            threshold: 0.001,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterOptions {
    pub wcs: bool,
    pub physical: bool,
    pub prefix: String,
}

impl Default for ParameterOptions {
    fn default() -> Self {
        ParameterOptions {
            wcs: true,
            physical: false,
            prefix: "SoFiA".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputOptions {
    pub directory: String,
    pub filename: String,
    /// Catalogue formats to write: `ascii`, `xml` (and reserved `sql`).
    pub format: Vec<String>,
    pub overwrite: bool,
    #[serde(rename = "writeCatalog")]
    pub write_catalog: bool,
    #[serde(rename = "writeMask")]
    pub write_mask: bool,
    #[serde(rename = "writeMoments")]
    pub write_moments: bool,
    #[serde(rename = "writeCubelets")]
    pub write_cubelets: bool,
    #[serde(rename = "writeNoise")]
    pub write_noise: bool,
    #[serde(rename = "marginCubelets")]
    pub margin_cubelets: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        OutputOptions {
            directory: String::new(),
            filename: String::new(),
            format: vec!["ascii".to_owned(), "xml".to_owned()],
            overwrite: false,
            write_catalog: true,
            write_mask: false,
            write_moments: false,
            write_cubelets: false,
            write_noise: false,
            margin_cubelets: 0,
        }
    }
}

impl Parameters {
    /// Load a parameter file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read parameter file {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("invalid parameter file {}", path.display()))
            }
            None => Ok(Parameters::default()),
        }
    }

    /// Apply command-line overrides on top of the file contents.
    pub fn apply_overrides(&mut self, opt: &Opt) -> Result<()> {
        if let Some(input) = &opt.input {
            self.input.data = input.clone();
        }

        if let Some(dir) = &opt.output_directory {
            self.output.directory = dir.to_string_lossy().into_owned();
        }

        if let Some(threshold) = opt.threshold {
            self.scfind.threshold = threshold;
        }

        if let Some(spec) = &opt.kernels_xy {
            self.scfind.kernels_xy = parse_kernels_flt(spec)?;
        }

        if let Some(spec) = &opt.kernels_z {
            self.scfind.kernels_z = parse_kernels_int(spec)?;
        }

        Ok(())
    }

    /// The inclusive sub-region to read, if any.
    pub fn region(&self) -> Result<Option<[usize; 6]>> {
        match &self.input.region {
            None => Ok(None),
            Some(values) => {
                if values.len() != 6 {
                    bail!("input.region must hold exactly 6 values");
                }
                let mut region = [0usize; 6];
                region.copy_from_slice(values);
                Ok(Some(region))
            }
        }
    }

    pub fn scfind_settings(&self) -> Result<ScfindSettings> {
        Ok(ScfindSettings {
            kernels_xy: self.scfind.kernels_xy.clone(),
            kernels_z: self.scfind.kernels_z.clone(),
            threshold: self.scfind.threshold,
            replacement: self.scfind.replacement,
            statistic: parse_statistic(&self.scfind.statistic)?,
            range: parse_flux_range(&self.scfind.flux_range)?,
            scale_noise: self.scale_noise_mode()?,
            scale_noise_statistic: parse_statistic(&self.scale_noise.statistic)?,
            scale_noise_range: parse_flux_range(&self.scale_noise.flux_range)?,
            local_noise: self.local_noise_settings(),
        })
    }

    pub fn linker_settings(&self) -> LinkerSettings {
        LinkerSettings {
            radius_x: self.linker.radius_xy,
            radius_y: self.linker.radius_xy,
            radius_z: self.linker.radius_z,
            min_size_x: self.linker.min_size_xy,
            min_size_y: self.linker.min_size_xy,
            min_size_z: self.linker.min_size_z,
            max_size_x: self.linker.max_size_xy,
            max_size_y: self.linker.max_size_xy,
            max_size_z: self.linker.max_size_z,
            positivity: self.linker.positivity,
            rms: 1.0,
        }
    }

    pub fn scale_noise_mode(&self) -> Result<ScaleNoiseMode> {
        Ok(match self.scale_noise.mode.as_str() {
            "none" => ScaleNoiseMode::None,
            "spectral" => ScaleNoiseMode::Spectral,
            "local" => ScaleNoiseMode::Local,
            other => bail!("invalid scaleNoise.mode `{other}` (expected none, spectral or local)"),
        })
    }

    pub fn local_noise_settings(&self) -> LocalNoiseSettings {
        LocalNoiseSettings {
            window_xy: self.scale_noise.window_xy,
            window_z: self.scale_noise.window_z,
            grid_xy: self.scale_noise.grid_xy,
            grid_z: self.scale_noise.grid_z,
            interpolate: self.scale_noise.interpolate,
        }
    }

    pub fn catalog_formats(&self) -> Result<Vec<CatalogFormat>> {
        self.output
            .format
            .iter()
            .map(|name| match name.as_str() {
                "ascii" => Ok(CatalogFormat::Ascii),
                "xml" => Ok(CatalogFormat::Xml),
                "sql" => Ok(CatalogFormat::Sql),
                other => bail!("invalid output.format entry `{other}` (expected ascii, xml or sql)"),
            })
            .collect()
    }

    /// Base path (directory + stem) for all output products, derived from
    /// the output options or falling back to the input file's location.
    pub fn output_base(&self) -> Result<PathBuf> {
        let input = &self.input.data;

        let directory: PathBuf = if self.output.directory.is_empty() {
            input.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            PathBuf::from(&self.output.directory)
        };

        let stem = if self.output.filename.is_empty() {
            let stem = input
                .file_stem()
                .context("cannot derive an output name from the input path")?
                .to_string_lossy()
                .into_owned();
            // Strip a residual `.fits` left over from `.fits.gz` inputs.
            stem.trim_end_matches(".fits").to_owned()
        } else {
            self.output.filename.clone()
        };

        Ok(directory.join(stem))
    }
}

pub fn parse_statistic(name: &str) -> Result<NoiseStatistic> {
    Ok(match name {
        "std" => NoiseStatistic::Std,
        "mad" => NoiseStatistic::Mad,
        "gauss" => NoiseStatistic::Gauss,
        other => bail!("invalid noise statistic `{other}` (expected std, mad or gauss)"),
    })
}

pub fn parse_flux_range(name: &str) -> Result<FluxRange> {
    Ok(match name {
        "negative" => FluxRange::Negative,
        "full" => FluxRange::Full,
        "positive" => FluxRange::Positive,
        other => bail!("invalid flux range `{other}` (expected negative, full or positive)"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_standard_pipeline() {
        let par = Parameters::default();
        assert!(par.scfind.enable);
        assert_eq!(par.scfind.kernels_xy, vec![0.0, 3.0, 6.0]);
        assert_eq!(par.scfind.kernels_z, vec![0, 3, 7, 15]);
        assert_eq!(par.scfind.threshold, 5.0);
        assert_eq!(par.linker.min_size_xy, 5);
        assert!(!par.dilation.enable);
        assert_eq!(par.parameter.prefix, "SoFiA");
        assert_eq!(par.output.format, vec!["ascii", "xml"]);
    }

    #[test]
    fn toml_sections_deserialize() {
        let text = r#"
            [input]
            data = "cube.fits"

            [scfind]
            kernelsXY = [0.0, 4.0]
            kernelsZ = [0, 5]
            threshold = 4.5
            statistic = "std"
            fluxRange = "full"

            [scaleNoise]
            mode = "local"
            windowXY = 51
            interpolate = true

            [linker]
            radiusXY = 2
            minSizeXY = 8

            [output]
            overwrite = true
            writeMask = true
        "#;

        let par: Parameters = toml::from_str(text).unwrap();
        assert_eq!(par.input.data, PathBuf::from("cube.fits"));
        assert_eq!(par.scfind.kernels_xy, vec![0.0, 4.0]);
        assert_eq!(par.scfind.threshold, 4.5);
        assert_eq!(par.scale_noise.mode, "local");
        assert_eq!(par.scale_noise.window_xy, 51);
        assert!(par.scale_noise.interpolate);
        assert_eq!(par.linker.radius_xy, 2);
        assert!(par.output.overwrite);
        assert!(par.output.write_mask);

        let settings = par.scfind_settings().unwrap();
        assert_eq!(settings.statistic, NoiseStatistic::Std);
        assert_eq!(settings.range, FluxRange::Full);
        assert_eq!(settings.scale_noise, ScaleNoiseMode::Local);

        let linker = par.linker_settings();
        assert_eq!(linker.radius_x, 2);
        assert_eq!(linker.min_size_y, 8);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = r#"
            [scfind]
            kernelXY = [0.0]
        "#;
        assert!(toml::from_str::<Parameters>(text).is_err());
    }

    #[test]
    fn invalid_enums_are_rejected() {
        assert!(parse_statistic("median").is_err());
        assert!(parse_flux_range("both").is_err());

        let mut par = Parameters::default();
        par.scale_noise.mode = "global".to_owned();
        assert!(par.scale_noise_mode().is_err());
    }

    #[test]
    fn region_validation() {
        let mut par = Parameters::default();
        assert!(par.region().unwrap().is_none());

        par.input.region = Some(vec![0, 9, 0, 9, 0, 4]);
        assert_eq!(par.region().unwrap(), Some([0, 9, 0, 9, 0, 4]));

        par.input.region = Some(vec![0, 9]);
        assert!(par.region().is_err());
    }

    #[test]
    fn output_base_falls_back_to_input() {
        let mut par = Parameters::default();
        par.input.data = PathBuf::from("/data/cubes/field1.fits");
        assert_eq!(par.output_base().unwrap(), PathBuf::from("/data/cubes/field1"));

        par.input.data = PathBuf::from("/data/cubes/field1.fits.gz");
        assert_eq!(par.output_base().unwrap(), PathBuf::from("/data/cubes/field1"));

        par.output.directory = "/out".to_owned();
        par.output.filename = "run1".to_owned();
        assert_eq!(par.output_base().unwrap(), PathBuf::from("/out/run1"));
    }
}
