//! World Coordinate System support.
//!
//! The pipeline only ever needs the per-axis linear part of the WCS: the
//! conversion between voxel indices and longitude/latitude/spectral values
//! used for catalog columns, moment-map scaling and source names. This
//! module implements exactly that from the CRVALn/CRPIXn/CDELTn keywords;
//! spherical projections are out of scope. Pixel indices are 0-based on the
//! Rust side, 1-based in the FITS convention, and the conversion accounts
//! for the difference.

use tracing::warn;

use crate::header::Header;

#[derive(Debug, Clone)]
pub struct Wcs {
    crval: [f64; 3],
    crpix: [f64; 3],
    cdelt: [f64; 3],
}

impl Wcs {
    /// Build a WCS object from the header's linear axis keywords. Returns
    /// `None` when any of them is missing or degenerate, in which case the
    /// caller falls back to pixel units.
    pub fn from_header(header: &Header) -> Option<Self> {
        let mut crval = [0.0; 3];
        let mut crpix = [0.0; 3];
        let mut cdelt = [0.0; 3];

        for axis in 0..3 {
            crval[axis] = header.get_flt(&format!("CRVAL{}", axis + 1));
            crpix[axis] = header.get_flt(&format!("CRPIX{}", axis + 1));
            cdelt[axis] = header.get_flt(&format!("CDELT{}", axis + 1));

            if crval[axis].is_nan() || crpix[axis].is_nan() || cdelt[axis].is_nan() || cdelt[axis] == 0.0
            {
                warn!("Incomplete WCS information in header; axis {}.", axis + 1);
                return None;
            }
        }

        Some(Wcs { crval, crpix, cdelt })
    }

    /// Convert 0-based voxel coordinates to world coordinates
    /// `(longitude, latitude, spectral)`.
    pub fn pixel_to_world(&self, x: f64, y: f64, z: f64) -> (f64, f64, f64) {
        (
            self.axis_to_world(0, x),
            self.axis_to_world(1, y),
            self.axis_to_world(2, z),
        )
    }

    /// Convert world coordinates back to 0-based voxel coordinates.
    pub fn world_to_pixel(&self, lon: f64, lat: f64, spec: f64) -> (f64, f64, f64) {
        (
            self.axis_to_pixel(0, lon),
            self.axis_to_pixel(1, lat),
            self.axis_to_pixel(2, spec),
        )
    }

    /// Spectral world coordinate of channel `z` alone; used for moment maps
    /// and spectra where the spatial position is irrelevant.
    pub fn spectral_value(&self, z: f64) -> f64 {
        self.axis_to_world(2, z)
    }

    fn axis_to_world(&self, axis: usize, pixel: f64) -> f64 {
        self.crval[axis] + (pixel + 1.0 - self.crpix[axis]) * self.cdelt[axis]
    }

    fn axis_to_pixel(&self, axis: usize, world: f64) -> f64 {
        (world - self.crval[axis]) / self.cdelt[axis] + self.crpix[axis] - 1.0
    }
}

/// Header-derived axis metadata for catalog columns and product headers.
#[derive(Debug, Clone)]
pub struct WcsInfo {
    pub unit_flux_dens: String,
    pub unit_flux: String,
    pub label_lon: String,
    pub label_lat: String,
    pub label_spec: String,
    pub ucd_lon: String,
    pub ucd_lat: String,
    pub ucd_spec: String,
    pub unit_lon: String,
    pub unit_lat: String,
    pub unit_spec: String,
    pub beam_area: f64,
    pub chan_size: f64,
}

impl WcsInfo {
    /// Extract axis labels, units, UCDs, beam solid angle and channel width
    /// from the header, substituting conventional defaults where keywords
    /// are missing.
    pub fn from_header(header: &Header) -> Self {
        let mut unit_flux_dens = header.get_str("BUNIT").trim().to_owned();

        if unit_flux_dens.is_empty() {
            warn!("No flux unit (BUNIT) defined in header.");
            unit_flux_dens = "???".to_owned();
        }

        // Fix commonly encountered misspellings.
        if unit_flux_dens == "JY/BEAM" || unit_flux_dens == "Jy/Beam" {
            unit_flux_dens = "Jy/beam".to_owned();
        }

        let mut label_lon = "lon".to_owned();
        let mut label_lat = "lat".to_owned();
        let mut label_spec = "spec".to_owned();
        let mut ucd_lon = String::new();
        let mut ucd_lat = String::new();
        let mut ucd_spec = String::new();
        let mut unit_lon = header.get_str("CUNIT1").trim().to_owned();
        let mut unit_lat = header.get_str("CUNIT2").trim().to_owned();
        let mut unit_spec = header.get_str("CUNIT3").trim().to_owned();

        if unit_lon.is_empty() {
            unit_lon = "deg".to_owned();
        }
        if unit_lat.is_empty() {
            unit_lat = "deg".to_owned();
        }

        if header.value_starts_with("CTYPE1", "RA--") {
            label_lon = "ra".to_owned();
            ucd_lon = "pos.eq.ra".to_owned();
        } else if header.value_starts_with("CTYPE1", "GLON") {
            label_lon = "l".to_owned();
            ucd_lon = "pos.galactic.lon".to_owned();
        } else {
            warn!("Unsupported CTYPE1 value. Supported: RA, GLON.");
        }

        if header.value_starts_with("CTYPE2", "DEC-") {
            label_lat = "dec".to_owned();
            ucd_lat = "pos.eq.dec".to_owned();
        } else if header.value_starts_with("CTYPE2", "GLAT") {
            label_lat = "b".to_owned();
            ucd_lat = "pos.galactic.lat".to_owned();
        } else {
            warn!("Unsupported CTYPE2 value. Supported: DEC, GLAT.");
        }

        if header.value_starts_with("CTYPE3", "FREQ") {
            label_spec = "freq".to_owned();
            ucd_spec = "em.freq".to_owned();
            if unit_spec.is_empty() {
                unit_spec = "Hz".to_owned();
            }
        } else if header.value_starts_with("CTYPE3", "VRAD") {
            label_spec = "v_rad".to_owned();
            ucd_spec = "spect.dopplerVeloc.radio".to_owned();
            if unit_spec.is_empty() {
                unit_spec = "m/s".to_owned();
            }
        } else if header.value_starts_with("CTYPE3", "VOPT") {
            label_spec = "v_opt".to_owned();
            ucd_spec = "spect.dopplerVeloc.opt".to_owned();
            if unit_spec.is_empty() {
                unit_spec = "m/s".to_owned();
            }
        } else if header.value_starts_with("CTYPE3", "FELO") {
            label_spec = "v_opt".to_owned();
            ucd_spec = "spect.dopplerVeloc".to_owned();
            if unit_spec.is_empty() {
                unit_spec = "m/s".to_owned();
            }
        } else if header.value_starts_with("CTYPE3", "VELO") {
            label_spec = "v_app".to_owned();
            ucd_spec = "spect.dopplerVeloc".to_owned();
            if unit_spec.is_empty() {
                unit_spec = "m/s".to_owned();
            }
        } else {
            warn!("Unsupported CTYPE3 value. Supported: FREQ, VRAD, VOPT, VELO.");
            if unit_spec.is_empty() {
                unit_spec = "???".to_owned();
            }
        }

        let mut chan_size = header.get_flt("CDELT3").abs();
        if chan_size.is_nan() {
            warn!("Header keyword CDELT3 not found; assuming value of 1.");
            chan_size = 1.0;
        }

        let beam_area = beam_area(header);
        let unit_flux = if beam_area.is_nan() {
            format!("{unit_flux_dens}*{unit_spec}")
        } else {
            format!("Jy*{unit_spec}")
        };

        WcsInfo {
            unit_flux_dens,
            unit_flux,
            label_lon,
            label_lat,
            label_spec,
            ucd_lon,
            ucd_lat,
            ucd_spec,
            unit_lon,
            unit_lat,
            unit_spec,
            beam_area: if beam_area.is_nan() { 1.0 } else { beam_area },
            chan_size,
        }
    }

    /// Whether flux values can be converted to physical units, which
    /// requires the flux density to be in Jy/beam.
    pub fn supports_physical(&self) -> bool {
        self.unit_flux_dens == "Jy/beam"
    }
}

/// Solid angle of a Gaussian beam in pixels, from BMAJ/BMIN/CDELT2. NaN when
/// the beam cannot be determined. BMAJ, BMIN and CDELT2 are assumed to share
/// the same unit.
pub fn beam_area(header: &Header) -> f64 {
    let beam_maj = header.get_flt("BMAJ");
    let beam_min = header.get_flt("BMIN");
    let pixel_size = header.get_flt("CDELT2");

    if beam_maj.is_nan()
        || beam_min.is_nan()
        || pixel_size.is_nan()
        || beam_maj == 0.0
        || beam_min == 0.0
        || pixel_size == 0.0
    {
        warn!("Failed to determine beam size from header.");
        return f64::NAN;
    }

    std::f64::consts::PI * beam_maj * beam_min / (4.0 * 2.0f64.ln() * pixel_size * pixel_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn equatorial_header() -> Header {
        let mut header = Header::new(-32, &[16, 16, 16]);
        header.set_str("CTYPE1", "RA---SIN");
        header.set_str("CTYPE2", "DEC--SIN");
        header.set_str("CTYPE3", "FREQ");
        header.set_flt("CRVAL1", 180.0);
        header.set_flt("CRVAL2", -30.0);
        header.set_flt("CRVAL3", 1.42e9);
        header.set_flt("CRPIX1", 8.0);
        header.set_flt("CRPIX2", 8.0);
        header.set_flt("CRPIX3", 1.0);
        header.set_flt("CDELT1", -0.01);
        header.set_flt("CDELT2", 0.01);
        header.set_flt("CDELT3", 1e5);
        header
    }

    #[test]
    fn pixel_world_round_trip() {
        let wcs = Wcs::from_header(&equatorial_header()).unwrap();

        let (lon, lat, spec) = wcs.pixel_to_world(7.0, 7.0, 0.0);
        assert_eq!(lon, 180.0);
        assert_eq!(lat, -30.0);
        assert_eq!(spec, 1.42e9);

        let (x, y, z) = wcs.world_to_pixel(lon, lat, spec);
        assert!((x - 7.0).abs() < 1e-9);
        assert!((y - 7.0).abs() < 1e-9);
        assert!(z.abs() < 1e-9);
    }

    #[test]
    fn incomplete_header_yields_none() {
        let mut header = Header::new(-32, &[4, 4, 4]);
        header.set_flt("CRVAL1", 1.0);
        assert!(Wcs::from_header(&header).is_none());
    }

    #[test]
    fn axis_recognition() {
        let info = WcsInfo::from_header(&equatorial_header());
        assert_eq!(info.label_lon, "ra");
        assert_eq!(info.label_lat, "dec");
        assert_eq!(info.label_spec, "freq");
        assert_eq!(info.ucd_lon, "pos.eq.ra");
        assert_eq!(info.unit_spec, "Hz");
        assert_eq!(info.chan_size, 1e5);
    }

    #[test]
    fn beam_area_from_header() {
        let mut header = equatorial_header();
        assert!(beam_area(&header).is_nan());

        header.set_flt("BMAJ", 0.05);
        header.set_flt("BMIN", 0.03);
        let area = beam_area(&header);
        let expected = std::f64::consts::PI * 0.05 * 0.03 / (4.0 * 2.0f64.ln() * 1e-4);
        assert!((area - expected).abs() < 1e-9);
    }

    #[test]
    fn physical_units_require_jy_per_beam() {
        let mut header = equatorial_header();
        header.set_str("BUNIT", "JY/BEAM");
        let info = WcsInfo::from_header(&header);
        assert_eq!(info.unit_flux_dens, "Jy/beam");
        assert!(info.supports_physical());
    }
}
