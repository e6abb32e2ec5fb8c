//! Reading and writing of FITS data cubes.
//!
//! This is a deliberately small FITS implementation: simple images only, no
//! extensions, no tiled compression. Headers are handled as verbatim card
//! lists (see [`crate::header`]); the data payload is big-endian on disk and
//! converted to native order on the way in and out. Gzip-compressed input is
//! detected from the magic bytes and decompressed transparently, so both
//! `cube.fits` and `cube.fits.gz` work.
//!
//! The reader applies the usual normalisations on load: degenerate axis
//! handling for rank-4 cubes, optional sub-region extraction with CRPIX
//! adjustment, and BSCALE/BZERO/BLANK resolution (integer cubes come out as
//! 32-bit floats with blanked voxels set to NaN).

use anyhow::{bail, ensure, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::cube::{clamp_region, Cube, CubeData, DataType};
use crate::header::{Header, BLOCK_SIZE, CARD_SIZE};

/// Read a cube from a FITS file, optionally restricted to an inclusive
/// sub-region `(x_min, x_max, y_min, y_max, z_min, z_max)`.
pub fn read_cube(path: &Path, region: Option<[usize; 6]>) -> Result<Cube> {
    info!("Opening FITS file {}.", path.display());

    let file = File::open(path).with_context(|| format!("failed to open FITS file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    // Gzip sniff: 0x1f 0x8b at the start of the stream.
    let mut magic = [0u8; 2];
    reader
        .read_exact(&mut magic)
        .context("FITS file ended unexpectedly while reading magic bytes")?;

    let mut stream: Box<dyn Read> = if magic == [0x1f, 0x8b] {
        let file = File::open(path)?;
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        let chained = std::io::Cursor::new(magic).chain(reader);
        Box::new(chained)
    };

    read_cube_from(stream.as_mut(), region)
}

/// Read a cube from an open byte stream of plain (uncompressed) FITS data.
pub fn read_cube_from(reader: &mut dyn Read, region: Option<[usize; 6]>) -> Result<Cube> {
    // Accumulate header blocks until the END card shows up.
    let mut raw_header: Vec<u8> = Vec::with_capacity(BLOCK_SIZE);
    let header_bytes;

    'blocks: loop {
        let start = raw_header.len();
        raw_header.resize(start + BLOCK_SIZE, 0);
        reader
            .read_exact(&mut raw_header[start..])
            .context("FITS file ended unexpectedly while reading header")?;

        for card_start in (start..start + BLOCK_SIZE).step_by(CARD_SIZE) {
            let card = &raw_header[card_start..card_start + CARD_SIZE];

            if card.starts_with(b"END") && card[3..].iter().all(|&b| b == b' ') {
                header_bytes = card_start + CARD_SIZE;
                break 'blocks;
            }
        }
    }

    ensure!(
        raw_header.starts_with(b"SIMPLE"),
        "missing SIMPLE keyword; file does not appear to be a FITS file"
    );

    let mut header = Header::parse(&raw_header[..header_bytes])?;

    // Structural keywords.
    let dtype = DataType::from_bitpix(header.get_int("BITPIX"))?;
    let dimension = header.get_int("NAXIS");
    ensure!(
        (1..5).contains(&dimension),
        "only FITS files with 1-4 dimensions are supported"
    );

    let mut axis_size = [1usize; 4];
    for (i, size) in axis_size.iter_mut().enumerate().take(dimension as usize) {
        let n = header.get_int(&format!("NAXIS{}", i + 1));
        ensure!(n > 0, "invalid NAXIS{} keyword encountered", i + 1);
        *size = n as usize;
    }

    ensure!(
        dimension < 4 || axis_size[3] == 1 || axis_size[2] == 1,
        "the size of the 3rd or 4th axis must be 1"
    );

    // A degenerate third axis paired with a real fourth axis gets swapped,
    // keywords included.
    if dimension == 4 && axis_size[2] == 1 && axis_size[3] > 1 {
        warn!("Swapping order of 3rd and 4th axis of 4D cube.");
        axis_size.swap(2, 3);
        header.swap_axes_3_4();
    }

    let (full_nx, full_ny, full_nz) = (axis_size[0], axis_size[1], axis_size[2]);
    let word_size = dtype.word_size();

    // Resolve the requested sub-region against the full cube extent.
    let bounds = match region {
        Some(r) => clamp_region(r, full_nx, full_ny, full_nz)?,
        None => [0, full_nx - 1, 0, full_ny - 1, 0, full_nz - 1],
    };
    let [x_min, x_max, y_min, y_max, z_min, z_max] = bounds;
    let (nx, ny, nz) = (x_max - x_min + 1, y_max - y_min + 1, z_max - z_min + 1);

    info!(
        "Reading FITS data: type {}, axes {} x {} x {}, region {}-{}, {}-{}, {}-{}.",
        dtype.bitpix(),
        full_nx,
        full_ny,
        full_nz,
        x_min,
        x_max,
        y_min,
        y_max,
        z_min,
        z_max
    );

    // Pull the payload, skipping everything outside the region. The stream
    // may be a gzip decoder, so skipping is done by reading into the void
    // rather than seeking.
    let mut payload = vec![0u8; nx * ny * nz * word_size];

    if region.is_none() {
        reader
            .read_exact(&mut payload)
            .context("FITS file ended unexpectedly while reading data")?;
    } else {
        let row_bytes = nx * word_size;
        let mut cursor = 0u64;

        for z in z_min..=z_max {
            for y in y_min..=y_max {
                let row_start = ((x_min + full_nx * (y + full_ny * z)) * word_size) as u64;
                skip_bytes(reader, row_start - cursor)?;

                let out = (((z - z_min) * ny + (y - y_min)) * row_bytes) as usize;
                reader
                    .read_exact(&mut payload[out..out + row_bytes])
                    .context("FITS file ended unexpectedly while reading data")?;
                cursor = row_start + row_bytes as u64;
            }
        }

        header.adjust_wcs_to_subregion(x_min, y_min, z_min);
        header.set_int("NAXIS", 3);
        header.set_int("NAXIS1", nx as i64);
        header.set_int("NAXIS2", ny as i64);
        header.set_int("NAXIS3", nz as i64);
    }

    let mut data = decode_payload(&payload, dtype);
    drop(payload);

    // BSCALE/BZERO rescaling; integer cubes convert to f32 with BLANK -> NaN.
    let bscale = header.get_flt("BSCALE");
    let bzero = header.get_flt("BZERO");
    let scaling = (!bscale.is_nan() && bscale != 1.0) || (!bzero.is_nan() && bzero != 0.0);

    if scaling {
        let bscale = if bscale.is_nan() { 1.0 } else { bscale };
        let bzero = if bzero.is_nan() { 0.0 } else { bzero };

        if dtype.is_float() {
            warn!("Applying non-trivial BSCALE and BZERO to floating-point data.");

            match &mut data {
                CubeData::F32(v) => v
                    .par_iter_mut()
                    .for_each(|s| *s = (bzero + bscale * *s as f64) as f32),
                CubeData::F64(v) => v.par_iter_mut().for_each(|s| *s = bzero + bscale * *s),
                _ => unreachable!(),
            }

            header.remove("BSCALE");
            header.remove("BZERO");
        } else {
            warn!("Applying BSCALE and BZERO to integer data and converting to 32-bit floats.");

            let blank = header.contains("BLANK").then(|| header.get_int("BLANK"));
            data = convert_scaled_to_f32(&data, bscale, bzero, blank);
            header.set_int("BITPIX", -32);
            header.remove("BSCALE");
            header.remove("BZERO");
            header.remove("BLANK");
        }
    }

    Cube::from_parts(nx, ny, nz, data, header)
}

fn skip_bytes(reader: &mut dyn Read, count: u64) -> Result<()> {
    let copied = std::io::copy(&mut reader.take(count), &mut std::io::sink())?;
    ensure!(copied == count, "FITS file ended unexpectedly while skipping data");
    Ok(())
}

fn decode_payload(payload: &[u8], dtype: DataType) -> CubeData {
    match dtype {
        DataType::U8 => CubeData::U8(payload.to_vec()),
        DataType::I16 => CubeData::I16(
            payload
                .par_chunks_exact(2)
                .map(BigEndian::read_i16)
                .collect(),
        ),
        DataType::I32 => CubeData::I32(
            payload
                .par_chunks_exact(4)
                .map(BigEndian::read_i32)
                .collect(),
        ),
        DataType::I64 => CubeData::I64(
            payload
                .par_chunks_exact(8)
                .map(BigEndian::read_i64)
                .collect(),
        ),
        DataType::F32 => CubeData::F32(
            payload
                .par_chunks_exact(4)
                .map(BigEndian::read_f32)
                .collect(),
        ),
        DataType::F64 => CubeData::F64(
            payload
                .par_chunks_exact(8)
                .map(BigEndian::read_f64)
                .collect(),
        ),
    }
}

fn convert_scaled_to_f32(data: &CubeData, bscale: f64, bzero: f64, blank: Option<i64>) -> CubeData {
    let scale = |v: i64| -> f32 {
        if blank == Some(v) {
            f32::NAN
        } else {
            (bzero + bscale * v as f64) as f32
        }
    };

    let converted = match data {
        CubeData::U8(v) => v.par_iter().map(|&s| scale(s as i64)).collect(),
        CubeData::I16(v) => v.par_iter().map(|&s| scale(s as i64)).collect(),
        CubeData::I32(v) => v.par_iter().map(|&s| scale(s as i64)).collect(),
        CubeData::I64(v) => v.par_iter().map(|&s| scale(s)).collect(),
        _ => unreachable!("scaled conversion only applies to integer cubes"),
    };

    CubeData::F32(converted)
}

fn encode_payload(data: &CubeData) -> Vec<u8> {
    fn encode<T: Copy + Send + Sync>(
        values: &[T],
        word: usize,
        write: impl Fn(&mut [u8], T) + Send + Sync,
    ) -> Vec<u8> {
        let mut out = vec![0u8; values.len() * word];
        out.par_chunks_exact_mut(word)
            .zip(values.par_iter())
            .for_each(|(chunk, &v)| write(chunk, v));
        out
    }

    match data {
        CubeData::U8(v) => v.clone(),
        CubeData::I16(v) => encode(v, 2, |c, s| BigEndian::write_i16(c, s)),
        CubeData::I32(v) => encode(v, 4, |c, s| BigEndian::write_i32(c, s)),
        CubeData::I64(v) => encode(v, 8, |c, s| BigEndian::write_i64(c, s)),
        CubeData::F32(v) => encode(v, 4, |c, s| BigEndian::write_f32(c, s)),
        CubeData::F64(v) => encode(v, 8, |c, s| BigEndian::write_f64(c, s)),
    }
}

/// Write a cube to a FITS file. Refuses to replace an existing file unless
/// `overwrite` is set.
pub fn write_cube(cube: &Cube, path: &Path, overwrite: bool) -> Result<()> {
    if !overwrite && path.exists() {
        bail!("output file {} already exists", path.display());
    }

    info!("Writing FITS file {}.", path.display());

    let file = File::create(path).with_context(|| format!("failed to create output file {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    // Keep the stored header but make the structural keywords match the
    // cube as it is now.
    let mut header = cube.header.clone();
    header.set_bool("SIMPLE", true);
    header.set_int("BITPIX", cube.dtype().bitpix());
    header.set_int("NAXIS", 3);
    header.set_int("NAXIS1", cube.nx() as i64);
    header.set_int("NAXIS2", cube.ny() as i64);
    header.set_int("NAXIS3", cube.nz() as i64);
    header.remove("NAXIS4");

    writer.write_all(&header.to_bytes())?;

    let payload = encode_payload(cube.data());
    writer.write_all(&payload)?;

    let padding = (BLOCK_SIZE - payload.len() % BLOCK_SIZE) % BLOCK_SIZE;
    writer.write_all(&vec![0u8; padding])?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cube_bytes(header: &Header, payload: &[u8]) -> Vec<u8> {
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(payload);
        let padding = (BLOCK_SIZE - payload.len() % BLOCK_SIZE) % BLOCK_SIZE;
        bytes.extend(std::iter::repeat(0).take(padding));
        bytes
    }

    #[test]
    fn round_trip_f32_cube() {
        let mut cube = Cube::blank(3, 2, 2, DataType::F32);
        for i in 0..cube.data_size() {
            let (x, y, z) = cube.coords(i);
            cube.set_flt(x, y, z, i as f64 - 5.5);
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fits");
        write_cube(&cube, &path, false).unwrap();

        // Refuses to overwrite unless asked.
        assert!(write_cube(&cube, &path, false).is_err());
        write_cube(&cube, &path, true).unwrap();

        let read = read_cube(&path, None).unwrap();
        assert_eq!(read.nx(), 3);
        assert_eq!(read.ny(), 2);
        assert_eq!(read.nz(), 2);

        for i in 0..read.data_size() {
            let (x, y, z) = read.coords(i);
            assert_eq!(read.get_flt(x, y, z), cube.get_flt(x, y, z));
        }
    }

    #[test]
    fn payload_round_trip_is_byte_identical() {
        let mut cube = Cube::blank(4, 4, 1, DataType::I16);
        for i in 0..16 {
            let (x, y, z) = cube.coords(i);
            cube.set_int(x, y, z, i as i64 * 3 - 7);
        }

        let payload = encode_payload(cube.data());
        let decoded = decode_payload(&payload, DataType::I16);
        let re_encoded = encode_payload(&decoded);
        assert_eq!(payload, re_encoded);
    }

    #[test]
    fn region_read_extracts_sub_cube() {
        let mut cube = Cube::blank(4, 4, 4, DataType::F32);
        for i in 0..cube.data_size() {
            let (x, y, z) = cube.coords(i);
            cube.set_flt(x, y, z, (x + 10 * y + 100 * z) as f64);
        }
        cube.header.set_flt("CRPIX1", 2.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.fits");
        write_cube(&cube, &path, false).unwrap();

        let sub = read_cube(&path, Some([1, 2, 1, 3, 2, 3])).unwrap();
        assert_eq!((sub.nx(), sub.ny(), sub.nz()), (2, 3, 2));
        assert_eq!(sub.get_flt(0, 0, 0), (1 + 10 + 200) as f64);
        assert_eq!(sub.get_flt(1, 2, 1), (2 + 30 + 300) as f64);
        assert_eq!(sub.header.get_flt("CRPIX1"), 1.0);
        assert_eq!(sub.header.get_int("NAXIS1"), 2);
    }

    #[test]
    fn integer_cube_with_bscale_converts_to_f32() {
        let mut header = Header::new(16, &[2, 1, 1]);
        header.set_flt("BSCALE", 2.0);
        header.set_flt("BZERO", 100.0);
        header.set_int("BLANK", -1);

        let mut payload = Vec::new();
        let mut buf = [0u8; 2];
        BigEndian::write_i16(&mut buf, 21);
        payload.extend_from_slice(&buf);
        BigEndian::write_i16(&mut buf, -1);
        payload.extend_from_slice(&buf);

        let bytes = cube_bytes(&header, &payload);
        let cube = read_cube_from(&mut Cursor::new(bytes), None).unwrap();

        assert_eq!(cube.dtype(), DataType::F32);
        assert_eq!(cube.get_flt(0, 0, 0), 142.0);
        assert!(cube.get_flt(1, 0, 0).is_nan());
        assert!(!cube.header.contains("BSCALE"));
        assert!(!cube.header.contains("BLANK"));
    }

    #[test]
    fn four_dimensional_cube_swaps_degenerate_axis() {
        let mut header = Header::new(-32, &[2, 2, 1, 3]);
        header.set_str("CTYPE3", "STOKES");
        header.set_str("CTYPE4", "FREQ");
        header.set_flt("CDELT4", 5.0);

        let mut payload = Vec::new();
        let mut buf = [0u8; 4];
        for i in 0..12 {
            BigEndian::write_f32(&mut buf, i as f32);
            payload.extend_from_slice(&buf);
        }

        let bytes = cube_bytes(&header, &payload);
        let cube = read_cube_from(&mut Cursor::new(bytes), None).unwrap();

        assert_eq!((cube.nx(), cube.ny(), cube.nz()), (2, 2, 3));
        assert_eq!(cube.header.get_int("NAXIS3"), 3);
        assert_eq!(cube.header.get_int("NAXIS4"), 1);
        assert_eq!(cube.header.get_str("CTYPE3"), "FREQ");
        assert_eq!(cube.header.get_flt("CDELT3"), 5.0);
    }

    #[test]
    fn gzip_input_is_transparent() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut cube = Cube::blank(2, 2, 1, DataType::F32);
        cube.set_flt(1, 1, 0, 4.25);

        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.fits");
        write_cube(&cube, &plain, false).unwrap();

        let gz_path = dir.path().join("plain.fits.gz");
        let mut encoder = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        std::io::copy(&mut File::open(&plain).unwrap(), &mut encoder).unwrap();
        encoder.finish().unwrap();

        let read = read_cube(&gz_path, None).unwrap();
        assert_eq!(read.get_flt(1, 1, 0), 4.25);
    }
}
