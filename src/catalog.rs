//! The source catalogue and its on-disk formats.
//!
//! A catalogue is an ordered, owning list of sources. Identifier look-up
//! scans from the tail so the most recently added source of a given name
//! wins. Two persistence formats are implemented: fixed-width ASCII with a
//! three-row commented header, and VOTable 1.3 XML. An SQL format is
//! reserved but not implemented.

use anyhow::{bail, Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::source::Source;

/// Fixed column width of the ASCII catalogue.
const COLUMN_WIDTH: usize = 14;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CatalogFormat {
    Ascii,
    Xml,
    Sql,
}

#[derive(Clone, Debug, Default)]
pub struct Catalog {
    sources: Vec<Source>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn push(&mut self, source: Source) {
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Source> {
        self.sources.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Source> {
        self.sources.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.sources.iter_mut()
    }

    /// Index of the last source carrying this identifier.
    pub fn index_of(&self, identifier: &str) -> Option<usize> {
        self.sources.iter().rposition(|s| s.identifier() == identifier)
    }

    /// The last source carrying this identifier.
    pub fn get_by_identifier(&self, identifier: &str) -> Option<&Source> {
        self.sources.iter().rev().find(|s| s.identifier() == identifier)
    }

    /// Save the catalogue in the requested format.
    pub fn save(&self, path: &Path, format: CatalogFormat, overwrite: bool) -> Result<()> {
        if self.is_empty() {
            bail!("invalid or empty catalogue provided");
        }

        if !overwrite && path.exists() {
            bail!("output file {} already exists", path.display());
        }

        info!("Writing catalogue {}.", path.display());

        let contents = match format {
            CatalogFormat::Ascii => self.to_ascii(),
            CatalogFormat::Xml => self.to_votable(),
            CatalogFormat::Sql => bail!("SQL catalogue output is not supported"),
        };

        fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn to_ascii(&self) -> String {
        let mut out = String::new();
        let first = &self.sources[0];

        out.push_str("# Source catalogue\n");
        out.push_str(concat!("# Creator: cubefind ", env!("CARGO_PKG_VERSION"), "\n"));
        out.push_str("#\n# Header rows:\n#   1 = column number\n#   2 = parameter name\n#   3 = parameter unit\n#\n");

        out.push('#');
        for j in 0..first.num_par() {
            let _ = write!(out, "{:>width$}", j + 1, width = COLUMN_WIDTH);
        }
        out.push_str("\n#");
        for par in first.params() {
            let _ = write!(out, "{:>width$}", par.name, width = COLUMN_WIDTH);
        }
        out.push_str("\n#");
        for par in first.params() {
            let _ = write!(out, "{:>width$}", par.unit, width = COLUMN_WIDTH);
        }
        out.push_str("\n\n");

        for src in &self.sources {
            out.push(' ');
            for par in src.params() {
                if par.value.is_int() {
                    let _ = write!(out, "{:>width$}", par.value.as_int(), width = COLUMN_WIDTH);
                } else {
                    let _ = write!(
                        out,
                        "{:>width$}",
                        format_exp(par.value.as_flt(), 5),
                        width = COLUMN_WIDTH
                    );
                }
            }
            out.push('\n');
        }

        out
    }

    fn to_votable(&self) -> String {
        let mut out = String::new();
        let first = &self.sources[0];
        let version = env!("CARGO_PKG_VERSION");

        out.push_str("<?xml version=\"1.0\" ?>\n");
        out.push_str("<VOTABLE version=\"1.3\" xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" xmlns=\"http://www.ivoa.net/xml/VOTable/v1.3\">\n");
        let _ = writeln!(out, "\t<RESOURCE name=\"cubefind catalogue (version {version})\">");
        let _ = writeln!(
            out,
            "\t\t<DESCRIPTION>Source catalogue produced by cubefind version {version}</DESCRIPTION>"
        );
        out.push_str("\t\t<COOSYS ID=\"wcs\" system=\"eq_FK5\" equinox=\"J2000\"/>\n");
        out.push_str("\t\t<TABLE ID=\"cubefind_catalog\" name=\"cubefind source catalogue\">\n");

        for par in first.params() {
            let datatype = if par.value.is_int() { "long" } else { "double" };
            let _ = writeln!(
                out,
                "\t\t\t<FIELD datatype=\"{}\" name=\"{}\" unit=\"{}\" ucd=\"{}\"/>",
                datatype,
                escape_xml(&par.name),
                escape_xml(&par.unit),
                escape_xml(&par.ucd)
            );
        }

        out.push_str("\t\t\t<DATA>\n\t\t\t\t<TABLEDATA>\n");

        for src in &self.sources {
            out.push_str("\t\t\t\t\t<TR>\n");

            for par in src.params() {
                if par.value.is_int() {
                    let _ = writeln!(out, "\t\t\t\t\t\t<TD>{}</TD>", par.value.as_int());
                } else {
                    let _ = writeln!(out, "\t\t\t\t\t\t<TD>{}</TD>", format_exp(par.value.as_flt(), 6));
                }
            }

            out.push_str("\t\t\t\t\t</TR>\n");
        }

        out.push_str("\t\t\t\t</TABLEDATA>\n\t\t\t</DATA>\n\t\t</TABLE>\n\t</RESOURCE>\n</VOTABLE>\n");
        out
    }
}

/// C-style scientific notation with a signed two-digit exponent, e.g.
/// `1.23000e+02`, which Rust's `{:e}` does not produce.
fn format_exp(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_owned();
    }

    if value.is_infinite() {
        return if value > 0.0 { "inf".to_owned() } else { "-inf".to_owned() };
    }

    let formatted = format!("{value:.precision$e}");

    // Rust emits `1.23e4` / `1.23e-4`; rewrite the exponent part.
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(rest) => ('-', rest),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => formatted,
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
