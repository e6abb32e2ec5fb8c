//! FITS header handling.
//!
//! A header is an ordered list of 80-character cards, kept verbatim so that
//! keywords we do not understand survive a read/write round trip. Typed
//! accessors follow the permissive convention of the rest of the pipeline:
//! a missing numeric keyword reads as NaN (floats) or 0 (integers) and the
//! caller decides whether that is fatal.

use anyhow::{bail, Result};

/// One header card is this many bytes on disk.
pub const CARD_SIZE: usize = 80;

/// Header block size; headers and data are padded to multiples of this.
pub const BLOCK_SIZE: usize = 2880;

/// Keyword families copied by [`Header::copy_wcs`].
const WCS_KEYS: &[&str] = &[
    "CTYPE", "CRVAL", "CRPIX", "CDELT", "CUNIT", "CROTA",
];

const WCS_KEYS_EXACT: &[&str] = &[
    "EPOCH", "EQUINOX", "RESTFREQ", "RESTFRQ", "SPECSYS", "LONPOLE", "LATPOLE",
];

#[derive(Debug, Clone)]
pub struct Header {
    cards: Vec<String>,
}

impl Header {
    /// An empty header with only the mandatory structural keywords.
    pub fn new(bitpix: i32, axes: &[usize]) -> Self {
        let mut header = Header { cards: Vec::new() };
        header.set_bool("SIMPLE", true);
        header.set_int("BITPIX", bitpix as i64);
        header.set_int("NAXIS", axes.len() as i64);

        for (i, &n) in axes.iter().enumerate() {
            header.set_int(&format!("NAXIS{}", i + 1), n as i64);
        }

        header
    }

    /// Parse raw header bytes (everything up to and including the END card).
    /// Blank and comment cards are retained.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() % CARD_SIZE != 0 {
            bail!("header size {} is not a multiple of the card size", raw.len());
        }

        let mut cards = Vec::new();

        for chunk in raw.chunks_exact(CARD_SIZE) {
            if !chunk.is_ascii() {
                bail!("non-ASCII bytes in header card");
            }

            let card: String = chunk.iter().map(|&b| b as char).collect();

            if card.starts_with("END") && card[3..].trim().is_empty() {
                return Ok(Header { cards });
            }

            cards.push(card);
        }

        bail!("header ended without an END card");
    }

    /// Serialise to raw bytes including END and padding to a block multiple.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.cards.len() + 1) * CARD_SIZE);

        for card in &self.cards {
            out.extend(card.bytes());
        }

        out.extend(format!("{:<80}", "END").bytes());

        while out.len() % BLOCK_SIZE != 0 {
            out.push(b' ');
        }

        out
    }

    fn find(&self, key: &str) -> Option<usize> {
        let padded = format!("{:<8}", key);
        self.cards.iter().position(|c| c.starts_with(&padded))
    }

    /// The raw value field of a card: text between `= ` and any `/` comment,
    /// with quotes left intact.
    fn raw_value(&self, key: &str) -> Option<&str> {
        let index = self.find(key)?;
        let card = &self.cards[index];

        if card.len() < 10 || &card[8..10] != "= " {
            return None;
        }

        let value = &card[10..];

        // A slash terminates the value unless it sits inside a quoted string.
        let mut in_quotes = false;
        for (i, c) in value.char_indices() {
            match c {
                '\'' => in_quotes = !in_quotes,
                '/' if !in_quotes => return Some(value[..i].trim()),
                _ => {}
            }
        }

        Some(value.trim())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// String value with quotes stripped and trailing blanks removed;
    /// empty if the keyword is absent or not a string.
    pub fn get_str(&self, key: &str) -> String {
        let Some(raw) = self.raw_value(key) else {
            return String::new();
        };

        let raw = raw.trim();
        if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
            raw[1..raw.len() - 1].replace("''", "'").trim_end().to_owned()
        } else {
            String::new()
        }
    }

    /// Integer value; 0 if absent or unparsable.
    pub fn get_int(&self, key: &str) -> i64 {
        self.raw_value(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    }

    /// Floating-point value; NaN if absent or unparsable. Integer-formatted
    /// values parse fine, as do FITS-style `1.0E+03` exponents.
    pub fn get_flt(&self, key: &str) -> f64 {
        self.raw_value(key)
            .and_then(|v| v.replace(['D', 'd'], "E").parse::<f64>().ok())
            .unwrap_or(f64::NAN)
    }

    /// Boolean value; false if absent.
    pub fn get_bool(&self, key: &str) -> bool {
        self.raw_value(key).map(|v| v == "T").unwrap_or(false)
    }

    /// Whether the string value of `key` starts with `prefix`. Used for
    /// CTYPE axis-type recognition.
    pub fn value_starts_with(&self, key: &str, prefix: &str) -> bool {
        self.get_str(key).starts_with(prefix)
    }

    fn upsert(&mut self, key: &str, card: String) {
        debug_assert_eq!(card.len(), CARD_SIZE);

        match self.find(key) {
            Some(index) => self.cards[index] = card,
            None => self.cards.push(card),
        }
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        let quoted = format!("'{}'", value.replace('\'', "''"));
        let card = format!("{:<8}= {:<70}", key, quoted);
        self.upsert(key, truncate_card(card));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        let card = format!("{:<8}= {:>20}{:<50}", key, value, "");
        self.upsert(key, truncate_card(card));
    }

    pub fn set_flt(&mut self, key: &str, value: f64) {
        let formatted = format_fits_float(value);
        let card = format!("{:<8}= {:>20}{:<50}", key, formatted, "");
        self.upsert(key, truncate_card(card));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        let card = format!("{:<8}= {:>20}{:<50}", key, if value { "T" } else { "F" }, "");
        self.upsert(key, truncate_card(card));
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(index) = self.find(key) {
            self.cards.remove(index);
        }
    }

    /// Copy the WCS keyword families (axis descriptors plus equinox and rest
    /// frequency information) into `target`, overwriting existing entries.
    pub fn copy_wcs(&self, target: &mut Header) {
        for card in &self.cards {
            let key = card[..8].trim_end();

            let is_axis_key = WCS_KEYS
                .iter()
                .any(|p| key.starts_with(p) && key[p.len()..].chars().all(|c| c.is_ascii_digit()) && key.len() > p.len());
            let is_exact = WCS_KEYS_EXACT.contains(&key);

            if is_axis_key || is_exact {
                target.upsert(key, card.clone());
            }
        }
    }

    /// Copy miscellaneous descriptive keywords (flux unit, beam, object).
    pub fn copy_misc(&self, target: &mut Header, copy_bunit: bool, copy_beam: bool) {
        if copy_bunit {
            if let Some(index) = self.find("BUNIT") {
                target.upsert("BUNIT", self.cards[index].clone());
            }
        }

        if copy_beam {
            for key in ["BMAJ", "BMIN", "BPA"] {
                if let Some(index) = self.find(key) {
                    target.upsert(key, self.cards[index].clone());
                }
            }
        }

        for key in ["ORIGIN", "OBJECT", "TELESCOP", "INSTRUME"] {
            if let Some(index) = self.find(key) {
                target.upsert(key, self.cards[index].clone());
            }
        }
    }

    /// Shift the reference pixels after a sub-region read so the WCS still
    /// refers to the same world coordinates.
    pub fn adjust_wcs_to_subregion(&mut self, x_min: usize, y_min: usize, z_min: usize) {
        for (axis, offset) in [(1usize, x_min), (2, y_min), (3, z_min)] {
            let key = format!("CRPIX{axis}");
            let crpix = self.get_flt(&key);

            if !crpix.is_nan() && offset > 0 {
                self.set_flt(&key, crpix - offset as f64);
            }
        }
    }

    /// Exchange the full keyword family of axes 3 and 4 (NAXIS, CRPIX, CDELT,
    /// CRVAL, CTYPE, CUNIT), used when a degenerate third axis is swapped
    /// with a non-degenerate fourth.
    pub fn swap_axes_3_4(&mut self) {
        self.set_int("NAXIS3", self.get_int("NAXIS4"));
        self.set_int("NAXIS4", 1);

        for family in ["CRPIX", "CRVAL", "CDELT"] {
            let key3 = format!("{family}3");
            let key4 = format!("{family}4");
            let v3 = self.get_flt(&key3);
            let v4 = self.get_flt(&key4);

            if !v4.is_nan() {
                self.set_flt(&key3, v4);
            } else {
                self.remove(&key3);
            }

            if !v3.is_nan() {
                self.set_flt(&key4, v3);
            } else {
                self.remove(&key4);
            }
        }

        for family in ["CTYPE", "CUNIT"] {
            let key3 = format!("{family}3");
            let key4 = format!("{family}4");
            let s3 = self.get_str(&key3);
            let s4 = self.get_str(&key4);
            self.set_str(&key3, &s4);
            self.set_str(&key4, &s3);
        }
    }
}

fn truncate_card(mut card: String) -> String {
    card.truncate(CARD_SIZE);

    while card.len() < CARD_SIZE {
        card.push(' ');
    }

    card
}

/// FITS requires a decimal point or exponent so the value is not mistaken
/// for an integer.
fn format_fits_float(value: f64) -> String {
    if value.is_nan() {
        return "NAN".to_owned();
    }

    // Very large or small magnitudes switch to exponent form so the value
    // always fits the fixed-width value field.
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-10..1e16).contains(&magnitude) {
        return format!("{value:E}");
    }

    let formatted = format!("{value}");

    if formatted.contains('.') || formatted.contains('e') || formatted.contains("inf") {
        formatted
    } else {
        format!("{formatted}.0")
    }
}
