//! A detected source and its typed, unit-carrying parameters.
//!
//! A source is an identifier plus an ordered list of named parameters, each
//! either integer or floating-point and tagged with a unit and a UCD
//! (Unified Content Descriptor) for the catalog writers. Parameter names
//! are case-sensitive; updates scan from the tail so the most recently
//! added parameter of a given name wins.

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ParValue {
    Int(i64),
    Flt(f64),
}

impl ParValue {
    pub fn as_flt(self) -> f64 {
        match self {
            ParValue::Int(v) => v as f64,
            ParValue::Flt(v) => v,
        }
    }

    pub fn as_int(self) -> i64 {
        match self {
            ParValue::Int(v) => v,
            ParValue::Flt(v) => v as i64,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, ParValue::Int(_))
    }
}

#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub value: ParValue,
    pub unit: String,
    pub ucd: String,
}

#[derive(Clone, Debug, Default)]
pub struct Source {
    identifier: String,
    params: Vec<Parameter>,
}

impl Source {
    pub fn new(identifier: &str) -> Self {
        Source {
            identifier: identifier.to_owned(),
            params: Vec::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn set_identifier(&mut self, identifier: &str) {
        self.identifier = identifier.to_owned();
    }

    /// Append a parameter unconditionally.
    pub fn add_par_flt(&mut self, name: &str, value: f64, unit: &str, ucd: &str) {
        self.params.push(Parameter {
            name: name.to_owned(),
            value: ParValue::Flt(value),
            unit: unit.to_owned(),
            ucd: ucd.to_owned(),
        });
    }

    pub fn add_par_int(&mut self, name: &str, value: i64, unit: &str, ucd: &str) {
        self.params.push(Parameter {
            name: name.to_owned(),
            value: ParValue::Int(value),
            unit: unit.to_owned(),
            ucd: ucd.to_owned(),
        });
    }

    fn find_from_tail(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().rev().find(|p| p.name == name)
    }

    /// Update a parameter in place, or append it when absent. `None` for
    /// unit or UCD keeps the existing strings.
    pub fn set_par_flt(&mut self, name: &str, value: f64, unit: Option<&str>, ucd: Option<&str>) {
        match self.find_from_tail(name) {
            Some(par) => {
                par.value = ParValue::Flt(value);
                if let Some(unit) = unit {
                    par.unit = unit.to_owned();
                }
                if let Some(ucd) = ucd {
                    par.ucd = ucd.to_owned();
                }
            }
            None => self.add_par_flt(name, value, unit.unwrap_or(""), ucd.unwrap_or("")),
        }
    }

    pub fn set_par_int(&mut self, name: &str, value: i64, unit: Option<&str>, ucd: Option<&str>) {
        match self.find_from_tail(name) {
            Some(par) => {
                par.value = ParValue::Int(value);
                if let Some(unit) = unit {
                    par.unit = unit.to_owned();
                }
                if let Some(ucd) = ucd {
                    par.ucd = ucd.to_owned();
                }
            }
            None => self.add_par_int(name, value, unit.unwrap_or(""), ucd.unwrap_or("")),
        }
    }

    pub fn get_par_flt(&self, name: &str) -> Option<f64> {
        self.params
            .iter()
            .rev()
            .find(|p| p.name == name)
            .map(|p| p.value.as_flt())
    }

    pub fn get_par_int(&self, name: &str) -> Option<i64> {
        self.params
            .iter()
            .rev()
            .find(|p| p.name == name)
            .map(|p| p.value.as_int())
    }

    pub fn par_exists(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn num_par(&self) -> usize {
        self.params.len()
    }

    /// Shift the positional parameters by a sub-region origin so catalogued
    /// coordinates refer to the full cube.
    pub fn offset_xyz(&mut self, dx: usize, dy: usize, dz: usize) {
        for (names, offset) in [
            (["x", "x_min", "x_max"], dx),
            (["y", "y_min", "y_max"], dy),
            (["z", "z_min", "z_max"], dz),
        ] {
            for name in names {
                if let Some(par) = self.find_from_tail(name) {
                    par.value = match par.value {
                        ParValue::Int(v) => ParValue::Int(v + offset as i64),
                        ParValue::Flt(v) => ParValue::Flt(v + offset as f64),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_par_updates_in_place() {
        let mut src = Source::new("test");
        src.add_par_flt("f_sum", 1.0, "Jy", "phot.flux");
        src.set_par_flt("f_sum", 2.0, None, None);

        assert_eq!(src.num_par(), 1);
        assert_eq!(src.get_par_flt("f_sum"), Some(2.0));
        assert_eq!(src.params()[0].unit, "Jy");
    }

    #[test]
    fn set_par_appends_when_missing() {
        let mut src = Source::new("test");
        src.set_par_int("id", 7, Some(""), Some("meta.id"));
        assert_eq!(src.get_par_int("id"), Some(7));
        assert_eq!(src.get_par_flt("id"), Some(7.0));
        assert!(src.get_par_flt("missing").is_none());
    }

    #[test]
    fn tail_match_wins() {
        let mut src = Source::new("test");
        src.add_par_flt("x", 1.0, "pix", "");
        src.add_par_flt("x", 2.0, "pix", "");

        assert_eq!(src.get_par_flt("x"), Some(2.0));

        src.set_par_flt("x", 3.0, None, None);
        assert_eq!(src.params()[1].value, ParValue::Flt(3.0));
        assert_eq!(src.params()[0].value, ParValue::Flt(1.0));
    }

    #[test]
    fn offset_moves_positions() {
        let mut src = Source::new("test");
        src.set_par_flt("x", 5.0, Some("pix"), None);
        src.set_par_int("x_min", 2, Some("pix"), None);
        src.set_par_int("z_max", 9, Some("pix"), None);
        src.set_par_flt("f_sum", 1.0, None, None);

        src.offset_xyz(10, 0, 100);

        assert_eq!(src.get_par_flt("x"), Some(15.0));
        assert_eq!(src.get_par_int("x_min"), Some(12));
        assert_eq!(src.get_par_int("z_max"), Some(109));
        assert_eq!(src.get_par_flt("f_sum"), Some(1.0));
    }
}
