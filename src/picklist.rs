//! Picklists restrict a collection to (or exclude) named datasets.
//!
//! Values are read from one column of a CSV file and matched against
//! manifest rows by name, identifier, md5 or md5 prefix.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;

use getset::{CopyGetters, Getters};
use typed_builder::TypedBuilder;

use crate::manifest::Record;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum PickStyle {
    #[default]
    Include = 1,
    Exclude = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColType {
    Name,
    Ident,
    Md5,
    Md5Short,
}

impl TryFrom<&str> for ColType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "name" => Ok(ColType::Name),
            "ident" => Ok(ColType::Ident),
            "md5" => Ok(ColType::Md5),
            "md5short" | "md5prefix8" => Ok(ColType::Md5Short),
            other => Err(Error::InvalidPickfile {
                path: String::new(),
                message: format!("unknown column type '{other}'"),
            }),
        }
    }
}

#[derive(TypedBuilder, CopyGetters, Getters, Clone, Debug)]
pub struct Picklist {
    #[getset(get_copy = "pub")]
    coltype: ColType,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    pickfile: String,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    column_name: String,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    pickstyle: PickStyle,

    #[builder(default)]
    values: HashSet<String>,
}

impl Picklist {
    /// Read the picked values from `pickfile`.
    pub fn load(mut self) -> Result<Self> {
        let invalid = |message: String| Error::InvalidPickfile {
            path: self.pickfile.clone(),
            message,
        };

        let file = File::open(&self.pickfile).map_err(|e| invalid(e.to_string()))?;
        let mut rdr = csv::Reader::from_reader(BufReader::new(file));

        let headers = rdr.headers()?.clone();
        let col = headers
            .iter()
            .position(|h| h == self.column_name)
            .ok_or_else(|| invalid(format!("column '{}' not found", self.column_name)))?;

        let mut values = HashSet::new();
        for record in rdr.records() {
            let record = record?;
            if let Some(value) = record.get(col) {
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                let value = match self.coltype {
                    ColType::Ident => ident(value).to_string(),
                    ColType::Md5Short => value.chars().take(8).collect(),
                    _ => value.to_string(),
                };
                values.insert(value);
            }
        }
        if values.is_empty() {
            return Err(invalid("no values found".into()));
        }
        log::debug!(
            "picklist '{}': {} distinct values",
            self.pickfile,
            values.len()
        );

        self.values = values;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn matches(&self, row: &Record) -> bool {
        let key = match self.coltype {
            ColType::Name => row.name().as_str(),
            ColType::Ident => ident(row.name()),
            ColType::Md5 => row.md5().as_str(),
            ColType::Md5Short => &row.md5()[..row.md5().len().min(8)],
        };
        let found = self.values.contains(key);
        match self.pickstyle {
            PickStyle::Include => found,
            PickStyle::Exclude => !found,
        }
    }
}

fn ident(name: &str) -> &str {
    name.split_whitespace().next().unwrap_or("")
}
