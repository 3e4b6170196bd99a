use typed_builder::TypedBuilder;

use crate::encodings::HashFunctions;
use crate::manifest::Record;
use crate::picklist::Picklist;
use crate::Result;

/// Filter applied to every sketch a collection loads.
#[derive(Default, Debug, TypedBuilder, Clone)]
pub struct Selection {
    #[builder(default, setter(strip_option))]
    ksize: Option<u32>,

    #[builder(default, setter(strip_option))]
    abund: Option<bool>,

    #[builder(default, setter(strip_option))]
    scaled: Option<u64>,

    #[builder(default, setter(strip_option))]
    moltype: Option<HashFunctions>,

    #[builder(default, setter(strip_option))]
    picklist: Option<Picklist>,
}

pub trait Select {
    fn select(self, selection: &Selection) -> Result<Self>
    where
        Self: Sized;
}

impl Selection {
    pub fn ksize(&self) -> Option<u32> {
        self.ksize
    }

    pub fn set_ksize(&mut self, ksize: u32) {
        self.ksize = Some(ksize);
    }

    pub fn abund(&self) -> Option<bool> {
        self.abund
    }

    pub fn set_abund(&mut self, value: bool) {
        self.abund = Some(value);
    }

    pub fn scaled(&self) -> Option<u64> {
        self.scaled
    }

    pub fn set_scaled(&mut self, scaled: u64) {
        self.scaled = Some(scaled);
    }

    pub fn moltype(&self) -> Option<HashFunctions> {
        self.moltype
    }

    pub fn set_moltype(&mut self, value: HashFunctions) {
        self.moltype = Some(value);
    }

    pub fn picklist(&self) -> Option<&Picklist> {
        self.picklist.as_ref()
    }

    pub fn set_picklist(&mut self, value: Picklist) {
        self.picklist = Some(value);
    }

    /// Selection pinned to the ksize, moltype and scaled of `row`.
    pub fn from_record(row: &Record) -> Result<Self> {
        Ok(Self {
            ksize: Some(*row.ksize()),
            abund: None,
            moltype: Some(row.moltype()?),
            scaled: Some(*row.scaled()),
            picklist: None,
        })
    }

    /// Whether a manifest row passes this selection.
    ///
    /// Rows with a smaller scaled pass, since they can be downsampled on load.
    pub fn matches(&self, row: &Record) -> bool {
        if let Some(ksize) = self.ksize {
            if *row.ksize() != ksize {
                return false;
            }
        }
        if let Some(abund) = self.abund {
            if abund && !*row.with_abundance() {
                return false;
            }
        }
        if let Some(moltype) = self.moltype {
            match row.moltype() {
                Ok(m) if m == moltype => {}
                _ => return false,
            }
        }
        // num sketches carry scaled = 0 and are never usable here
        if *row.scaled() == 0 {
            return false;
        }
        if let Some(scaled) = self.scaled {
            if *row.scaled() > scaled {
                return false;
            }
        }
        if let Some(picklist) = &self.picklist {
            if !picklist.matches(row) {
                return false;
            }
        }
        true
    }
}
