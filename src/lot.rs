use indexmap::IndexMap;

/// The only format tag the merge pipeline consumes or produces. All other
/// tags ride through the pipeline untouched.
pub const MERGE_FORMAT: &str = "th01";

/// Lot configuration key naming the process step handed to the merge tool.
pub const PROCESS_STEP_KEY: &str = "processStep";

/// One encoding of a wafermap's data: either the payload itself, or an
/// opaque reference into the wafermap datastore. Freshly merged maps start
/// out `Inline` and become `Referenced` once uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    Inline(Vec<u8>),
    Referenced(String),
}

impl Format {
    pub fn is_inline(&self) -> bool {
        matches!(self, Format::Inline(_))
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            Format::Referenced(reference) => Some(reference),
            Format::Inline(_) => None,
        }
    }
}

/// A named collection of per-format map payloads for one wafer. Format tags
/// are case-insensitive and stored lowercase; inserting an existing tag
/// replaces it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wafermap {
    pub name: String,
    formats: IndexMap<String, Format>,
}

impl Wafermap {
    pub fn new(name: impl Into<String>) -> Self {
        Wafermap {
            name: name.into(),
            formats: IndexMap::new(),
        }
    }

    pub fn set_format(&mut self, tag: &str, format: Format) {
        self.formats.insert(tag.to_ascii_lowercase(), format);
    }

    pub fn format(&self, tag: &str) -> Option<&Format> {
        self.formats.get(&tag.to_ascii_lowercase())
    }

    pub fn format_mut(&mut self, tag: &str) -> Option<&mut Format> {
        self.formats.get_mut(&tag.to_ascii_lowercase())
    }

    /// Tags and formats in insertion order.
    pub fn formats(&self) -> impl Iterator<Item = (&str, &Format)> {
        self.formats.iter().map(|(tag, format)| (tag.as_str(), format))
    }
}

/// One physical unit within a lot, owning its own wafermaps and properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wafer {
    pub number: String,
    pub pass_dies: String,
    pub wafermaps: Vec<Wafermap>,
    pub config: IndexMap<String, String>,
}

impl Wafer {
    pub fn new(number: impl Into<String>, pass_dies: impl Into<String>) -> Self {
        Wafer {
            number: number.into(),
            pass_dies: pass_dies.into(),
            wafermaps: Vec::new(),
            config: IndexMap::new(),
        }
    }
}

/// A batch of wafers processed together, as carried by one lot document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lot {
    pub name: String,
    pub item: String,
    pub wafers_in_lot: String,
    pub organization: String,
    pub probe_location: String,
    pub subcontractor: String,
    pub wafers: Vec<Wafer>,
    pub config: IndexMap<String, String>,
}

impl Lot {
    pub fn new(
        name: impl Into<String>,
        item: impl Into<String>,
        wafers_in_lot: impl Into<String>,
        organization: impl Into<String>,
        probe_location: impl Into<String>,
        subcontractor: impl Into<String>,
    ) -> Self {
        Lot {
            name: name.into(),
            item: item.into(),
            wafers_in_lot: wafers_in_lot.into(),
            organization: organization.into(),
            probe_location: probe_location.into(),
            subcontractor: subcontractor.into(),
            wafers: Vec::new(),
            config: IndexMap::new(),
        }
    }

    /// The process step the merge tool runs under. Required before any wafer
    /// in the lot can be merged.
    pub fn process_step(&self) -> Option<&str> {
        self.config.get(PROCESS_STEP_KEY).map(String::as_str)
    }
}
