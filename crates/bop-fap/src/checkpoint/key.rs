//! Remote key and local path templates for checkpoint artifacts.
//!
//! A [`KeyTemplate`] is an ordered list of literal and field segments.
//! Fields render as fixed-width lowercase hex so rendered keys sort
//! lexicographically in the same order as their numeric fields, and parsing
//! a rendered key back into its fields is unambiguous.
//!
//! Default layout:
//! - Manifests: `s{store_id}/manifest/mf_{seq}`
//! - Data files: `s{store_id}/data/dat_{seq}_{index}`

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCode;

pub type StoreId = u64;
pub type Sequence = u64;
pub type DataFileIndex = u32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template field {0} has no value")]
    MissingField(KeyField),
    #[error("unknown placeholder {{{0}}} in pattern")]
    UnknownPlaceholder(String),
    #[error("unterminated placeholder in pattern {0:?}")]
    Unterminated(String),
    #[error("fields {0} and {1} are adjacent without a separator")]
    AdjacentFields(KeyField, KeyField),
}

impl TemplateError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ConfigurationError
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyField {
    StoreId,
    Sequence,
    Index,
}

impl KeyField {
    fn width(self) -> usize {
        match self {
            KeyField::StoreId | KeyField::Sequence => 16,
            KeyField::Index => 8,
        }
    }

    fn placeholder(self) -> &'static str {
        match self {
            KeyField::StoreId => "store_id",
            KeyField::Sequence => "seq",
            KeyField::Index => "index",
        }
    }

    fn from_placeholder(name: &str) -> Option<Self> {
        match name {
            "store_id" => Some(KeyField::StoreId),
            "seq" => Some(KeyField::Sequence),
            "index" => Some(KeyField::Index),
            _ => None,
        }
    }
}

impl fmt::Display for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.placeholder())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemplateSegment {
    Literal(String),
    Field(KeyField),
}

/// Values substituted into a [`KeyTemplate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyArgs {
    pub store_id: Option<StoreId>,
    pub sequence: Option<Sequence>,
    pub index: Option<DataFileIndex>,
}

impl KeyArgs {
    pub fn store(store_id: StoreId) -> Self {
        Self {
            store_id: Some(store_id),
            ..Self::default()
        }
    }

    pub fn manifest(store_id: StoreId, sequence: Sequence) -> Self {
        Self {
            store_id: Some(store_id),
            sequence: Some(sequence),
            index: None,
        }
    }

    pub fn data_file(store_id: StoreId, sequence: Sequence, index: DataFileIndex) -> Self {
        Self {
            store_id: Some(store_id),
            sequence: Some(sequence),
            index: Some(index),
        }
    }

    fn get(&self, field: KeyField) -> Option<u64> {
        match field {
            KeyField::StoreId => self.store_id,
            KeyField::Sequence => self.sequence,
            KeyField::Index => self.index.map(u64::from),
        }
    }

    fn set(&mut self, field: KeyField, value: u64) -> bool {
        match field {
            KeyField::StoreId => self.store_id = Some(value),
            KeyField::Sequence => self.sequence = Some(value),
            KeyField::Index => match DataFileIndex::try_from(value) {
                Ok(index) => self.index = Some(index),
                Err(_) => return false,
            },
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyTemplate {
    segments: Vec<TemplateSegment>,
}

impl KeyTemplate {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn literal(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            return self;
        }
        if let Some(TemplateSegment::Literal(last)) = self.segments.last_mut() {
            last.push_str(&text);
        } else {
            self.segments.push(TemplateSegment::Literal(text));
        }
        self
    }

    pub fn field(mut self, field: KeyField) -> Self {
        self.segments.push(TemplateSegment::Field(field));
        self
    }

    /// `s{store_id}/manifest/mf_{seq}`
    pub fn default_manifest() -> Self {
        Self::new()
            .literal("s")
            .field(KeyField::StoreId)
            .literal("/manifest/mf_")
            .field(KeyField::Sequence)
    }

    /// `s{store_id}/data/dat_{seq}_{index}`
    pub fn default_data_file() -> Self {
        Self::new()
            .literal("s")
            .field(KeyField::StoreId)
            .literal("/data/dat_")
            .field(KeyField::Sequence)
            .literal("_")
            .field(KeyField::Index)
    }

    /// Parse a placeholder pattern such as `"{dir}/dat_{seq}_{index}"`.
    ///
    /// Recognized placeholders are `{store_id}`, `{seq}` and `{index}`.
    pub fn from_pattern(pattern: &str) -> Result<Self, TemplateError> {
        let mut template = Self::new();
        let mut rest = pattern;
        while let Some(open) = rest.find('{') {
            template = template.literal(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| TemplateError::Unterminated(pattern.to_string()))?;
            let name = &after[..close];
            let field = KeyField::from_placeholder(name)
                .ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
            if let Some(TemplateSegment::Field(previous)) = template.segments.last() {
                return Err(TemplateError::AdjacentFields(*previous, field));
            }
            template = template.field(field);
            rest = &after[close + 1..];
        }
        Ok(template.literal(rest))
    }

    pub fn segments(&self) -> &[TemplateSegment] {
        &self.segments
    }

    pub fn render(&self, args: &KeyArgs) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => out.push_str(text),
                TemplateSegment::Field(field) => {
                    let value = args.get(*field).ok_or(TemplateError::MissingField(*field))?;
                    out.push_str(&format!("{value:0width$x}", width = field.width()));
                }
            }
        }
        Ok(out)
    }

    /// Render up to the first field that `args` leaves unset.
    ///
    /// Used to derive listing prefixes such as a store's manifest namespace.
    pub fn prefix(&self, args: &KeyArgs) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => out.push_str(text),
                TemplateSegment::Field(field) => match args.get(*field) {
                    Some(value) => out.push_str(&format!("{value:0width$x}", width = field.width())),
                    None => break,
                },
            }
        }
        out
    }

    /// Recover field values from a rendered key. Returns `None` when the key
    /// was not produced by this template.
    pub fn parse(&self, rendered: &str) -> Option<KeyArgs> {
        let mut args = KeyArgs::default();
        let mut rest = rendered;
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => {
                    rest = rest.strip_prefix(text.as_str())?;
                }
                TemplateSegment::Field(field) => {
                    let width = field.width();
                    let digits = rest.get(..width)?;
                    if !digits.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
                        return None;
                    }
                    let value = u64::from_str_radix(digits, 16).ok()?;
                    if !args.set(*field, value) {
                        return None;
                    }
                    rest = &rest[width..];
                }
            }
        }
        rest.is_empty().then_some(args)
    }
}

impl Default for KeyTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => f.write_str(text)?,
                TemplateSegment::Field(field) => write!(f, "{{{}}}", field.placeholder())?,
            }
        }
        Ok(())
    }
}

/// Identity of one published manifest. Orders by `(store_id, sequence)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ManifestKey {
    pub store_id: StoreId,
    pub sequence: Sequence,
}

impl ManifestKey {
    pub fn new(store_id: StoreId, sequence: Sequence) -> Self {
        Self {
            store_id,
            sequence,
        }
    }

    pub fn object_key(&self, template: &KeyTemplate) -> Result<String, TemplateError> {
        template.render(&KeyArgs::manifest(self.store_id, self.sequence))
    }

    pub fn parse(template: &KeyTemplate, rendered: &str) -> Option<Self> {
        let args = template.parse(rendered)?;
        Some(Self::new(args.store_id?, args.sequence?))
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.store_id, self.sequence)
    }
}

/// Identity of a checkpoint data file within its producing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataFileId {
    pub sequence: Sequence,
    pub index: DataFileIndex,
}

impl DataFileId {
    pub fn new(sequence: Sequence, index: DataFileIndex) -> Self {
        Self { sequence, index }
    }

    pub(crate) fn encode(&self) -> u128 {
        ((self.sequence as u128) << 32) | (self.index as u128)
    }
}

impl fmt::Display for DataFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.sequence, self.index)
    }
}
