use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The 3-bit type tag of a field on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FieldKind {
    Boolean = 0,
    Byte = 1,
    Char = 2,
    Short = 3,
    Integer = 4,
    Float = 5,
}

impl FieldKind {
    pub const ALL: [FieldKind; 6] = [
        FieldKind::Boolean,
        FieldKind::Byte,
        FieldKind::Char,
        FieldKind::Short,
        FieldKind::Integer,
        FieldKind::Float,
    ];

    /// The key under which decoded values of this kind are exposed to applications
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Boolean => "BooleanArray",
            FieldKind::Byte => "ByteArray",
            FieldKind::Char => "CharArray",
            FieldKind::Short => "ShortArray",
            FieldKind::Integer => "IntegerArray",
            FieldKind::Float => "FloatArray",
        }
    }

    /// Number of payload bytes for `count` elements of this kind
    pub fn payload_len(&self, count: usize) -> usize {
        match self {
            FieldKind::Boolean => count.div_ceil(8),
            FieldKind::Byte | FieldKind::Char => count,
            FieldKind::Short => count * size_of::<i16>(),
            FieldKind::Integer => count * size_of::<i32>(),
            FieldKind::Float => count * size_of::<f32>(),
        }
    }
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for FieldKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldKind::ALL.into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| anyhow!("unknown field kind {:?}", s))
    }
}

/// A homogeneous array of values, i.e. the payload of one field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValues {
    Booleans(Vec<bool>),
    Bytes(Vec<u8>),
    /// NB: the element count on the wire is the UTF-8 byte length
    Chars(String),
    Shorts(Vec<i16>),
    Integers(Vec<i32>),
    Floats(Vec<f32>),
}

impl FieldValues {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValues::Booleans(_) => FieldKind::Boolean,
            FieldValues::Bytes(_) => FieldKind::Byte,
            FieldValues::Chars(_) => FieldKind::Char,
            FieldValues::Shorts(_) => FieldKind::Short,
            FieldValues::Integers(_) => FieldKind::Integer,
            FieldValues::Floats(_) => FieldKind::Float,
        }
    }

    /// the number of elements as encoded in the field header
    pub fn count(&self) -> usize {
        match self {
            FieldValues::Booleans(v) => v.len(),
            FieldValues::Bytes(v) => v.len(),
            FieldValues::Chars(s) => s.len(),
            FieldValues::Shorts(v) => v.len(),
            FieldValues::Integers(v) => v.len(),
            FieldValues::Floats(v) => v.len(),
        }
    }

    fn empty(kind: FieldKind) -> FieldValues {
        match kind {
            FieldKind::Boolean => FieldValues::Booleans(Vec::new()),
            FieldKind::Byte => FieldValues::Bytes(Vec::new()),
            FieldKind::Char => FieldValues::Chars(String::new()),
            FieldKind::Short => FieldValues::Shorts(Vec::new()),
            FieldKind::Integer => FieldValues::Integers(Vec::new()),
            FieldKind::Float => FieldValues::Floats(Vec::new()),
        }
    }

    /// Appends `other` if it is of the same kind, returning it otherwise
    fn append(&mut self, other: FieldValues) -> Result<(), FieldValues> {
        match (self, other) {
            (FieldValues::Booleans(a), FieldValues::Booleans(b)) => a.extend(b),
            (FieldValues::Bytes(a), FieldValues::Bytes(b)) => a.extend(b),
            (FieldValues::Chars(a), FieldValues::Chars(b)) => a.push_str(&b),
            (FieldValues::Shorts(a), FieldValues::Shorts(b)) => a.extend(b),
            (FieldValues::Integers(a), FieldValues::Integers(b)) => a.extend(b),
            (FieldValues::Floats(a), FieldValues::Floats(b)) => a.extend(b),
            (_, other) => return Err(other),
        }
        Ok(())
    }
}

/// The application-level view of a frame's payload: at most one (concatenated) array per
///  field kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldMap {
    fields: BTreeMap<FieldKind, FieldValues>,
}

impl FieldMap {
    pub fn new() -> FieldMap {
        FieldMap::default()
    }

    /// Adds values, concatenating them to previously added values of the same kind. This is
    ///  the decoder's multiplexing rule, so several fields of one kind decode to a single entry.
    pub fn merge(&mut self, values: FieldValues) {
        let kind = values.kind();
        let entry = self.fields.entry(kind)
            .or_insert_with(|| FieldValues::empty(kind));

        if let Err(values) = entry.append(values) {
            // unreachable because entries are keyed by kind, but replacing is the sane fallback
            *entry = values;
        }
    }

    /// builder style convenience for [FieldMap::merge]
    pub fn with(mut self, values: FieldValues) -> FieldMap {
        self.merge(values);
        self
    }

    pub fn get(&self, kind: FieldKind) -> Option<&FieldValues> {
        self.fields.get(&kind)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&FieldValues> {
        let kind = FieldKind::from_str(name).ok()?;
        self.get(kind)
    }

    pub fn remove(&mut self, kind: FieldKind) -> Option<FieldValues> {
        self.fields.remove(&kind)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &FieldValues> {
        self.fields.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldValues)> {
        self.fields.iter()
            .map(|(kind, values)| (kind.name(), values))
    }

    /// true if some field has more elements than fit a single-byte field header
    pub fn requires_double_content_count(&self) -> bool {
        self.values()
            .any(|v| v.count() > super::frame::MAX_SHORT_FIELD_COUNT)
    }

    pub fn booleans(&self) -> Option<&[bool]> {
        match self.get(FieldKind::Boolean) {
            Some(FieldValues::Booleans(v)) => Some(v),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self.get(FieldKind::Byte) {
            Some(FieldValues::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn chars(&self) -> Option<&str> {
        match self.get(FieldKind::Char) {
            Some(FieldValues::Chars(s)) => Some(s),
            _ => None,
        }
    }

    pub fn shorts(&self) -> Option<&[i16]> {
        match self.get(FieldKind::Short) {
            Some(FieldValues::Shorts(v)) => Some(v),
            _ => None,
        }
    }

    pub fn integers(&self) -> Option<&[i32]> {
        match self.get(FieldKind::Integer) {
            Some(FieldValues::Integers(v)) => Some(v),
            _ => None,
        }
    }

    pub fn floats(&self) -> Option<&[f32]> {
        match self.get(FieldKind::Float) {
            Some(FieldValues::Floats(v)) => Some(v),
            _ => None,
        }
    }
}

impl FromIterator<FieldValues> for FieldMap {
    fn from_iter<T: IntoIterator<Item = FieldValues>>(iter: T) -> Self {
        let mut result = FieldMap::new();
        for values in iter {
            result.merge(values);
        }
        result
    }
}
