//! A small persistent store of structs, queried by field.
//!
//! Records are any `Facet` type. Queries read fields by reflection: each
//! record is viewed as a `facet_value::Value` object and conditions compare
//! one named field against a value. The store saves to a single JSON file:
//!
//! ```text
//! { "next_id": 3, "records": [ { "id": 1, "record": { ... } }, ... ] }
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use facet::Facet;
use facet_value::{VObject, Value};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug)]
pub enum StructStoreError {
    Io(io::Error),
    /// A record could not be turned into JSON or a reflected value.
    Encode(String),
    /// Stored or updated data does not fit the record type.
    Decode(String),
    UnknownField(String),
    /// The store file parsed as JSON but does not have the expected layout.
    Malformed(&'static str),
}

impl fmt::Display for StructStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "struct store I/O error: {e}"),
            Self::Encode(e) => write!(f, "failed to encode record: {e}"),
            Self::Decode(e) => write!(f, "failed to decode record: {e}"),
            Self::UnknownField(field) => write!(f, "record has no field `{field}`"),
            Self::Malformed(what) => write!(f, "malformed store file: {what}"),
        }
    }
}

impl std::error::Error for StructStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StructStoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// ── Queries ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equal,
    Greater,
    Less,
    /// Substring match; only applies to string fields.
    Like,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Equal, value)
    }

    pub fn greater(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Greater, value)
    }

    pub fn less(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Less, value)
    }

    pub fn like(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Like, value)
    }

    fn matches(&self, record: &Value) -> bool {
        let Some(actual) = record.as_object().and_then(|o| o.get(&self.field)) else {
            return false;
        };
        match self.op {
            Op::Equal => match (numeric(actual), numeric(&self.value)) {
                (Some(a), Some(b)) => a == b,
                _ => actual == &self.value,
            },
            Op::Greater => compare(actual, &self.value) == Some(Ordering::Greater),
            Op::Less => compare(actual, &self.value) == Some(Ordering::Less),
            Op::Like => match (text(actual), text(&self.value)) {
                (Some(haystack), Some(needle)) => haystack.contains(needle),
                _ => false,
            },
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    let number = value.as_number()?;
    number
        .to_i64()
        .map(|n| n as f64)
        .or_else(|| number.to_u64().map(|n| n as f64))
        .or_else(|| number.to_f64())
}

fn text(value: &Value) -> Option<&str> {
    value.as_string().map(|s| s.as_str())
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (numeric(a), numeric(b)) {
        return a.partial_cmp(&b);
    }
    match (text(a), text(b)) {
        (Some(a), Some(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn reflect<T: for<'facet> Facet<'facet>>(record: &T) -> Result<Value, StructStoreError> {
    facet_value::to_value(record).map_err(|e| StructStoreError::Encode(e.to_string()))
}

/// Rebuilds a record from its reflected form by way of JSON.
fn rebuild<T: for<'facet> Facet<'facet>>(value: &Value) -> Result<T, StructStoreError> {
    let json = facet_json::to_string(value).map_err(|e| StructStoreError::Encode(e.to_string()))?;
    facet_json::from_str::<T>(&json).map_err(|e| StructStoreError::Decode(e.to_string()))
}

// ── Store ───────────────────────────────────────────────

struct Inner<T> {
    next_id: u64,
    records: BTreeMap<u64, T>,
}

/// Records keyed by monotonically increasing ids, backed by one JSON file.
///
/// Changes stay in memory until [`StructStore::save`].
pub struct StructStore<T> {
    path: PathBuf,
    inner: Mutex<Inner<T>>,
}

impl<T> StructStore<T>
where
    T: for<'facet> Facet<'facet> + Clone,
{
    /// Opens the store at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StructStoreError> {
        let path = path.into();
        let inner = match std::fs::read_to_string(&path) {
            Ok(text) => load(&text)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Inner {
                next_id: 1,
                records: BTreeMap::new(),
            },
            Err(e) => return Err(e.into()),
        };
        debug!(
            path = %path.display(),
            records = inner.records.len(),
            "opened struct store"
        );
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores `record` and returns its new id.
    pub fn add(&self, record: T) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.records.insert(id, record);
        id
    }

    pub fn get(&self, id: u64) -> Option<T> {
        self.inner.lock().records.get(&id).cloned()
    }

    /// Every record, in id order.
    pub fn get_all(&self) -> Vec<T> {
        self.inner.lock().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn delete(&self, id: u64) -> bool {
        self.inner.lock().records.remove(&id).is_some()
    }

    /// Removes every record. Ids keep counting up.
    pub fn clear(&self) {
        self.inner.lock().records.clear();
    }

    /// Replaces one field of a stored record.
    ///
    /// Returns `Ok(false)` if there is no record with `id`. The record is left
    /// untouched when the field does not exist or `value` does not fit it.
    pub fn set_field(
        &self,
        id: u64,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<bool, StructStoreError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get(&id) else {
            return Ok(false);
        };

        let mut reflected = reflect(record)?;
        let Some(object) = reflected.as_object_mut() else {
            return Err(StructStoreError::UnknownField(field.to_string()));
        };
        if object.get(field).is_none() {
            return Err(StructStoreError::UnknownField(field.to_string()));
        }
        object.insert(field, value.into());

        let updated = rebuild::<T>(&reflected)?;
        inner.records.insert(id, updated);
        Ok(true)
    }

    /// Visits records in id order until `f` returns `false`. The store stays
    /// locked meanwhile, so `f` must not call back into it.
    pub fn iterate(&self, mut f: impl FnMut(u64, &T) -> bool) {
        let inner = self.inner.lock();
        for (id, record) in &inner.records {
            if !f(*id, record) {
                return;
            }
        }
    }

    /// Records matching the conditions, in id order.
    ///
    /// With no conditions, `And` matches everything and `Or` matches nothing.
    pub fn find(
        &self,
        combine: Combine,
        conditions: &[Condition],
    ) -> Result<Vec<T>, StructStoreError> {
        let inner = self.inner.lock();
        let mut found = Vec::new();
        for record in inner.records.values() {
            let reflected = reflect(record)?;
            let hit = match combine {
                Combine::And => conditions.iter().all(|c| c.matches(&reflected)),
                Combine::Or => conditions.iter().any(|c| c.matches(&reflected)),
            };
            if hit {
                found.push(record.clone());
            }
        }
        Ok(found)
    }

    /// Writes the store to its file, replacing the previous contents.
    pub fn save(&self) -> Result<(), StructStoreError> {
        let json = {
            let inner = self.inner.lock();
            let records = inner
                .records
                .iter()
                .map(|(id, record)| {
                    let mut entry = VObject::new();
                    entry.insert("id", Value::from(*id));
                    entry.insert("record", reflect(record)?);
                    Ok(Value::from(entry))
                })
                .collect::<Result<Vec<Value>, StructStoreError>>()?;

            let mut root = VObject::new();
            root.insert("next_id", Value::from(inner.next_id));
            root.insert("records", records.into_iter().collect::<Value>());
            facet_json::to_string(&Value::from(root))
                .map_err(|e| StructStoreError::Encode(e.to_string()))?
        };

        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, json)?;
        std::fs::rename(&staging, &self.path)?;
        debug!(path = %self.path.display(), "saved struct store");
        Ok(())
    }
}

fn load<T: for<'facet> Facet<'facet>>(text: &str) -> Result<Inner<T>, StructStoreError> {
    let root: Value =
        facet_json::from_str(text).map_err(|e| StructStoreError::Decode(e.to_string()))?;
    let root = root
        .as_object()
        .ok_or(StructStoreError::Malformed("top level is not an object"))?;

    let next_id = root
        .get("next_id")
        .and_then(Value::as_number)
        .and_then(|n| n.to_u64())
        .ok_or(StructStoreError::Malformed("missing `next_id`"))?;
    let entries = root
        .get("records")
        .and_then(Value::as_array)
        .ok_or(StructStoreError::Malformed("missing `records`"))?;

    let mut records = BTreeMap::new();
    for entry in entries.iter() {
        let entry = entry
            .as_object()
            .ok_or(StructStoreError::Malformed("record entry is not an object"))?;
        let id = entry
            .get("id")
            .and_then(Value::as_number)
            .and_then(|n| n.to_u64())
            .ok_or(StructStoreError::Malformed("record entry without `id`"))?;
        let record = entry
            .get("record")
            .ok_or(StructStoreError::Malformed("record entry without `record`"))?;
        records.insert(id, rebuild::<T>(record)?);
    }

    // Never hand out an id that is already stored.
    let floor = records.keys().next_back().map_or(1, |max| max + 1);
    Ok(Inner {
        next_id: next_id.max(floor),
        records,
    })
}
