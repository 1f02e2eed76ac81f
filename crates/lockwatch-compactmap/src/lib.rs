//! An ordered map kept as a list of small sorted buffers.
//!
//! Each buffer holds at most [`MAX_BUFFER_LEN`] entries, buffers do not
//! overlap, and they are ordered by key, so lookups are two binary searches
//! and inserts only shift within one buffer. A full buffer is split in half.
//!
//! The map persists to a little-endian binary file:
//!
//! ```text
//! [u64 entry count]
//! repeated: [u32 key len][key bytes][u32 value len][value bytes]
//! ```
//!
//! Element bytes come from the [`Codec`] trait.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

mod codec;

pub use codec::Codec;

pub const MAX_BUFFER_LEN: usize = 1000;

#[derive(Debug)]
pub enum CompactMapError {
    Io(io::Error),
    /// The input ended before a length-prefixed item was complete.
    Truncated { needed: usize, available: usize },
    InvalidUtf8(std::str::Utf8Error),
    /// An encoded element does not fit a `u32` length prefix.
    UnsupportedLength(usize),
}

impl fmt::Display for CompactMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "compact map I/O error: {e}"),
            Self::Truncated { needed, available } => write!(
                f,
                "truncated compact map data: needed {needed} bytes, {available} available"
            ),
            Self::InvalidUtf8(e) => write!(f, "invalid UTF-8 in compact map string: {e}"),
            Self::UnsupportedLength(len) => {
                write!(f, "encoded element of {len} bytes exceeds the u32 length prefix")
            }
        }
    }
}

impl std::error::Error for CompactMapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidUtf8(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CompactMapError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

struct Inner<K, V> {
    buffers: Vec<Vec<(K, V)>>,
    changed: bool,
    synced_with: Option<PathBuf>,
}

enum Slot {
    Found(usize, usize),
    Vacant(usize, usize),
    NoBuffers,
}

impl<K: Ord, V> Inner<K, V> {
    fn locate(&self, key: &K) -> Slot {
        if self.buffers.is_empty() {
            return Slot::NoBuffers;
        }
        // First buffer whose last key is >= `key`; past the end, the last one.
        let buffer = self
            .buffers
            .partition_point(|b| b.last().is_some_and(|(k, _)| k < key))
            .min(self.buffers.len() - 1);
        match self.buffers[buffer].binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(index) => Slot::Found(buffer, index),
            Err(index) => Slot::Vacant(buffer, index),
        }
    }

    fn insert(&mut self, key: K, value: V) {
        match self.locate(&key) {
            Slot::Found(buffer, index) => self.buffers[buffer][index].1 = value,
            Slot::Vacant(buffer, index) => {
                self.buffers[buffer].insert(index, (key, value));
                if self.buffers[buffer].len() > MAX_BUFFER_LEN {
                    let half = self.buffers[buffer].len() / 2;
                    let tail = self.buffers[buffer].split_off(half);
                    self.buffers.insert(buffer + 1, tail);
                }
            }
            Slot::NoBuffers => self.buffers.push(vec![(key, value)]),
        }
        self.changed = true;
    }

    fn len(&self) -> usize {
        self.buffers.iter().map(Vec::len).sum()
    }
}

/// A sorted map guarded by its own mutex. All methods take `&self`.
pub struct CompactMap<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Ord, V> CompactMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffers: Vec::new(),
                changed: false,
                synced_with: None,
            }),
        }
    }

    /// Inserts `key`, replacing the value if it is already present.
    pub fn add(&self, key: K, value: V) {
        self.inner.lock().insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let inner = self.inner.lock();
        match inner.locate(key) {
            Slot::Found(buffer, index) => Some(inner.buffers[buffer][index].1.clone()),
            _ => None,
        }
    }

    /// Returns whether the key was present.
    pub fn delete(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let Slot::Found(buffer, index) = inner.locate(key) else {
            return false;
        };
        inner.buffers[buffer].remove(index);
        if inner.buffers[buffer].is_empty() {
            inner.buffers.remove(buffer);
        }
        inner.changed = true;
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        matches!(self.inner.lock().locate(key), Slot::Found(..))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffers.is_empty()
    }

    /// Visits entries in ascending key order until `f` returns `false`.
    ///
    /// The map stays locked for the whole walk: `f` must not call back into
    /// the same map.
    pub fn iterate(&self, mut f: impl FnMut(&K, &V) -> bool) {
        let inner = self.inner.lock();
        for (key, value) in inner.buffers.iter().flatten() {
            if !f(key, value) {
                return;
            }
        }
    }

    /// Clones out every entry matching `pred`, in key order.
    pub fn find(&self, mut pred: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let inner = self.inner.lock();
        inner
            .buffers
            .iter()
            .flatten()
            .filter(|(k, v)| pred(k, v))
            .cloned()
            .collect()
    }
}

impl<K: Ord, V> Default for CompactMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Codec, V: Codec> CompactMap<K, V> {
    /// Writes the map to `path`.
    ///
    /// Does nothing if the map has not changed since it was last saved to,
    /// or loaded from, the same path.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CompactMapError> {
        let path = path.as_ref();
        let mut inner = self.inner.lock();
        if !inner.changed && inner.synced_with.as_deref() == Some(path) {
            debug!(path = %path.display(), "compact map unchanged, skipping save");
            return Ok(());
        }

        let mut out = BufWriter::new(File::create(path)?);
        let count = inner.len();
        out.write_all(&(count as u64).to_le_bytes())?;

        let mut scratch = Vec::new();
        for (key, value) in inner.buffers.iter().flatten() {
            write_element(&mut out, &mut scratch, key)?;
            write_element(&mut out, &mut scratch, value)?;
        }
        out.flush()?;

        inner.changed = false;
        inner.synced_with = Some(path.to_path_buf());
        debug!(path = %path.display(), entries = count, "saved compact map");
        Ok(())
    }

    /// Merges the entries stored at `path` into the map. Stored values win
    /// over values already present for the same key.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), CompactMapError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let entries = decode_file::<K, V>(&bytes)?;
        let count = entries.len();

        let mut inner = self.inner.lock();
        for (key, value) in entries {
            inner.insert(key, value);
        }
        inner.changed = false;
        inner.synced_with = Some(path.to_path_buf());
        debug!(path = %path.display(), entries = count, "loaded compact map");
        Ok(())
    }
}

fn write_element<T: Codec>(
    out: &mut impl Write,
    scratch: &mut Vec<u8>,
    element: &T,
) -> Result<(), CompactMapError> {
    scratch.clear();
    element.encode(scratch);
    let len = u32::try_from(scratch.len())
        .map_err(|_| CompactMapError::UnsupportedLength(scratch.len()))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(scratch)?;
    Ok(())
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], CompactMapError> {
    if input.len() < n {
        return Err(CompactMapError::Truncated {
            needed: n,
            available: input.len(),
        });
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

fn read_element<T: Codec>(input: &mut &[u8]) -> Result<T, CompactMapError> {
    let len = u32::decode(take(input, 4)?)? as usize;
    T::decode(take(input, len)?)
}

fn decode_file<K: Codec, V: Codec>(bytes: &[u8]) -> Result<Vec<(K, V)>, CompactMapError> {
    let mut input = bytes;
    let count = u64::decode(take(&mut input, 8)?)?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let key = read_element::<K>(&mut input)?;
        let value = read_element::<V>(&mut input)?;
        entries.push((key, value));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lockwatch-compactmap-{}-{name}", std::process::id()))
    }

    fn keys<K: Ord + Clone, V>(map: &CompactMap<K, V>) -> Vec<K> {
        let mut out = Vec::new();
        map.iterate(|k, _| {
            out.push(k.clone());
            true
        });
        out
    }

    #[test]
    fn add_get_replace_delete() {
        let map = CompactMap::new();
        assert!(map.is_empty());

        map.add(3u32, "three".to_string());
        map.add(1, "one".to_string());
        map.add(2, "two".to_string());
        map.add(2, "deux".to_string());

        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&2).as_deref(), Some("deux"));
        assert!(map.contains(&1));
        assert!(map.get(&4).is_none());

        assert!(map.delete(&1));
        assert!(!map.delete(&1));
        assert!(!map.contains(&1));
        assert_eq!(keys(&map), vec![2, 3]);
    }

    #[test]
    fn full_buffers_split_and_stay_ordered() {
        let map = CompactMap::new();
        // Interleave so inserts land in the middle of existing buffers.
        for i in (0..5000u32).rev().step_by(2) {
            map.add(i, i);
        }
        for i in (0..5000u32).step_by(2) {
            map.add(i, i);
        }
        assert_eq!(map.len(), 5000);
        assert_eq!(keys(&map), (0..5000).collect::<Vec<_>>());

        let inner = map.inner.lock();
        assert!(inner.buffers.len() >= 5);
        assert!(inner.buffers.iter().all(|b| !b.is_empty() && b.len() <= MAX_BUFFER_LEN));
    }

    #[test]
    fn deleting_every_entry_leaves_an_empty_map() {
        let map = CompactMap::new();
        for i in 0..2500i64 {
            map.add(i, i * 2);
        }
        for i in 0..2500i64 {
            assert!(map.delete(&i));
        }
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);

        map.add(-1, -2);
        assert_eq!(map.get(&-1), Some(-2));
    }

    #[test]
    fn iterate_stops_early_and_find_filters() {
        let map = CompactMap::new();
        for i in 0..10u8 {
            map.add(i, i32::from(i) * 10);
        }

        let mut seen = 0;
        map.iterate(|_, _| {
            seen += 1;
            seen < 3
        });
        assert_eq!(seen, 3);

        let found = map.find(|k, v| k % 2 == 0 && *v >= 40);
        assert_eq!(found, vec![(4, 40), (6, 60), (8, 80)]);
    }

    #[test]
    fn file_layout_is_length_prefixed_little_endian() {
        let path = temp_path("layout");
        let map = CompactMap::new();
        map.add(1u16, "a".to_string());
        map.save(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let mut expected = 1u64.to_le_bytes().to_vec();
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.extend_from_slice(&5u32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.push(b'a');
        assert_eq!(bytes, expected);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_merges_into_existing_entries() {
        let path = temp_path("merge");
        let saved = CompactMap::new();
        saved.add("k1".to_string(), vec![1u8, 2, 3]);
        saved.add("k2".to_string(), vec![]);
        saved.save(&path).unwrap();

        let map = CompactMap::new();
        map.add("k0".to_string(), vec![0u8]);
        map.add("k1".to_string(), vec![9u8]);
        map.load(&path).unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&"k1".to_string()), Some(vec![1, 2, 3]));
        assert_eq!(map.get(&"k2".to_string()), Some(vec![]));
        assert_eq!(map.get(&"k0".to_string()), Some(vec![0]));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unchanged_map_skips_resave_to_same_path() {
        let path = temp_path("skip");
        let map = CompactMap::new();
        map.add(1u64, 1.5f64);
        map.save(&path).unwrap();

        // Clobber the file; an unchanged map must not rewrite it.
        std::fs::write(&path, b"junk").unwrap();
        map.save(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"junk");

        map.add(2, 2.5);
        map.save(&path).unwrap();
        let reloaded = CompactMap::<u64, f64>::new();
        reloaded.load(&path).unwrap();
        assert_eq!(reloaded.get(&2), Some(2.5));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let path = temp_path("truncated");
        let mut bytes = 2u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&7u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let map = CompactMap::<u32, u32>::new();
        let err = map.load(&path).unwrap_err();
        assert!(matches!(err, CompactMapError::Truncated { .. }));
        assert!(map.is_empty());

        let missing = map.load(temp_path("missing")).unwrap_err();
        assert!(matches!(missing, CompactMapError::Io(_)));

        let _ = std::fs::remove_file(&path);
    }
}
