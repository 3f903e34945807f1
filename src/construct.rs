// other keepers use HashMap with a fast hasher
use core::hash::BuildHasherDefault;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use seahash::SeaHasher;

// used to validate names before they become store columns
use lazy_static::lazy_static;
use regex::Regex;

// used to print out readable forms of a construct
use std::fmt;

// our own stuff that we need
use crate::datatype::{Value, ValueType};
use crate::error::{Result, VantageError};

pub type NameHasher = BuildHasherDefault<SeaHasher>;

/// Columns every observation row carries; value names may not shadow them.
pub const RESERVED_NAMES: [&str; 8] = [
    "row_id", "rowid", "oid", "_rowid_", "pub_guid", "frame", "time_send", "time_recv",
];

lazy_static! {
    static ref VALID_NAME: Regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,127}$").unwrap();
}

pub fn validate_name(name: &str) -> Result<()> {
    if !VALID_NAME.is_match(name)
        || RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name))
    {
        return Err(VantageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Seconds since the Unix epoch, the unit every timestamp is kept in.
pub fn now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9
}

// ------------- NamedValue -------------
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValue {
    name: String,
    value_type: ValueType,
    value: Value,
    seq: u64,
    time_pack: f64,
    announced: bool,
}

impl NamedValue {
    pub fn new(name: String, value: Value) -> Self {
        Self {
            name,
            value_type: value.value_type(),
            value,
            seq: 1,
            time_pack: now(),
            announced: false,
        }
    }
    // Type and name are only exposed through getters since a value's
    // type is fixed once it has been created.
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }
    pub fn value(&self) -> &Value {
        &self.value
    }
    pub fn seq(&self) -> u64 {
        self.seq
    }
    pub fn time_pack(&self) -> f64 {
        self.time_pack
    }
    pub fn announced(&self) -> bool {
        self.announced
    }
    fn update(&mut self, value: Value) {
        self.value = value;
        self.seq += 1;
        self.time_pack = now();
    }
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            name: self.name.clone(),
            value: self.value.clone(),
            seq: self.seq,
            time_pack: self.time_pack,
        }
    }
}

impl fmt::Display for NamedValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}::<{}> = {} (#{})", self.name, self.value_type, self.value, self.seq)
    }
}

// ------------- Snapshot -------------
/// A named value as it was at one pack.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub name: String,
    pub value: Value,
    pub seq: u64,
    pub time_pack: f64,
}

impl Snapshot {
    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }
}

// ------------- PublicationBatch -------------
/// Snapshots gathered since the last acknowledged publish, one per name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublicationBatch {
    pub frame: u64,
    pub time_send: f64,
    entries: Vec<Snapshot>,
    positions: HashMap<String, usize, NameHasher>,
}

impl PublicationBatch {
    pub fn new() -> Self {
        Self::default()
    }
    /// Replaces an earlier snapshot of the same name in place, keeping
    /// first-pack order.
    pub fn record(&mut self, snapshot: Snapshot) {
        match self.positions.entry(snapshot.name.clone()) {
            Entry::Occupied(e) => self.entries[*e.get()] = snapshot,
            Entry::Vacant(e) => {
                e.insert(self.entries.len());
                self.entries.push(snapshot);
            }
        }
    }
    pub fn entries(&self) -> &[Snapshot] {
        &self.entries
    }
    pub fn get(&self, name: &str) -> Option<&Snapshot> {
        self.positions.get(name).map(|i| &self.entries[*i])
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Rebuilds a batch from decoded entries (the receiving side).
    pub fn from_entries(frame: u64, time_send: f64, entries: Vec<Snapshot>) -> Self {
        let mut batch = Self { frame, time_send, ..Self::default() };
        for entry in entries {
            batch.record(entry);
        }
        batch
    }
}

// ------------- ValueKeeper -------------
/// Owns the named values registered in a session.
#[derive(Debug, Default)]
pub struct ValueKeeper {
    kept: HashMap<String, NamedValue, NameHasher>,
}

impl ValueKeeper {
    pub fn new() -> Self {
        Self { kept: HashMap::default() }
    }
    /// Creates or updates `name`, returning a snapshot of the kept value
    /// and whether it was previously kept.
    pub fn keep(&mut self, name: &str, value: Value) -> Result<(Snapshot, bool)> {
        match self.kept.entry(name.to_owned()) {
            Entry::Occupied(mut e) => {
                let kept = e.get_mut();
                if kept.value_type != value.value_type() {
                    return Err(VantageError::TypeMismatch {
                        name: name.to_owned(),
                        announced: kept.value_type,
                        packed: value.value_type(),
                    });
                }
                kept.update(value);
                Ok((kept.snapshot(), true))
            }
            Entry::Vacant(e) => {
                validate_name(name)?;
                let kept = e.insert(NamedValue::new(name.to_owned(), value));
                Ok((kept.snapshot(), false))
            }
        }
    }
    pub fn get(&self, name: &str) -> Option<&NamedValue> {
        self.kept.get(name)
    }
    /// Names (and types) not yet announced, sorted by name.
    pub fn unannounced(&self) -> Vec<(String, ValueType)> {
        let mut pending: Vec<_> = self
            .kept
            .values()
            .filter(|v| !v.announced)
            .map(|v| (v.name.clone(), v.value_type))
            .collect();
        pending.sort();
        pending
    }
    pub fn mark_announced<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            if let Some(kept) = self.kept.get_mut(name) {
                kept.announced = true;
            }
        }
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeper_rejects_type_change_either_way() {
        let mut keeper = ValueKeeper::new();
        keeper.keep("a", Value::Integer32(1)).unwrap();
        assert!(matches!(
            keeper.keep("a", Value::Integer64(1)),
            Err(VantageError::TypeMismatch { .. })
        ));
        keeper.keep("b", Value::Integer64(1)).unwrap();
        assert!(matches!(
            keeper.keep("b", Value::Integer32(1)),
            Err(VantageError::TypeMismatch { .. })
        ));
        // the failed re-pack left the kept value untouched
        assert_eq!(keeper.get("a").unwrap().seq(), 1);
    }

    #[test]
    fn keeper_counts_sequence() {
        let mut keeper = ValueKeeper::new();
        let (first, existed) = keeper.keep("loop_val", Value::Integer32(1)).unwrap();
        assert!(!existed);
        assert_eq!(first.seq, 1);
        let (second, existed) = keeper.keep("loop_val", Value::Integer32(1)).unwrap();
        assert!(existed);
        assert_eq!(second.seq, 2);
    }

    #[test]
    fn unannounced_shrinks_after_marking() {
        let mut keeper = ValueKeeper::new();
        keeper.keep("b", Value::Double(1.0)).unwrap();
        keeper.keep("a", Value::String("x".into())).unwrap();
        assert_eq!(
            keeper.unannounced(),
            vec![("a".to_string(), ValueType::String), ("b".to_string(), ValueType::Double)]
        );
        keeper.mark_announced(["a"]);
        assert_eq!(keeper.unannounced(), vec![("b".to_string(), ValueType::Double)]);
    }

    #[test]
    fn batch_keeps_last_value_in_first_order() {
        let mut batch = PublicationBatch::new();
        let mut keeper = ValueKeeper::new();
        for (name, v) in [("x", 1), ("y", 2), ("x", 3)] {
            let (snap, _) = keeper.keep(name, Value::Integer32(v)).unwrap();
            batch.record(snap);
        }
        let names: Vec<_> = batch.entries().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(batch.get("x").unwrap().value, Value::Integer32(3));
    }

    #[test]
    fn names_are_validated() {
        for good in ["x", "loop_val", "0abc", "node.cpu-load", "_hidden"] {
            assert!(validate_name(good).is_ok(), "{good}");
        }
        for bad in ["", "has space", "semi;colon", "quote\"d", "FRAME", "rowid", "-lead"] {
            assert!(matches!(validate_name(bad), Err(VantageError::InvalidName(_))), "{bad}");
        }
        assert!(validate_name(&"n".repeat(129)).is_err());
    }
}
