// used for persistence
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::HashMap;
use std::path::PathBuf;

// used to hand query results to the http endpoint
use serde::Serialize;

use tracing::{debug, trace};

use crate::construct::{NameHasher, PublicationBatch, now};
use crate::datatype::{Value, ValueType};
use crate::error::{Result, VantageError};
use crate::message::Identity;
use crate::sql;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(PathBuf),
}

impl From<Option<PathBuf>> for PersistenceMode {
    fn from(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => PersistenceMode::File(path),
            None => PersistenceMode::InMemory,
        }
    }
}

/// One cell of a query result, as SQLite stored it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<ValueRef<'_>> for Cell {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Cell::Null,
            ValueRef::Integer(i) => Cell::Integer(i),
            ValueRef::Real(r) => Cell::Real(r),
            ValueRef::Text(t) => Cell::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Cell::Blob(b.to_vec()),
        }
    }
}

/// Column names plus rows aligned positionally with them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    /// Position of a column, compared case-insensitively like SQLite does.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
    pub fn get(&self, row: usize, column: &str) -> Option<&Cell> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }
}

fn column_type(value_type: ValueType) -> &'static str {
    match value_type {
        ValueType::Integer32 | ValueType::Integer64 => "integer",
        ValueType::Double => "real",
        ValueType::String => "text",
    }
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ------------- Persistence -------------
pub struct Persistor {
    db: Connection,
    // lower-cased value name -> column name in tblVals
    columns: HashMap<String, String, NameHasher>,
}

impl Persistor {
    pub fn new(mode: &PersistenceMode) -> Result<Persistor> {
        let db = match mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        db.execute_batch(
            "
            create table if not exists tblPubs (
                row_id integer primary key,
                guid integer not null unique,
                title text not null,
                process_id integer not null,
                node_id text not null,
                prog_name text not null,
                prog_ver text not null,
                time_connect real not null,
                time_disconnect real null
            );
            create table if not exists tblEnums (
                row_id integer primary key,
                type text not null,
                text text not null,
                enum_val integer not null,
                constraint unique_enum unique (type, text)
            );
            create table if not exists tblData (
                row_id integer primary key,
                pub_guid integer not null references tblPubs(guid),
                name text not null,
                val_type text not null,
                constraint unique_name_per_pub unique (pub_guid, name)
            );
            create table if not exists tblVals (
                row_id integer primary key,
                pub_guid integer not null references tblPubs(guid),
                frame integer not null,
                time_send real not null,
                time_recv real not null
            );
            create table if not exists tblSnaps (
                row_id integer primary key,
                pub_guid integer not null references tblPubs(guid),
                name text not null,
                val_type text not null,
                val blob null,
                seq integer not null,
                frame integer not null,
                time_pack real not null,
                time_send real not null,
                time_recv real not null
            );
            create index if not exists idx_vals_frame on tblVals (pub_guid, frame);
            ",
        )?;
        for value_type in ValueType::ALL {
            db.execute(
                "insert or ignore into tblEnums (type, text, enum_val) values ('val_type', ?, ?)",
                params![value_type, value_type.tag()],
            )?;
        }
        let mut columns = HashMap::default();
        {
            let mut stmt = db.prepare("select name from pragma_table_info('tblVals')")?;
            let names = stmt.query_map([], |r| r.get::<_, String>(0))?;
            for name in names {
                let name = name?;
                columns.insert(name.to_lowercase(), name);
            }
        }
        debug!(?mode, columns = columns.len(), "store opened");
        Ok(Persistor { db, columns })
    }

    /// Allocates the next publication guid and records who connected.
    pub fn register(&mut self, identity: &Identity) -> Result<u64> {
        let tx = self.db.transaction()?;
        let guid: i64 = tx.query_row("select coalesce(max(guid), 0) + 1 from tblPubs", [], |r| {
            r.get(0)
        })?;
        tx.execute(
            "
            insert into tblPubs (
                guid, title, process_id, node_id, prog_name, prog_ver, time_connect
            ) values (?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                guid,
                identity.title,
                identity.process_id,
                identity.node_id,
                identity.program_name,
                identity.program_version,
                now()
            ],
        )?;
        tx.commit()?;
        debug!(guid, program = %identity.program_name, "publication registered");
        Ok(guid as u64)
    }

    pub fn unregister(&mut self, guid: u64) -> Result<()> {
        self.db.execute(
            "update tblPubs set time_disconnect = ? where guid = ? and time_disconnect is null",
            params![now(), guid as i64],
        )?;
        Ok(())
    }

    fn ensure_registered(&self, guid: u64) -> Result<()> {
        let known = self
            .db
            .query_row("select 1 from tblPubs where guid = ?", [guid as i64], |_| Ok(()))
            .optional()?;
        match known {
            Some(()) => Ok(()),
            None => Err(VantageError::Connection(format!("unknown publication {guid}"))),
        }
    }

    /// Names announced for a publication, with their types.
    pub fn announced(&self, guid: u64) -> Result<HashMap<String, ValueType, NameHasher>> {
        let mut stmt = self
            .db
            .prepare_cached("select name, val_type from tblData where pub_guid = ?")?;
        let rows = stmt.query_map([guid as i64], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, ValueType>(1)?))
        })?;
        let mut announced = HashMap::default();
        for row in rows {
            let (name, value_type) = row?;
            announced.insert(name, value_type);
        }
        Ok(announced)
    }

    /// Records the schema of a publication, adding a `tblVals` column for
    /// every name seen for the first time. Returns how many names were new
    /// to this publication.
    pub fn announce(&mut self, guid: u64, schema: &[(String, ValueType)]) -> Result<usize> {
        self.ensure_registered(guid)?;
        let announced = self.announced(guid)?;
        let mut added_columns = Vec::new();
        let mut new_names = 0;
        let tx = self.db.transaction()?;
        for (name, value_type) in schema {
            match announced.get(name) {
                Some(existing) if existing == value_type => continue,
                Some(existing) => {
                    return Err(VantageError::TypeMismatch {
                        name: name.clone(),
                        announced: *existing,
                        packed: *value_type,
                    });
                }
                None => (),
            }
            crate::construct::validate_name(name)?;
            // a tblVals column holds one value type, whichever publication announced it
            let stored = tx
                .query_row(
                    "select val_type from tblData where name = ? collate nocase limit 1",
                    [name],
                    |r| r.get::<_, ValueType>(0),
                )
                .optional()?;
            if let Some(existing) = stored.filter(|t| t != value_type) {
                return Err(VantageError::TypeMismatch {
                    name: name.clone(),
                    announced: existing,
                    packed: *value_type,
                });
            }
            tx.execute(
                "insert into tblData (pub_guid, name, val_type) values (?, ?, ?)",
                params![guid as i64, name, value_type],
            )?;
            new_names += 1;
            let key = name.to_lowercase();
            if !self.columns.contains_key(&key) && !added_columns.iter().any(|(k, _)| *k == key) {
                tx.execute_batch(&format!(
                    "alter table tblVals add column {} {};",
                    quoted(name),
                    column_type(*value_type)
                ))?;
                trace!(column = %name, "column added");
                added_columns.push((key, name.clone()));
            }
        }
        tx.commit()?;
        self.columns.extend(added_columns);
        debug!(guid, new_names, "schema announced");
        Ok(new_names)
    }

    /// Stores one batch atomically and returns the row id of its `tblVals`
    /// row. A batch whose frame was already stored for the publication is
    /// acknowledged again without being stored twice.
    pub fn publish(&mut self, guid: u64, batch: &PublicationBatch) -> Result<i64> {
        self.ensure_registered(guid)?;
        let existing = self
            .db
            .query_row(
                "select row_id from tblVals where pub_guid = ? and frame = ?",
                params![guid as i64, batch.frame as i64],
                |r| r.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(row_id) = existing {
            debug!(guid, frame = batch.frame, row_id, "frame already stored");
            return Ok(row_id);
        }
        let announced = self.announced(guid)?;
        let mut columns = Vec::with_capacity(batch.len());
        for snapshot in batch.entries() {
            match announced.get(&snapshot.name) {
                None => return Err(VantageError::SchemaNotAnnounced(snapshot.name.clone())),
                Some(value_type) if *value_type != snapshot.value_type() => {
                    return Err(VantageError::TypeMismatch {
                        name: snapshot.name.clone(),
                        announced: *value_type,
                        packed: snapshot.value_type(),
                    });
                }
                Some(_) => (),
            }
            let column = self
                .columns
                .get(&snapshot.name.to_lowercase())
                .ok_or_else(|| VantageError::SchemaNotAnnounced(snapshot.name.clone()))?;
            columns.push(quoted(column));
        }

        let time_recv = now();
        let mut insert = String::from("insert into tblVals (pub_guid, frame, time_send, time_recv");
        for column in &columns {
            insert.push_str(", ");
            insert.push_str(column);
        }
        insert.push_str(") values (?, ?, ?, ?");
        insert.push_str(&", ?".repeat(columns.len()));
        insert.push(')');

        let mut values: Vec<rusqlite::types::Value> = vec![
            (guid as i64).into(),
            (batch.frame as i64).into(),
            batch.time_send.into(),
            time_recv.into(),
        ];
        values.extend(batch.entries().iter().map(|s| sql_value(&s.value)));

        let tx = self.db.transaction()?;
        tx.execute(&insert, params_from_iter(values))?;
        let row_id = tx.last_insert_rowid();
        {
            let mut snap = tx.prepare_cached(
                "
                insert into tblSnaps (
                    pub_guid, name, val_type, val, seq, frame, time_pack, time_send, time_recv
                ) values (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for snapshot in batch.entries() {
                snap.execute(params![
                    guid as i64,
                    snapshot.name,
                    snapshot.value_type(),
                    snapshot.value,
                    snapshot.seq as i64,
                    batch.frame as i64,
                    snapshot.time_pack,
                    batch.time_send,
                    time_recv
                ])?;
            }
        }
        tx.commit()?;
        debug!(guid, frame = batch.frame, entries = batch.len(), row_id, "batch stored");
        Ok(row_id)
    }

    /// Runs a query from the accepted subset against the store.
    pub fn query(&self, text: &str) -> Result<QueryResult> {
        let select = sql::parse(text)?;
        let (statement, params) = select.to_sql();
        trace!(%statement, "query rendered");
        let execution = |e: rusqlite::Error| VantageError::QueryExecution(e.to_string());
        let mut stmt = self.db.prepare(&statement).map_err(execution)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(params)).map_err(execution)?;
        let mut result = QueryResult { columns, rows: Vec::new() };
        while let Some(row) = rows.next().map_err(execution)? {
            let mut cells = Vec::with_capacity(result.columns.len());
            for i in 0..result.columns.len() {
                cells.push(Cell::from(row.get_ref(i).map_err(execution)?));
            }
            result.rows.push(cells);
        }
        Ok(result)
    }
}

fn sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Integer32(i) => rusqlite::types::Value::Integer(i64::from(*i)),
        Value::Integer64(l) => rusqlite::types::Value::Integer(*l),
        Value::Double(d) => rusqlite::types::Value::Real(*d),
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
    }
}
