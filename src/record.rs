//! Durable on-disk schema.
//!
//! A flushed buffer becomes one [`ColumnBatch`]: one vector per fixed column
//! plus one nullable column per payload field seen in the batch. The batch is
//! bincode-encoded and written as a single frame
//! `[len:u32 LE][crc32:u32 LE][payload]`.
use crate::envelope::{Payload, Source};
use anyhow::{Context, Result, bail, ensure};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Read, Write};

pub const PART_FORMAT_VERSION: u16 = 1;

/// Envelope plus the fields assigned by the event store.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub ts: u128, // wall-clock receive time, unix ns
    pub source: Source,
    pub doc_type: String,
    pub session_id: String,
    pub seq: u64,
    pub event_name: String,
    pub fields: Payload,
}

/// Typed cell of a payload column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    /// Arrays and nested objects, kept as JSON text.
    Json(String),
}

impl FieldValue {
    /// `None` stands for JSON null.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => Some(if let Some(i) = n.as_i64() {
                FieldValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                FieldValue::UInt(u)
            } else {
                FieldValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }),
            Value::String(s) => Some(FieldValue::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => Some(FieldValue::Json(value.to_string())),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::UInt(u) => Value::from(*u),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Json(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        }
    }
}

/// Column-major batch of records, the content of one part file.
///
/// Every column has `len()` entries. A payload column holds `None` for rows
/// whose payload did not carry that field (or carried null).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnBatch {
    pub version: u16,
    pub ts: Vec<u128>,
    pub source: Vec<Source>,
    pub doc_type: Vec<String>,
    pub session_id: Vec<String>,
    pub seq: Vec<u64>,
    pub event_name: Vec<String>,
    pub fields: BTreeMap<String, Vec<Option<FieldValue>>>,
}

impl ColumnBatch {
    pub fn from_records(records: &[PersistedRecord]) -> Self {
        let rows = records.len();
        let mut fields: BTreeMap<String, Vec<Option<FieldValue>>> = BTreeMap::new();
        for (row, rec) in records.iter().enumerate() {
            for (key, value) in &rec.fields {
                let column = fields.entry(key.clone()).or_insert_with(|| vec![None; rows]);
                column[row] = FieldValue::from_json(value);
            }
        }
        Self {
            version: PART_FORMAT_VERSION,
            ts: records.iter().map(|r| r.ts).collect(),
            source: records.iter().map(|r| r.source).collect(),
            doc_type: records.iter().map(|r| r.doc_type.clone()).collect(),
            session_id: records.iter().map(|r| r.session_id.clone()).collect(),
            seq: records.iter().map(|r| r.seq).collect(),
            event_name: records.iter().map(|r| r.event_name.clone()).collect(),
            fields,
        }
    }

    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let rows = self.len();
        ensure!(self.version == PART_FORMAT_VERSION, "unsupported part format version {}", self.version);
        ensure!(
            self.ts.len() == rows
                && self.source.len() == rows
                && self.doc_type.len() == rows
                && self.session_id.len() == rows
                && self.event_name.len() == rows,
            "fixed columns have mismatched lengths"
        );
        for (name, column) in &self.fields {
            ensure!(column.len() == rows, "column {name} has {} rows, expected {rows}", column.len());
        }
        Ok(())
    }

    /// Rebuild row records. Null cells are omitted from the payload.
    pub fn into_records(self) -> Result<Vec<PersistedRecord>> {
        self.validate()?;
        let mut out: Vec<PersistedRecord> = (0..self.len())
            .map(|i| PersistedRecord {
                ts: self.ts[i],
                source: self.source[i],
                doc_type: self.doc_type[i].clone(),
                session_id: self.session_id[i].clone(),
                seq: self.seq[i],
                event_name: self.event_name[i].clone(),
                fields: Payload::new(),
            })
            .collect();
        for (name, column) in self.fields {
            for (row, cell) in column.into_iter().enumerate() {
                if let Some(value) = cell {
                    out[row].fields.insert(name.clone(), value.to_json());
                }
            }
        }
        Ok(out)
    }
}

/// Encode a batch as one complete frame.
pub fn encode_frame(batch: &ColumnBatch) -> bincode::Result<Vec<u8>> {
    let payload = bincode::serialize(batch)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let len = u32::try_from(payload.len())
        .map_err(|_| Box::new(bincode::ErrorKind::Custom("column batch larger than 4 GiB".into())))?;
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn write_frame<W: Write>(w: &mut W, batch: &ColumnBatch) -> Result<()> {
    let frame = encode_frame(batch).context("bincode encode")?;
    w.write_all(&frame)?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<ColumnBatch> {
    let len = read_u32(r).context("read frame length")? as usize;
    let crc_on_file = read_u32(r).context("read frame crc")?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).context("read frame payload")?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc_calc = hasher.finalize();
    if crc_calc != crc_on_file {
        bail!("CRC mismatch: file={crc_on_file:#x}, calc={crc_calc:#x}");
    }
    bincode::deserialize(&payload).context("bincode decode")
}
