//! Typed decoding of tuple cells.
//!
//! Maps a column's type oid and cell payload (textual or binary wire form)
//! into a domain value. Unrecognized oids fall back to the server's textual
//! representation.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::decoder::TupleCell;
use crate::{Error, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Type oids recognized by the decoder registry.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
}

/// A decoded column value.
///
/// `Numeric` keeps the exact decimal rendering; arbitrary precision does not
/// fit a float. `Unknown` carries the textual form of an oid outside the
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Numeric(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Unknown(String),
}

/// Decodes one tuple cell against its column's type oid.
///
/// # Errors
///
/// `Malformed` when a recognized oid's payload cannot be interpreted, and for
/// unchanged-TOAST cells, which carry no value (callers filter them out).
pub fn decode(type_oid: u32, cell: &TupleCell) -> Result<PgValue> {
    match cell {
        TupleCell::Null => Ok(PgValue::Null),
        TupleCell::UnchangedToast => Err(Error::Malformed(
            "unchanged TOAST cell carries no value".to_string(),
        )),
        TupleCell::Text(raw) => decode_text(type_oid, raw),
        TupleCell::Binary(raw) => decode_binary(type_oid, raw),
    }
}

fn decode_text(type_oid: u32, raw: &Bytes) -> Result<PgValue> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::Malformed(format!("invalid UTF-8 in text cell: {e}")))?;

    match type_oid {
        oid::BOOL => match text {
            "t" | "true" => Ok(PgValue::Bool(true)),
            "f" | "false" => Ok(PgValue::Bool(false)),
            other => Err(malformed("bool", other)),
        },
        oid::INT2 => text
            .parse()
            .map(PgValue::Int2)
            .map_err(|_| malformed("int2", text)),
        oid::INT4 => text
            .parse()
            .map(PgValue::Int4)
            .map_err(|_| malformed("int4", text)),
        oid::INT8 => text
            .parse()
            .map(PgValue::Int8)
            .map_err(|_| malformed("int8", text)),
        oid::FLOAT4 => text
            .parse()
            .map(PgValue::Float4)
            .map_err(|_| malformed("float4", text)),
        oid::FLOAT8 => text
            .parse()
            .map(PgValue::Float8)
            .map_err(|_| malformed("float8", text)),
        oid::TEXT | oid::VARCHAR | oid::BPCHAR => Ok(PgValue::Text(text.to_string())),
        oid::BYTEA => decode_hex_bytea(text),
        oid::NUMERIC => Ok(PgValue::Numeric(text.to_string())),
        oid::DATE => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(PgValue::Date)
            .map_err(|_| malformed("date", text)),
        oid::TIME => NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
            .map(PgValue::Time)
            .map_err(|_| malformed("time", text)),
        oid::TIMESTAMP => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map(PgValue::Timestamp)
            .map_err(|_| malformed("timestamp", text)),
        oid::TIMESTAMPTZ => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .map(|dt| PgValue::TimestampTz(dt.with_timezone(&Utc)))
            .map_err(|_| malformed("timestamptz", text)),
        oid::UUID => Uuid::parse_str(text)
            .map(PgValue::Uuid)
            .map_err(|_| malformed("uuid", text)),
        oid::JSON | oid::JSONB => serde_json::from_str(text)
            .map(PgValue::Json)
            .map_err(|_| malformed("json", text)),
        _ => Ok(PgValue::Unknown(text.to_string())),
    }
}

fn decode_binary(type_oid: u32, raw: &Bytes) -> Result<PgValue> {
    match type_oid {
        oid::BOOL => match raw.as_ref() {
            [0] => Ok(PgValue::Bool(false)),
            [1] => Ok(PgValue::Bool(true)),
            _ => Err(Error::Malformed(format!(
                "bool binary payload of {} bytes",
                raw.len()
            ))),
        },
        oid::INT2 => fixed::<2>(raw, "int2").map(|b| PgValue::Int2(i16::from_be_bytes(b))),
        oid::INT4 => fixed::<4>(raw, "int4").map(|b| PgValue::Int4(i32::from_be_bytes(b))),
        oid::INT8 => fixed::<8>(raw, "int8").map(|b| PgValue::Int8(i64::from_be_bytes(b))),
        oid::FLOAT4 => fixed::<4>(raw, "float4").map(|b| PgValue::Float4(f32::from_be_bytes(b))),
        oid::FLOAT8 => fixed::<8>(raw, "float8").map(|b| PgValue::Float8(f64::from_be_bytes(b))),
        oid::TEXT | oid::VARCHAR | oid::BPCHAR => std::str::from_utf8(raw)
            .map(|s| PgValue::Text(s.to_string()))
            .map_err(|e| Error::Malformed(format!("invalid UTF-8 in text value: {e}"))),
        oid::BYTEA => Ok(PgValue::Bytea(raw.to_vec())),
        oid::NUMERIC => decode_binary_numeric(raw).map(PgValue::Numeric),
        oid::DATE => {
            let days = fixed::<4>(raw, "date").map(i32::from_be_bytes)?;
            let secs = i64::from(days) * 86_400 + PG_EPOCH_OFFSET_MICROS / 1_000_000;
            DateTime::from_timestamp(secs, 0)
                .map(|dt| PgValue::Date(dt.date_naive()))
                .ok_or_else(|| Error::Malformed(format!("date {days} days out of range")))
        }
        oid::TIME => {
            let micros = fixed::<8>(raw, "time").map(i64::from_be_bytes)?;
            NaiveTime::from_num_seconds_from_midnight_opt(
                (micros / 1_000_000) as u32,
                ((micros % 1_000_000) * 1_000) as u32,
            )
            .map(PgValue::Time)
            .ok_or_else(|| Error::Malformed(format!("time {micros}us out of range")))
        }
        oid::TIMESTAMP => timestamp_from_pg_micros(fixed::<8>(raw, "timestamp")?)
            .map(|dt| PgValue::Timestamp(dt.naive_utc())),
        oid::TIMESTAMPTZ => {
            timestamp_from_pg_micros(fixed::<8>(raw, "timestamptz")?).map(PgValue::TimestampTz)
        }
        oid::UUID => Uuid::from_slice(raw)
            .map(PgValue::Uuid)
            .map_err(|_| Error::Malformed(format!("uuid binary payload of {} bytes", raw.len()))),
        oid::JSON => serde_json::from_slice(raw)
            .map(PgValue::Json)
            .map_err(|e| Error::Malformed(format!("invalid json payload: {e}"))),
        oid::JSONB => {
            // One-byte format version precedes the document.
            match raw.split_first() {
                Some((&1, doc)) => serde_json::from_slice(doc)
                    .map(PgValue::Json)
                    .map_err(|e| Error::Malformed(format!("invalid jsonb payload: {e}"))),
                Some((v, _)) => Err(Error::Malformed(format!("unsupported jsonb version {v}"))),
                None => Err(Error::Malformed("empty jsonb payload".to_string())),
            }
        }
        _ => Ok(PgValue::Unknown(String::from_utf8_lossy(raw).to_string())),
    }
}

/// Textual bytea in the hex output format: `\x` then two hex digits per byte.
fn decode_hex_bytea(text: &str) -> Result<PgValue> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| malformed("bytea", text))?;
    if hex.len() % 2 != 0 {
        return Err(malformed("bytea", text));
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for pair in hex.as_bytes().chunks_exact(2) {
        let s = std::str::from_utf8(pair).map_err(|_| malformed("bytea", text))?;
        bytes.push(u8::from_str_radix(s, 16).map_err(|_| malformed("bytea", text))?);
    }
    Ok(PgValue::Bytea(bytes))
}

fn malformed(type_name: &str, text: &str) -> Error {
    Error::Malformed(format!("cannot decode {text:?} as {type_name}"))
}

fn fixed<const N: usize>(raw: &Bytes, type_name: &str) -> Result<[u8; N]> {
    raw.as_ref().try_into().map_err(|_| {
        Error::Malformed(format!(
            "{type_name} binary payload of {} bytes, expected {N}",
            raw.len()
        ))
    })
}

fn timestamp_from_pg_micros(raw: [u8; 8]) -> Result<DateTime<Utc>> {
    let micros = i64::from_be_bytes(raw);
    DateTime::from_timestamp_micros(micros + PG_EPOCH_OFFSET_MICROS)
        .ok_or_else(|| Error::Malformed(format!("timestamp {micros}us out of range")))
}

/// Renders the binary numeric wire form: u16 ndigits, i16 weight, u16 sign,
/// u16 dscale, then ndigits base-10000 digit groups.
fn decode_binary_numeric(raw: &Bytes) -> Result<String> {
    let buf = raw.as_ref();
    if buf.len() < 8 {
        return Err(Error::Malformed(format!(
            "numeric binary payload of {} bytes",
            buf.len()
        )));
    }
    let ndigits = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let weight = i16::from_be_bytes([buf[2], buf[3]]) as i32;
    let sign = u16::from_be_bytes([buf[4], buf[5]]);
    let dscale = u16::from_be_bytes([buf[6], buf[7]]) as usize;

    if buf.len() < 8 + ndigits * 2 {
        return Err(Error::Truncated {
            needed: 8 + ndigits * 2,
            remaining: buf.len(),
        });
    }
    let digit = |i: i32| -> u16 {
        if i < 0 || i as usize >= ndigits {
            0
        } else {
            let at = 8 + i as usize * 2;
            u16::from_be_bytes([buf[at], buf[at + 1]])
        }
    };

    match sign {
        0x0000 | 0x4000 => {}
        0xC000 => return Ok("NaN".to_string()),
        other => return Err(Error::Malformed(format!("numeric sign {other:#06x}"))),
    }

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                out.push_str(&digit(i).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(i)));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::new();
        let groups = (dscale + 3) / 4;
        for i in 0..groups {
            frac.push_str(&format!("{:04}", digit(weight + 1 + i as i32)));
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}
