//! Field decoding: source bytes to typed values.

use std::fmt;

use csv::ByteRecord;

use super::table::{ColumnType, SourceEncoding, TableSpec};

/// One typed field of a row. Empty source fields become [`Value::Null`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
}

impl Value {
    /// Approximate in-memory size used for batch byte budgets.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        match self {
            Self::Null => 1,
            Self::Text(s) => s.len(),
            Self::Integer(_) | Self::Decimal(_) => 8,
        }
    }
}

/// Why a record was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    WrongFieldCount { expected: usize, found: usize },
    InvalidNumber { column: &'static str, value: String },
    InvalidUtf8 { column: &'static str },
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongFieldCount { expected, found } => {
                write!(f, "expected {expected} fields, found {found}")
            }
            Self::InvalidNumber { column, value } => {
                write!(f, "column {column}: '{value}' is not a number")
            }
            Self::InvalidUtf8 { column } => write!(f, "column {column}: invalid UTF-8"),
        }
    }
}

/// Decodes raw bytes in the given encoding.
///
/// Latin-1 maps each byte to the code point of the same value, so it never
/// fails.
pub fn decode_text(bytes: &[u8], encoding: SourceEncoding) -> Option<String> {
    match encoding {
        SourceEncoding::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        SourceEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
    }
}

/// Converts a raw record into the table's typed row.
///
/// # Errors
///
/// Returns [`MalformedRecord`] for a wrong field count, a non-numeric value
/// in a numeric column, or invalid UTF-8 in a UTF-8 table.
pub fn convert_record(record: &ByteRecord, spec: &TableSpec) -> Result<Vec<Value>, MalformedRecord> {
    if record.len() != spec.columns.len() {
        return Err(MalformedRecord::WrongFieldCount {
            expected: spec.columns.len(),
            found: record.len(),
        });
    }

    spec.columns
        .iter()
        .zip(record.iter())
        .map(|(column, raw)| {
            let text = decode_text(raw, spec.encoding)
                .ok_or(MalformedRecord::InvalidUtf8 {
                    column: column.name,
                })?;
            convert_field(&text, column.kind, column.name)
        })
        .collect()
}

fn convert_field(
    text: &str,
    kind: ColumnType,
    column: &'static str,
) -> Result<Value, MalformedRecord> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    let invalid = || MalformedRecord::InvalidNumber {
        column,
        value: trimmed.to_string(),
    };
    match kind {
        ColumnType::Text => Ok(Value::Text(text.to_string())),
        ColumnType::Integer => trimmed.parse::<i64>().map(Value::Integer).map_err(|_| invalid()),
        ColumnType::Decimal => trimmed
            .replace(',', ".")
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Value::Decimal)
            .ok_or_else(invalid),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::load::table::table_spec;

    fn record(fields: &[&[u8]]) -> ByteRecord {
        let mut record = ByteRecord::new();
        for field in fields {
            record.push_field(field);
        }
        record
    }

    #[test]
    fn test_latin1_decodes_accents() {
        // "SÃO JOSÉ" in ISO-8859-1
        let bytes = [0x53, 0xC3, 0x4F, 0x20, 0x4A, 0x4F, 0x53, 0xC9];
        assert_eq!(
            decode_text(&bytes, SourceEncoding::Latin1).unwrap(),
            "SÃO JOSÉ"
        );
        assert!(decode_text(&bytes, SourceEncoding::Utf8).is_none());
    }

    #[test]
    fn test_empresa_row_is_typed() {
        let spec = table_spec("empresa").unwrap();
        let row = convert_record(
            &record(&[b"00000000", b"BANCO DO BRASIL SA", b"2038", b"10", b"120000000000,00", b"05", b""]),
            spec,
        )
        .unwrap();
        assert_eq!(row[0], Value::Text("00000000".into()));
        assert_eq!(row[2], Value::Integer(2038));
        assert_eq!(row[4], Value::Decimal(120_000_000_000.0));
        assert_eq!(row[5], Value::Integer(5));
        assert_eq!(row[6], Value::Null);
    }

    #[test]
    fn test_short_record_is_malformed() {
        let spec = table_spec("empresa").unwrap();
        let err = convert_record(&record(&[b"1", b"x", b"2", b"3", b"4,0"]), spec).unwrap_err();
        assert_eq!(
            err,
            MalformedRecord::WrongFieldCount {
                expected: 7,
                found: 5
            }
        );
    }

    #[test]
    fn test_non_numeric_integer_is_malformed() {
        let spec = table_spec("moti").unwrap();
        let err = convert_record(&record(&[b"A1", b"MOTIVO"]), spec).unwrap_err();
        assert!(matches!(
            err,
            MalformedRecord::InvalidNumber {
                column: "codigo",
                ..
            }
        ));
        assert!(err.to_string().contains("A1"));
    }

    #[test]
    fn test_cnae_codes_stay_text() {
        let spec = table_spec("cnae").unwrap();
        let row = convert_record(&record(&[b"0111301", b"Cultivo de arroz"]), spec).unwrap();
        assert_eq!(row[0], Value::Text("0111301".into()));
    }
}
