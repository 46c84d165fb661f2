//! Server-side prepared statements (binary protocol).
//!
//! 1. COM_STMT_PREPARE carries the SQL text. The server answers with a
//!    PREPARE_OK header, then parameter and column definitions.
//! 2. COM_STMT_EXECUTE binds positional values in binary form.
//! 3. COM_STMT_CLOSE releases the server handle. The server never replies.

#![allow(clippy::cast_possible_truncation)]

use mariwire_core::{Error, Result, Value};

use super::reader::{PacketReader, server_error};
use super::{Command, FieldType, PacketWriter};

/// Header of the COM_STMT_PREPARE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Server-assigned statement identifier
    pub statement_id: u32,
    /// Result columns (0 for statements without a result set)
    pub num_columns: u16,
    /// Number of `?` placeholders
    pub num_params: u16,
    pub warnings: u16,
}

/// Build a COM_STMT_PREPARE packet.
pub fn build_stmt_prepare_packet(sql: &str) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtPrepare);
    writer.write_bytes(sql.as_bytes());
    writer.build_packet(0)
}

/// Build a COM_STMT_EXECUTE packet.
///
/// Layout: opcode, statement id, cursor flags (none), iteration count (1),
/// then for statements with parameters: NULL bitmap, new-params-bound flag,
/// a (type, flags) pair per parameter and the non-NULL values.
pub fn build_stmt_execute_packet(statement_id: u32, params: &[Value]) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtExecute);
    writer.write_u32_le(statement_id);
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, _) in params.iter().enumerate().filter(|(_, p)| p.is_null()) {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
        writer.write_bytes(&null_bitmap);
        writer.write_u8(1);

        for param in params {
            let (field_type, unsigned) = binary_type(param);
            writer.write_u8(field_type as u8);
            writer.write_u8(if unsigned { 0x80 } else { 0x00 });
        }
        for param in params {
            encode_binary_param(&mut writer, param);
        }
    }

    writer.build_packet(0)
}

/// Build a COM_STMT_CLOSE packet.
pub fn build_stmt_close_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtClose);
    writer.write_u32_le(statement_id);
    writer.build_packet(0)
}

/// Parse the first frame of a COM_STMT_PREPARE response.
///
/// An ERR frame is returned as the server error it carries.
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Result<StmtPrepareOk> {
    match data.first() {
        Some(0xFF) => return Err(server_error(data)),
        Some(0x00) => {}
        _ => {
            return Err(Error::Protocol(mariwire_core::error::ProtocolError {
                message: "unexpected prepare response header".to_string(),
                raw_data: Some(data.to_vec()),
                source: None,
            }));
        }
    }

    let mut reader = PacketReader::new(&data[1..]);
    let statement_id = reader
        .read_u32_le()
        .ok_or_else(|| reader.truncated("statement id"))?;
    let num_columns = reader
        .read_u16_le()
        .ok_or_else(|| reader.truncated("column count"))?;
    let num_params = reader
        .read_u16_le()
        .ok_or_else(|| reader.truncated("parameter count"))?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);

    Ok(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

/// Wire type and unsigned flag for a parameter value.
fn binary_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::Int(_) => (FieldType::Long, false),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UnsignedBigInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Json(_) => (FieldType::Json, false),
    }
}

fn encode_binary_param(writer: &mut PacketWriter, value: &Value) {
    match value {
        // carried by the NULL bitmap
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(i) => writer.write_u8(*i as u8),
        Value::SmallInt(i) => writer.write_u16_le(*i as u16),
        Value::Int(i) => writer.write_u32_le(*i as u32),
        Value::BigInt(i) => writer.write_u64_le(*i as u64),
        Value::UnsignedBigInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_packet() {
        let packet = build_stmt_prepare_packet("SELECT ?");
        assert_eq!(&packet[..4], &[9, 0, 0, 0]);
        assert_eq!(packet[4], Command::StmtPrepare as u8);
        assert_eq!(&packet[5..], b"SELECT ?");
    }

    #[test]
    fn test_close_packet() {
        let packet = build_stmt_close_packet(0x0102_0304);
        assert_eq!(packet, vec![5, 0, 0, 0, 0x19, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_execute_without_params() {
        let packet = build_stmt_execute_packet(7, &[]);
        assert_eq!(&packet[4..], &[0x17, 7, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_execute_with_null_and_values() {
        let params = vec![Value::Int(5), Value::Null, Value::Text("ab".into())];
        let packet = build_stmt_execute_packet(1, &params);
        let body = &packet[4..];
        // opcode + id + flags + iterations
        let rest = &body[10..];
        assert_eq!(rest[0], 0b0000_0010, "second param is NULL");
        assert_eq!(rest[1], 1, "types are bound");
        assert_eq!(
            &rest[2..8],
            &[
                FieldType::Long as u8,
                0,
                FieldType::Null as u8,
                0,
                FieldType::VarString as u8,
                0
            ]
        );
        assert_eq!(&rest[8..], &[5, 0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_unsigned_flag() {
        let packet = build_stmt_execute_packet(1, &[Value::UnsignedBigInt(u64::MAX)]);
        let rest = &packet[4 + 10..];
        assert_eq!(&rest[1..4], &[1, FieldType::LongLong as u8, 0x80]);
        assert_eq!(&rest[4..], &[0xFF; 8]);
    }

    #[test]
    fn test_parse_prepare_ok() {
        let data = [0x00, 0x2A, 0, 0, 0, 3, 0, 2, 0, 0x00, 1, 0];
        let ok = parse_stmt_prepare_ok(&data).unwrap();
        assert_eq!(ok.statement_id, 42);
        assert_eq!(ok.num_columns, 3);
        assert_eq!(ok.num_params, 2);
        assert_eq!(ok.warnings, 1);
    }

    #[test]
    fn test_parse_prepare_error() {
        let mut data = vec![0xFF, 0x28, 0x04, b'#'];
        data.extend_from_slice(b"42000You have an error in your SQL syntax");
        let err = parse_stmt_prepare_ok(&data).unwrap_err();
        assert_eq!(err.error_code(), Some(1064));

        let err = parse_stmt_prepare_ok(&[0x00, 1, 0]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
