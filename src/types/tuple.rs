// Row encoding.
//
// Layout: a leading null bitmap (one bit per column, LSB-first within each
// byte), then per non-null column either the fixed-width payload or a
// 4-byte length prefix followed by the payload. Values are stored in the
// column's exact type; numeric literals are narrowed or widened on encode.

use crate::error::{DbError, Result};
use crate::types::schema::Schema;
use crate::types::value::{DataType, Value};

/// An ordered sequence of values conforming to a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub values: Vec<Value>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Encodes the tuple, canonicalizing each value to its column type.
    pub fn encode(&self, schema: &Schema) -> Result<Vec<u8>> {
        schema.validate(&self.values)?;
        let bitmap_len = (schema.len() + 7) / 8;
        let mut buf = vec![0u8; bitmap_len];
        for (i, (value, column)) in self.values.iter().zip(schema.columns()).enumerate() {
            if value.is_null() {
                buf[i / 8] |= 1 << (i % 8);
                continue;
            }
            if column.stores_crdt_state() {
                // Merge state is an opaque tagged array behind the length
                // prefix; it bypasses declared-type coercion.
                let mut payload = Vec::new();
                value.serialize(&mut payload);
                buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                buf.extend_from_slice(&payload);
                continue;
            }
            let canonical = value.coerce_to(&column.data_type)?;
            match &column.data_type {
                DataType::Varchar(_)
                | DataType::Text
                | DataType::Timestamp
                | DataType::Date
                | DataType::Time => {
                    let s = canonical
                        .as_str()
                        .ok_or_else(|| DbError::Internal("coerce produced non-string".into()))?;
                    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
                DataType::Blob => {
                    if let Value::Blob(b) = &canonical {
                        buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                        buf.extend_from_slice(b);
                    } else {
                        return Err(DbError::Internal("coerce produced non-blob".into()));
                    }
                }
                DataType::Vector(_) => {
                    if let Value::Vector(v) = &canonical {
                        buf.extend_from_slice(&((v.len() * 8) as u32).to_le_bytes());
                        for x in v {
                            buf.extend_from_slice(&x.to_le_bytes());
                        }
                    } else {
                        return Err(DbError::Internal("coerce produced non-vector".into()));
                    }
                }
                DataType::Set(_) => {
                    let mut payload = Vec::new();
                    canonical.serialize(&mut payload);
                    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                    buf.extend_from_slice(&payload);
                }
                // Fixed-width scalars carry their exact payload.
                _ => canonical.serialize_payload(&mut buf),
            }
        }
        Ok(buf)
    }

    /// Size `encode` would produce, without producing it.
    pub fn encoded_size(&self, schema: &Schema) -> Result<usize> {
        Ok(self.encode(schema)?.len())
    }

    /// Decodes a tuple previously produced by `encode` under `schema`.
    pub fn decode(bytes: &[u8], schema: &Schema) -> Result<Tuple> {
        let bitmap_len = (schema.len() + 7) / 8;
        if bytes.len() < bitmap_len {
            return Err(DbError::Serialization("truncated tuple".to_string()));
        }
        let bitmap = &bytes[..bitmap_len];
        let mut offset = bitmap_len;
        let mut values = Vec::with_capacity(schema.len());
        for (i, column) in schema.columns().iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                values.push(Value::Null);
                continue;
            }
            if column.stores_crdt_state() {
                let len = read_u32(bytes, &mut offset)? as usize;
                if offset + len > bytes.len() {
                    return Err(DbError::Serialization("truncated tuple".to_string()));
                }
                let mut inner_offset = offset;
                let value = Value::deserialize(bytes, &mut inner_offset)?;
                if inner_offset != offset + len {
                    return Err(DbError::Serialization("bad merge-state payload".to_string()));
                }
                offset += len;
                values.push(value);
                continue;
            }
            let value = match &column.data_type {
                DataType::Boolean => Value::deserialize_payload(1, bytes, &mut offset)?,
                DataType::TinyInt => Value::deserialize_payload(2, bytes, &mut offset)?,
                DataType::SmallInt => Value::deserialize_payload(3, bytes, &mut offset)?,
                DataType::Integer => Value::deserialize_payload(4, bytes, &mut offset)?,
                DataType::BigInt => Value::deserialize_payload(5, bytes, &mut offset)?,
                DataType::Double => Value::deserialize_payload(6, bytes, &mut offset)?,
                DataType::Varchar(_) => Value::deserialize_payload(7, bytes, &mut offset)?,
                DataType::Text => Value::deserialize_payload(8, bytes, &mut offset)?,
                DataType::Timestamp => Value::deserialize_payload(9, bytes, &mut offset)?,
                DataType::Date => Value::deserialize_payload(10, bytes, &mut offset)?,
                DataType::Time => Value::deserialize_payload(11, bytes, &mut offset)?,
                DataType::Blob => Value::deserialize_payload(12, bytes, &mut offset)?,
                DataType::Vector(_) => {
                    let len = read_u32(bytes, &mut offset)? as usize;
                    if len % 8 != 0 {
                        return Err(DbError::Serialization("bad vector payload".to_string()));
                    }
                    let mut v = Vec::with_capacity(len / 8);
                    for _ in 0..len / 8 {
                        let mut arr = [0u8; 8];
                        if offset + 8 > bytes.len() {
                            return Err(DbError::Serialization("truncated tuple".to_string()));
                        }
                        arr.copy_from_slice(&bytes[offset..offset + 8]);
                        offset += 8;
                        v.push(f64::from_le_bytes(arr));
                    }
                    Value::Vector(v)
                }
                DataType::Set(_) => {
                    let len = read_u32(bytes, &mut offset)? as usize;
                    if offset + len > bytes.len() {
                        return Err(DbError::Serialization("truncated tuple".to_string()));
                    }
                    let mut inner_offset = offset;
                    let value = Value::deserialize(bytes, &mut inner_offset)?;
                    if inner_offset != offset + len {
                        return Err(DbError::Serialization("bad set payload".to_string()));
                    }
                    offset += len;
                    match value {
                        Value::Array(_) => value,
                        _ => {
                            return Err(DbError::Serialization(
                                "set column payload is not an array".to_string(),
                            ))
                        }
                    }
                }
            };
            values.push(value);
        }
        Ok(Tuple::new(values))
    }
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> Result<u32> {
    if *offset + 4 > bytes.len() {
        return Err(DbError::Serialization("truncated tuple".to_string()));
    }
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_le_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::schema::Column;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", DataType::Text).primary_key(),
            Column::new("n", DataType::Integer),
            Column::new("score", DataType::Double),
            Column::new("v", DataType::Vector(3)),
            Column::new("tags", DataType::Set(Box::new(DataType::Text))),
        ])
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let schema = schema();
        let tuple = Tuple::new(vec![
            Value::Text("a".to_string()),
            Value::Integer(7),
            Value::Double(0.25),
            Value::Vector(vec![0.1, 0.0, -1.0]),
            Value::Array(vec![Value::Text("x".to_string()), Value::Text("y".to_string())]),
        ]);
        let bytes = tuple.encode(&schema).unwrap();
        let back = Tuple::decode(&bytes, &schema).unwrap();
        assert_eq!(back, tuple);
    }

    #[test]
    fn test_nulls_roundtrip_via_bitmap() {
        let schema = schema();
        let tuple = Tuple::new(vec![
            Value::Text("a".to_string()),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
        ]);
        let bytes = tuple.encode(&schema).unwrap();
        let back = Tuple::decode(&bytes, &schema).unwrap();
        assert_eq!(back.values[1], Value::Null);
        assert_eq!(back, tuple);
    }

    #[test]
    fn test_encoded_size_matches_encode() {
        let schema = schema();
        let tuple = Tuple::new(vec![
            Value::Text("abcdef".to_string()),
            Value::Integer(1),
            Value::Double(1.0),
            Value::Vector(vec![0.0, 0.0, 0.0]),
            Value::Array(vec![Value::Text("t".to_string())]),
        ]);
        assert_eq!(
            tuple.encoded_size(&schema).unwrap(),
            tuple.encode(&schema).unwrap().len()
        );
    }

    #[test]
    fn test_numeric_literals_canonicalized_on_encode() {
        let schema = schema();
        // A BIGINT literal destined for an INT column narrows on encode.
        let tuple = Tuple::new(vec![
            Value::Text("a".to_string()),
            Value::BigInt(41),
            Value::Double(0.0),
            Value::Vector(vec![0.0, 0.0, 0.0]),
            Value::Array(vec![]),
        ]);
        let bytes = tuple.encode(&schema).unwrap();
        let back = Tuple::decode(&bytes, &schema).unwrap();
        assert_eq!(back.values[1], Value::Integer(41));
    }
}
