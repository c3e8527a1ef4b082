use crate::core::errors::*;
use crate::core::schema::{FieldType, RelationSchema};
use serde_json::{Map, Number, Value};

pub type Record = Map<String, Value>;

/// Validates `record` against `schema` and returns the stored form: schema field
/// order, defaults filled in, numbers of float-typed fields widened to f64.
pub fn normalize(schema: &RelationSchema, record: &Record) -> Result<Record> {
    for key in record.keys() {
        if schema.field(key).is_none() {
            return Err(Error::Validation {
                field: key.clone(),
                value: record[key].to_string(),
                reason: format!("relation '{}' has no such field", schema.name),
            });
        }
    }

    let mut normalized = Record::new();
    for field in &schema.fields {
        let value = match record.get(&field.name) {
            Some(v) if !v.is_null() => v.clone(),
            _ => field.default.clone().unwrap_or(Value::Null),
        };

        if value.is_null() {
            if !field.nullable || schema.is_primary_key(&field.name) {
                return Err(Error::Validation {
                    field: field.name.clone(),
                    value: "null".to_string(),
                    reason: "field is not nullable".to_string(),
                });
            }
            normalized.insert(field.name.clone(), Value::Null);
            continue;
        }

        field.validate_value(&value)?;

        let value = if field.field_type.is_float() {
            widen(&value)
        } else {
            value
        };
        normalized.insert(field.name.clone(), value);
    }

    Ok(normalized)
}

fn widen(value: &Value) -> Value {
    value
        .as_f64()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Packs a normalized record: `field_count:u16`, then for each non-null field
/// `name_len:u8, name, type_tag:u8, value`, all big-endian.
pub fn pack(schema: &RelationSchema, record: &Record) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut count: u16 = 0;

    for field in &schema.fields {
        let value = match record.get(&field.name) {
            Some(v) if !v.is_null() => v,
            _ => continue,
        };

        let name = field.name.as_bytes();
        let name_len = u8::try_from(name.len()).map_err(|_| Error::Validation {
            field: field.name.clone(),
            value: String::new(),
            reason: "field name longer than 255 bytes".to_string(),
        })?;
        body.push(name_len);
        body.extend_from_slice(name);
        body.push(field.field_type.tag());
        encode_value(&field.name, field.field_type, value, &mut body)?;
        count += 1;
    }

    let mut packed = Vec::with_capacity(2 + body.len());
    packed.extend_from_slice(&count.to_be_bytes());
    packed.extend_from_slice(&body);
    Ok(packed)
}

fn encode_value(name: &str, field_type: FieldType, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    let mismatch = || Error::Validation {
        field: name.to_string(),
        value: value.to_string(),
        reason: format!("cannot encode as {:?}", field_type),
    };

    match field_type {
        FieldType::Integer => {
            let v = value.as_i64().ok_or_else(mismatch)?;
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldType::Float | FieldType::Timestamp | FieldType::Curvature => {
            let v = value.as_f64().ok_or_else(mismatch)?;
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldType::String => {
            let s = value.as_str().ok_or_else(mismatch)?;
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        FieldType::Boolean => {
            let b = value.as_bool().ok_or_else(mismatch)?;
            out.push(b as u8);
        }
        FieldType::Uuid => {
            let s = value.as_str().ok_or_else(mismatch)?;
            let id = uuid::Uuid::parse_str(s).map_err(|_| mismatch())?;
            out.extend_from_slice(id.as_bytes());
        }
        FieldType::Geodesic | FieldType::HyperbolicPoint => {
            let items = value.as_array().ok_or_else(mismatch)?;
            let count = u16::try_from(items.len()).map_err(|_| mismatch())?;
            out.extend_from_slice(&count.to_be_bytes());
            for item in items {
                let v = item.as_f64().ok_or_else(mismatch)?;
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
    }

    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::DataCorruption {
                details: format!(
                    "packed record truncated: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.data.len()
                ),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into()?))
    }
}

fn float_value(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn decode_value(field_type: FieldType, reader: &mut Reader) -> Result<Value> {
    let value = match field_type {
        FieldType::Integer => Value::from(reader.i64()?),
        FieldType::Float | FieldType::Timestamp | FieldType::Curvature => float_value(reader.f64()?),
        FieldType::String => {
            let len = reader.u32()? as usize;
            let bytes = reader.take(len)?;
            let s = std::str::from_utf8(bytes).map_err(|e| Error::DataCorruption {
                details: format!("packed string is not utf-8: {}", e),
            })?;
            Value::String(s.to_string())
        }
        FieldType::Boolean => Value::Bool(reader.u8()? != 0),
        FieldType::Uuid => {
            let bytes: [u8; 16] = reader.take(16)?.try_into()?;
            Value::String(uuid::Uuid::from_bytes(bytes).to_string())
        }
        FieldType::Geodesic | FieldType::HyperbolicPoint => {
            let count = reader.u16()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(float_value(reader.f64()?));
            }
            Value::Array(items)
        }
    };
    Ok(value)
}

/// Inverse of `pack`. Fields the schema no longer declares are skipped, and so
/// are fields stored under a type the schema no longer declares them with (a
/// column dropped and re-added with a new type). Fields the schema declares but
/// the bytes lack come back as their default or null.
pub fn unpack(schema: &RelationSchema, data: &[u8]) -> Result<Record> {
    let mut reader = Reader { data, pos: 0 };
    let count = reader.u16()?;

    let mut stored = Record::new();
    for _ in 0..count {
        let name_len = reader.u8()? as usize;
        let name = std::str::from_utf8(reader.take(name_len)?)
            .map_err(|e| Error::DataCorruption {
                details: format!("packed field name is not utf-8: {}", e),
            })?
            .to_string();
        let field_type = FieldType::from_tag(reader.u8()?)?;
        let value = decode_value(field_type, &mut reader)?;

        match schema.field(&name) {
            Some(field) if field.field_type == field_type => {
                stored.insert(name, value);
            }
            Some(field) => log::trace!(
                "skipping '{}' stored as {:?}, now declared {:?}",
                name,
                field_type,
                field.field_type
            ),
            None => {}
        }
    }

    if reader.pos != data.len() {
        return Err(Error::DataCorruption {
            details: format!("{} trailing bytes after packed record", data.len() - reader.pos),
        });
    }

    let mut record = Record::new();
    for field in &schema.fields {
        let value = stored
            .remove(&field.name)
            .or_else(|| field.default.clone())
            .unwrap_or(Value::Null);
        record.insert(field.name.clone(), value);
    }

    Ok(record)
}
