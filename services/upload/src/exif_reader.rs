//! EXIF extraction from untrusted image bytes.
//!
//! Extraction never fails: a missing, truncated or corrupt metadata block
//! yields an empty [`ExifData`].

use exif::{Context, Field, In, Tag, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::debug;

/// Key under which GPS sub-tags are nested
pub const GPS_INFO: &str = "GPSInfo";

/// Opaque byte values longer than this are summarised instead of rendered
const MAX_RENDERED_BYTES: usize = 64;

/// Tag name to rendered value, with GPS tags nested under `GPSInfo`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExifData {
    #[serde(flatten)]
    pub tags: BTreeMap<String, String>,
    #[serde(rename = "GPSInfo", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gps: BTreeMap<String, JsonValue>,
}

impl ExifData {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.gps.is_empty()
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.tags.get(tag).map(String::as_str)
    }
}

/// Parse the metadata segment of an image container
pub fn extract(bytes: &[u8]) -> ExifData {
    let mut cursor = Cursor::new(bytes);
    let exif = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => exif,
        Err(e) => {
            debug!(error = %e, size_bytes = bytes.len(), "No readable EXIF block");
            metrics::counter!("upload.exif.missing").increment(1);
            return ExifData::default();
        }
    };

    let mut data = ExifData::default();

    for field in exif.fields().filter(|f| f.ifd_num == In::PRIMARY) {
        add_field(&mut data, field);
    }

    data
}

fn add_field(data: &mut ExifData, field: &Field) {
    let name = tag_name(field.tag);

    if field.tag.context() == Context::Gps {
        data.gps.insert(name, gps_value(&field.value));
    } else {
        data.tags.insert(name, value_to_string(&field.value));
    }
}

/// Canonical tag name, or the raw tag number for tags without one
pub fn tag_name(tag: Tag) -> String {
    match tag.description() {
        Some(_) => tag.to_string(),
        None => tag.number().to_string(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Byte(vec) => bytes_to_string(vec),
        Value::Ascii(vec) => vec
            .iter()
            .map(|v| String::from_utf8_lossy(v).trim_end_matches('\0').to_string())
            .collect::<Vec<_>>()
            .join(" "),
        Value::Short(vec) => join(vec),
        Value::Long(vec) => join(vec),
        Value::Rational(vec) => vec
            .iter()
            .map(|r| format!("{}/{}", r.num, r.denom))
            .collect::<Vec<_>>()
            .join(","),
        Value::SByte(vec) => join(vec),
        Value::Undefined(data, _) => bytes_to_string(data),
        Value::SShort(vec) => join(vec),
        Value::SLong(vec) => join(vec),
        Value::SRational(vec) => vec
            .iter()
            .map(|r| format!("{}/{}", r.num, r.denom))
            .collect::<Vec<_>>()
            .join(","),
        Value::Float(vec) => join(vec),
        Value::Double(vec) => join(vec),
        Value::Unknown(_type, count, offset) => {
            format!("(unknown {count} bytes at offset {offset})")
        }
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// Short printable payloads (ExifVersion "0230") stay readable
fn bytes_to_string(data: &[u8]) -> String {
    let printable = data
        .iter()
        .all(|b| b.is_ascii_graphic() || *b == b' ' || *b == 0);

    if printable && data.len() <= MAX_RENDERED_BYTES {
        String::from_utf8_lossy(data)
            .trim_end_matches('\0')
            .to_string()
    } else if data.len() <= MAX_RENDERED_BYTES {
        format!("{data:?}")
    } else {
        format!("({} bytes)", data.len())
    }
}

/// GPS values keep a JSON-native shape so coordinates stay numeric
fn gps_value(value: &Value) -> JsonValue {
    match value {
        Value::Ascii(_) | Value::Undefined(..) | Value::Unknown(..) => {
            JsonValue::String(value_to_string(value))
        }
        Value::Byte(vec) => collapse(vec.iter().map(|v| JsonValue::from(*v))),
        Value::Short(vec) => collapse(vec.iter().map(|v| JsonValue::from(*v))),
        Value::Long(vec) => collapse(vec.iter().map(|v| JsonValue::from(*v))),
        Value::SByte(vec) => collapse(vec.iter().map(|v| JsonValue::from(*v))),
        Value::SShort(vec) => collapse(vec.iter().map(|v| JsonValue::from(*v))),
        Value::SLong(vec) => collapse(vec.iter().map(|v| JsonValue::from(*v))),
        Value::Rational(vec) => collapse(
            vec.iter()
                .map(|r| ratio_to_json(f64::from(r.num), f64::from(r.denom))),
        ),
        Value::SRational(vec) => collapse(
            vec.iter()
                .map(|r| ratio_to_json(f64::from(r.num), f64::from(r.denom))),
        ),
        Value::Float(vec) => collapse(vec.iter().map(|v| float_to_json(f64::from(*v)))),
        Value::Double(vec) => collapse(vec.iter().map(|v| float_to_json(*v))),
    }
}

fn ratio_to_json(num: f64, denom: f64) -> JsonValue {
    if denom == 0.0 {
        return JsonValue::Null;
    }
    float_to_json(num / denom)
}

fn float_to_json(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn collapse(values: impl Iterator<Item = JsonValue>) -> JsonValue {
    let mut values: Vec<JsonValue> = values.collect();
    if values.len() == 1 {
        values.remove(0)
    } else {
        JsonValue::Array(values)
    }
}
