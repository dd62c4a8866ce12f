//! Value marshalling between tagged wire payloads and native JSON values.
//!
//! Payloads follow the shape of protobuf's well-known types rendered as JSON:
//! a `type_url` names the packed message, scalars travel in wrapper types,
//! and structured data travels as `Struct` / `ListValue` trees whose nodes
//! are externally tagged (`{"string_value": "..."}`).
//!
//! Decoding is all-or-nothing: any unknown tag or shape mismatch anywhere in
//! the tree fails the whole payload with `DispatchError::Unmarshal`.

use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

use super::errors::DispatchError;
use super::types::TypedPayload;

/// Prefix used on every type URL we produce.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// Largest integer an `f64` represents exactly.
const MAX_EXACT_F64_INT: f64 = 9_007_199_254_740_992.0;

// ─── WireType ────────────────────────────────────────────────────────────────

/// Every type tag the decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    String,
    Bool,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float,
    Double,
    Null,
    Value,
    Struct,
    List,
    StringArray,
    FloatArray,
    IntArray,
}

impl WireType {
    pub const ALL: [WireType; 15] = [
        WireType::String,
        WireType::Bool,
        WireType::Int32,
        WireType::Int64,
        WireType::UInt32,
        WireType::UInt64,
        WireType::Float,
        WireType::Double,
        WireType::Null,
        WireType::Value,
        WireType::Struct,
        WireType::List,
        WireType::StringArray,
        WireType::FloatArray,
        WireType::IntArray,
    ];

    /// Fully-qualified message name.
    pub fn full_name(&self) -> &'static str {
        match self {
            WireType::String => "google.protobuf.StringValue",
            WireType::Bool => "google.protobuf.BoolValue",
            WireType::Int32 => "google.protobuf.Int32Value",
            WireType::Int64 => "google.protobuf.Int64Value",
            WireType::UInt32 => "google.protobuf.UInt32Value",
            WireType::UInt64 => "google.protobuf.UInt64Value",
            WireType::Float => "google.protobuf.FloatValue",
            WireType::Double => "google.protobuf.DoubleValue",
            WireType::Null => "google.protobuf.NullValue",
            WireType::Value => "google.protobuf.Value",
            WireType::Struct => "google.protobuf.Struct",
            WireType::List => "google.protobuf.ListValue",
            WireType::StringArray => "ugrpc_pipe.StringArrayRep",
            WireType::FloatArray => "ugrpc_pipe.FloatArrayRep",
            WireType::IntArray => "ugrpc_pipe.IntArrayRep",
        }
    }

    /// Only the segment after the last `/` identifies the type.
    pub fn from_type_url(type_url: &str) -> Option<WireType> {
        let name = type_url.rsplit('/').next().unwrap_or(type_url);
        WireType::ALL.into_iter().find(|t| t.full_name() == name)
    }

    pub fn type_url(&self) -> String {
        format!("{TYPE_URL_PREFIX}{}", self.full_name())
    }
}

// ─── WireValue ───────────────────────────────────────────────────────────────

/// One node of a `Struct` / `ListValue` tree.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Number(f64),
    String(String),
    Bool(bool),
    /// Fields in wire order.
    Struct(Vec<(String, WireValue)>),
    List(Vec<WireValue>),
    /// A nested packed payload.
    Packed(TypedPayload),
}

impl WireValue {
    /// Parse a node. Tagged objects, bare primitives, and nested packed
    /// payloads are accepted; `context` is the enclosing type URL for errors.
    pub fn from_json(json: &Value, context: &str) -> Result<WireValue, DispatchError> {
        match json {
            Value::Null => Ok(WireValue::Null),
            Value::Bool(b) => Ok(WireValue::Bool(*b)),
            Value::Number(n) => Ok(WireValue::from_number(n)),
            Value::String(s) => Ok(WireValue::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| WireValue::from_json(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(WireValue::List),
            Value::Object(obj) => {
                if obj.contains_key("type_url") {
                    let packed: TypedPayload = serde_json::from_value(json.clone())
                        .map_err(|e| DispatchError::unmarshal(context, format!("bad nested payload: {e}")))?;
                    return Ok(WireValue::Packed(packed));
                }
                let mut entries = obj.iter();
                let (kind, inner) = match (entries.next(), entries.next()) {
                    (Some(entry), None) => entry,
                    _ => {
                        return Err(DispatchError::unmarshal(
                            context,
                            format!("value node must carry exactly one kind tag, found {}", obj.len()),
                        ))
                    }
                };
                Self::from_tagged(kind, inner, context)
            }
        }
    }

    fn from_tagged(kind: &str, inner: &Value, context: &str) -> Result<WireValue, DispatchError> {
        match kind {
            "null_value" => Ok(WireValue::Null),
            "number_value" => match inner {
                Value::Number(n) => Ok(WireValue::Number(number_as_f64(n))),
                other => Err(mismatch(context, "number_value", other)),
            },
            "string_value" => inner
                .as_str()
                .map(|s| WireValue::String(s.to_string()))
                .ok_or_else(|| mismatch(context, "string_value", inner)),
            "bool_value" => inner
                .as_bool()
                .map(WireValue::Bool)
                .ok_or_else(|| mismatch(context, "bool_value", inner)),
            "struct_value" => parse_struct(inner, context),
            "list_value" => parse_list(inner, context),
            other => Err(DispatchError::unmarshal(
                context,
                format!("unknown value kind '{other}'"),
            )),
        }
    }

    /// Tagged JSON form, as the encoder emits it.
    pub fn to_json(&self) -> Value {
        match self {
            WireValue::Null => serde_json::json!({ "null_value": null }),
            WireValue::Number(n) => serde_json::json!({ "number_value": n }),
            WireValue::String(s) => serde_json::json!({ "string_value": s }),
            WireValue::Bool(b) => serde_json::json!({ "bool_value": b }),
            WireValue::Struct(fields) => serde_json::json!({ "struct_value": struct_body(fields) }),
            WireValue::List(items) => serde_json::json!({ "list_value": list_body(items) }),
            WireValue::Packed(payload) => serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    /// Convert into a native value, decoding nested packed payloads.
    pub fn into_native(self) -> Result<Value, DispatchError> {
        match self {
            WireValue::Null => Ok(Value::Null),
            WireValue::Number(n) => Ok(native_number(n)),
            WireValue::String(s) => Ok(Value::String(s)),
            WireValue::Bool(b) => Ok(Value::Bool(b)),
            WireValue::Struct(fields) => {
                let mut map = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    map.insert(key, value.into_native()?);
                }
                Ok(Value::Object(map))
            }
            WireValue::List(items) => items
                .into_iter()
                .map(WireValue::into_native)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            WireValue::Packed(payload) => Marshaller::decode(&payload),
        }
    }

    /// Integers an `f64` cannot hold exactly travel as packed Int64/UInt64 payloads.
    fn from_number(n: &Number) -> WireValue {
        if exceeds_f64_precision(n) {
            WireValue::Packed(Marshaller::encode(&Value::Number(n.clone())))
        } else {
            WireValue::Number(number_as_f64(n))
        }
    }

    pub fn from_native(value: &Value) -> WireValue {
        match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Number(n) => WireValue::from_number(n),
            Value::String(s) => WireValue::String(s.clone()),
            Value::Array(items) => WireValue::List(items.iter().map(WireValue::from_native).collect()),
            Value::Object(map) => WireValue::Struct(
                map.iter()
                    .map(|(k, v)| (k.clone(), WireValue::from_native(v)))
                    .collect(),
            ),
        }
    }
}

fn struct_body(fields: &[(String, WireValue)]) -> Value {
    let mut map = Map::with_capacity(fields.len());
    for (key, value) in fields {
        map.insert(key.clone(), value.to_json());
    }
    serde_json::json!({ "fields": map })
}

fn list_body(items: &[WireValue]) -> Value {
    let values: Vec<Value> = items.iter().map(WireValue::to_json).collect();
    serde_json::json!({ "values": values })
}

/// `{"fields": {..}}`; an object without `fields` is an empty struct.
fn parse_struct(body: &Value, context: &str) -> Result<WireValue, DispatchError> {
    let obj = body
        .as_object()
        .ok_or_else(|| mismatch(context, "struct body", body))?;
    let fields = match obj.get("fields") {
        None => return Ok(WireValue::Struct(Vec::new())),
        Some(fields) => fields
            .as_object()
            .ok_or_else(|| mismatch(context, "struct fields", fields))?,
    };
    fields
        .iter()
        .map(|(key, value)| Ok((key.clone(), WireValue::from_json(value, context)?)))
        .collect::<Result<Vec<_>, DispatchError>>()
        .map(WireValue::Struct)
}

/// `{"values": [..]}`; an object without `values` is an empty list.
fn parse_list(body: &Value, context: &str) -> Result<WireValue, DispatchError> {
    list_items(body, context)?
        .iter()
        .map(|item| WireValue::from_json(item, context))
        .collect::<Result<Vec<_>, _>>()
        .map(WireValue::List)
}

fn list_items<'a>(body: &'a Value, context: &str) -> Result<&'a [Value], DispatchError> {
    let obj = body
        .as_object()
        .ok_or_else(|| mismatch(context, "list body", body))?;
    match obj.get("values") {
        None => Ok(&[][..]),
        Some(values) => values
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| mismatch(context, "list values", values)),
    }
}

fn exceeds_f64_precision(n: &Number) -> bool {
    const LIMIT: u64 = 1 << 53;
    match (n.as_i64(), n.as_u64()) {
        (Some(i), _) => i.unsigned_abs() >= LIMIT,
        (None, Some(u)) => u >= LIMIT,
        (None, None) => false,
    }
}

fn number_as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or_default()
}

/// Integral numbers that an `f64` holds exactly come back as integers.
fn native_number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < MAX_EXACT_F64_INT {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn mismatch(context: &str, expected: &str, found: &Value) -> DispatchError {
    DispatchError::unmarshal(context, format!("expected {expected}, found {found}"))
}

// ─── Marshaller ──────────────────────────────────────────────────────────────

/// Converts between [`TypedPayload`]s and native `serde_json::Value`s.
pub struct Marshaller;

impl Marshaller {
    /// Decode a tagged payload into a native value.
    ///
    /// An empty payload decodes to an empty object.
    pub fn decode(payload: &TypedPayload) -> Result<Value, DispatchError> {
        if payload.is_empty() {
            return Ok(Value::Object(Map::new()));
        }

        let url = payload.type_url.as_str();
        let wire_type = WireType::from_type_url(url)
            .ok_or_else(|| DispatchError::unmarshal(url, "unknown type tag"))?;
        let body = unwrap_wrapper(&payload.value);

        match wire_type {
            WireType::String => body
                .as_str()
                .map(|s| Value::String(s.to_string()))
                .ok_or_else(|| mismatch(url, "string", body)),
            WireType::Bool => body
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| mismatch(url, "bool", body)),
            WireType::Int32 | WireType::Int64 => {
                wrapped_i64(body).map(Value::from).ok_or_else(|| mismatch(url, "integer", body))
            }
            WireType::UInt32 | WireType::UInt64 => {
                wrapped_u64(body).map(Value::from).ok_or_else(|| mismatch(url, "unsigned integer", body))
            }
            WireType::Float | WireType::Double => body
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch(url, "number", body)),
            WireType::Null => match body {
                Value::Null => Ok(Value::Null),
                Value::String(s) if s == "NULL_VALUE" => Ok(Value::Null),
                other => Err(mismatch(url, "null", other)),
            },
            WireType::Value => WireValue::from_json(&payload.value, url)?.into_native(),
            WireType::Struct => parse_struct(&payload.value, url)?.into_native(),
            WireType::List => parse_list(&payload.value, url)?.into_native(),
            WireType::StringArray => list_items(&payload.value, url)?
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(|s| Value::String(s.to_string()))
                        .ok_or_else(|| mismatch(url, "string element", v))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            WireType::FloatArray => list_items(&payload.value, url)?
                .iter()
                .map(|v| {
                    v.as_f64()
                        .and_then(Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(|| mismatch(url, "float element", v))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            WireType::IntArray => list_items(&payload.value, url)?
                .iter()
                .map(|v| wrapped_i64(v).map(Value::from).ok_or_else(|| mismatch(url, "integer element", v)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }

    /// Decode and deserialize into a concrete type.
    pub fn decode_as<T: DeserializeOwned>(payload: &TypedPayload) -> Result<T, DispatchError> {
        let value = Self::decode(payload)?;
        serde_json::from_value(value)
            .map_err(|e| DispatchError::unmarshal(&payload.type_url, format!("unexpected shape: {e}")))
    }

    /// Encode a native value into a tagged payload.
    pub fn encode(value: &Value) -> TypedPayload {
        match value {
            Value::Null => TypedPayload::new(WireType::Null.type_url(), Value::Null),
            Value::Bool(b) => TypedPayload::new(WireType::Bool.type_url(), Value::Bool(*b)),
            Value::String(s) => TypedPayload::new(WireType::String.type_url(), Value::String(s.clone())),
            Value::Number(n) => {
                let wire_type = if n.is_i64() {
                    WireType::Int64
                } else if n.is_u64() {
                    WireType::UInt64
                } else {
                    WireType::Double
                };
                TypedPayload::new(wire_type.type_url(), Value::Number(n.clone()))
            }
            Value::Array(items) => {
                let items: Vec<WireValue> = items.iter().map(WireValue::from_native).collect();
                TypedPayload::new(WireType::List.type_url(), list_body(&items))
            }
            Value::Object(map) => {
                let fields: Vec<(String, WireValue)> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), WireValue::from_native(v)))
                    .collect();
                TypedPayload::new(WireType::Struct.type_url(), struct_body(&fields))
            }
        }
    }

    /// Encode a parameter list, preserving order.
    pub fn encode_params(params: &[Value]) -> Vec<TypedPayload> {
        params.iter().map(Self::encode).collect()
    }

    /// Decode a parameter list; fails on the first bad element.
    pub fn decode_params(params: &[TypedPayload]) -> Result<Vec<Value>, DispatchError> {
        params.iter().map(Self::decode).collect()
    }
}

/// Wrapper messages may arrive bare (`"x"`) or as `{"value": "x"}`.
fn unwrap_wrapper(body: &Value) -> &Value {
    match body.as_object() {
        Some(obj) if obj.len() == 1 => obj.get("value").unwrap_or(body),
        _ => body,
    }
}

/// 64-bit integers may be sent as JSON strings.
fn wrapped_i64(body: &Value) -> Option<i64> {
    match body {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn wrapped_u64(body: &Value) -> Option<u64> {
    match body {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
