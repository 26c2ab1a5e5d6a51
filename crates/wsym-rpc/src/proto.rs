//! Wire types for the six RPC methods (spec.md §4.6/§6): serde-derived
//! request/response structs plus the `value`/`error` envelope every
//! response is wrapped in.

use serde::{Deserialize, Serialize};

use wsym_module::{Scope, SymbolServerError};

/// JSON has no byte-string type; `rawModule.code` and `evaluateVariable`'s
/// `value.code` are base64 on the wire, the same encoding protobuf's JSON
/// mapping uses for `bytes` fields (which is what the original transport
/// actually produced these messages as).
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(d)?;
        encoded.map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom)).transpose()
    }
}

/// The envelope every response is wrapped in: the method's own success
/// shape, or `{"error": {...}}`. `SUCCESS` is never serialized — it's a
/// reserved tag, not an observed wire value (spec.md §7).
#[derive(Serialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Ok(T),
    Err { error: ErrorPayload },
}

impl<T> From<Result<T, SymbolServerError>> for Envelope<T> {
    fn from(result: Result<T, SymbolServerError>) -> Self {
        match result {
            Ok(value) => Envelope::Ok(value),
            Err(err) => Envelope::Err { error: ErrorPayload::from(&err) },
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireErrorCode {
    InternalError,
    NotFound,
    ProtocolError,
}

#[derive(Serialize, Debug, Clone)]
pub struct ErrorPayload {
    pub code: WireErrorCode,
    pub message: String,
}

impl From<&SymbolServerError> for ErrorPayload {
    fn from(err: &SymbolServerError) -> Self {
        let (code, message) = match err {
            SymbolServerError::NotFound(m) => (WireErrorCode::NotFound, m.clone()),
            SymbolServerError::Protocol(m) => (WireErrorCode::ProtocolError, m.clone()),
            SymbolServerError::Internal(m) => (WireErrorCode::InternalError, m.clone()),
        };
        ErrorPayload { code, message }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireScope {
    Local,
    Parameter,
    Global,
}

impl From<Scope> for WireScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Local => WireScope::Local,
            Scope::Parameter => WireScope::Parameter,
            Scope::Global => WireScope::Global,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct RawModulePayload {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, with = "base64_bytes_opt")]
    pub code: Option<Vec<u8>>,
}

#[derive(Deserialize, Debug)]
pub struct AddRawModuleRequest {
    #[serde(rename = "rawModuleId")]
    pub raw_module_id: String,
    /// Unused by the symbol resolution path; accepted and ignored, same as
    /// the original request shape.
    #[serde(default)]
    pub symbols: Option<serde_json::Value>,
    #[serde(rename = "rawModule")]
    pub raw_module: RawModulePayload,
}

#[derive(Serialize, Debug)]
pub struct AddRawModuleResponse {
    pub sources: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WireSourceLocation {
    #[serde(rename = "rawModuleId")]
    pub raw_module_id: String,
    #[serde(rename = "sourceFile")]
    pub source_file: String,
    #[serde(rename = "lineNumber")]
    pub line_number: u32,
    #[serde(rename = "columnNumber")]
    pub column_number: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WireRawLocation {
    #[serde(rename = "rawModuleId")]
    pub raw_module_id: String,
    #[serde(rename = "codeOffset")]
    pub code_offset: u32,
}

#[derive(Serialize, Debug)]
pub struct SourceLocationToRawLocationResponse {
    #[serde(rename = "rawLocation")]
    pub raw_location: Vec<WireRawLocation>,
}

#[derive(Serialize, Debug)]
pub struct RawLocationToSourceLocationResponse {
    #[serde(rename = "sourceLocation")]
    pub source_location: Vec<WireSourceLocation>,
}

#[derive(Serialize, Debug)]
pub struct WireVariable {
    pub scope: WireScope,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Serialize, Debug)]
pub struct ListVariablesInScopeResponse {
    pub variable: Vec<WireVariable>,
}

#[derive(Deserialize, Debug)]
pub struct EvaluateVariableRequest {
    pub name: String,
    pub location: WireRawLocation,
}

#[derive(Serialize, Debug)]
pub struct RawModuleValue {
    pub url: Option<String>,
    #[serde(with = "base64_bytes")]
    pub code: Vec<u8>,
}

#[derive(Serialize, Debug)]
pub struct EvaluateVariableResponse {
    pub value: RawModuleValue,
}
