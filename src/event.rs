use serde::Deserialize;
use serde_json::{Map, Value};
use std::{fmt, io::Write};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("malformed log event: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl LogEvent {
    // Serde's struct visitor would also take `["type", "message"]`.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let object: Map<String, Value> = serde_json::from_slice(payload)?;
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    pub fn render(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "{self}")?;
        out.flush()
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
