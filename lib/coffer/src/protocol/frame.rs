use crate::error::{read_err, write_err, CoreError, CoreResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;
use serde_json::Value;
use std::io;

/// Upper bound on a single frame body. Worker payloads are chunked well
/// below this; anything larger indicates stream corruption.
const FRAME_MAX: u32 = 16 * 1024 * 1024;

/// Command that closes a session.
pub const NOOP_COMMAND: &str = "noop";

/// Command asking the peer for configuration option values.
pub const OPTION_COMMAND: &str = "option";

/// Session greeting exchanged when a client connects to a worker. The
/// service names must agree.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq)]
pub struct Greeting {
    pub service: String,
}

/// Request frame: a command plus named parameters in a fixed order.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Request {
    pub cmd: String,
    pub param: IndexMap<String, Value>,
}

/// Response frame: either an `out` value or an error triple.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub out: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub err: Option<String>,
    #[serde(rename = "errCode", skip_serializing_if = "Option::is_none", default)]
    pub err_code: Option<i64>,
    #[serde(rename = "errMsg", skip_serializing_if = "Option::is_none", default)]
    pub err_msg: Option<String>,
}

impl Response {
    pub fn ok(out: Value) -> Response {
        Response {
            out: Some(out),
            err: None,
            err_code: None,
            err_msg: None,
        }
    }

    pub fn error<E: Into<String>, M: Into<String>>(err: E, code: i64, message: M) -> Response {
        Response {
            out: None,
            err: Some(err.into()),
            err_code: Some(code),
            err_msg: Some(message.into()),
        }
    }

    /// Folds the frame into the value it carries, raising the peer's error
    /// when the frame is an error frame.
    pub fn into_value(self) -> CoreResult<Value> {
        if self.err.is_some() {
            return Err(CoreError::ProtocolResponse {
                code: self.err_code.unwrap_or(-1),
                message: self.err_msg.unwrap_or_default(),
            });
        }

        match self.out {
            Some(out) => Ok(out),
            None => Err(CoreError::ProtocolFrame(
                "response carries neither out nor err".to_string(),
            )),
        }
    }
}

/// Writes one length-prefixed frame. The body encoding is deterministic:
/// struct fields and parameter maps serialize in declaration/insertion
/// order.
pub fn write_frame<W: io::Write, T: Serialize>(writer: &mut W, frame: &T) -> CoreResult<()> {
    let body = serde_json::to_vec(frame).map_err(|err| CoreError::ProtocolFrame(err.to_string()))?;

    writer
        .write_u32::<BigEndian>(body.len() as u32)
        .map_err(write_err)?;
    writer.write_all(&body).map_err(write_err)?;
    writer.flush().map_err(write_err)
}

/// Reads one length-prefixed frame.
pub fn read_frame<R: io::Read, T: DeserializeOwned>(reader: &mut R) -> CoreResult<T> {
    let size = reader.read_u32::<BigEndian>().map_err(read_err)?;

    if size > FRAME_MAX {
        return Err(CoreError::ProtocolFrame(format!(
            "frame size {} exceeds maximum {}",
            size, FRAME_MAX
        )));
    }

    let mut body = vec![0u8; size as usize];
    reader.read_exact(&mut body).map_err(read_err)?;

    serde_json::from_slice(&body).map_err(|err| CoreError::ProtocolFrame(err.to_string()))
}
