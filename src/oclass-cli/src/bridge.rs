//! Debugger bridge channel
//!
//! Implements `TargetChannel` over a Unix socket speaking line-delimited
//! JSON to a debugger-side adapter. One request per line, one response per
//! line:
//!
//! ```text
//! -> {"op":"hello"}
//! <- {"ok":true,"pid":4242,"generation":1,"pointer_width":8,"byte_order":"little"}
//! -> {"op":"evaluate","expr":"(Class)objc_getClass(\"NSObject\")"}
//! <- {"ok":true,"pointer":105553116266496}
//! -> {"op":"read_bytes","address":105553116266496,"length":16}
//! <- {"ok":true,"bytes":"80f0..."}
//! ```
//!
//! Byte payloads travel hex-encoded. A response with `ok:false` carries an
//! `error` message and an optional `kind`; kind `"unavailable"` means the
//! target is not stopped and maps to `ChannelError::Unavailable`.

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use oclass::{ByteOrdering, ChannelError, ProcessSession, TargetChannel, Value};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Hello,
    Evaluate { expr: &'a str },
    ReadBytes { address: u64, length: usize },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Response {
    ok: bool,
    error: Option<String>,
    kind: Option<String>,
    pointer: Option<u64>,
    string: Option<String>,
    /// Hex-encoded payload for read_bytes.
    bytes: Option<String>,
    pid: Option<u64>,
    generation: Option<u32>,
    pointer_width: Option<usize>,
    byte_order: Option<String>,
}

pub struct BridgeChannel {
    writer: RefCell<UnixStream>,
    reader: RefCell<BufReader<UnixStream>>,
    session: ProcessSession,
    pointer_width: usize,
    byte_order: ByteOrdering,
}

impl BridgeChannel {
    /// Connect and perform the hello handshake.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .with_context(|| format!("connecting to {}", path.display()))?;
        let reader = BufReader::new(stream.try_clone().context("cloning bridge stream")?);

        let channel = Self {
            writer: RefCell::new(stream),
            reader: RefCell::new(reader),
            session: ProcessSession::new(0, 0),
            pointer_width: 8,
            byte_order: ByteOrdering::Little,
        };
        let hello = channel
            .round_trip(&Request::Hello)
            .map_err(|err| anyhow::anyhow!("bridge handshake failed: {err}"))?;
        if !hello.ok {
            anyhow::bail!(
                "bridge rejected handshake: {}",
                hello.error.unwrap_or_else(|| "unknown error".into())
            );
        }

        let pid = hello.pid.context("hello response missing pid")?;
        let generation = hello.generation.context("hello response missing generation")?;
        let pointer_width = hello
            .pointer_width
            .context("hello response missing pointer_width")?;
        anyhow::ensure!(
            pointer_width == 4 || pointer_width == 8,
            "unsupported pointer width {pointer_width}"
        );
        let byte_order = match hello.byte_order.as_deref() {
            Some("big") => ByteOrdering::Big,
            _ => ByteOrdering::Little,
        };

        Ok(Self {
            session: ProcessSession::new(pid, generation),
            pointer_width,
            byte_order,
            ..channel
        })
    }

    fn round_trip(&self, request: &Request) -> Result<Response, ChannelError> {
        let line = serde_json::to_string(request).map_err(transport_error)?;
        {
            let mut writer = self.writer.borrow_mut();
            writer.write_all(line.as_bytes()).map_err(transport_error)?;
            writer.write_all(b"\n").map_err(transport_error)?;
            writer.flush().map_err(transport_error)?;
        }
        let mut reply = String::new();
        self.reader
            .borrow_mut()
            .read_line(&mut reply)
            .map_err(transport_error)?;
        if reply.is_empty() {
            // Bridge hung up.
            return Err(ChannelError::Unavailable);
        }
        serde_json::from_str(&reply).map_err(transport_error)
    }
}

/// A broken bridge means nobody is driving the target anymore.
fn transport_error<E: std::fmt::Display>(_err: E) -> ChannelError {
    ChannelError::Unavailable
}

fn failure(response: Response) -> ChannelError {
    let message = response.error.unwrap_or_else(|| "unknown error".into());
    match response.kind.as_deref() {
        Some("unavailable") => ChannelError::Unavailable,
        _ => ChannelError::Evaluation(message),
    }
}

impl TargetChannel for BridgeChannel {
    fn evaluate(&self, expr: &str) -> Result<Value, ChannelError> {
        let response = self.round_trip(&Request::Evaluate { expr })?;
        if !response.ok {
            return Err(failure(response));
        }
        if let Some(pointer) = response.pointer {
            return Ok(Value::Pointer(pointer));
        }
        if let Some(string) = response.string {
            return Ok(Value::Str(string));
        }
        Err(ChannelError::Evaluation(
            "bridge response carried no value".into(),
        ))
    }

    fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>, ChannelError> {
        let response = self.round_trip(&Request::ReadBytes { address, length })?;
        if !response.ok {
            let message = response.error.unwrap_or_else(|| "unknown error".into());
            if response.kind.as_deref() == Some("unavailable") {
                return Err(ChannelError::Unavailable);
            }
            return Err(ChannelError::Read {
                address,
                length,
                reason: message,
            });
        }
        let encoded = response.bytes.ok_or_else(|| ChannelError::Read {
            address,
            length,
            reason: "bridge response carried no bytes".into(),
        })?;
        hex::decode(&encoded).map_err(|err| ChannelError::Read {
            address,
            length,
            reason: format!("bad hex payload: {err}"),
        })
    }

    fn pointer_width(&self) -> usize {
        self.pointer_width
    }

    fn byte_order(&self) -> ByteOrdering {
        self.byte_order
    }

    fn session(&self) -> ProcessSession {
        self.session
    }
}
