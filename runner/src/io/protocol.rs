//! Messages exchanged with the worker, one JSON document per line.

use std::io::{BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snip_lang::{CompiledArtifact, Fault, Record};

use crate::core::types::{BoundaryRef, ModuleId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Load { artifact: CompiledArtifact },
    Send { record: Record },
    Invoke { module: ModuleId, context: BoundaryRef },
    Receive { context: BoundaryRef },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Loaded {
        module: ModuleId,
    },
    LoadFault {
        message: String,
    },
    Sent {
        context: BoundaryRef,
    },
    Returned {
        context: BoundaryRef,
        logs: Vec<String>,
    },
    Fault {
        #[serde(flatten)]
        fault: Fault,
        #[serde(default)]
        logs: Vec<String>,
    },
    Record {
        record: Record,
    },
    /// The request was out of turn or referenced something unknown.
    Error {
        message: String,
    },
    Bye,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Load { .. } => "load",
            Request::Send { .. } => "send",
            Request::Invoke { .. } => "invoke",
            Request::Receive { .. } => "receive",
            Request::Shutdown => "shutdown",
        }
    }
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Loaded { .. } => "loaded",
            Reply::LoadFault { .. } => "load_fault",
            Reply::Sent { .. } => "sent",
            Reply::Returned { .. } => "returned",
            Reply::Fault { .. } => "fault",
            Reply::Record { .. } => "record",
            Reply::Error { .. } => "error",
            Reply::Bye => "bye",
        }
    }
}

/// Write `message` as a single line and flush.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// Read the next message. `Ok(None)` at end of stream; blank lines are skipped.
pub fn read_message<R: BufRead, T: DeserializeOwned>(
    reader: &mut R,
) -> std::io::Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    let message = serde_json::from_str(&line)?;
    Ok(Some(message))
}
