//! Bytecode and the artifact that carries it across the boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::{BinOp, UnOp};
use crate::record::Value;

/// Bump when [`Op`] or [`Program`] change shape.
pub const FORMAT_VERSION: u32 = 1;

/// Name of the entry every compiled snippet exposes.
pub const ENTRY_POINT: &str = "execute";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    Len,
    Has,
    Log,
    Fail,
    Remove,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "len" => Some(Builtin::Len),
            "has" => Some(Builtin::Has),
            "log" => Some(Builtin::Log),
            "fail" => Some(Builtin::Fail),
            "remove" => Some(Builtin::Remove),
            _ => None,
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Len | Builtin::Log | Builtin::Fail => 1,
            Builtin::Has | Builtin::Remove => 2,
        }
    }
}

/// Stack machine instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Const(Value),
    Load(u16),
    Store(u16),
    LoadRows,
    LoadTime,
    StoreTime,
    /// Pops target; pushes the named field.
    GetField(String),
    /// Pops value and target; writes the named field.
    SetField(String),
    /// Pops index and target.
    GetIndex,
    /// Pops value, index and target.
    SetIndex,
    Binary(BinOp),
    Unary(UnOp),
    Call(Builtin),
    Jump(usize),
    JumpIfFalse(usize),
    Pop,
    Return,
}

/// One callable body plus its local slot count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub code: Vec<Op>,
    pub locals: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub format_version: u32,
    pub entries: BTreeMap<String, Chunk>,
}

/// Per-entry source line of every instruction.
pub type LineTable = BTreeMap<String, Vec<u32>>;

/// Loadable output of the compiler.
///
/// `payload` is the serialized [`Program`]; `symbols` the serialized
/// [`LineTable`]. Both are opaque bytes to everything but the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub payload: Vec<u8>,
    pub symbols: Option<Vec<u8>>,
    pub entry_point: String,
}

impl CompiledArtifact {
    pub fn from_program(program: &Program, lines: Option<&LineTable>) -> serde_json::Result<Self> {
        Ok(Self {
            payload: serde_json::to_vec(program)?,
            symbols: lines.map(serde_json::to_vec).transpose()?,
            entry_point: ENTRY_POINT.to_string(),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("artifact payload is malformed: {0}")]
    Malformed(String),
    #[error("artifact format version {found} is not supported (expected {expected})")]
    IncompatibleVersion { found: u32, expected: u32 },
    #[error("artifact has no entry point `{0}`")]
    MissingEntryPoint(String),
    #[error("artifact declares entry point `{found}`, expected `{expected}`")]
    WrongConvention { found: String, expected: String },
}

/// An artifact decoded and checked against the entry-point convention.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedProgram {
    pub entry: Chunk,
    pub lines: Vec<u32>,
}

impl LoadedProgram {
    pub fn load(artifact: &CompiledArtifact) -> Result<Self, LoadError> {
        if artifact.entry_point != ENTRY_POINT {
            return Err(LoadError::WrongConvention {
                found: artifact.entry_point.clone(),
                expected: ENTRY_POINT.to_string(),
            });
        }
        let mut program: Program = serde_json::from_slice(&artifact.payload)
            .map_err(|err| LoadError::Malformed(err.to_string()))?;
        if program.format_version != FORMAT_VERSION {
            return Err(LoadError::IncompatibleVersion {
                found: program.format_version,
                expected: FORMAT_VERSION,
            });
        }
        let entry = program
            .entries
            .remove(ENTRY_POINT)
            .ok_or_else(|| LoadError::MissingEntryPoint(ENTRY_POINT.to_string()))?;
        if let Some(problem) = entry.code.iter().find_map(|op| match op {
            Op::Jump(t) | Op::JumpIfFalse(t) if *t > entry.code.len() => {
                Some(format!("jump target {t} is out of range"))
            }
            Op::Load(slot) | Op::Store(slot) if *slot >= entry.locals => {
                Some(format!("local slot {slot} is out of range"))
            }
            _ => None,
        }) {
            return Err(LoadError::Malformed(problem));
        }
        // Symbols are optional; a damaged table only costs line numbers.
        let lines = artifact
            .symbols
            .as_deref()
            .and_then(|raw| serde_json::from_slice::<LineTable>(raw).ok())
            .and_then(|mut table| table.remove(ENTRY_POINT))
            .unwrap_or_default();
        Ok(Self { entry, lines })
    }

    /// Source line for an instruction index, when symbols were shipped.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.lines.get(pc).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_with(entry: &str, code: Vec<Op>) -> Program {
        let mut entries = BTreeMap::new();
        entries.insert(entry.to_string(), Chunk { code, locals: 0 });
        Program {
            format_version: FORMAT_VERSION,
            entries,
        }
    }

    #[test]
    fn load_reads_entry_and_lines() {
        let program = program_with(ENTRY_POINT, vec![Op::Return]);
        let mut lines = LineTable::new();
        lines.insert(ENTRY_POINT.to_string(), vec![3]);
        let artifact = CompiledArtifact::from_program(&program, Some(&lines)).expect("encode");

        let loaded = LoadedProgram::load(&artifact).expect("load");
        assert_eq!(loaded.entry.code, vec![Op::Return]);
        assert_eq!(loaded.line_at(0), Some(3));
        assert_eq!(loaded.line_at(1), None);
    }

    #[test]
    fn missing_entry_point_is_a_load_error() {
        let program = program_with("main", vec![Op::Return]);
        let artifact = CompiledArtifact::from_program(&program, None).expect("encode");
        assert_eq!(
            LoadedProgram::load(&artifact).unwrap_err(),
            LoadError::MissingEntryPoint(ENTRY_POINT.to_string())
        );
    }

    #[test]
    fn version_mismatch_is_a_load_error() {
        let mut program = program_with(ENTRY_POINT, vec![]);
        program.format_version = FORMAT_VERSION + 1;
        let artifact = CompiledArtifact::from_program(&program, None).expect("encode");
        assert!(matches!(
            LoadedProgram::load(&artifact),
            Err(LoadError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let artifact = CompiledArtifact {
            payload: b"\x00\x01not json".to_vec(),
            symbols: None,
            entry_point: ENTRY_POINT.to_string(),
        };
        assert!(matches!(
            LoadedProgram::load(&artifact),
            Err(LoadError::Malformed(_))
        ));
    }

    #[test]
    fn out_of_range_jump_is_malformed() {
        let program = program_with(ENTRY_POINT, vec![Op::Jump(99)]);
        let artifact = CompiledArtifact::from_program(&program, None).expect("encode");
        assert!(matches!(
            LoadedProgram::load(&artifact),
            Err(LoadError::Malformed(_))
        ));
    }
}
