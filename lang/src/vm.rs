//! Bytecode interpreter that runs a loaded snippet against a record.
//!
//! The VM has no notion of time: bounding execution is the host's job, done by
//! tearing down the process the VM runs in.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::ast::{BinOp, UnOp};
use crate::program::{Builtin, LoadedProgram, Op};
use crate::record::{Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Raised by the snippet through `fail(...)`.
    UserError,
    TypeError,
    MissingField,
    OutOfRange,
    Arithmetic,
    ResourceExhausted,
    /// The process running the snippet died; only the host reports this.
    Crashed,
    /// A value could not be copied across the boundary.
    Marshal,
    /// The entry point did not return in time; only the host reports this.
    Timeout,
}

/// A runtime failure attributed to user code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    pub line: Option<u32>,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::UserError => "user_error",
            FaultKind::TypeError => "type_error",
            FaultKind::MissingField => "missing_field",
            FaultKind::OutOfRange => "out_of_range",
            FaultKind::Arithmetic => "arithmetic",
            FaultKind::ResourceExhausted => "resource_exhausted",
            FaultKind::Crashed => "crashed",
            FaultKind::Marshal => "marshal",
            FaultKind::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} at line {}: {}", self.kind, line, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Caps on what a snippet may allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_string_len: usize,
    pub max_row_fields: usize,
    pub max_log_lines: usize,
    pub max_stack_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_string_len: 1 << 20,
            max_row_fields: 10_000,
            max_log_lines: 10_000,
            max_stack_depth: 1_024,
        }
    }
}

#[derive(Debug, Clone)]
enum Operand {
    Value(Value),
    Rows,
    Row(usize),
}

impl Operand {
    fn describe(&self) -> &'static str {
        match self {
            Operand::Value(v) => v.type_name(),
            Operand::Rows => "rows",
            Operand::Row(_) => "row",
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Operand::Value(v) => v.is_truthy(),
            Operand::Rows | Operand::Row(_) => true,
        }
    }
}

type Step<T> = Result<T, (FaultKind, String)>;

enum Flow {
    Next,
    Jump(usize),
    Return,
}

pub struct Vm<'p> {
    program: &'p LoadedProgram,
    limits: Limits,
    logs: Vec<String>,
}

impl<'p> Vm<'p> {
    pub fn new(program: &'p LoadedProgram, limits: Limits) -> Self {
        Self {
            program,
            limits,
            logs: Vec::new(),
        }
    }

    /// Lines written with `log(...)` so far.
    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn into_logs(self) -> Vec<String> {
        self.logs
    }

    /// Execute the entry point to completion, mutating `record` in place.
    pub fn run(&mut self, record: &mut Record) -> Result<(), Fault> {
        let program = self.program;
        let code = &program.entry.code;
        let mut frame = Frame {
            locals: vec![Operand::Value(Value::Null); program.entry.locals as usize],
            stack: Vec::new(),
            max_depth: self.limits.max_stack_depth,
        };
        let mut pc = 0;
        while let Some(op) = code.get(pc) {
            match self.exec(op, &mut frame, record) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Return) => break,
                Err((kind, message)) => {
                    return Err(Fault {
                        kind,
                        message,
                        line: program.line_at(pc),
                    });
                }
            }
        }
        Ok(())
    }

    fn exec(&mut self, op: &Op, frame: &mut Frame, record: &mut Record) -> Step<Flow> {
        match op {
            Op::Const(v) => frame.push(Operand::Value(v.clone()))?,
            Op::Load(slot) => {
                let value = frame.locals[*slot as usize].clone();
                frame.push(value)?;
            }
            Op::Store(slot) => {
                let value = frame.pop()?;
                frame.locals[*slot as usize] = value;
            }
            Op::LoadRows => frame.push(Operand::Rows)?,
            Op::LoadTime => {
                frame.push(Operand::Value(Value::Int(record.time.timestamp_millis())))?;
            }
            Op::StoreTime => {
                let value = frame.pop_value()?;
                let time = match value {
                    Value::Int(ms) => DateTime::from_timestamp_millis(ms),
                    _ => None,
                };
                record.time = time.ok_or_else(|| {
                    type_error(format!(
                        "time must be unix milliseconds, got {}",
                        value.type_name()
                    ))
                })?;
            }
            Op::GetField(name) => {
                let target = frame.pop()?;
                let value = read_field(record, &target, name)?;
                frame.push(Operand::Value(value))?;
            }
            Op::SetField(name) => {
                let value = frame.pop_value()?;
                let target = frame.pop()?;
                self.write_field(record, &target, name, value)?;
            }
            Op::GetIndex => {
                let index = frame.pop_value()?;
                let target = frame.pop()?;
                let item = match (&target, index) {
                    (Operand::Rows, Value::Int(i)) => {
                        let len = record.rows.len();
                        usize::try_from(i)
                            .ok()
                            .filter(|i| *i < len)
                            .map(Operand::Row)
                            .ok_or_else(|| {
                                (
                                    FaultKind::OutOfRange,
                                    format!("row index {i} out of range ({len} rows)"),
                                )
                            })?
                    }
                    (Operand::Row(_), Value::Str(name)) => {
                        Operand::Value(read_field(record, &target, &name)?)
                    }
                    (target, index) => {
                        return Err(type_error(format!(
                            "cannot index {} with {}",
                            target.describe(),
                            index.type_name()
                        )));
                    }
                };
                frame.push(item)?;
            }
            Op::SetIndex => {
                let value = frame.pop_value()?;
                let index = frame.pop_value()?;
                let target = frame.pop()?;
                match index {
                    Value::Str(name) => self.write_field(record, &target, &name, value)?,
                    other => {
                        return Err(type_error(format!(
                            "cannot assign into {} by {}",
                            target.describe(),
                            other.type_name()
                        )));
                    }
                }
            }
            Op::Binary(op) => {
                let rhs = frame.pop_value()?;
                let lhs = frame.pop_value()?;
                let result = self.binary(*op, lhs, rhs)?;
                frame.push(Operand::Value(result))?;
            }
            Op::Unary(op) => {
                let operand = frame.pop()?;
                let result = match (op, operand) {
                    (UnOp::Not, operand) => Value::Bool(!operand.is_truthy()),
                    (UnOp::Neg, Operand::Value(Value::Int(i))) => {
                        Value::Int(i.checked_neg().ok_or_else(overflow)?)
                    }
                    (UnOp::Neg, Operand::Value(Value::Float(f))) => Value::Float(-f),
                    (UnOp::Neg, other) => {
                        return Err(type_error(format!("cannot negate {}", other.describe())));
                    }
                };
                frame.push(Operand::Value(result))?;
            }
            Op::Call(builtin) => {
                let result = self.call(*builtin, frame, record)?;
                frame.push(result)?;
            }
            Op::Jump(target) => return Ok(Flow::Jump(*target)),
            Op::JumpIfFalse(target) => {
                if !frame.pop()?.is_truthy() {
                    return Ok(Flow::Jump(*target));
                }
            }
            Op::Pop => {
                frame.pop()?;
            }
            Op::Return => return Ok(Flow::Return),
        }
        Ok(Flow::Next)
    }

    fn write_field(
        &self,
        record: &mut Record,
        target: &Operand,
        name: &str,
        value: Value,
    ) -> Step<()> {
        let Operand::Row(i) = target else {
            return Err(type_error(format!(
                "cannot set field `{name}` on {}",
                target.describe()
            )));
        };
        let row = record
            .rows
            .get_mut(*i)
            .ok_or_else(|| (FaultKind::OutOfRange, format!("row {i} no longer exists")))?;
        if !row.contains(name) && row.len() >= self.limits.max_row_fields {
            return Err((
                FaultKind::ResourceExhausted,
                format!("row {i} exceeds {} fields", self.limits.max_row_fields),
            ));
        }
        row.set(name, value);
        Ok(())
    }

    fn binary(&self, op: BinOp, lhs: Value, rhs: Value) -> Step<Value> {
        use Value::{Float, Int, Str};
        let result = match (op, lhs, rhs) {
            (BinOp::Eq, a, b) => Value::Bool(values_equal(&a, &b)),
            (BinOp::Ne, a, b) => Value::Bool(!values_equal(&a, &b)),
            (BinOp::Add, Str(a), b) => self.concat(a, &b.to_string())?,
            (BinOp::Add, a, Str(b)) => self.concat(a.to_string(), &b)?,
            (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, Str(a), Str(b)) => {
                Value::Bool(compare(op, a.cmp(&b)))
            }
            (op, Int(a), Int(b)) => int_binary(op, a, b)?,
            (op, a @ (Int(_) | Float(_)), b @ (Int(_) | Float(_))) => {
                float_binary(op, as_float(&a), as_float(&b))
            }
            (op, a, b) => {
                return Err(type_error(format!(
                    "unsupported operands for {op:?}: {} and {}",
                    a.type_name(),
                    b.type_name()
                )));
            }
        };
        Ok(result)
    }

    fn concat(&self, mut lhs: String, rhs: &str) -> Step<Value> {
        if lhs.len() + rhs.len() > self.limits.max_string_len {
            return Err((
                FaultKind::ResourceExhausted,
                format!(
                    "string would exceed {} bytes",
                    self.limits.max_string_len
                ),
            ));
        }
        lhs.push_str(rhs);
        Ok(Value::Str(lhs))
    }

    fn call(&mut self, builtin: Builtin, frame: &mut Frame, record: &mut Record) -> Step<Operand> {
        let result = match builtin {
            Builtin::Len => {
                let len = match frame.pop()? {
                    Operand::Rows => record.rows.len(),
                    Operand::Row(i) => record.rows.get(i).map_or(0, |row| row.len()),
                    Operand::Value(Value::Str(s)) => s.chars().count(),
                    other => {
                        return Err(type_error(format!("len() of {}", other.describe())));
                    }
                };
                Value::Int(len as i64)
            }
            Builtin::Has | Builtin::Remove => {
                let name = frame.pop_value()?;
                let target = frame.pop()?;
                let (Operand::Row(i), Value::Str(name)) = (&target, &name) else {
                    return Err(type_error(format!(
                        "{builtin:?} expects a row and a field name, got {} and {}",
                        target.describe(),
                        name.type_name()
                    )));
                };
                let row = record.rows.get_mut(*i).ok_or_else(|| {
                    (FaultKind::OutOfRange, format!("row {i} no longer exists"))
                })?;
                if builtin == Builtin::Has {
                    Value::Bool(row.contains(name))
                } else {
                    row.remove(name).unwrap_or(Value::Null)
                }
            }
            Builtin::Log => {
                let line = render(&frame.pop()?, record);
                if self.logs.len() >= self.limits.max_log_lines {
                    return Err((
                        FaultKind::ResourceExhausted,
                        format!("more than {} log lines", self.limits.max_log_lines),
                    ));
                }
                self.logs.push(line);
                Value::Null
            }
            Builtin::Fail => {
                let message = render(&frame.pop()?, record);
                return Err((FaultKind::UserError, message));
            }
        };
        Ok(Operand::Value(result))
    }
}

struct Frame {
    locals: Vec<Operand>,
    stack: Vec<Operand>,
    max_depth: usize,
}

impl Frame {
    fn push(&mut self, operand: Operand) -> Step<()> {
        if self.stack.len() >= self.max_depth {
            return Err((
                FaultKind::ResourceExhausted,
                format!("operand stack exceeds {} entries", self.max_depth),
            ));
        }
        self.stack.push(operand);
        Ok(())
    }

    fn pop(&mut self) -> Step<Operand> {
        self.stack
            .pop()
            .ok_or_else(|| type_error("operand stack underflow".to_string()))
    }

    fn pop_value(&mut self) -> Step<Value> {
        match self.pop()? {
            Operand::Value(v) => Ok(v),
            other => Err(type_error(format!(
                "expected a value, found {}",
                other.describe()
            ))),
        }
    }
}

fn type_error(message: String) -> (FaultKind, String) {
    (FaultKind::TypeError, message)
}

fn overflow() -> (FaultKind, String) {
    (FaultKind::Arithmetic, "integer overflow".to_string())
}

fn read_field(record: &Record, target: &Operand, name: &str) -> Step<Value> {
    let Operand::Row(i) = target else {
        return Err(type_error(format!(
            "cannot read field `{name}` of {}",
            target.describe()
        )));
    };
    record
        .rows
        .get(*i)
        .and_then(|row| row.get(name))
        .cloned()
        .ok_or_else(|| {
            (
                FaultKind::MissingField,
                format!("row {i} has no field `{name}`"),
            )
        })
}

fn render(operand: &Operand, record: &Record) -> String {
    match operand {
        Operand::Value(v) => v.to_string(),
        Operand::Rows => format!("<{} rows>", record.rows.len()),
        Operand::Row(i) => record
            .rows
            .get(*i)
            .and_then(|row| serde_json::to_string(row).ok())
            .unwrap_or_else(|| format!("<row {i}>")),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn as_float(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

fn compare(op: BinOp, ordering: std::cmp::Ordering) -> bool {
    match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => false,
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Step<Value> {
    let divide_by_zero = || (FaultKind::Arithmetic, "division by zero".to_string());
    let value = match op {
        BinOp::Add => Value::Int(a.checked_add(b).ok_or_else(overflow)?),
        BinOp::Sub => Value::Int(a.checked_sub(b).ok_or_else(overflow)?),
        BinOp::Mul => Value::Int(a.checked_mul(b).ok_or_else(overflow)?),
        BinOp::Div if b == 0 => return Err(divide_by_zero()),
        BinOp::Rem if b == 0 => return Err(divide_by_zero()),
        BinOp::Div => Value::Int(a.checked_div(b).ok_or_else(overflow)?),
        BinOp::Rem => Value::Int(a.checked_rem(b).ok_or_else(overflow)?),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => Value::Bool(compare(op, a.cmp(&b))),
        BinOp::Eq => Value::Bool(a == b),
        BinOp::Ne => Value::Bool(a != b),
    };
    Ok(value)
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Value {
    match op {
        BinOp::Add => Value::Float(a + b),
        BinOp::Sub => Value::Float(a - b),
        BinOp::Mul => Value::Float(a * b),
        BinOp::Div => Value::Float(a / b),
        BinOp::Rem => Value::Float(a % b),
        BinOp::Lt => Value::Bool(a < b),
        BinOp::Le => Value::Bool(a <= b),
        BinOp::Gt => Value::Bool(a > b),
        BinOp::Ge => Value::Bool(a >= b),
        BinOp::Eq => Value::Bool(a == b),
        BinOp::Ne => Value::Bool(a != b),
    }
}
