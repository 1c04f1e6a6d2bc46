//! A minimal deterministic script engine implementing the interpreter
//! contract.
//!
//! Programs are instruction lists, one instruction per line; this is what the
//! runtime's tests, benches and the demo CLI run. The full script-side
//! operation set is covered, so every runtime behavior is drivable without a
//! foreign interpreter.
//!
//! ```text
//! # spawn a relay, then talk to it
//! newchannel in
//! newchannel out
//! newproc "recv in\nsendlast out"
//! send in 1 2.5 "hi"
//! recv out
//! expect 1 2.5 "hi"
//! ```
//!
//! Values: `nil`, `true`, `false`, `nan`, numbers, and double-quoted strings
//! with `\n \t \r \0 \\ \"` escapes. Lines starting with `#` are comments.
//!
//! `recv` stores the operation's reply; `expect` faults the script unless the
//! stored reply matches (NaN compares equal to NaN); `sendlast` forwards the
//! stored reply, which is what makes relay scripts one-liners.
//!
//! The bytecode form produced by `dump` is the serde_json encoding of the
//! parsed instruction list; `load` accepts it back, and the runtime's chunk
//! cache keeps it across identical spawns.

use serde::{Deserialize, Serialize};

use crate::engine::{Chunk, EngineFactory, LoadError, Resume, ScriptEngine, Syscall};
use crate::types::{Value, ValueStack, DEFAULT_STACK_SLOTS};

// ── Instructions ──────────────────────────────────────────────────────────────

/// One parsed instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpCode {
    NewChannel { name: String },
    DelChannel { name: String },
    Send { channel: String, values: Vec<Value> },
    /// Send the previous operation's reply values.
    SendLast { channel: String },
    Recv { channel: String, nowait: bool },
    /// Fault unless the previous reply matches.
    Expect { values: Vec<Value> },
    NewProc { source: String },
    SetWorkers { count: usize },
    GetWorkers,
    Recycle { max: usize },
    Yield,
    Fail { message: String },
}

// ── Parsing ───────────────────────────────────────────────────────────────────

enum Tok {
    Word(String),
    Quoted(Vec<u8>),
}

fn tokenize(line: &str, lineno: usize) -> Result<Vec<Tok>, LoadError> {
    let mut toks = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else { break };
        if first == '"' {
            chars.next();
            let mut bytes = Vec::new();
            loop {
                match chars.next() {
                    None => {
                        return Err(LoadError::new(format!(
                            "line {lineno}: unterminated string"
                        )))
                    }
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => bytes.push(b'\n'),
                        Some('t') => bytes.push(b'\t'),
                        Some('r') => bytes.push(b'\r'),
                        Some('0') => bytes.push(0),
                        Some('\\') => bytes.push(b'\\'),
                        Some('"') => bytes.push(b'"'),
                        other => {
                            return Err(LoadError::new(format!(
                                "line {lineno}: bad escape {other:?}"
                            )))
                        }
                    },
                    Some(c) => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
            toks.push(Tok::Quoted(bytes));
        } else {
            let mut word = String::new();
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                word.push(chars.next().unwrap());
            }
            toks.push(Tok::Word(word));
        }
    }
    Ok(toks)
}

fn parse_value(tok: &Tok, lineno: usize) -> Result<Value, LoadError> {
    match tok {
        Tok::Quoted(bytes) => Ok(Value::Str(bytes.clone())),
        Tok::Word(w) => match w.as_str() {
            "nil" => Ok(Value::Nil),
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "nan" => Ok(Value::Number(f64::NAN)),
            _ => w
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| LoadError::new(format!("line {lineno}: invalid value '{w}'"))),
        },
    }
}

fn word<'a>(tok: Option<&'a Tok>, what: &str, lineno: usize) -> Result<&'a str, LoadError> {
    match tok {
        Some(Tok::Word(w)) => Ok(w),
        _ => Err(LoadError::new(format!("line {lineno}: expected {what}"))),
    }
}

/// Parse textual source into an instruction list.
pub fn parse_program(source: &str) -> Result<Vec<OpCode>, LoadError> {
    let mut program = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let toks = tokenize(line, lineno)?;
        let keyword = word(toks.first(), "an instruction", lineno)?;
        let op = match keyword {
            "newchannel" => OpCode::NewChannel {
                name: word(toks.get(1), "a channel name", lineno)?.to_string(),
            },
            "delchannel" => OpCode::DelChannel {
                name: word(toks.get(1), "a channel name", lineno)?.to_string(),
            },
            "send" => {
                let channel = word(toks.get(1), "a channel name", lineno)?.to_string();
                let values = toks[2..]
                    .iter()
                    .map(|t| parse_value(t, lineno))
                    .collect::<Result<Vec<_>, _>>()?;
                OpCode::Send { channel, values }
            }
            "sendlast" => OpCode::SendLast {
                channel: word(toks.get(1), "a channel name", lineno)?.to_string(),
            },
            "recv" => {
                let channel = word(toks.get(1), "a channel name", lineno)?.to_string();
                let nowait = match toks.get(2) {
                    None => false,
                    Some(Tok::Word(w)) if w == "nowait" => true,
                    _ => {
                        return Err(LoadError::new(format!(
                            "line {lineno}: expected 'nowait'"
                        )))
                    }
                };
                OpCode::Recv { channel, nowait }
            }
            "expect" => {
                let values = toks[1..]
                    .iter()
                    .map(|t| parse_value(t, lineno))
                    .collect::<Result<Vec<_>, _>>()?;
                OpCode::Expect { values }
            }
            "newproc" => match toks.get(1) {
                Some(Tok::Quoted(bytes)) => OpCode::NewProc {
                    source: String::from_utf8(bytes.clone()).map_err(|_| {
                        LoadError::new(format!("line {lineno}: source is not UTF-8"))
                    })?,
                },
                _ => {
                    return Err(LoadError::new(format!(
                        "line {lineno}: expected a quoted source string"
                    )))
                }
            },
            "setworkers" => OpCode::SetWorkers {
                count: word(toks.get(1), "a worker count", lineno)?
                    .parse()
                    .map_err(|_| {
                        LoadError::new(format!("line {lineno}: invalid worker count"))
                    })?,
            },
            "getworkers" => OpCode::GetWorkers,
            "recycle" => OpCode::Recycle {
                max: word(toks.get(1), "a recycle limit", lineno)?
                    .parse()
                    .map_err(|_| {
                        LoadError::new(format!("line {lineno}: invalid recycle limit"))
                    })?,
            },
            "yield" => OpCode::Yield,
            "fail" => OpCode::Fail {
                message: line["fail".len()..].trim().to_string(),
            },
            other => {
                return Err(LoadError::new(format!(
                    "line {lineno}: unknown instruction '{other}'"
                )))
            }
        };
        program.push(op);
    }
    Ok(program)
}

// ── Interpreter ───────────────────────────────────────────────────────────────

/// An isolated instance of the instruction-list interpreter.
pub struct OpInterp {
    program: Vec<OpCode>,
    pc: usize,
    stack: ValueStack,
    /// Reply values of the most recent suspending operation.
    last: Vec<Value>,
    /// A suspending operation's reply is on the stack at the next resume.
    pending: bool,
}

impl OpInterp {
    pub fn new(stack_slots: usize) -> Self {
        OpInterp {
            program: Vec::new(),
            pc: 0,
            stack: ValueStack::new(stack_slots),
            last: Vec::new(),
            pending: false,
        }
    }

    fn suspend(&mut self, stack_image: Vec<Value>, request: Syscall) -> Resume {
        self.stack.clear();
        for v in stack_image {
            self.stack.push(v);
        }
        self.pending = true;
        Resume::Yield(request)
    }
}

impl ScriptEngine for OpInterp {
    fn load(&mut self, chunk: &Chunk) -> Result<(), LoadError> {
        let program = match chunk {
            Chunk::Source(src) => parse_program(src)?,
            Chunk::Bytecode(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| LoadError::new(format!("invalid bytecode: {e}")))?,
        };
        self.program = program;
        self.pc = 0;
        self.stack.clear();
        self.last.clear();
        self.pending = false;
        Ok(())
    }

    fn resume(&mut self, nargs: usize) -> Resume {
        if self.pending {
            self.last = self.stack.take_top(nargs);
            self.stack.clear();
            self.pending = false;
        }

        while self.pc < self.program.len() {
            let op = self.program[self.pc].clone();
            self.pc += 1;
            match op {
                OpCode::Send { channel, values } => {
                    let mut image = vec![Value::str(&channel)];
                    image.extend(values);
                    return self.suspend(image, Syscall::Send { channel });
                }
                OpCode::SendLast { channel } => {
                    let mut image = vec![Value::str(&channel)];
                    image.extend(std::mem::take(&mut self.last));
                    return self.suspend(image, Syscall::Send { channel });
                }
                OpCode::Recv { channel, nowait } => {
                    let image = vec![Value::str(&channel)];
                    return self.suspend(image, Syscall::Receive { channel, nowait });
                }
                OpCode::Expect { values } => {
                    let matches = values.len() == self.last.len()
                        && values.iter().zip(&self.last).all(|(a, b)| a.same_as(b));
                    if !matches {
                        return Resume::Fault(format!(
                            "expectation failed at instruction {}: expected {:?}, got {:?}",
                            self.pc, values, self.last
                        ));
                    }
                }
                OpCode::NewChannel { name } => {
                    return self.suspend(Vec::new(), Syscall::NewChannel { name });
                }
                OpCode::DelChannel { name } => {
                    return self.suspend(Vec::new(), Syscall::DelChannel { name });
                }
                OpCode::NewProc { source } => {
                    return self.suspend(
                        Vec::new(),
                        Syscall::NewProcess { chunk: Chunk::Source(source) },
                    );
                }
                OpCode::SetWorkers { count } => {
                    return self.suspend(Vec::new(), Syscall::SetWorkers { count });
                }
                OpCode::GetWorkers => {
                    return self.suspend(Vec::new(), Syscall::GetWorkers);
                }
                OpCode::Recycle { max } => {
                    return self.suspend(Vec::new(), Syscall::SetRecycleMax { max });
                }
                OpCode::Yield => {
                    // No reply to collect: `last` survives a reschedule.
                    return Resume::Yield(Syscall::Pass);
                }
                OpCode::Fail { message } => return Resume::Fault(message),
            }
        }
        Resume::Finished
    }

    fn stack(&mut self) -> &mut ValueStack {
        &mut self.stack
    }

    fn dump(&self) -> Option<Vec<u8>> {
        serde_json::to_vec(&self.program).ok()
    }

    fn reset(&mut self) {
        self.program.clear();
        self.pc = 0;
        self.stack.clear();
        self.last.clear();
        self.pending = false;
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Manufactures [`OpInterp`] instances.
pub struct OpEngineFactory {
    stack_slots: usize,
}

impl OpEngineFactory {
    pub fn new() -> Self {
        OpEngineFactory { stack_slots: DEFAULT_STACK_SLOTS }
    }

    pub fn with_stack_slots(stack_slots: usize) -> Self {
        OpEngineFactory { stack_slots }
    }
}

impl Default for OpEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for OpEngineFactory {
    fn create(&self) -> Box<dyn ScriptEngine> {
        Box::new(OpInterp::new(self.stack_slots))
    }
}
