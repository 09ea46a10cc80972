//! Bytecode format and interpreter for tally machines.
//!
//! A program is a constructor plus a table of named functions. Each function
//! body is a short stack program over the machine's arguments and its tally
//! storage. Every instruction is metered; storage writes cost the most.

use serde::{Deserialize, Serialize};

use crate::{
    abi::{self, Mutability, ParamType, Value},
    tally::{Revert, TallyState},
};

pub const MAGIC: &[u8; 4] = b"TALY";
pub const VERSION: u8 = 1;

/// A function body's length travels as a `u16`.
pub const MAX_CODE_LEN: usize = u16::MAX as usize;

pub const GAS_TX_BASE: u64 = 21_000;
pub const GAS_CREATE: u64 = 32_000;
pub const GAS_CODE_BYTE: u64 = 200;
pub const GAS_REGISTER: u64 = 20_000;
pub const GAS_UPDATE: u64 = 5_000;
pub const GAS_READ: u64 = 800;
pub const GAS_STEP: u64 = 3;

#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum VmError {
    #[error("out of gas: needs at least {required}, limit {limit}")]
    OutOfGas { required: u64, limit: u64 },
    #[error("reverted: {0}")]
    Reverted(Revert),
    #[error("invalid bytecode: {0}")]
    InvalidProgram(String),
    #[error("no operation named {0}")]
    UnknownOperation(String),
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("operation {0} may not change state")]
    StateChangeInView(String),
}

impl From<Revert> for VmError {
    fn from(revert: Revert) -> Self {
        VmError::Reverted(revert)
    }
}

impl From<abi::AbiError> for VmError {
    fn from(err: abi::AbiError) -> Self {
        VmError::BadArguments(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instr {
    /// Push argument `i`.
    Arg(u8),
    /// Pop a candidate, push whether it is registered.
    Member,
    /// Pop a candidate, revert unless it is registered.
    Check,
    /// Pop a candidate, push its counter.
    Load,
    /// Pop a candidate, add one to its counter.
    Incr,
    /// Pop an index, push the registry entry at it.
    Index,
    /// Pop a candidate list, create the registry.
    Init,
    Ret,
    Stop,
}

impl Instr {
    /// Encoded size in bytes.
    pub fn width(&self) -> usize {
        match self {
            Instr::Arg(_) => 2,
            _ => 1,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Instr::Stop => out.push(0x00),
            Instr::Arg(i) => out.extend_from_slice(&[0x01, *i]),
            Instr::Member => out.push(0x02),
            Instr::Check => out.push(0x03),
            Instr::Load => out.push(0x04),
            Instr::Incr => out.push(0x05),
            Instr::Index => out.push(0x06),
            Instr::Init => out.push(0x07),
            Instr::Ret => out.push(0x08),
        }
    }

    fn decode_all(code: &[u8]) -> Result<Vec<Instr>, VmError> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < code.len() {
            let op = code[pos];
            pos += 1;
            let instr = match op {
                0x00 => Instr::Stop,
                0x01 => {
                    let idx = *code
                        .get(pos)
                        .ok_or_else(|| invalid("ARG without operand"))?;
                    pos += 1;
                    Instr::Arg(idx)
                }
                0x02 => Instr::Member,
                0x03 => Instr::Check,
                0x04 => Instr::Load,
                0x05 => Instr::Incr,
                0x06 => Instr::Index,
                0x07 => Instr::Init,
                0x08 => Instr::Ret,
                other => return Err(invalid(format!("unknown opcode 0x{other:02x}"))),
            };
            out.push(instr);
        }
        Ok(out)
    }
}

fn invalid(msg: impl Into<String>) -> VmError {
    VmError::InvalidProgram(msg.into())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub mutability: Mutability,
    pub params: Vec<ParamType>,
    pub returns: Option<ParamType>,
    pub code: Vec<Instr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    pub constructor: Function,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        encode_signature(&self.constructor, &mut out);
        encode_code(&self.constructor.code, &mut out);
        out.push(self.functions.len() as u8);
        for function in &self.functions {
            out.push(function.name.len() as u8);
            out.extend_from_slice(function.name.as_bytes());
            out.push(match function.mutability {
                Mutability::View => 0,
                Mutability::Mutating => 1,
            });
            encode_signature(function, &mut out);
            encode_code(&function.code, &mut out);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VmError> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(invalid("bad magic"));
        }
        let version = reader.u8()?;
        if version != VERSION {
            return Err(invalid(format!("unsupported version {version}")));
        }
        let (params, returns) = reader.signature()?;
        let constructor = Function {
            name: "constructor".into(),
            mutability: Mutability::Mutating,
            params,
            returns,
            code: reader.code()?,
        };
        let count = reader.u8()?;
        let mut functions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_len = reader.u8()? as usize;
            let name = std::str::from_utf8(reader.take(name_len)?)
                .map_err(|_| invalid("function name is not utf-8"))?
                .to_string();
            let mutability = match reader.u8()? {
                0 => Mutability::View,
                1 => Mutability::Mutating,
                other => return Err(invalid(format!("bad mutability flag {other}"))),
            };
            let (params, returns) = reader.signature()?;
            functions.push(Function {
                name,
                mutability,
                params,
                returns,
                code: reader.code()?,
            });
        }
        if reader.pos != bytes.len() {
            return Err(invalid("trailing bytes after function table"));
        }
        Ok(Self {
            constructor,
            functions,
        })
    }
}

fn encode_signature(function: &Function, out: &mut Vec<u8>) {
    out.push(function.params.len() as u8);
    out.extend(function.params.iter().map(|p| p.tag()));
    out.push(function.returns.map(|r| r.tag()).unwrap_or(0));
}

fn encode_code(code: &[Instr], out: &mut Vec<u8>) {
    let mut body = Vec::new();
    for instr in code {
        instr.encode(&mut body);
    }
    debug_assert!(body.len() <= MAX_CODE_LEN, "function body too large");
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(&body);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], VmError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| invalid("truncated bytecode"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, VmError> {
        Ok(self.take(1)?[0])
    }

    fn param_type(&mut self) -> Result<ParamType, VmError> {
        let tag = self.u8()?;
        ParamType::from_tag(tag).ok_or_else(|| invalid(format!("bad type tag {tag}")))
    }

    fn signature(&mut self) -> Result<(Vec<ParamType>, Option<ParamType>), VmError> {
        let count = self.u8()?;
        let params = (0..count)
            .map(|_| self.param_type())
            .collect::<Result<Vec<_>, _>>()?;
        let returns = match self.u8()? {
            0 => None,
            tag => Some(
                ParamType::from_tag(tag).ok_or_else(|| invalid(format!("bad type tag {tag}")))?,
            ),
        };
        Ok((params, returns))
    }

    fn code(&mut self) -> Result<Vec<Instr>, VmError> {
        let len_bytes = self.take(2)?;
        let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
        Instr::decode_all(self.take(len)?)
    }
}

/// Gas meter for a single transaction or call.
#[derive(Clone, Copy, Debug)]
pub struct Gas {
    limit: u64,
    used: u64,
}

impl Gas {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn charge(&mut self, amount: u64) -> Result<(), VmError> {
        let required = self.used.saturating_add(amount);
        if required > self.limit {
            return Err(VmError::OutOfGas {
                required,
                limit: self.limit,
            });
        }
        self.used = required;
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

/// Intrinsic cost of creating a machine from `code_len` bytes of bytecode.
pub fn creation_cost(code_len: usize) -> u64 {
    GAS_TX_BASE + GAS_CREATE + GAS_CODE_BYTE * code_len as u64
}

/// Run the constructor and return the freshly initialised storage.
pub fn construct(program: &Program, args: &[Value], gas: &mut Gas) -> Result<TallyState, VmError> {
    let ctor = &program.constructor;
    abi::check_args("constructor", ctor.params.iter().copied(), args)?;
    let mut storage = None;
    run(ctor, args, &mut storage, gas)?;
    storage.ok_or_else(|| invalid("constructor did not initialise storage"))
}

/// Execute `name` against `state`. Storage changes land only when the whole
/// function completes; a revert or gas exhaustion leaves `state` untouched.
pub fn execute(
    program: &Program,
    name: &str,
    args: &[Value],
    state: &mut TallyState,
    gas: &mut Gas,
) -> Result<Value, VmError> {
    let function = program
        .function(name)
        .ok_or_else(|| VmError::UnknownOperation(name.to_string()))?;
    abi::check_args(name, function.params.iter().copied(), args)?;
    let mut scratch = Some(state.clone());
    let output = run(function, args, &mut scratch, gas)?;
    if function.mutability == Mutability::Mutating {
        if let Some(next) = scratch {
            *state = next;
        }
    }
    Ok(output)
}

fn run(
    function: &Function,
    args: &[Value],
    storage: &mut Option<TallyState>,
    gas: &mut Gas,
) -> Result<Value, VmError> {
    let mut stack: Vec<Value> = Vec::new();
    for instr in &function.code {
        gas.charge(GAS_STEP)?;
        match instr {
            Instr::Arg(idx) => {
                let arg = args
                    .get(*idx as usize)
                    .ok_or_else(|| invalid(format!("argument {idx} out of range")))?;
                stack.push(arg.clone());
            }
            Instr::Member => {
                let candidate = pop_candidate(&mut stack)?;
                gas.charge(GAS_READ)?;
                stack.push(Value::Bool(state(storage)?.is_candidate(&candidate)));
            }
            Instr::Check => {
                let candidate = pop_candidate(&mut stack)?;
                gas.charge(GAS_READ)?;
                if !state(storage)?.is_candidate(&candidate) {
                    return Err(Revert::UnknownCandidate(candidate).into());
                }
            }
            Instr::Load => {
                let candidate = pop_candidate(&mut stack)?;
                gas.charge(GAS_READ)?;
                stack.push(Value::Uint(state(storage)?.total_votes_for(&candidate)?));
            }
            Instr::Incr => {
                if function.mutability == Mutability::View {
                    return Err(VmError::StateChangeInView(function.name.clone()));
                }
                let candidate = pop_candidate(&mut stack)?;
                gas.charge(GAS_UPDATE)?;
                state_mut(storage)?.vote(&candidate)?;
            }
            Instr::Index => {
                let index = match stack.pop() {
                    Some(Value::Uint(index)) => index,
                    _ => return Err(invalid("INDEX expects a uint")),
                };
                gas.charge(GAS_READ)?;
                stack.push(Value::Bytes32(state(storage)?.candidate_at(index)?));
            }
            Instr::Init => {
                if storage.is_some() {
                    return Err(invalid("INIT outside constructor"));
                }
                let list = match stack.pop() {
                    Some(Value::Bytes32List(list)) => list,
                    _ => return Err(invalid("INIT expects a candidate list")),
                };
                gas.charge(GAS_REGISTER.saturating_mul(list.len() as u64))?;
                *storage = Some(TallyState::construct(&list)?);
            }
            Instr::Ret => {
                let value = stack.pop().ok_or_else(|| invalid("RET on empty stack"))?;
                if value.param_type() != function.returns {
                    return Err(invalid(format!(
                        "{} returned {} but declares {:?}",
                        function.name,
                        value.kind(),
                        function.returns
                    )));
                }
                return Ok(value);
            }
            Instr::Stop => break,
        }
    }
    if function.returns.is_some() {
        return Err(invalid(format!("{} ended without a value", function.name)));
    }
    Ok(Value::Unit)
}

fn pop_candidate(stack: &mut Vec<Value>) -> Result<crate::abi::Bytes32, VmError> {
    match stack.pop() {
        Some(Value::Bytes32(candidate)) => Ok(candidate),
        _ => Err(invalid("expected a bytes32 operand")),
    }
}

fn state(storage: &Option<TallyState>) -> Result<&TallyState, VmError> {
    storage
        .as_ref()
        .ok_or_else(|| invalid("storage used before INIT"))
}

fn state_mut(storage: &mut Option<TallyState>) -> Result<&mut TallyState, VmError> {
    storage
        .as_mut()
        .ok_or_else(|| invalid("storage used before INIT"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Bytes32;

    fn voting_program() -> Program {
        Program {
            constructor: Function {
                name: "constructor".into(),
                mutability: Mutability::Mutating,
                params: vec![ParamType::Bytes32List],
                returns: None,
                code: vec![Instr::Arg(0), Instr::Init],
            },
            functions: vec![
                Function {
                    name: "totalVotesFor".into(),
                    mutability: Mutability::View,
                    params: vec![ParamType::Bytes32],
                    returns: Some(ParamType::Uint),
                    code: vec![Instr::Arg(0), Instr::Check, Instr::Arg(0), Instr::Load, Instr::Ret],
                },
                Function {
                    name: "voteForCandidate".into(),
                    mutability: Mutability::Mutating,
                    params: vec![ParamType::Bytes32],
                    returns: None,
                    code: vec![Instr::Arg(0), Instr::Check, Instr::Arg(0), Instr::Incr],
                },
            ],
        }
    }

    fn candidates() -> Value {
        Value::Bytes32List(
            ["Rama", "Nick"]
                .iter()
                .map(|n| Bytes32::from_name(n).unwrap())
                .collect(),
        )
    }

    fn rama() -> Value {
        Value::Bytes32(Bytes32::from_name("Rama").unwrap())
    }

    #[test]
    fn bytecode_decodes_to_the_same_program() {
        let program = voting_program();
        let bytes = program.encode();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(Program::decode(&bytes).unwrap(), program);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Program::decode(b"nope").is_err());
        let mut bytes = voting_program().encode();
        bytes.push(0xee);
        assert!(matches!(
            Program::decode(&bytes),
            Err(VmError::InvalidProgram(_))
        ));
        let bytes = voting_program().encode();
        assert!(Program::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn vote_then_read_back() {
        let program = voting_program();
        let mut gas = Gas::new(1_000_000);
        let mut state = construct(&program, &[candidates()], &mut gas).unwrap();
        assert!(gas.used() >= 2 * GAS_REGISTER);
        let mut gas = Gas::new(100_000);
        execute(&program, "voteForCandidate", &[rama()], &mut state, &mut gas).unwrap();
        let mut gas = Gas::new(100_000);
        let total = execute(&program, "totalVotesFor", &[rama()], &mut state, &mut gas).unwrap();
        assert_eq!(total, Value::Uint(1));
    }

    #[test]
    fn out_of_gas_leaves_state_untouched() {
        let program = voting_program();
        let mut state = construct(&program, &[candidates()], &mut Gas::new(1_000_000)).unwrap();
        let before = state.clone();
        let err = execute(
            &program,
            "voteForCandidate",
            &[rama()],
            &mut state,
            &mut Gas::new(GAS_UPDATE),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::OutOfGas { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn unknown_candidate_reverts() {
        let program = voting_program();
        let mut state = construct(&program, &[candidates()], &mut Gas::new(1_000_000)).unwrap();
        let stranger = Bytes32::from_name("Unknown").unwrap();
        let err = execute(
            &program,
            "voteForCandidate",
            &[Value::Bytes32(stranger)],
            &mut state,
            &mut Gas::new(100_000),
        )
        .unwrap_err();
        assert_eq!(err, VmError::Reverted(Revert::UnknownCandidate(stranger)));
    }

    #[test]
    fn view_function_cannot_write() {
        let mut program = voting_program();
        program.functions[0].code = vec![Instr::Arg(0), Instr::Incr, Instr::Stop];
        program.functions[0].returns = None;
        let mut state = construct(&program, &[candidates()], &mut Gas::new(1_000_000)).unwrap();
        let err = execute(
            &program,
            "totalVotesFor",
            &[rama()],
            &mut state,
            &mut Gas::new(100_000),
        )
        .unwrap_err();
        assert_eq!(err, VmError::StateChangeInView("totalVotesFor".into()));
    }

    #[test]
    fn constructor_rejects_duplicates() {
        let dup = Value::Bytes32List(vec![
            Bytes32::from_name("Rama").unwrap(),
            Bytes32::from_name("Rama").unwrap(),
        ]);
        let err = construct(&voting_program(), &[dup], &mut Gas::new(1_000_000)).unwrap_err();
        assert!(matches!(
            err,
            VmError::Reverted(Revert::DuplicateCandidate(_))
        ));
    }
}
