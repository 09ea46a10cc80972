//! Artifact production: `.tally` source in, bytecode plus interface out.
//!
//! The language is deliberately tiny. A source holds one `machine` with one
//! constructor that registers the candidate list, followed by `view` and
//! `call` functions built from five statement forms:
//!
//! ```text
//! register <list>;          require known <c>;       votes[<c>] += 1;
//! return votes[<c>];        return known <c>;        return candidates[<i>];
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    abi::{Abi, Mutability, Operation, Param, ParamType},
    vm::{self, Function, Instr, Program},
};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("{line}:{column}: {message}")]
    Diagnostic {
        line: usize,
        column: usize,
        message: String,
    },
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    #[serde(with = "serde_hex")]
    pub bytecode: Vec<u8>,
    pub constructor: Vec<Param>,
    pub abi: Abi,
}

/// Compile a machine definition.
pub fn produce(source: &str) -> Result<Artifact, CompileError> {
    let tokens = lex(source)?;
    let machine = Parser { tokens, pos: 0 }.machine()?;
    lower(machine)
}

pub fn produce_file(path: &Path) -> Result<Artifact, CompileError> {
    let source = fs::read_to_string(path).map_err(|source| CompileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    produce(&source)
}

//==================== lexer ====================//

#[derive(Clone, Debug, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Number(u64),
    Punct(&'static str),
    Eof,
}

#[derive(Clone, Debug)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
}

const PUNCT: [&str; 11] = ["->", "+=", "{", "}", "(", ")", "[", "]", ";", ":", ","];

fn diag(line: usize, column: usize, message: impl Into<String>) -> CompileError {
    CompileError::Diagnostic {
        line,
        column,
        message: message.into(),
    }
}

fn lex(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    for (line_idx, line) in source.lines().enumerate() {
        let line_no = line_idx + 1;
        let code = match line.find("//") {
            Some(at) => &line[..at],
            None => line,
        };
        let chars: Vec<(usize, char)> = code.char_indices().collect();
        let mut i = 0;
        while i < chars.len() {
            let (offset, ch) = chars[i];
            let column = offset + 1;
            if ch.is_whitespace() {
                i += 1;
                continue;
            }
            if ch.is_ascii_alphabetic() || ch == '_' {
                let start = offset;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let end = chars.get(i).map(|c| c.0).unwrap_or(code.len());
                tokens.push(Token {
                    tok: Tok::Ident(code[start..end].to_string()),
                    line: line_no,
                    column,
                });
                continue;
            }
            if ch.is_ascii_digit() {
                let start = offset;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
                let end = chars.get(i).map(|c| c.0).unwrap_or(code.len());
                let value = code[start..end]
                    .parse()
                    .map_err(|_| diag(line_no, column, "number too large"))?;
                tokens.push(Token {
                    tok: Tok::Number(value),
                    line: line_no,
                    column,
                });
                continue;
            }
            let rest = &code[offset..];
            match PUNCT.iter().copied().find(|p| rest.starts_with(*p)) {
                Some(p) => {
                    tokens.push(Token {
                        tok: Tok::Punct(p),
                        line: line_no,
                        column,
                    });
                    i += p.len();
                }
                None => return Err(diag(line_no, column, format!("unexpected character {ch:?}"))),
            }
        }
    }
    let line = source.lines().count().max(1);
    tokens.push(Token {
        tok: Tok::Eof,
        line,
        column: 1,
    });
    Ok(tokens)
}

//==================== parser ====================//

struct Spanned<T> {
    node: T,
    line: usize,
    column: usize,
}

enum Stmt {
    Register(Spanned<String>),
    RequireKnown(Spanned<String>),
    Increment(Spanned<String>),
    Return(Expr),
}

enum Expr {
    Known(Spanned<String>),
    Votes(Spanned<String>),
    Candidate(Spanned<String>),
}

struct FnDecl {
    name: Spanned<String>,
    kind: FnKind,
    params: Vec<(Spanned<String>, ParamType)>,
    returns: Option<ParamType>,
    body: Vec<Spanned<Stmt>>,
    close_line: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Constructor,
    View,
    Call,
}

struct MachineDecl {
    name: String,
    functions: Vec<FnDecl>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error_here(&self, message: impl Into<String>) -> CompileError {
        let token = self.peek();
        diag(token.line, token.column, message)
    }

    fn expect_punct(&mut self, punct: &str) -> Result<Token, CompileError> {
        if self.peek().tok == Tok::Punct(punct_static(punct)) {
            return Ok(self.next());
        }
        Err(self.error_here(format!("expected `{punct}`, found {}", describe(&self.peek().tok))))
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.peek().tok == Tok::Punct(punct_static(punct)) {
            self.next();
            return true;
        }
        false
    }

    fn ident(&mut self) -> Result<Spanned<String>, CompileError> {
        let token = self.next();
        match token.tok {
            Tok::Ident(name) => Ok(Spanned {
                node: name,
                line: token.line,
                column: token.column,
            }),
            other => Err(diag(
                token.line,
                token.column,
                format!("expected identifier, found {}", describe(&other)),
            )),
        }
    }

    fn keyword(&mut self, word: &str) -> Result<Token, CompileError> {
        if matches!(&self.peek().tok, Tok::Ident(name) if name == word) {
            return Ok(self.next());
        }
        Err(self.error_here(format!("expected `{word}`, found {}", describe(&self.peek().tok))))
    }

    fn machine(mut self) -> Result<MachineDecl, CompileError> {
        self.keyword("machine")?;
        let name = self.ident()?.node;
        self.expect_punct("{")?;
        let mut functions = Vec::new();
        while !self.eat_punct("}") {
            functions.push(self.function()?);
        }
        if self.peek().tok != Tok::Eof {
            return Err(self.error_here("a source defines exactly one machine"));
        }
        Ok(MachineDecl { name, functions })
    }

    fn function(&mut self) -> Result<FnDecl, CompileError> {
        let head = self.ident()?;
        let (kind, name) = match head.node.as_str() {
            "constructor" => (FnKind::Constructor, head),
            "view" => (FnKind::View, self.ident()?),
            "call" => (FnKind::Call, self.ident()?),
            other => {
                return Err(diag(
                    head.line,
                    head.column,
                    format!("expected `constructor`, `view` or `call`, found `{other}`"),
                ))
            }
        };
        self.expect_punct("(")?;
        let mut params = Vec::new();
        if !self.eat_punct(")") {
            loop {
                let pname = self.ident()?;
                self.expect_punct(":")?;
                let ty = self.param_type()?;
                params.push((pname, ty));
                if self.eat_punct(")") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }
        let returns = if self.eat_punct("->") {
            Some(self.param_type()?)
        } else {
            None
        };
        self.expect_punct("{")?;
        let mut body = Vec::new();
        loop {
            if self.peek().tok == Tok::Punct("}") {
                break;
            }
            body.push(self.statement()?);
        }
        let close = self.expect_punct("}")?;
        Ok(FnDecl {
            name,
            kind,
            params,
            returns,
            body,
            close_line: close.line,
        })
    }

    fn param_type(&mut self) -> Result<ParamType, CompileError> {
        let base = self.ident()?;
        let mut text = base.node.clone();
        if self.eat_punct("[") {
            self.expect_punct("]")?;
            text.push_str("[]");
        }
        text.parse()
            .map_err(|_| diag(base.line, base.column, format!("unknown type `{text}`")))
    }

    fn indexed(&mut self) -> Result<Spanned<String>, CompileError> {
        self.expect_punct("[")?;
        let inner = self.ident()?;
        self.expect_punct("]")?;
        Ok(inner)
    }

    fn statement(&mut self) -> Result<Spanned<Stmt>, CompileError> {
        let head = self.ident()?;
        let stmt = match head.node.as_str() {
            "register" => Stmt::Register(self.ident()?),
            "require" => {
                self.keyword("known")?;
                Stmt::RequireKnown(self.ident()?)
            }
            "votes" => {
                let target = self.indexed()?;
                self.expect_punct("+=")?;
                let amount = self.next();
                if amount.tok != Tok::Number(1) {
                    return Err(diag(amount.line, amount.column, "counters only move by one"));
                }
                Stmt::Increment(target)
            }
            "return" => Stmt::Return(self.expr()?),
            other => {
                return Err(diag(
                    head.line,
                    head.column,
                    format!("unknown statement `{other}`"),
                ))
            }
        };
        self.expect_punct(";")?;
        Ok(Spanned {
            node: stmt,
            line: head.line,
            column: head.column,
        })
    }

    fn expr(&mut self) -> Result<Expr, CompileError> {
        let head = self.ident()?;
        match head.node.as_str() {
            "known" => Ok(Expr::Known(self.ident()?)),
            "votes" => Ok(Expr::Votes(self.indexed()?)),
            "candidates" => Ok(Expr::Candidate(self.indexed()?)),
            other => Err(diag(
                head.line,
                head.column,
                format!("unknown expression `{other}`"),
            )),
        }
    }
}

fn punct_static(punct: &str) -> &'static str {
    PUNCT.iter().find(|p| **p == punct).copied().unwrap_or("")
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(name) => format!("`{name}`"),
        Tok::Number(n) => format!("`{n}`"),
        Tok::Punct(p) => format!("`{p}`"),
        Tok::Eof => "end of input".to_string(),
    }
}

//==================== lowering ====================//

struct Scope<'a> {
    function: &'a FnDecl,
}

impl Scope<'_> {
    fn arg(&self, name: &Spanned<String>, want: ParamType) -> Result<Instr, CompileError> {
        let (idx, (_, ty)) = self
            .function
            .params
            .iter()
            .enumerate()
            .find(|(_, (p, _))| p.node == name.node)
            .ok_or_else(|| diag(name.line, name.column, format!("unknown parameter `{}`", name.node)))?;
        if *ty != want {
            return Err(diag(
                name.line,
                name.column,
                format!("`{}` is {ty}, expected {want}", name.node),
            ));
        }
        Ok(Instr::Arg(idx as u8))
    }
}

fn lower(machine: MachineDecl) -> Result<Artifact, CompileError> {
    let mut constructor = None;
    let mut functions: Vec<Function> = Vec::new();
    let mut operations = Vec::new();
    let mut ctor_params = Vec::new();

    for decl in &machine.functions {
        if decl.params.len() > u8::MAX as usize {
            return Err(diag(decl.name.line, decl.name.column, "too many parameters"));
        }
        if decl.name.node.len() > u8::MAX as usize {
            return Err(diag(decl.name.line, decl.name.column, "name too long"));
        }
        let code = lower_body(decl)?;
        let params: Vec<ParamType> = decl.params.iter().map(|(_, ty)| *ty).collect();
        match decl.kind {
            FnKind::Constructor => {
                if constructor.is_some() {
                    return Err(diag(decl.name.line, decl.name.column, "duplicate constructor"));
                }
                ctor_params = decl
                    .params
                    .iter()
                    .map(|(p, ty)| Param::new(p.node.clone(), *ty))
                    .collect();
                constructor = Some(Function {
                    name: "constructor".into(),
                    mutability: Mutability::Mutating,
                    params,
                    returns: None,
                    code,
                });
            }
            FnKind::View | FnKind::Call => {
                if functions.iter().any(|f| f.name == decl.name.node) {
                    return Err(diag(
                        decl.name.line,
                        decl.name.column,
                        format!("duplicate function `{}`", decl.name.node),
                    ));
                }
                let mutability = if decl.kind == FnKind::View {
                    Mutability::View
                } else {
                    Mutability::Mutating
                };
                operations.push(Operation {
                    name: decl.name.node.clone(),
                    inputs: decl
                        .params
                        .iter()
                        .map(|(p, ty)| Param::new(p.node.clone(), *ty))
                        .collect(),
                    outputs: decl.returns.map(|ty| Param::new("", ty)).into_iter().collect(),
                    mutability,
                });
                functions.push(Function {
                    name: decl.name.node.clone(),
                    mutability,
                    params,
                    returns: decl.returns,
                    code,
                });
            }
        }
    }

    let constructor =
        constructor.ok_or_else(|| diag(1, 1, format!("machine `{}` has no constructor", machine.name)))?;
    if functions.len() > u8::MAX as usize {
        return Err(diag(1, 1, "too many functions"));
    }
    let program = Program {
        constructor,
        functions,
    };
    Ok(Artifact {
        name: machine.name,
        bytecode: program.encode(),
        constructor: ctor_params,
        abi: Abi(operations),
    })
}

fn lower_body(decl: &FnDecl) -> Result<Vec<Instr>, CompileError> {
    let scope = Scope { function: decl };
    let mut code = Vec::new();
    let mut registered = false;
    let mut returned = false;

    for stmt in &decl.body {
        if returned {
            return Err(diag(stmt.line, stmt.column, "statement after return"));
        }
        let in_ctor = decl.kind == FnKind::Constructor;
        match &stmt.node {
            Stmt::Register(list) => {
                if !in_ctor {
                    return Err(diag(stmt.line, stmt.column, "`register` is only allowed in the constructor"));
                }
                if registered {
                    return Err(diag(stmt.line, stmt.column, "candidates are registered once"));
                }
                code.push(scope.arg(list, ParamType::Bytes32List)?);
                code.push(Instr::Init);
                registered = true;
            }
            _ if in_ctor => {
                return Err(diag(
                    stmt.line,
                    stmt.column,
                    "the constructor may only register candidates",
                ))
            }
            Stmt::RequireKnown(c) => {
                code.push(scope.arg(c, ParamType::Bytes32)?);
                code.push(Instr::Check);
            }
            Stmt::Increment(c) => {
                if decl.kind == FnKind::View {
                    return Err(diag(
                        stmt.line,
                        stmt.column,
                        format!("view `{}` cannot change votes", decl.name.node),
                    ));
                }
                code.push(scope.arg(c, ParamType::Bytes32)?);
                code.push(Instr::Incr);
            }
            Stmt::Return(expr) => {
                let (arg, op, ty) = match expr {
                    Expr::Known(c) => (scope.arg(c, ParamType::Bytes32)?, Instr::Member, ParamType::Bool),
                    Expr::Votes(c) => (scope.arg(c, ParamType::Bytes32)?, Instr::Load, ParamType::Uint),
                    Expr::Candidate(i) => (scope.arg(i, ParamType::Uint)?, Instr::Index, ParamType::Bytes32),
                };
                match decl.returns {
                    Some(declared) if declared == ty => {}
                    Some(declared) => {
                        return Err(diag(
                            stmt.line,
                            stmt.column,
                            format!("returns {ty} but `{}` declares {declared}", decl.name.node),
                        ))
                    }
                    None => {
                        return Err(diag(
                            stmt.line,
                            stmt.column,
                            format!("`{}` declares no return value", decl.name.node),
                        ))
                    }
                }
                code.extend([arg, op, Instr::Ret]);
                returned = true;
            }
        }
    }

    if decl.kind == FnKind::Constructor && !registered {
        return Err(diag(decl.name.line, decl.name.column, "constructor must register candidates"));
    }
    if decl.returns.is_some() && !returned {
        return Err(diag(
            decl.close_line,
            1,
            format!("`{}` must end with a return", decl.name.node),
        ));
    }
    if !returned {
        code.push(Instr::Stop);
    }
    let len: usize = code.iter().map(Instr::width).sum();
    if len > vm::MAX_CODE_LEN {
        return Err(diag(
            decl.name.line,
            decl.name.column,
            format!(
                "body of `{}` is {len} bytes, the limit is {}",
                decl.name.node,
                vm::MAX_CODE_LEN
            ),
        ));
    }
    Ok(code)
}

pub(crate) mod serde_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded.trim_start_matches("0x")).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOTING: &str = include_str!("../../demos/Voting.tally");

    fn message(err: CompileError) -> String {
        match err {
            CompileError::Diagnostic { message, .. } => message,
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn voting_source_compiles() {
        let artifact = produce(VOTING).unwrap();
        assert_eq!(artifact.name, "Voting");
        assert_eq!(artifact.constructor, vec![Param::new("candidateNames", ParamType::Bytes32List)]);
        let total = artifact.abi.get("totalVotesFor").unwrap();
        assert!(total.is_read_only());
        assert_eq!(total.outputs[0].ty, ParamType::Uint);
        assert!(!artifact.abi.get("voteForCandidate").unwrap().is_read_only());
        let program = Program::decode(&artifact.bytecode).unwrap();
        assert_eq!(program.functions.len(), artifact.abi.len());
    }

    #[test]
    fn diagnostics_carry_position() {
        let err = produce("machine M {\n  constructor(c: bytes32[]) { register c; }\n  view f() -> uint { return votes[x]; }\n}\n").unwrap_err();
        match err {
            CompileError::Diagnostic { line, message, .. } => {
                assert_eq!(line, 3);
                assert!(message.contains("unknown parameter `x`"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn view_may_not_vote() {
        let src = "machine M { constructor(c: bytes32[]) { register c; } view v(x: bytes32) { votes[x] += 1; } }";
        assert!(message(produce(src).unwrap_err()).contains("cannot change votes"));
    }

    #[test]
    fn exactly_one_machine_and_constructor() {
        let two = "machine A { constructor(c: bytes32[]) { register c; } } machine B { }";
        assert!(message(produce(two).unwrap_err()).contains("exactly one machine"));
        let none = "machine A { view f(x: bytes32) -> bool { return known x; } }";
        assert!(message(produce(none).unwrap_err()).contains("no constructor"));
        let unregistered = "machine A { constructor(c: bytes32[]) { } }";
        assert!(message(produce(unregistered).unwrap_err()).contains("must register"));
    }

    #[test]
    fn type_errors_are_reported() {
        let src = "machine A { constructor(c: bytes32[]) { register c; } view f(i: uint) -> uint { return known i; } }";
        assert!(message(produce(src).unwrap_err()).contains("`i` is uint"));
        let src = "machine A { constructor(c: bytes32) { register c; } }";
        assert!(message(produce(src).unwrap_err()).contains("expected bytes32[]"));
        let src = "machine A { constructor(c: bytes32[]) { register c; } call f(x: bytes32) { votes[x] += 2; } }";
        assert!(message(produce(src).unwrap_err()).contains("only move by one"));
    }

    #[test]
    fn oversized_bodies_are_refused() {
        // Each increment lowers to ARG + INCR, three bytes; STOP adds one.
        let machine = |statements: usize| {
            format!(
                "machine A {{ constructor(c: bytes32[]) {{ register c; }} call f(x: bytes32) {{ {} }} }}",
                "votes[x] += 1; ".repeat(statements)
            )
        };
        let fits = produce(&machine(21_844)).unwrap();
        let program = Program::decode(&fits.bytecode).unwrap();
        assert_eq!(program.functions[0].code.len(), 21_844 * 2 + 1);

        let err = message(produce(&machine(21_845)).unwrap_err());
        assert!(err.contains("65536 bytes"), "{err}");
    }

    #[test]
    fn artifact_json_keeps_bytecode_as_hex() {
        let artifact = produce(VOTING).unwrap();
        let json = serde_json::to_value(&artifact).unwrap();
        assert!(json["bytecode"].as_str().unwrap().starts_with(&hex::encode(b"TALY")));
        let back: Artifact = serde_json::from_value(json).unwrap();
        assert_eq!(back, artifact);
    }
}
