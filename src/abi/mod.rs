use std::{fmt, str::FromStr};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

pub const BYTES32_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("identifier is empty")]
    EmptyIdentifier,
    #[error("identifier {name:?} is {len} bytes, at most 32 allowed")]
    IdentifierTooLong { name: String, len: usize },
    #[error("unknown parameter type {0:?}")]
    UnknownType(String),
    #[error("{operation} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        operation: String,
        expected: usize,
        actual: usize,
    },
    #[error("{operation} argument {index} must be {expected}, got {actual}")]
    ArgumentType {
        operation: String,
        index: usize,
        expected: ParamType,
        actual: String,
    },
    #[error("cannot parse {text:?} as {ty}")]
    InvalidValue { ty: ParamType, text: String },
}

/// Fixed-width identifier: a UTF-8 name right-padded with zero bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bytes32([u8; BYTES32_LEN]);

impl Bytes32 {
    pub fn from_name(name: &str) -> Result<Self, AbiError> {
        if name.is_empty() {
            return Err(AbiError::EmptyIdentifier);
        }
        if name.len() > BYTES32_LEN {
            return Err(AbiError::IdentifierTooLong {
                name: name.to_string(),
                len: name.len(),
            });
        }
        let mut raw = [0u8; BYTES32_LEN];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self(raw))
    }

    pub fn from_bytes(raw: [u8; BYTES32_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; BYTES32_LEN] {
        &self.0
    }

    /// The name with its zero padding stripped, if it is printable UTF-8.
    pub fn name(&self) -> Option<&str> {
        let end = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let text = std::str::from_utf8(&self.0[..end]).ok()?;
        if text.is_empty() || text.contains('\0') || text.chars().any(char::is_control) {
            return None;
        }
        Some(text)
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.pad(name),
            None => f.pad(&format!("0x{}", hex::encode(self.0))),
        }
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes32({self})")
    }
}

impl FromStr for Bytes32 {
    type Err = AbiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex_part) = s.strip_prefix("0x") {
            if hex_part.len() == BYTES32_LEN * 2 {
                let mut raw = [0u8; BYTES32_LEN];
                hex::decode_to_slice(hex_part, &mut raw).map_err(|_| AbiError::InvalidValue {
                    ty: ParamType::Bytes32,
                    text: s.to_string(),
                })?;
                return Ok(Self(raw));
            }
        }
        Self::from_name(s)
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamType {
    Bytes32,
    Bytes32List,
    Uint,
    Bool,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Bytes32 => "bytes32",
            ParamType::Bytes32List => "bytes32[]",
            ParamType::Uint => "uint",
            ParamType::Bool => "bool",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            ParamType::Bytes32 => 1,
            ParamType::Bytes32List => 2,
            ParamType::Uint => 3,
            ParamType::Bool => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ParamType::Bytes32),
            2 => Some(ParamType::Bytes32List),
            3 => Some(ParamType::Uint),
            4 => Some(ParamType::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamType {
    type Err = AbiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bytes32" => Ok(ParamType::Bytes32),
            "bytes32[]" => Ok(ParamType::Bytes32List),
            "uint" => Ok(ParamType::Uint),
            "bool" => Ok(ParamType::Bool),
            other => Err(AbiError::UnknownType(other.to_string())),
        }
    }
}

impl Serialize for ParamType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ParamType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bytes32(Bytes32),
    Bytes32List(Vec<Bytes32>),
    Uint(u64),
    Bool(bool),
    Unit,
}

impl Value {
    pub fn param_type(&self) -> Option<ParamType> {
        match self {
            Value::Bytes32(_) => Some(ParamType::Bytes32),
            Value::Bytes32List(_) => Some(ParamType::Bytes32List),
            Value::Uint(_) => Some(ParamType::Uint),
            Value::Bool(_) => Some(ParamType::Bool),
            Value::Unit => None,
        }
    }

    /// Parse command-line text as a value of `ty`. Lists are comma separated.
    pub fn parse(ty: ParamType, text: &str) -> Result<Self, AbiError> {
        let invalid = || AbiError::InvalidValue {
            ty,
            text: text.to_string(),
        };
        match ty {
            ParamType::Bytes32 => Ok(Value::Bytes32(text.trim().parse()?)),
            ParamType::Bytes32List => text
                .split(',')
                .map(|item| item.trim().parse())
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Bytes32List),
            ParamType::Uint => text.trim().parse().map(Value::Uint).map_err(|_| invalid()),
            ParamType::Bool => text.trim().parse().map(Value::Bool).map_err(|_| invalid()),
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.param_type().map(|ty| ty.as_str()).unwrap_or("unit")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes32(v) => write!(f, "{v}"),
            Value::Bytes32List(items) => {
                let joined: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", joined.join(", "))
            }
            Value::Uint(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Unit => f.write_str("()"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    View,
    Mutating,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// One entry of the interface descriptor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Operation {
    pub name: String,
    pub inputs: Vec<Param>,
    pub outputs: Vec<Param>,
    pub mutability: Mutability,
}

impl Operation {
    pub fn is_read_only(&self) -> bool {
        self.mutability == Mutability::View
    }

    /// Canonical signature, e.g. `totalVotesFor(bytes32)`.
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.inputs.iter().map(|p| p.ty.as_str()).collect();
        format!("{}({})", self.name, types.join(","))
    }

    pub fn check_args(&self, args: &[Value]) -> Result<(), AbiError> {
        check_args(&self.name, self.inputs.iter().map(|p| p.ty), args)
    }
}

pub(crate) fn check_args(
    operation: &str,
    expected: impl ExactSizeIterator<Item = ParamType>,
    args: &[Value],
) -> Result<(), AbiError> {
    if expected.len() != args.len() {
        return Err(AbiError::ArgumentCount {
            operation: operation.to_string(),
            expected: expected.len(),
            actual: args.len(),
        });
    }
    for (index, (ty, arg)) in expected.zip(args).enumerate() {
        if arg.param_type() != Some(ty) {
            return Err(AbiError::ArgumentType {
                operation: operation.to_string(),
                index,
                expected: ty,
                actual: arg.kind().to_string(),
            });
        }
    }
    Ok(())
}

/// Ordered list of operations a deployed machine exposes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Abi(pub Vec<Operation>);

impl Abi {
    pub fn operations(&self) -> &[Operation] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.0.iter().find(|op| op.name == name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes32_pads_and_trims_names() {
        let rama = Bytes32::from_name("Rama").unwrap();
        assert_eq!(&rama.as_bytes()[..4], b"Rama");
        assert!(rama.as_bytes()[4..].iter().all(|b| *b == 0));
        assert_eq!(rama.to_string(), "Rama");
        assert_eq!("Rama".parse::<Bytes32>().unwrap(), rama);
    }

    #[test]
    fn bytes32_rejects_empty_and_oversized_names() {
        assert_eq!(Bytes32::from_name(""), Err(AbiError::EmptyIdentifier));
        let long = "x".repeat(33);
        assert!(matches!(
            Bytes32::from_name(&long),
            Err(AbiError::IdentifierTooLong { len: 33, .. })
        ));
    }

    #[test]
    fn unprintable_bytes32_renders_as_hex() {
        let raw = Bytes32::from_bytes([0xff; 32]);
        let shown = raw.to_string();
        assert!(shown.starts_with("0x"));
        assert_eq!(shown.parse::<Bytes32>().unwrap(), raw);
    }

    #[test]
    fn value_parse_follows_param_type() {
        assert_eq!(
            Value::parse(ParamType::Bytes32List, "Rama, Nick").unwrap(),
            Value::Bytes32List(vec![
                Bytes32::from_name("Rama").unwrap(),
                Bytes32::from_name("Nick").unwrap()
            ])
        );
        assert_eq!(Value::parse(ParamType::Uint, "7").unwrap(), Value::Uint(7));
        assert!(Value::parse(ParamType::Bool, "maybe").is_err());
    }

    #[test]
    fn operation_checks_arity_and_types() {
        let op = Operation {
            name: "totalVotesFor".into(),
            inputs: vec![Param::new("candidate", ParamType::Bytes32)],
            outputs: vec![Param::new("", ParamType::Uint)],
            mutability: Mutability::View,
        };
        assert_eq!(op.signature(), "totalVotesFor(bytes32)");
        assert!(op
            .check_args(&[Value::Bytes32(Bytes32::from_name("Rama").unwrap())])
            .is_ok());
        assert!(matches!(
            op.check_args(&[]),
            Err(AbiError::ArgumentCount { expected: 1, actual: 0, .. })
        ));
        assert!(matches!(
            op.check_args(&[Value::Uint(1)]),
            Err(AbiError::ArgumentType { index: 0, .. })
        ));
    }

    #[test]
    fn abi_json_shape_is_strict() {
        let json = r#"[{"name":"f","inputs":[],"outputs":[],"mutability":"view","extra":1}]"#;
        assert!(serde_json::from_str::<Abi>(json).is_err());
        let json = r#"[{"name":"f","inputs":[{"name":"c","type":"bytes32"}],"outputs":[],"mutability":"mutating"}]"#;
        let abi: Abi = serde_json::from_str(json).unwrap();
        assert_eq!(abi.len(), 1);
        assert!(!abi.get("f").unwrap().is_read_only());
    }
}
