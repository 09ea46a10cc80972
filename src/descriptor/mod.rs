//! Durable record of a deployed machine: where it lives and what it exposes.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::abi::Abi;

pub const DEFAULT_PATH: &str = "contract.json";

/// Exactly two fields; anything else in the file is an error.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Descriptor {
    pub address: String,
    pub abi: Abi,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("descriptor io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no descriptor at {0}")]
    NotFound(PathBuf),
    #[error("descriptor at {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode descriptor for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("descriptor at {path} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Clone, Debug)]
pub struct DescriptorStore {
    path: PathBuf,
}

impl DescriptorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn encode(&self, source: serde_json::Error) -> StoreError {
        StoreError::Encode {
            path: self.path.clone(),
            source,
        }
    }

    /// Overwrites any existing file. The write goes to a sibling temp file
    /// first and is renamed into place.
    pub fn save(&self, descriptor: &Descriptor) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io(e))?;
        }
        let mut body = serde_json::to_vec_pretty(descriptor).map_err(|e| self.encode(e))?;
        body.push(b'\n');
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &body).map_err(|e| self.io(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io(e))?;
        info!(path = %self.path.display(), address = %descriptor.address, "descriptor saved");
        Ok(())
    }

    pub fn load(&self) -> Result<Descriptor, StoreError> {
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()))
            }
            Err(err) => return Err(self.io(err)),
        };
        let descriptor: Descriptor =
            serde_json::from_slice(&body).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if descriptor.address.trim().is_empty() {
            return Err(StoreError::Invalid {
                path: self.path.clone(),
                reason: "address is empty".into(),
            });
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use crate::abi::{Mutability, Operation, Param, ParamType};

    fn two_ops() -> Abi {
        Abi(vec![
            Operation {
                name: "totalVotesFor".into(),
                inputs: vec![Param::new("candidate", ParamType::Bytes32)],
                outputs: vec![Param::new("", ParamType::Uint)],
                mutability: Mutability::View,
            },
            Operation {
                name: "voteForCandidate".into(),
                inputs: vec![Param::new("candidate", ParamType::Bytes32)],
                outputs: vec![],
                mutability: Mutability::Mutating,
            },
        ])
    }

    #[test]
    fn save_then_load_in_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("contract.json");
        let descriptor = Descriptor {
            address: "0xABC".into(),
            abi: two_ops(),
        };
        DescriptorStore::new(&path).save(&descriptor).unwrap();
        assert_eq!(DescriptorStore::new(&path).load().unwrap(), descriptor);
    }

    #[test]
    fn save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::new(dir.path().join("contract.json"));
        let mut descriptor = Descriptor {
            address: "0x01".into(),
            abi: two_ops(),
        };
        store.save(&descriptor).unwrap();
        descriptor.address = "0x02".into();
        store.save(&descriptor).unwrap();
        assert_eq!(store.load().unwrap().address, "0x02");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::new(dir.path().join("absent.json"));
        assert!(matches!(store.load(), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn wrong_shapes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contract.json");
        let store = DescriptorStore::new(&path);
        for body in [
            r#"{"address":"0x1"}"#,
            r#"{"abi":[]}"#,
            r#"{"address":"0x1","abi":[],"network":"dev"}"#,
            r#"{"address":"0x1","abi":[{"name":"f","inputs":[],"outputs":[]}]}"#,
            "not json",
        ] {
            fs::write(&path, body).unwrap();
            assert!(
                matches!(store.load(), Err(StoreError::Parse { .. })),
                "accepted {body}"
            );
        }
        fs::write(&path, r#"{"address":"  ","abi":[]}"#).unwrap();
        assert!(matches!(store.load(), Err(StoreError::Invalid { .. })));
    }

    #[test]
    fn encoding_failures_are_not_parse_errors() {
        let store = DescriptorStore::new("contract.json");
        let unencodable = std::collections::BTreeMap::from([(vec![1u8], 1u8)]);
        let source = serde_json::to_vec(&unencodable).unwrap_err();
        let err = store.encode(source);
        assert!(matches!(err, StoreError::Encode { .. }));
        assert!(err.to_string().starts_with("could not encode descriptor for contract.json"));
    }

    fn arb_param() -> impl Strategy<Value = Param> {
        let ty = prop_oneof![
            Just(ParamType::Bytes32),
            Just(ParamType::Bytes32List),
            Just(ParamType::Uint),
            Just(ParamType::Bool),
        ];
        ("\\PC{0,12}", ty).prop_map(|(name, ty)| Param::new(name, ty))
    }

    fn arb_operation() -> impl Strategy<Value = Operation> {
        (
            "\\PC{0,24}",
            prop::collection::vec(arb_param(), 0..4),
            prop::collection::vec(arb_param(), 0..3),
            prop_oneof![Just(Mutability::View), Just(Mutability::Mutating)],
        )
            .prop_map(|(name, inputs, outputs, mutability)| Operation {
                name,
                inputs,
                outputs,
                mutability,
            })
    }

    fn arb_descriptor() -> impl Strategy<Value = Descriptor> {
        (
            "[ -~]{0,20}[!-~][ -~]{0,20}",
            prop::collection::vec(arb_operation(), 0..6),
        )
            .prop_map(|(address, ops)| Descriptor {
                address,
                abi: Abi(ops),
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_load_returns_what_was_saved(descriptor in arb_descriptor()) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("contract.json");
            DescriptorStore::new(&path).save(&descriptor).unwrap();
            prop_assert_eq!(DescriptorStore::new(&path).load().unwrap(), descriptor);
        }
    }
}
