//! Deploy a vote tally machine to an execution ledger and talk to it.
//!
//! The pipeline, leaves first:
//!
//! * [`artifact`]: compiles a `.tally` machine definition into bytecode plus
//!   its interface ([`abi`]).
//! * [`deploy`]: submits the construction transaction and waits for the
//!   ledger to confirm it, yielding a [`descriptor::Descriptor`].
//! * [`descriptor`]: persists that descriptor so another process can bind.
//! * [`proxy`]: a typed dispatch table over the descriptor's operations;
//!   [`tally::TallyBinding`] narrows it to the vote tally.
//! * [`view`]: keeps a display in step with confirmed ledger state.
//!
//! Everything that reaches the ledger goes through an explicit
//! [`client::LedgerClient`]. The crate carries its own development ledger
//! ([`ledger`], [`vm`]) behind that trait, reachable in process or over TCP
//! ([`rpc`]).

pub mod abi;
pub mod artifact;
pub mod client;
pub mod config;
pub mod deploy;
pub mod descriptor;
pub mod handle;
pub mod identity;
pub mod ledger;
pub mod proxy;
pub mod rpc;
pub mod tally;
pub mod view;
pub mod vm;

pub use client::{ClientError, LedgerClient};
pub use descriptor::{Descriptor, DescriptorStore};
pub use proxy::{bind, BindOptions, Proxy, ProxyError};
