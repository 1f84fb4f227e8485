//! In-process key-value backend for kvmodel.
//!
//! This crate provides a store with the command semantics the mapper
//! relies on (sets, sorted sets, hashes, lists, `SORT`, expiry and the
//! server-side scripts) behind the `Connector` trait from kvmodel-core.
//!
//! # Features
//!
//! - Atomic pipelines: one batch never interleaves with another client's
//! - Redis-compatible replies, including per-command `WRONGTYPE` errors
//! - Lazy key expiry driven by a system or manual test clock
//! - Command statistics for asserting round trips
//!
//! # Example
//!
//! ```rust,ignore
//! use kvmodel_memory::MemoryConnector;
//! use kvmodel_core::{Command, Connector, Cx, Outcome};
//!
//! let store = MemoryConnector::default();
//! let cx = Cx::for_testing();
//! match store.execute(&cx, Command::Incr("counter".into())).await {
//!     Outcome::Ok(reply) => println!("counter = {:?}", reply),
//!     Outcome::Err(e) => eprintln!("Error: {}", e),
//!     _ => {}
//! }
//! ```

pub mod config;
pub mod connector;
mod script;
pub mod store;

pub use config::{Clock, ManualClock, MemoryConfig};
pub use connector::{MemoryConnector, MemoryStats};
pub use store::KeyKind;
