//! Query layer for kvmodel.
//!
//! `kvmodel-query` turns declarative criteria into set algebra over the
//! store's index keys.
//!
//! # Role In The Architecture
//!
//! - **Query builder**: [`Query`] accumulates filters, excludes, ordering and
//!   projections lazily.
//! - **Combinator tree**: [`Combinator`] is the immutable union / intersect /
//!   difference description a query compiles to.
//! - **Lowering**: [`lower`] maps a tree onto store commands and temporary
//!   keys; [`BackendQuery`] runs them in one round trip and serves counts,
//!   membership tests, slices and record fetches.
//!
//! Most users reach queries through `Session::query` in the `kvmodel` facade.

pub mod backend;
pub mod combinator;
pub mod lowering;
pub mod query;
pub mod search;

pub use backend::{BackendQuery, slice_range, to_inclusive};
pub use combinator::{Combinator, CombinatorKind, Lookup};
pub use lowering::{Plan, Reader, check_ordering, lower};
pub use query::{Compound, Query};
pub use search::{SearchEngine, TermIndex};
