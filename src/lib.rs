//! Translated-plan caching for entity query engines.
//!
//! Domain statements over entities are translated into table-level SQL,
//! cached, and re-executed while compatible with the current bindings and
//! options. Polymorphic statements fan out over concrete entities, and
//! selects can be paged by key.

pub mod config;
pub mod model;
pub mod query;
pub mod sql;
pub mod tree;
pub mod types;

pub use config::{ConfigError, PlanCacheOptions};
pub use model::{EntityDescriptor, InMemoryMappingModel, MappingModel};
pub use query::{Query, QueryEngine};
pub use types::{PlanError, Result, Value};
