#![warn(clippy::pedantic)]
// False positives for `bytes::Bytes`
#![allow(clippy::mutable_key_type)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod agent;
pub mod cache;
pub mod clock;
pub mod error;
pub mod facade;
pub mod query;
pub mod roothints;
pub mod transport;

pub use agent::{AgentParams, Strategy, Transport};
pub use cache::{Cache, CacheConfig};
pub use error::{ResolverError, ResolverResult};
pub use facade::{Resolver, ResolverBuilder};
