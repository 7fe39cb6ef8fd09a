//! Adapters behind the domain ports: the local entitlement cache and an
//! in-memory backend stub for tests and demos.

pub mod in_memory;
pub mod stub;
