//! Concrete source handlers, one per remote source family.

pub mod direct;
pub mod mirror;
pub mod portal;
