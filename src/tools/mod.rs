//! Backends registered at startup.

pub mod builtin;

pub use builtin::builtin_registry;
