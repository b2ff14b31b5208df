//! Message types exchanged with receivers and intent writers.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! move them over any byte transport.

pub mod events;
