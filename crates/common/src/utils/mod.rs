//! Serialization helpers shared by configuration and persisted records

pub mod serde;

pub use self::serde::{duration_millis, option_duration_millis};
