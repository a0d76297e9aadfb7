//! Types published to observers of the engine.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over whatever IPC it uses.

pub mod events;
