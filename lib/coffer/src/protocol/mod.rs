//! Framed request/response protocol between the main process and its
//! workers, plus the helper that caches spawned workers.

pub mod client;
pub mod frame;
pub mod helper;
