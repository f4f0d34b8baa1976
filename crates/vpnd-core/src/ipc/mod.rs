//! Daemon to frontend IPC: wire protocol and the loopback server.

pub mod protocol;
pub mod server;

pub use protocol::{Command, Outgoing, Request, Response, ResponseBody, MAX_MESSAGE_SIZE};
pub use server::{IpcServer, KeyService, Services};
