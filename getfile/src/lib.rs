//! Embeddable client/server library for the GETFILE wire protocol: the
//! codec, the framed transport, the bounded work queue, the client request
//! API, the server-side accept/dispatch framework, and the request pipeline
//! shared by the proxy and cache binaries.

pub mod client;
pub mod origin;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod transport;

pub use client::ClientRequest;
pub use protocol::{Method, Outcome, Status};
pub use queue::WorkQueue;
pub use server::{Handler, IncomingRequest, Server, ServerConfig, ServerContext};
