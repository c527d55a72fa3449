//! Line-oriented TCP chat relay.
//!
//! Clients connect, send a display name as their first line, and every line
//! they send afterwards is relayed to all other connected clients as
//! `<name>: <text>`. Each module focuses on a concrete responsibility:
//!
//! - [`frame`] reads and writes newline-delimited UTF-8 frames.
//! - [`message`] defines outbound messages and the events sessions report.
//! - [`session`] owns one connection: handshake, read loop, serialized writes.
//! - [`registry`] tracks admitted sessions and enforces the client limit.
//! - [`dispatcher`] consumes session events in order and broadcasts them.
//! - [`acceptor`] accepts connections while capacity remains.
//! - [`controller`] wires everything together behind `start` and `stop`.
//! - [`config`] and [`cli`] describe how the relay is configured.
//! - [`client`] is the terminal client used by the `send` subcommand.
//!
//! Integration tests drive a [`controller::Controller`] over loopback TCP.

pub mod acceptor;
pub mod cli;
pub mod client;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod frame;
pub mod message;
pub mod registry;
pub mod session;
