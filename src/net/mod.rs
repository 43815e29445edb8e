//! Wire-level connection layer shared by every transport.
//!
//! Every outbound socket carries a mandatory timeout, can be tracked in a
//! [`SocketRegistry`] and is force-closed when it stays idle for longer than
//! that timeout.

pub mod address;
pub mod connection;
pub mod registry;
pub mod request;
pub mod tls;

pub use address::Address;
pub use connection::{open_connection, BoxedStream, ConnectOptions, Connection, IoStream};
pub use registry::SocketRegistry;
pub use request::{establish, send_request, HttpResponse, RequestArgs, Tunnel};
pub use tls::TlsOptions;
