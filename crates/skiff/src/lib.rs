//! Skiff - build host applications that launch trusted helper binaries
//! ("plugins") and talk to them over local RPC.
//!
//! A host configures a [`Supervisor`] with a command and a set of named
//! plugins, calls [`Supervisor::start`] to launch the child and read its
//! one-line handshake, and then [`Supervisor::dispense`]s typed service
//! handles. The child runs [`serve`] with the symmetric configuration.
//! Two transports are supported: a multiplexed request/response protocol
//! and a streaming (gRPC) protocol, both framed over a local TCP or Unix
//! socket, optionally authenticated in both directions with ephemeral
//! certificates (auto-mTLS).
//!
//! # Example
//!
//! ```rust,ignore
//! use skiff::{plugin_set, CommandSpec, HandshakeConfig, Supervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> skiff::Result<()> {
//!     let handshake = HandshakeConfig {
//!         user_version: 1,
//!         magic_cookie_key: "MY_APP_COOKIE".into(),
//!         magic_cookie_value: "d3c0de".into(),
//!     };
//!     let supervisor = Supervisor::new(
//!         SupervisorConfig::new(handshake, plugin_set([("kv", my_kv_plugin())]))
//!             .command(CommandSpec::new("./kv-plugin")),
//!     );
//!
//!     let kv = supervisor.dispense("kv").await?;
//!     // ... downcast to the typed client the plugin factory produced ...
//!     supervisor.kill().await;
//!     Ok(())
//! }
//! ```

mod broker;

pub mod client;
pub mod config;
pub mod discover;
pub mod error;
pub mod grpc;
pub mod handshake;
pub mod mtls;
pub mod mux;
pub mod plugin;
pub mod rpc;
pub mod runner;
pub mod server;
pub mod stdio;
pub mod transport;

// The common surface, re-exported at the crate root.
pub use client::{
    ClientProtocol, HashAlgorithm, SecureConfig, Supervisor, SupervisorConfig, SupervisorSet,
};
pub use config::HandshakeConfig;
pub use discover::discover;
pub use error::{Result, SkiffError};
pub use grpc::{GrpcBroker, GrpcClientProtocol};
pub use handshake::{HandshakeRecord, Protocol, CORE_PROTOCOL_VERSION};
pub use plugin::{plugin_set, Plugin, PluginSet, RpcHandler, VersionedPluginSet};
pub use rpc::{RpcClientProtocol, RpcServiceHandle};
pub use runner::{AttachedRunner, CommandRunner, CommandSpec, ReattachConfig, Runner};
pub use server::{serve, ServeConfig, ServeTestConfig};
pub use transport::{Endpoint, Network, UnixSocketConfig};
