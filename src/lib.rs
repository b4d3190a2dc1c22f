// #![warn(missing_docs)]

//! Pure-rust client for the Beckhoff ADS protocol.
//!
//! This crate talks ADS to TwinCAT PLCs directly over AMS/TCP. It does not
//! depend on the vendor ADS router or DLL, and it does not need one running.
//!
//! It is separated into:
//!
//! - Parsing and formatting `ads://` symbol addresses, in module [address].
//! - Mapping the type information the PLC reports for a symbol to a plan for
//!   decoding and encoding its bytes, in module [ctype].
//! - Serialization of AMS frames and ADS commands, in module [messages].
//! - Symbol lookup and symbol table upload, in module [symbols].
//! - A [client] layer: a [`Session`] per PLC runtime, [`SymbolHandle`]s giving
//!   typed access to single variables, and a [`ConnectionRegistry`] sharing
//!   sessions between handles.
//! - An adapter to push symbol updates into a host application, in module
//!   [channel].
//!
//! ## Example
//!
//! Watch a variable for changes, pushed by the PLC as device notifications:
//!
//! ```no_run
//! use adsars::{ConnectionRegistry, Update};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), adsars::ClientError> {
//!     let registry = ConnectionRegistry::new();
//!     let handle = registry.open_symbol("ads://192.168.0.10/MAIN.nCounter").await?;
//!     println!("Currently: {}", handle.read().await?);
//!     let mut updates = handle.subscribe();
//!     while let Ok(update) = updates.recv().await {
//!         if let Update::Value { value, .. } = update {
//!             println!("Changed to {value}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Adding a poll rate to the address (`ads://192.168.0.10/@0.5/MAIN.nCounter`)
//! reads the variable every half second instead, and delivers it when it
//! changed.
//!
//! ## Configuration
//!
//! Defaults for the connection are read from the environment, see
//! [`ClientConfig`].

pub mod address;
pub mod channel;
pub mod client;
pub mod ctype;
pub mod messages;
pub mod symbols;

mod utils;

pub use crate::address::{AddressDescriptor, AmsNetId, TargetDescriptor};
pub use crate::client::{
    ClientConfig, ClientError, ConnectionRegistry, Session, SymbolHandle, TransportError, Update,
};
pub use crate::ctype::Value;
