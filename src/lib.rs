//! Protocol engine for the eBUS field bus used in residential heating
//! equipment: byte-level framing, the multi-master arbitration state
//! machine, the typed data-field codec, the message catalog with its
//! polling scheduler, and the dispatcher that serializes bus access for
//! clients.
//!
//! Device I/O stays outside: the engine is driven through the
//! [`bus::Transport`] trait one symbol at a time, and front-ends talk to
//! the [`dispatcher::Dispatcher`] through the line protocol contract in
//! [`client`].

pub mod bus;
pub mod client;
pub mod config;
pub mod datatype;
pub mod dispatcher;
pub mod error;
pub mod field;
pub mod logging;
pub mod message;
pub mod symbol;
pub(crate) mod util;

pub use bus::{BusConfig, BusHandler, BusState, Transport};
pub use config::Loader;
pub use dispatcher::{Dispatcher, Engine, UpdateNotice};
pub use error::{Error, Result};
pub use field::{DataField, OutputFormat, Templates};
pub use message::{Message, MessageMap};
pub use symbol::SymbolString;
