//! flexmux-core: multiplexes independent logical streams over one ordered transport.
//!
//! This crate defines:
//! - Frame model ([`Frame`], [`MessageFrame`], [`PingFrame`], [`DisconnectionFrame`])
//! - Wire codec ([`FrameCodec`], [`FlexCodec`])
//! - Stream lifecycle ([`Stream`], [`StreamState`])
//! - The session engine ([`Session`]): inbound dispatch, stream id allocation and
//!   the serialized outbound write scheduler
//! - Listener capabilities ([`SessionListener`], [`StreamListener`], [`ContextListener`])
//! - Transport traits ([`Transport`], [`FrameSource`]) and the [`transport::mem`] /
//!   [`transport::stream`] backends
//! - Errors ([`SessionError`], [`ProtocolError`], [`TransportError`], [`DecodeError`])
//!
//! # Usage
//!
//! ```ignore
//! let ((client_tx, client_rx), (server_tx, server_rx)) = flexmux_core::transport::mem::pair();
//!
//! let server = SessionBuilder::new(SessionConfig::new(Role::Server))
//!     .listener(Arc::new(MyServerListener))
//!     .build(server_tx);
//! tokio::spawn(server.clone().run(server_rx));
//!
//! let client = Session::new(client_tx, SessionConfig::new(Role::Client));
//! tokio::spawn(client.clone().run(client_rx));
//!
//! let stream = client
//!     .new_stream(MessageFrame::new(0, "GET /"), Arc::new(MyStreamListener))
//!     .await?;
//! stream.send_data("body", true).await?;
//! ```

#![forbid(unsafe_code)]

mod attributes;
mod codec;
mod completion;
mod config;
mod error;
mod frame;
mod id;
mod listener;
mod scheduler;
mod session;
mod stream;
mod table;
pub mod transport;

pub use attributes::*;
pub use codec::*;
pub use completion::*;
pub use config::*;
pub use error::*;
pub use frame::*;
pub use id::*;
pub use listener::*;
pub use scheduler::{PendingWrite, Submit, WriteScheduler};
pub use session::*;
pub use stream::*;
pub use table::*;
pub use transport::{FrameSource, Transport};
