//! # Relay
//!
//! Event-driven handles over a single-threaded, completion-based loop
//! (`io_uring` via `compio`), with live socket handoff between loops and
//! processes.
//!
//! ## Architecture
//!
//! - **`relay-core`**: dispatcher, loop, handle lifecycle, transports
//! - **`relay`**: public API surface (this crate)
//!
//! Every handle is a [`Resource`] bound to one [`Loop`]. Handlers are
//! registered per event type with `on` (persistent) or `once` (one-shot)
//! and run on the loop thread. Completions are never delivered from inside
//! the call that started the operation.
//!
//! ## Quick Start
//!
//! ### Echo over a local channel
//!
//! ```rust,no_run
//! use relay::prelude::*;
//!
//! # fn example() -> relay::Result<()> {
//! let lp = Loop::new()?;
//! let server = Pipe::create(&lp)?;
//! server.bind("/tmp/relay-echo.sock")?;
//! server.listen_default()?;
//! server.on::<Accept<PipeKind>>(|accept, _| {
//!     let Some(peer) = accept.take() else { return };
//!     let peer = std::rc::Rc::new(peer);
//!     peer.on::<Read>(|read, peer| {
//!         let _ = peer.write_async(Buffer::from_slice(&read.data));
//!     });
//!     let _ = peer.read_start();
//!     peer.ref_until::<Close>();
//! });
//! lp.run();
//! # Ok(())
//! # }
//! ```
//!
//! ### Handing a listening socket to another loop
//!
//! ```rust,no_run
//! use relay::prelude::*;
//!
//! # fn example(channel: &Pipe, listener: &Tcp) -> relay::Result<()> {
//! // `channel` is a connected pipe created with `PipeKind::cross_process()`
//! channel.send_tcp_handle(listener)?;
//! listener.close();
//! # Ok(())
//! # }
//! ```
//!
//! The receiving pipe publishes `Accept<TcpKind>` with a `Tcp` that owns
//! the transferred socket; calling `listen` on it resumes accepting there.
//!
//! ## Safety
//!
//! - `unsafe` is confined to raw descriptor calls in `relay-core` (`sys`)
//!   and two audited casts in `buffer` and `resource`
//! - Handles are `!Send`; cross-thread requests go through [`LoopHandle`]

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use bytes::Bytes;
pub use socket2::{Domain, Socket};

pub use relay_core::buffer::Buffer;
pub use relay_core::error::{RelayError, Result, WriteRejected};
pub use relay_core::event;
pub use relay_core::event_loop::{Loop, LoopHandle};
pub use relay_core::handoff::PendingHandle;
pub use relay_core::options::LoopOptions;
pub use relay_core::pipe::{Pipe, PipeKind};
pub use relay_core::resource::{HandleKind, Kind, Resource};
pub use relay_core::stream::StreamKind;
pub use relay_core::tcp::{Tcp, TcpKind};
pub use relay_core::timer::{Timer, TimerKind};
pub use relay_core::udp::{Udp, UdpKind};
pub use relay_core::work::{Work, WorkKind};

/// Logging setup for tests and demos.
pub mod dev_tracing;

/// Everything needed to write handler code.
pub mod prelude {
    pub use relay_core::prelude::*;
}
