//! Relay Core
//!
//! Building blocks of the relay event layer:
//! - Typed per-resource event dispatch (`event`, `dispatch`)
//! - Single-threaded loop over the completion engine (`event_loop`)
//! - Resource and handle lifecycle with ref-until pins (`resource`)
//! - Stream transports with FIFO write queues (`stream`, `tcp`, `pipe`)
//! - Live socket handoff over cross-process pipes (`handoff`)
//! - Datagrams, timers and background work (`udp`, `timer`, `work`)
//! - Error types (`error`) and loop configuration (`options`)

// Raw fd work (SCM_RIGHTS, setsockopt, poll) is confined to `sys`;
// `buffer` and `resource` carry the only other unsafe blocks.
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]
pub mod buffer;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod handoff;
pub mod options;
pub mod pipe;
pub mod resource;
pub mod stream;
pub mod tcp;
pub mod timer;
pub mod udp;
pub mod work;

mod sys;

// Keep the prelude to what handler code touches.
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::error::{RelayError, Result, WriteRejected};
    pub use crate::event::{
        Accept, AfterWork, BufferRecycled, Close, Connect, Datagram, Destroy, Error, Event, Read,
        Ref, Sent, Shutdown, Timeout, Write,
    };
    pub use crate::event_loop::{Loop, LoopHandle};
    pub use crate::handoff::PendingHandle;
    pub use crate::options::LoopOptions;
    pub use crate::pipe::{Pipe, PipeKind};
    pub use crate::resource::{HandleKind, Kind, Resource};
    pub use crate::stream::StreamKind;
    pub use crate::tcp::{Tcp, TcpKind};
    pub use crate::timer::Timer;
    pub use crate::udp::Udp;
    pub use crate::work::Work;
}
