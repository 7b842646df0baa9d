//! TCP transport: connection setup, frame I/O and keep-alive.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames    ┌─────────────────┐
//! │  read half   │ ──────────▶ │  FrameReader    │ ──▶ client/server dispatch
//! └──────────────┘             └─────────────────┘
//!
//! Session::send_frame ──▶ outbound queue ──▶ writer task ──▶ write half
//!
//! keep-alive task: HEARTBEAT when write-idle, disconnect when read-idle
//! ```
//!
//! Each connection gets one reader loop (owned by the client or server),
//! one writer task and one keep-alive task. All three end when the
//! session reaches `Disconnected`.

mod io;
mod keepalive;
mod tcp;

pub use io::{spawn_writer, write_frame, FrameReader};
pub use keepalive::{spawn_keepalive, KeepAlive};
pub use tcp::{connect, parse_address_list, resolve};
