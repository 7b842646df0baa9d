//! Version negotiation and the session state machine.
//!
//! # Message Flow
//!
//! ```text
//! Client                                   Server
//!    |                                        |
//!    |-------- HANDSHAKE (min,max) --------->|  Connecting -> Negotiating
//!    |<------- HANDSHAKE_ACK (version) ------|  Negotiating -> Active
//!    |                                        |
//!    |======== REQUEST (corr=n) ============>|
//!    |<======= RESPONSE_OK/FAULT (corr=n) ===|  any order
//!    |                                        |
//!    |<------- HEARTBEAT ------------------->|  when write-idle
//!    |                                        |
//!    |<------- SUSPEND ----------------------|  server unhealthy (v5+)
//!    |<------- DISCONNECT -------------------|  drained or wait expired
//! ```
//!
//! # State Machine
//!
//! | State          | Entered on                         | Valid Transitions        |
//! |----------------|------------------------------------|--------------------------|
//! | `Connecting`   | session created                    | → Negotiating, Disconnected |
//! | `Negotiating`  | socket connected                   | → Active, Disconnected   |
//! | `Active`       | handshake accepted                 | → Suspending, Disconnected |
//! | `Suspending`   | SUSPEND sent or received           | → Disconnected           |
//! | `Disconnected` | DISCONNECT, socket error, timeout  | (terminal)               |
//!
//! # Versions
//!
//! | Version | Introduces                               |
//! |---------|------------------------------------------|
//! | 1       | base protocol                            |
//! | 2       | inferred country in the geo-location     |
//! | 3       | root/parent request UUIDs                |
//! | 4       | additional context parameters            |
//! | 5       | SUSPEND during graceful drain            |

mod handshake;
mod session;
mod version;

pub use handshake::{Handshake, HandshakeReply};
pub use session::{OutboundQueue, Session, SessionRole, SessionState, SessionStats};
pub use version::{ProtocolVersion, VersionRange};
