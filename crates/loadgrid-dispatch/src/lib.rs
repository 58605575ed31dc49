//! loadgrid-dispatch — the coordination core of a distributed load test.
//!
//! Given a target population, a set of weighted or fixed user profiles,
//! and a pool of workers, the dispatcher decides how many users of each
//! profile every worker should run, and walks the live plan toward that
//! goal at a caller-specified spawn rate.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher (async handle, cloneable)
//!   ├── Mutex<DispatchSequencer>
//!   │   ├── ProfileRegistry (name → UserProfile)
//!   │   ├── Topology (worker set, host-aware order)
//!   │   └── RampState
//!   │       ├── weigh()  → per-profile targets
//!   │       ├── spread() → ideal plan
//!   │       └── live plan, stepped one user at a time
//!   └── Notify (topology change interrupts the pacing sleep)
//! ```
//!
//! The dispatcher performs no I/O. Each emitted `Plan` is handed to the
//! transport layer by the caller.

pub mod balancer;
pub mod dispatcher;
pub mod error;
pub mod sequencer;
pub mod topology;
pub mod weighting;

pub use balancer::{RoundRobin, spread};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};
pub use sequencer::{Direction, DispatchSequencer, ProfileRegistry, RampPhase, Tick, TickKind};
pub use topology::Topology;
pub use weighting::weigh;
