//! A cooperative, user-space proc runtime: many lightweight procs,
//! each with its own heap-allocated stack, multiplexed onto a single
//! OS thread.
//!
//! Procs re-enter the runtime by parking an upcall in their record and
//! yielding through the machine-specific c-to-proc glue; the dispatcher
//! serves the request and the random-fair scheduler picks who runs
//! next. Ports and channels pair blocked writers with blocked readers
//! and move one word per rendezvous.
//!
//! The crate is the host side only: the glue and the compiled prog are
//! supplied by the embedder. `tests/scenarios.rs` shows a scripted
//! stand-in for both.

pub mod param;
pub mod port;
pub mod proc;
pub mod ptrvec;
pub mod rt;
pub mod stack;
pub mod start;
pub mod upcall;

pub use port::{Chan, Port};
pub use proc::{Proc, ProcState, Prog, ProgCode};
pub use ptrvec::PtrVec;
pub use rt::{Error, Rt};
pub use stack::StkSeg;
pub use start::{run, run_seeded, start, Glue, EXIT_ALLOC_FAILED, EXIT_DEADLOCK, EXIT_OK};
pub use upcall::Upcall;
