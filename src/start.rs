use crate::proc::{Proc, ProcState, Prog};
use crate::rt::{Error, Rt};
use crate::upcall;
use core::ptr::NonNull;
use log::debug;

/// The machine-specific c-to-proc glue. It must restore `saved_sp` and
/// the callee-saves, enter proc code, and come back once the proc has
/// updated its state word.
pub type Glue = unsafe extern "C" fn(*mut Proc);

pub const EXIT_OK: i32 = 0;
pub const EXIT_DEADLOCK: i32 = 1;
pub const EXIT_ALLOC_FAILED: i32 = 123;

/// Run `prog`'s root proc to completion and map the outcome onto the
/// runtime's historical process exit codes.
pub fn start(prog: &Prog, glue: Glue) -> i32 {
    match run(prog, glue) {
        Ok(()) => EXIT_OK,
        Err(e @ Error::Deadlock) => {
            println!("rt: {}", e);
            EXIT_DEADLOCK
        }
        Err(e @ Error::AllocFailed(_)) => {
            println!("rt: {}, exiting", e);
            EXIT_ALLOC_FAILED
        }
    }
}

/// The event loop with an entropy-seeded schedule.
pub fn run(prog: &Prog, glue: Glue) -> Result<(), Error> {
    run_loop(&mut Rt::new(), NonNull::from(prog), glue)
}

/// The event loop with a pinned schedule, for embedders and tests that
/// need reproducible interleavings.
pub fn run_seeded(prog: &Prog, glue: Glue, seed: u64) -> Result<(), Error> {
    run_loop(&mut Rt::with_seed(seed), NonNull::from(prog), glue)
}

// Schedule, resume, dispatch, reap, until no procs remain.
fn run_loop(rt: &mut Rt, prog: NonNull<Prog>, glue: Glue) -> Result<(), Error> {
    debug!("rt: control is in the runtime library");

    let root = rt.spawn_proc(prog)?;
    rt.add_proc_to_state_vec(root);
    debug!("rt: root proc is {:#x}", root.as_ptr() as usize);

    let mut proc = rt.sched()?;
    loop {
        unsafe {
            (*proc.as_ptr()).state = ProcState::Running;
            glue(proc.as_ptr());
        }
        match unsafe { (*proc.as_ptr()).state } {
            ProcState::Running => {}
            ProcState::CallingC => {
                upcall::handle_upcall(rt, proc)?;
                match unsafe { (*proc.as_ptr()).state } {
                    // The dispatcher served the request without
                    // suspending the proc.
                    ProcState::CallingC => unsafe {
                        (*proc.as_ptr()).state = ProcState::Running;
                    },
                    // A failed check. Reap now; the proc must not be
                    // re-entered past its failure point.
                    ProcState::Exiting => rt.exit_proc(proc),
                    _ => {}
                }
            }
            ProcState::Exiting => {
                debug!("rt: proc exiting {:#x}", proc.as_ptr() as usize);
                rt.exit_proc(proc);
            }
            // Procs block only through the dispatcher, never by the
            // glue returning a blocked state of its own.
            ProcState::BlockedReading | ProcState::BlockedWriting => {
                unreachable!("proc returned from glue in a blocked state")
            }
        }
        if rt.n_live_procs() > 0 {
            proc = rt.sched()?;
        } else {
            break;
        }
    }
    debug!("rt: finished main loop");
    Ok(())
}
