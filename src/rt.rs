use crate::proc::{self, Proc, ProcState, Prog};
use crate::ptrvec::PtrVec;
use core::ptr::NonNull;
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

// Fatal, process-terminating conditions. Everything else is either a
// proc-terminating state change or an asserted invariant.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no schedulable processes")]
    Deadlock,
    #[error("allocation of {0:#x} bytes failed")]
    AllocFailed(usize),
}

// The runtime: every live proc, partitioned into the running and
// blocked vectors by state, plus the PRNG behind both fairness
// decisions (scheduling and writer selection).
pub struct Rt {
    /// Parking spot for the host-side stack pointer while a proc runs.
    /// Owned by the glue; the core never reads it.
    pub host_sp: usize,
    pub(crate) running_procs: PtrVec<NonNull<Proc>>,
    pub(crate) blocked_procs: PtrVec<NonNull<Proc>>,
    rng: SmallRng,
}

impl Rt {
    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_entropy())
    }

    /// Pin the schedule: every fairness decision becomes reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed))
    }

    fn with_rng(rng: SmallRng) -> Self {
        Self {
            host_sp: 0,
            running_procs: PtrVec::new(),
            blocked_procs: PtrVec::new(),
            rng,
        }
    }

    pub fn n_live_procs(&self) -> usize {
        self.running_procs.init() + self.blocked_procs.init()
    }

    fn state_vec_mut(&mut self, state: ProcState) -> &mut PtrVec<NonNull<Proc>> {
        match state {
            ProcState::Running | ProcState::CallingC | ProcState::Exiting => {
                &mut self.running_procs
            }
            ProcState::BlockedReading | ProcState::BlockedWriting => &mut self.blocked_procs,
        }
    }

    // Register a proc in the vector its state selects.
    pub(crate) fn add_proc_to_state_vec(&mut self, proc: NonNull<Proc>) {
        let state = unsafe { (*proc.as_ptr()).state };
        let v = self.state_vec_mut(state);
        unsafe { (*proc.as_ptr()).idx = v.init() };
        v.push(proc);
    }

    pub(crate) fn remove_proc_from_state_vec(&mut self, proc: NonNull<Proc>) {
        let (state, idx) = unsafe { ((*proc.as_ptr()).state, (*proc.as_ptr()).idx) };
        {
            let v = self.state_vec_mut(state);
            assert!(v.get(idx) == Some(proc), "proc index out of sync");
            v.swapdel(idx);
            if let Some(moved) = v.get(idx) {
                unsafe { (*moved.as_ptr()).idx = idx };
            }
        }
        let live = self.n_live_procs();
        self.state_vec_mut(state).trim(live);
    }

    // Move a proc between vectors, asserting the expected source state.
    pub(crate) fn transition(&mut self, proc: NonNull<Proc>, src: ProcState, dst: ProcState) {
        let p = proc.as_ptr();
        assert!(unsafe { (*p).state } == src, "transition: wrong source state");
        debug_assert!(
            core::ptr::eq(unsafe { (*p).rt.as_ptr() }, self),
            "transition: proc from another runtime"
        );
        self.remove_proc_from_state_vec(proc);
        unsafe { (*p).state = dst };
        self.add_proc_to_state_vec(proc);
    }

    /// Allocate a proc for `prog`. The caller registers it, or hands it
    /// to proc code which will issue a `sched` upcall.
    pub(crate) fn spawn_proc(&mut self, prog: NonNull<Prog>) -> Result<NonNull<Proc>, Error> {
        proc::new_proc(NonNull::from(&mut *self), prog)
    }

    // Pick the next proc to run, uniformly at random. Runnable procs
    // exhausted while others stay blocked is a deadlock.
    pub(crate) fn sched(&mut self) -> Result<NonNull<Proc>, Error> {
        assert!(self.n_live_procs() > 0, "sched: no procs");
        let n = self.running_procs.init();
        if n == 0 {
            return Err(Error::Deadlock);
        }
        let i = self.rng.gen_range(0..n);
        Ok(self.running_procs.get(i).expect("sched: index out of range"))
    }

    /// Random index below `n`, for the fairness decisions outside the
    /// scheduler proper.
    pub(crate) fn pick(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }

    // Tear down a proc that has finished: unlink it from its vector and
    // free the record and stack.
    pub(crate) fn exit_proc(&mut self, proc: NonNull<Proc>) {
        assert!(self.n_live_procs() > 0);
        let addr = proc.as_ptr() as usize;
        self.remove_proc_from_state_vec(proc);
        proc::del_proc(proc);
        debug!("rt: proc {:#x} exited (and deleted)", addr);
    }
}

impl Drop for Rt {
    // Free whatever procs are still parked in either vector.
    fn drop(&mut self) {
        while let Some(p) = self.running_procs.pop() {
            proc::del_proc(p);
        }
        while let Some(p) = self.blocked_procs.pop() {
            proc::del_proc(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProgCode;

    unsafe extern "C" fn nop(_out: *mut u8, _proc: *mut Proc) {}

    fn test_prog() -> Prog {
        let code: ProgCode = nop;
        Prog {
            init: code,
            main: code,
            fini: code,
        }
    }

    fn spawn_registered(rt: &mut Rt, prog: &Prog) -> NonNull<Proc> {
        let p = rt.spawn_proc(NonNull::from(prog)).unwrap();
        rt.add_proc_to_state_vec(p);
        p
    }

    #[test]
    fn every_proc_sits_where_its_idx_says() {
        let mut rt = Box::new(Rt::with_seed(7));
        let prog = test_prog();
        let procs: Vec<_> = (0..5).map(|_| spawn_registered(&mut rt, &prog)).collect();

        for p in &procs {
            let idx = unsafe { (*p.as_ptr()).idx };
            assert_eq!(rt.running_procs.get(idx), Some(*p));
        }
        assert_eq!(rt.n_live_procs(), 5);
    }

    #[test]
    fn transition_round_trip_restores_membership() {
        let mut rt = Box::new(Rt::with_seed(7));
        let prog = test_prog();
        let a = spawn_registered(&mut rt, &prog);
        let b = spawn_registered(&mut rt, &prog);

        rt.transition(a, ProcState::Running, ProcState::BlockedReading);
        assert_eq!(rt.running_procs.init(), 1);
        assert_eq!(rt.blocked_procs.init(), 1);
        let idx = unsafe { (*a.as_ptr()).idx };
        assert_eq!(rt.blocked_procs.get(idx), Some(a));

        rt.transition(a, ProcState::BlockedReading, ProcState::Running);
        assert_eq!(rt.running_procs.init(), 2);
        assert!(rt.blocked_procs.is_empty());
        for p in [a, b] {
            let idx = unsafe { (*p.as_ptr()).idx };
            assert_eq!(rt.running_procs.get(idx), Some(p));
        }
    }

    #[test]
    fn sched_with_one_runnable_always_picks_it() {
        let mut rt = Box::new(Rt::with_seed(7));
        let prog = test_prog();
        let only = spawn_registered(&mut rt, &prog);
        for _ in 0..16 {
            assert_eq!(rt.sched().unwrap(), only);
        }
    }

    #[test]
    fn all_blocked_is_a_deadlock() {
        let mut rt = Box::new(Rt::with_seed(7));
        let prog = test_prog();
        let p = spawn_registered(&mut rt, &prog);
        rt.transition(p, ProcState::Running, ProcState::BlockedReading);
        assert!(matches!(rt.sched(), Err(Error::Deadlock)));
    }

    #[test]
    fn exit_proc_unlinks_and_frees() {
        let mut rt = Box::new(Rt::with_seed(7));
        let prog = test_prog();
        let a = spawn_registered(&mut rt, &prog);
        let b = spawn_registered(&mut rt, &prog);

        rt.exit_proc(a);
        assert_eq!(rt.n_live_procs(), 1);
        let idx = unsafe { (*b.as_ptr()).idx };
        assert_eq!(rt.running_procs.get(idx), Some(b));
    }
}
