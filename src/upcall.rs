use crate::port::{self, Chan, Port};
use crate::proc::{Proc, ProcState, Prog};
use crate::rt::{Error, Rt};
use core::ptr::NonNull;
use log::{debug, warn};
use std::ffi::CStr;
use std::os::raw::c_char;

// Host-mediated operations proc code can request. The discriminants
// are the wire contract with compiled code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Upcall {
    LogUint32 = 0,
    LogStr = 1,
    Spawn = 2,
    CheckExpr = 3,
    Malloc = 4,
    Free = 5,
    NewPort = 6,
    DelPort = 7,
    NewChan = 8,
    DelChan = 9,
    Send = 10,
    Recv = 11,
    Sched = 12,
}

impl Upcall {
    pub fn from_usize(n: usize) -> Option<Self> {
        match n {
            0 => Some(Self::LogUint32),
            1 => Some(Self::LogStr),
            2 => Some(Self::Spawn),
            3 => Some(Self::CheckExpr),
            4 => Some(Self::Malloc),
            5 => Some(Self::Free),
            6 => Some(Self::NewPort),
            7 => Some(Self::DelPort),
            8 => Some(Self::NewChan),
            9 => Some(Self::DelChan),
            10 => Some(Self::Send),
            11 => Some(Self::Recv),
            12 => Some(Self::Sched),
            _ => None,
        }
    }
}

// Decode and perform the operation a proc parked in its record before
// yielding. On return the opcode slot is cleared; the proc may have
// been suspended (send/recv) or marked Exiting (failed check).
pub(crate) fn handle_upcall(rt: &mut Rt, proc: NonNull<Proc>) -> Result<(), Error> {
    let p = proc.as_ptr();
    let code = unsafe { (*p).upcall_code };
    let args = unsafe { (*p).upcall_args };
    debug!("rt: proc {:#x} calling fn #{}", p as usize, code);

    match Upcall::from_usize(code) {
        Some(Upcall::LogUint32) => upcall_log_uint32(args[0] as u32),
        Some(Upcall::LogStr) => upcall_log_str(args[0] as *const c_char),
        Some(Upcall::Spawn) => {
            let prog = NonNull::new(args[1] as *mut Prog).expect("spawn: null prog");
            let child = rt.spawn_proc(prog)?;
            unsafe { (args[0] as *mut *mut Proc).write(child.as_ptr()) };
        }
        Some(Upcall::Sched) => {
            // Register an externally constructed proc with the
            // scheduler; this is spawn's other half.
            let newcomer = NonNull::new(args[0] as *mut Proc).expect("sched: null proc");
            rt.add_proc_to_state_vec(newcomer);
        }
        Some(Upcall::CheckExpr) => upcall_check_expr(proc, args[0] as u32),
        Some(Upcall::Malloc) => {
            let addr = upcall_malloc(args[1])?;
            unsafe { (args[0] as *mut usize).write(addr) };
        }
        Some(Upcall::Free) => upcall_free(args[0]),
        Some(Upcall::NewPort) => {
            let new = port::new_port(proc);
            unsafe { (args[0] as *mut *mut Port).write(new.as_ptr()) };
        }
        Some(Upcall::DelPort) => {
            let doomed = NonNull::new(args[0] as *mut Port).expect("del_port: null port");
            port::del_port(rt, doomed);
        }
        Some(Upcall::NewChan) => {
            let on = NonNull::new(args[1] as *mut Port).expect("new_chan: null port");
            let new = port::new_chan(proc, on);
            unsafe { (args[0] as *mut *mut Chan).write(new.as_ptr()) };
        }
        Some(Upcall::DelChan) => {
            // The channel handle travels in args[1]; args[0] is
            // reserved.
            let doomed = NonNull::new(args[1] as *mut Chan).expect("del_chan: null chan");
            port::del_chan(doomed);
        }
        Some(Upcall::Send) => {
            let chan = NonNull::new(args[0] as *mut Chan).expect("send: null chan");
            port::send(rt, proc, chan);
        }
        Some(Upcall::Recv) => {
            let from = NonNull::new(args[1] as *mut Port).expect("recv: null port");
            port::recv(rt, proc, from);
        }
        None => warn!("rt: proc {:#x} requested unknown upcall {}", p as usize, code),
    }

    // Clear the opcode so a stale request can never re-fire.
    unsafe { (*p).upcall_code = 0 };
    Ok(())
}

fn upcall_log_uint32(v: u32) {
    println!("rt: log_uint32({:#x})", v);
}

fn upcall_log_str(s: *const c_char) {
    let s = unsafe { CStr::from_ptr(s) };
    println!("rt: log_str(\"{}\")", s.to_string_lossy());
}

fn upcall_check_expr(proc: NonNull<Proc>, v: u32) {
    if v == 0 {
        println!("\nrt: *** CHECK FAILED ***\n");
        unsafe { (*proc.as_ptr()).state = ProcState::Exiting };
    }
}

fn upcall_malloc(nbytes: usize) -> Result<usize, Error> {
    let p = unsafe { libc::malloc(nbytes) };
    if p.is_null() {
        return Err(Error::AllocFailed(nbytes));
    }
    debug!("rt: malloc({}) = {:#x}", nbytes, p as usize);
    Ok(p as usize)
}

fn upcall_free(ptr: usize) {
    debug!("rt: free({:#x})", ptr);
    unsafe { libc::free(ptr as *mut libc::c_void) };
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

    fn calling_proc(rt: &mut Rt, prog: &Prog) -> NonNull<Proc> {
        let p = rt.spawn_proc(NonNull::from(prog)).unwrap();
        rt.add_proc_to_state_vec(p);
        unsafe { (*p.as_ptr()).state = ProcState::CallingC };
        p
    }

    #[test]
    fn opcode_numbering_round_trips() {
        for n in 0..=12 {
            let code = Upcall::from_usize(n).unwrap();
            assert_eq!(code as usize, n);
        }
        assert!(Upcall::from_usize(13).is_none());
    }

    #[test]
    fn dispatch_clears_the_opcode() {
        let mut rt = Box::new(Rt::with_seed(3));
        let prog = test_prog();
        let p = calling_proc(&mut rt, &prog);

        unsafe { p.as_ptr().as_mut().unwrap().set_upcall(Upcall::LogUint32, &[5]) };
        handle_upcall(&mut rt, p).unwrap();

        assert_eq!(unsafe { (*p.as_ptr()).upcall_code }, 0);
        // Logging does not suspend; the driver will reset to Running.
        assert_eq!(unsafe { (*p.as_ptr()).state }, ProcState::CallingC);
    }

    #[test]
    fn malloc_then_free_round_trips() {
        let mut rt = Box::new(Rt::with_seed(3));
        let prog = test_prog();
        let p = calling_proc(&mut rt, &prog);

        let mut out: usize = 0;
        unsafe {
            let proc = p.as_ptr().as_mut().unwrap();
            proc.set_upcall(Upcall::Malloc, &[&mut out as *mut usize as usize, 64]);
        }
        handle_upcall(&mut rt, p).unwrap();
        assert_ne!(out, 0);

        unsafe { p.as_ptr().as_mut().unwrap().set_upcall(Upcall::Free, &[out]) };
        handle_upcall(&mut rt, p).unwrap();
    }

    #[test]
    fn failed_check_marks_the_proc_exiting() {
        let mut rt = Box::new(Rt::with_seed(3));
        let prog = test_prog();
        let p = calling_proc(&mut rt, &prog);

        unsafe { p.as_ptr().as_mut().unwrap().set_upcall(Upcall::CheckExpr, &[0]) };
        handle_upcall(&mut rt, p).unwrap();
        assert_eq!(unsafe { (*p.as_ptr()).state }, ProcState::Exiting);
    }

    #[test]
    fn passing_check_leaves_the_proc_alone() {
        let mut rt = Box::new(Rt::with_seed(3));
        let prog = test_prog();
        let p = calling_proc(&mut rt, &prog);

        unsafe { p.as_ptr().as_mut().unwrap().set_upcall(Upcall::CheckExpr, &[1]) };
        handle_upcall(&mut rt, p).unwrap();
        assert_eq!(unsafe { (*p.as_ptr()).state }, ProcState::CallingC);
    }

    #[test]
    fn spawn_constructs_and_sched_registers() {
        let mut rt = Box::new(Rt::with_seed(3));
        let prog = test_prog();
        let parent = calling_proc(&mut rt, &prog);

        let mut child_out: *mut Proc = core::ptr::null_mut();
        unsafe {
            let p = parent.as_ptr().as_mut().unwrap();
            p.set_upcall(
                Upcall::Spawn,
                &[
                    &mut child_out as *mut *mut Proc as usize,
                    &prog as *const Prog as usize,
                ],
            );
        }
        handle_upcall(&mut rt, parent).unwrap();
        assert!(!child_out.is_null());
        // Construction alone does not schedule.
        assert_eq!(rt.n_live_procs(), 1);

        unsafe {
            let p = parent.as_ptr().as_mut().unwrap();
            p.set_upcall(Upcall::Sched, &[child_out as usize]);
        }
        handle_upcall(&mut rt, parent).unwrap();
        assert_eq!(rt.n_live_procs(), 2);
        let idx = unsafe { (*child_out).idx };
        assert_eq!(rt.running_procs.get(idx), NonNull::new(child_out));
    }

    #[test]
    fn unknown_opcode_is_ignored() {
        let mut rt = Box::new(Rt::with_seed(3));
        let prog = test_prog();
        let p = calling_proc(&mut rt, &prog);

        unsafe {
            (*p.as_ptr()).upcall_code = 99;
        }
        handle_upcall(&mut rt, p).unwrap();
        assert_eq!(unsafe { (*p.as_ptr()).upcall_code }, 0);
        assert_eq!(unsafe { (*p.as_ptr()).state }, ProcState::CallingC);
    }
}
