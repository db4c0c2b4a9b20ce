use crate::param::{MAX_UPCALL_ARGS, PROC_DATA_BYTES};
use crate::rt::{Error, Rt};
use crate::stack::{self, StkSeg};
use crate::upcall::Upcall;
use core::mem::size_of;
use core::ptr::NonNull;
use log::debug;

/// Calling convention shared with compiled proc code: out-pointer
/// first, then the proc record.
pub type ProgCode = unsafe extern "C" fn(*mut u8, *mut Proc);

/// Code triple handed over by the language front-end. The core only
/// ever enters `main`; init and fini belong to surrounding machinery.
#[repr(C)]
pub struct Prog {
    pub init: ProgCode,
    pub main: ProgCode,
    pub fini: ProgCode,
}

// Keep Running at 0: proc code can flag anything-not-running with a
// single store of the other value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ProcState {
    Running = 0,
    CallingC = 1,
    Exiting = 2,
    BlockedReading = 3,
    BlockedWriting = 4,
}

// One lightweight process. The layout is ABI: the glue reads saved_sp
// and writes state, compiled proc code fills upcall_code/upcall_args,
// and the trailing data area is the proc's private slot space.
#[repr(C)]
pub struct Proc {
    pub rt: NonNull<Rt>,
    pub stk: NonNull<StkSeg>,
    pub prog: NonNull<Prog>,
    /// Resume point. Valid whenever the proc is not executing.
    pub saved_sp: usize,
    pub state: ProcState,
    /// Slot within the scheduler vector currently holding this proc.
    pub idx: usize,
    pub refcnt: usize,

    /// Parameter space for upcalls, written by proc code.
    pub upcall_code: usize,
    pub upcall_args: [usize; MAX_UPCALL_ARGS],

    // Accounting. Reserved: nothing charges against these yet.
    pub mem_budget: usize,
    pub curr_mem: usize,
    pub tick_budget: usize,
    pub curr_ticks: usize,

    data: [u8; PROC_DATA_BYTES],
}

impl Proc {
    pub fn prog(&self) -> &Prog {
        unsafe { self.prog.as_ref() }
    }

    /// Proc-private slot space viewed as words. Native proc code keeps
    /// its locals and cursors here.
    pub fn data_word(&self, i: usize) -> usize {
        assert!(i < PROC_DATA_BYTES / size_of::<usize>());
        unsafe { self.data.as_ptr().cast::<usize>().add(i).read() }
    }

    pub fn set_data_word(&mut self, i: usize, v: usize) {
        assert!(i < PROC_DATA_BYTES / size_of::<usize>());
        unsafe { self.data.as_mut_ptr().cast::<usize>().add(i).write(v) }
    }

    /// Address of an internal slot, for use as an upcall out-slot.
    pub fn data_word_ptr(&mut self, i: usize) -> *mut usize {
        assert!(i < PROC_DATA_BYTES / size_of::<usize>());
        unsafe { self.data.as_mut_ptr().cast::<usize>().add(i) }
    }

    /// Park an upcall in the record and flag it, so the next return
    /// from proc code lands in the dispatcher.
    pub fn set_upcall(&mut self, code: Upcall, args: &[usize]) {
        assert!(args.len() <= MAX_UPCALL_ARGS);
        self.upcall_code = code as usize;
        self.upcall_args[..args.len()].copy_from_slice(args);
        self.state = ProcState::CallingC;
    }
}

pub(crate) fn new_proc(rt: NonNull<Rt>, prog: NonNull<Prog>) -> Result<NonNull<Proc>, Error> {
    let stk = stack::new_stk()?;
    let proc = Box::new(Proc {
        rt,
        stk,
        prog,
        saved_sp: 0,
        state: ProcState::Running,
        idx: 0,
        refcnt: 0,
        upcall_code: 0,
        upcall_args: [0; MAX_UPCALL_ARGS],
        mem_budget: 0,
        curr_mem: 0,
        tick_budget: 0,
        curr_ticks: 0,
        data: [0; PROC_DATA_BYTES],
    });
    let mut proc = NonNull::from(Box::leak(proc));

    let p = unsafe { prog.as_ref() };
    debug!("rt: new proc {:#x}", proc.as_ptr() as usize);
    debug!("rt: from prog {:#x}", prog.as_ptr() as usize);
    debug!("rt: init: {:#x}", p.init as usize);
    debug!("rt: main: {:#x}", p.main as usize);
    debug!("rt: fini: {:#x}", p.fini as usize);

    let sp = stack::seed_initial_frame(stk, proc.as_ptr() as usize, p.main as usize);
    unsafe { proc.as_mut().saved_sp = sp };
    Ok(proc)
}

pub(crate) fn del_proc(proc: NonNull<Proc>) {
    debug!("rt: del proc {:#x}", proc.as_ptr() as usize);
    let proc = unsafe { Box::from_raw(proc.as_ptr()) };
    assert!(proc.refcnt == 0, "del_proc: live refs");
    stack::del_stk(proc.stk);
}
