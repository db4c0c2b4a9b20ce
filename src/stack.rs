use crate::param::{INIT_STK_BYTES, N_CALLEE_SAVES};
use crate::rt::Error;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use log::debug;
use std::alloc::{alloc, dealloc, Layout};
use zerocopy::AsBytes;

// A proc execution stack. Header and data share one allocation; the
// data region trails the header. prev/next chain segments together for
// eventual stack growth.
#[repr(C)]
pub struct StkSeg {
    pub prev: *mut StkSeg,
    pub next: *mut StkSeg,
    /// Registration handle for external memory debuggers. Unused until
    /// a registration hook is wired in.
    pub debug_id: u32,
    pub size: usize,
    pub live: usize,
}

impl StkSeg {
    fn layout(size: usize) -> Layout {
        // Size stays word-friendly and modest; this cannot fail.
        Layout::from_size_align(size_of::<StkSeg>() + size, 16).unwrap()
    }

    /// Base of the stack data region.
    pub fn data(seg: NonNull<StkSeg>) -> *mut u8 {
        unsafe { seg.as_ptr().cast::<u8>().add(size_of::<StkSeg>()) }
    }
}

pub(crate) fn new_stk() -> Result<NonNull<StkSeg>, Error> {
    let layout = StkSeg::layout(INIT_STK_BYTES);
    let Some(stk) = NonNull::new(unsafe { alloc(layout) }.cast::<StkSeg>()) else {
        return Err(Error::AllocFailed(layout.size()));
    };
    unsafe {
        ptr::write(
            stk.as_ptr(),
            StkSeg {
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                debug_id: 0,
                size: INIT_STK_BYTES,
                live: 0,
            },
        );
    }
    debug!("rt: new stk {:#x}", stk.as_ptr() as usize);
    Ok(stk)
}

// Free a whole segment chain, following next links.
pub(crate) fn del_stk(stk: NonNull<StkSeg>) {
    let mut stk = stk.as_ptr();
    while !stk.is_null() {
        let next = unsafe { (*stk).next };
        debug!("rt: freeing stk segment {:#x}", stk as usize);
        let layout = StkSeg::layout(unsafe { (*stk).size });
        unsafe { dealloc(stk.cast(), layout) };
        stk = next;
    }
    debug!("rt: freed stacks");
}

// The frame seeded at the top of a fresh stack. The glue "activates" a
// proc by restoring the callee-saves below the activation PC and
// returning to it, so the first instruction of main finds a frame of
// the usual shape under itself: a return-PC slot and an out-pointer
// slot (both spacers here) and the proc pointer as first argument.
// The glue honors this layout bit for bit; change it only together
// with the glue.
#[derive(AsBytes)]
#[repr(C)]
struct InitFrame {
    callee_saves: [usize; N_CALLEE_SAVES],
    activation_pc: usize,
    fake_ret_pc: usize,
    fake_out_ptr: usize,
    proc_ptr: usize,
}

// Seed the initial frame and return the stack pointer to park in the
// proc record. The proc-pointer slot lands on the last word of the
// segment after aligning down to a 16-byte boundary.
pub(crate) fn seed_initial_frame(stk: NonNull<StkSeg>, proc_ptr: usize, main_pc: usize) -> usize {
    let data = StkSeg::data(stk);
    let size = unsafe { (*stk.as_ptr()).size };

    let mut top = unsafe { data.add(size - size_of::<usize>()) } as usize;
    top &= !0xf;

    let frame = InitFrame {
        callee_saves: [0; N_CALLEE_SAVES],
        activation_pc: main_pc,
        fake_ret_pc: 0,
        fake_out_ptr: 0,
        proc_ptr,
    };
    let sp = top + size_of::<usize>() - size_of::<InitFrame>();
    unsafe {
        ptr::copy_nonoverlapping(frame.as_bytes().as_ptr(), sp as *mut u8, size_of::<InitFrame>());
    }
    sp
}
