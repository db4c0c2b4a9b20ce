use crate::proc::{Proc, ProcState};
use crate::ptrvec::PtrVec;
use crate::rt::Rt;
use core::ptr::NonNull;
use log::debug;

// Receive endpoint, owned by the proc that created it. Writers that
// could not rendezvous immediately queue here until the owner reads.
#[repr(C)]
pub struct Port {
    // Reference counts are reserved; nothing decrements them yet.
    pub live_refcnt: usize,
    pub weak_refcnt: usize,
    pub proc: Option<NonNull<Proc>>,
    pub writers: PtrVec<NonNull<Chan>>,
}

// Send endpoint. `proc` is the sender of record, rewritten on every
// send; `idx` is meaningful only while `queued`.
#[repr(C)]
pub struct Chan {
    pub port: NonNull<Port>,
    pub proc: NonNull<Proc>,
    pub queued: bool,
    pub idx: usize,
    /// Reserved for buffered sends.
    pub buf: PtrVec<usize>,
}

pub(crate) fn new_port(proc: NonNull<Proc>) -> NonNull<Port> {
    let port = NonNull::from(Box::leak(Box::new(Port {
        live_refcnt: 0,
        weak_refcnt: 0,
        proc: Some(proc),
        writers: PtrVec::new(),
    })));
    debug!("rt: new port {:#x}", port.as_ptr() as usize);
    port
}

// Destroy a port. Writers still queued will never pair: fail each one,
// returning its sender to the runnable pool with the payload dropped.
pub(crate) fn del_port(rt: &mut Rt, port: NonNull<Port>) {
    debug!("rt: del port {:#x}", port.as_ptr() as usize);
    assert!(unsafe { (*port.as_ptr()).live_refcnt } == 0, "del_port: live refs");
    while let Some(chan) = unsafe { (*port.as_ptr()).writers.pop() } {
        unsafe { (*chan.as_ptr()).queued = false };
        let src = unsafe { (*chan.as_ptr()).proc };
        println!(
            "rt: *** DEAD PORT *** dropping send from proc {:#x}",
            src.as_ptr() as usize
        );
        rt.transition(src, ProcState::BlockedWriting, ProcState::Running);
    }
    drop(unsafe { Box::from_raw(port.as_ptr()) });
}

pub(crate) fn new_chan(proc: NonNull<Proc>, port: NonNull<Port>) -> NonNull<Chan> {
    let chan = NonNull::from(Box::leak(Box::new(Chan {
        port,
        proc,
        queued: false,
        idx: 0,
        buf: PtrVec::new(),
    })));
    debug!("rt: new chan {:#x}", chan.as_ptr() as usize);
    chan
}

pub(crate) fn del_chan(chan: NonNull<Chan>) {
    debug!("rt: del chan {:#x}", chan.as_ptr() as usize);
    if unsafe { (*chan.as_ptr()).queued } {
        // Unlink from the port's writer vector first.
        let port = unsafe { (*chan.as_ptr()).port };
        let writers = unsafe { &mut (*port.as_ptr()).writers };
        chan_vec_swapdel(writers, chan);
        let live = writers.init();
        writers.trim(live);
    }
    drop(unsafe { Box::from_raw(chan.as_ptr()) });
}

// Swap-delete that patches up the index of whichever channel lands in
// the vacated slot.
pub(crate) fn chan_vec_swapdel(v: &mut PtrVec<NonNull<Chan>>, chan: NonNull<Chan>) {
    let idx = unsafe { (*chan.as_ptr()).idx };
    assert!(v.get(idx) == Some(chan), "chan index out of sync");
    v.swapdel(idx);
    if let Some(moved) = v.get(idx) {
        unsafe { (*moved.as_ptr()).idx = idx };
    }
}

// Pair a blocked writer with a blocked reader: move the payload word
// from the writer's argument slot to the address the reader parked,
// then return both to Running. Anything else fails with no effect.
pub(crate) fn attempt_rendezvous(rt: &mut Rt, src: NonNull<Proc>, dst: NonNull<Proc>) -> bool {
    let src_state = unsafe { (*src.as_ptr()).state };
    let dst_state = unsafe { (*dst.as_ptr()).state };
    if src_state != ProcState::BlockedWriting || dst_state != ProcState::BlockedReading {
        debug!(
            "rt: rendezvous failed: src state {:?} vs. dst state {:?}",
            src_state, dst_state
        );
        return false;
    }
    // One pointer-sized word per rendezvous; structured payloads would
    // need a copy plan negotiated with the compiler.
    let sval = unsafe { (*src.as_ptr()).upcall_args[1] };
    let dptr = unsafe { (*dst.as_ptr()).upcall_args[0] } as *mut usize;
    debug!(
        "rt: rendezvous successful, copying val {:#x} to dst {:#x}",
        sval, dptr as usize
    );
    unsafe { dptr.write(sval) };
    rt.transition(src, ProcState::BlockedWriting, ProcState::Running);
    rt.transition(dst, ProcState::BlockedReading, ProcState::Running);
    true
}

// A send blocks the caller, then tries to pair with the port's owner.
// If the owner is not ready the channel joins the port's writer queue.
pub(crate) fn send(rt: &mut Rt, src: NonNull<Proc>, chan: NonNull<Chan>) {
    debug!("rt: send to chan {:#x}", chan.as_ptr() as usize);
    // Sender identity is per-send.
    unsafe { (*chan.as_ptr()).proc = src };
    let port = unsafe { (*chan.as_ptr()).port };
    let Some(owner) = (unsafe { (*port.as_ptr()).proc }) else {
        println!("rt: *** DEAD SEND *** (possibly throw?)");
        return;
    };
    rt.transition(src, ProcState::CallingC, ProcState::BlockedWriting);
    if attempt_rendezvous(rt, src, owner) || unsafe { (*chan.as_ptr()).queued } {
        return;
    }
    let writers = unsafe { &mut (*port.as_ptr()).writers };
    unsafe { (*chan.as_ptr()).idx = writers.init() };
    writers.push(chan);
    unsafe { (*chan.as_ptr()).queued = true };
}

// A recv blocks the owner, then tries one randomly chosen queued
// writer. No writers, or a failed attempt, leaves the owner blocked.
pub(crate) fn recv(rt: &mut Rt, dst: NonNull<Proc>, port: NonNull<Port>) {
    debug!("rt: recv from port {:#x}", port.as_ptr() as usize);
    let owner = unsafe { (*port.as_ptr()).proc };
    assert!(owner == Some(dst), "recv: not the port owner");
    rt.transition(dst, ProcState::CallingC, ProcState::BlockedReading);
    let n = unsafe { (*port.as_ptr()).writers.init() };
    if n == 0 {
        return;
    }
    let i = rt.pick(n);
    let chan = unsafe { (*port.as_ptr()).writers.get(i) }.expect("recv: writer index out of range");
    assert!(unsafe { (*chan.as_ptr()).idx } == i, "recv: writer index out of sync");
    let src = unsafe { (*chan.as_ptr()).proc };
    if attempt_rendezvous(rt, src, dst) {
        let writers = unsafe { &mut (*port.as_ptr()).writers };
        chan_vec_swapdel(writers, chan);
        let live = writers.init();
        writers.trim(live);
        unsafe { (*chan.as_ptr()).queued = false };
    }
}
