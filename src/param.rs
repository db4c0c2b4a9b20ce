// Runtime-wide tunables.

/// Bytes of stack data in a freshly allocated segment.
/// Linked lists of size-doubling segments can come later; one segment
/// of this size is what every proc starts with.
pub const INIT_STK_BYTES: usize = 65536;

/// Zeroed callee-save slots in a proc's initial frame. The count is a
/// contract with the c-to-proc glue for the target architecture.
#[cfg(target_arch = "x86_64")]
pub const N_CALLEE_SAVES: usize = 6;
#[cfg(not(target_arch = "x86_64"))]
pub const N_CALLEE_SAVES: usize = 4;

/// Upcall argument slots on every proc record.
pub const MAX_UPCALL_ARGS: usize = 8;

/// Bytes of proc-private internal slot space trailing the proc record.
pub const PROC_DATA_BYTES: usize = 1024;

/// Starting capacity of a PtrVec; trimming never shrinks below this.
pub const INIT_PTR_VEC_CAP: usize = 8;
