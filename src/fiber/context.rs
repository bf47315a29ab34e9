//! Saved machine contexts and the switch between them.
//!
//! A switch stores the callee-saved register set on the current stack,
//! records the stack pointer, and reloads the target's. A freshly
//! initialized stack is laid out so that the first switch-in "returns"
//! into the entry trampoline with a zeroed register set, as if the
//! trampoline had been called from nowhere.

#[cfg(unix)]
use std::cell::UnsafeCell;

#[cfg(unix)]
use crate::fiber::stack::Stack;

#[cfg(unix)]
pub(crate) type StackPointer = *mut usize;

/// Machine context of one fiber: its stack (if it owns one) and the stack
/// pointer recorded at its last suspension.
///
/// The pointer slot is only ever read or written by the thread that is
/// executing or switching this fiber; cross-thread handoff is ordered by
/// the scheduler's queue lock.
#[cfg(unix)]
pub(crate) struct Context {
    stack: Option<Stack>,
    sp: UnsafeCell<StackPointer>,
}

#[cfg(unix)]
impl Context {
    /// Context for the thread that is already running; no stack is
    /// allocated and the pointer slot is filled by the first switch away.
    pub(crate) fn for_thread() -> Context {
        Context {
            stack: None,
            sp: UnsafeCell::new(std::ptr::null_mut()),
        }
    }

    pub(crate) fn with_stack(stack_size: usize, entry: extern "C" fn() -> !) -> Context {
        let stack = Stack::new(stack_size);
        let context = Context {
            stack: Some(stack),
            sp: UnsafeCell::new(std::ptr::null_mut()),
        };
        context.reinit(entry);
        context
    }

    pub(crate) fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Re-lays the trampoline frame so the next switch-in begins at
    /// `entry` again. Only valid while the fiber is not suspended
    /// mid-execution.
    pub(crate) fn reinit(&self, entry: extern "C" fn() -> !) {
        let stack = self.stack.as_ref().expect("cannot reinit a thread context");
        unsafe {
            *self.sp.get() = arch::init_stack(stack.top(), entry);
        }
    }

    /// Switches from the currently running fiber (whose context is `self`)
    /// into `to`. Returns when something switches back here.
    ///
    /// # Safety
    ///
    /// `self` must be the context of the fiber executing on this thread and
    /// `to` must hold a valid suspended (or freshly initialized) context
    /// that no other thread resumes concurrently. Both must stay alive for
    /// the duration of the switch.
    pub(crate) unsafe fn switch_to(&self, to: &Context) {
        arch::switch_context(self.sp.get(), *to.sp.get());
    }
}

#[cfg(unix)]
impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("has_stack", &self.stack.is_some())
            .finish()
    }
}

#[cfg(all(unix, target_arch = "x86_64"))]
mod arch {
    use super::StackPointer;

    /// MXCSR with all exceptions masked plus the default x87 control word,
    /// packed the way the switch spills them.
    const FP_CONTROL: usize = 0x037F_0000_1F80;

    /// Save rbp/rbx/r12-r15 and the floating-point control state on the
    /// current stack, publish rsp through `save`, then unspill the same
    /// set from `load` and return into its recorded instruction pointer.
    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_context(save: *mut StackPointer, load: StackPointer) {
        core::arch::naked_asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "sub rsp, 8",
            "stmxcsr [rsp]",
            "fnstcw [rsp + 4]",
            "mov [rdi], rsp",
            "mov rsp, rsi",
            "ldmxcsr [rsp]",
            "fldcw [rsp + 4]",
            "add rsp, 8",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        )
    }

    /// Lay out the initial frame: a padding word keeps the entry point
    /// aligned the way a `call` would have left it, the saved registers
    /// are zeroed, and the frame-pointer slot terminates the chain.
    pub(super) unsafe fn init_stack(top: *mut u8, entry: extern "C" fn() -> !) -> StackPointer {
        let top = top as *mut usize;
        unsafe {
            top.sub(1).write(0); // padding
            top.sub(2).write(entry as usize); // return address for `ret`
            top.sub(3).write(0); // rbp
            top.sub(4).write(0); // rbx
            top.sub(5).write(0); // r12
            top.sub(6).write(0); // r13
            top.sub(7).write(0); // r14
            top.sub(8).write(0); // r15
            top.sub(9).write(FP_CONTROL);
            top.sub(9)
        }
    }
}

#[cfg(all(unix, target_arch = "aarch64"))]
mod arch {
    use super::StackPointer;

    /// Save x19-x28, the frame pointer, the link register and d8-d15 on
    /// the current stack, publish sp through `save`, then unspill the same
    /// set from `load` and return through the restored link register.
    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_context(save: *mut StackPointer, load: StackPointer) {
        core::arch::naked_asm!(
            "sub sp, sp, #0xa0",
            "stp x19, x20, [sp, #0x00]",
            "stp x21, x22, [sp, #0x10]",
            "stp x23, x24, [sp, #0x20]",
            "stp x25, x26, [sp, #0x30]",
            "stp x27, x28, [sp, #0x40]",
            "stp x29, x30, [sp, #0x50]",
            "stp d8, d9, [sp, #0x60]",
            "stp d10, d11, [sp, #0x70]",
            "stp d12, d13, [sp, #0x80]",
            "stp d14, d15, [sp, #0x90]",
            "mov x2, sp",
            "str x2, [x0]",
            "mov sp, x1",
            "ldp x19, x20, [sp, #0x00]",
            "ldp x21, x22, [sp, #0x10]",
            "ldp x23, x24, [sp, #0x20]",
            "ldp x25, x26, [sp, #0x30]",
            "ldp x27, x28, [sp, #0x40]",
            "ldp x29, x30, [sp, #0x50]",
            "ldp d8, d9, [sp, #0x60]",
            "ldp d10, d11, [sp, #0x70]",
            "ldp d12, d13, [sp, #0x80]",
            "ldp d14, d15, [sp, #0x90]",
            "add sp, sp, #0xa0",
            "ret",
        )
    }

    /// Zero every saved register except the link register, which carries
    /// the entry point; the first `ret` branches there with sp at the
    /// 16-aligned stack top.
    pub(super) unsafe fn init_stack(top: *mut u8, entry: extern "C" fn() -> !) -> StackPointer {
        let top = top as *mut usize;
        unsafe {
            let sp = top.sub(20);
            for i in 0..20 {
                sp.add(i).write(0);
            }
            sp.add(11).write(entry as usize); // x30
            sp
        }
    }
}

#[cfg(all(unix, not(any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("fiber context switching is only implemented for x86_64 and aarch64");

#[cfg(windows)]
mod windows {
    //! Native Windows fibers. The OS owns the stacks and the register
    //! save discipline; a switch is `SwitchToFiber`.

    use std::cell::UnsafeCell;
    use std::ffi::c_void;

    use windows_sys::Win32::System::Threading::{
        ConvertFiberToThread, ConvertThreadToFiber, CreateFiber, DeleteFiber, SwitchToFiber,
    };

    pub(crate) struct Context {
        fiber: UnsafeCell<*mut c_void>,
        owned: bool,
        stack_size: usize,
    }

    unsafe extern "system" fn fiber_start(parameter: *mut c_void) {
        let entry: extern "C" fn() -> ! = unsafe { std::mem::transmute(parameter) };
        entry();
    }

    impl Context {
        pub(crate) fn for_thread() -> Context {
            let fiber = unsafe { ConvertThreadToFiber(std::ptr::null()) };
            assert!(!fiber.is_null(), "ConvertThreadToFiber failed");
            Context {
                fiber: UnsafeCell::new(fiber),
                owned: false,
                stack_size: 0,
            }
        }

        pub(crate) fn with_stack(stack_size: usize, entry: extern "C" fn() -> !) -> Context {
            let fiber =
                unsafe { CreateFiber(stack_size, Some(fiber_start), entry as *const c_void) };
            assert!(!fiber.is_null(), "CreateFiber failed");
            Context {
                fiber: UnsafeCell::new(fiber),
                owned: true,
                stack_size,
            }
        }

        pub(crate) fn has_stack(&self) -> bool {
            self.owned
        }

        pub(crate) fn reinit(&self, entry: extern "C" fn() -> !) {
            assert!(self.owned, "cannot reinit a thread context");
            unsafe {
                DeleteFiber(*self.fiber.get());
                let fiber =
                    CreateFiber(self.stack_size, Some(fiber_start), entry as *const c_void);
                assert!(!fiber.is_null(), "CreateFiber failed");
                *self.fiber.get() = fiber;
            }
        }

        pub(crate) unsafe fn switch_to(&self, to: &Context) {
            unsafe { SwitchToFiber(*to.fiber.get()) };
        }
    }

    impl Drop for Context {
        fn drop(&mut self) {
            unsafe {
                if self.owned {
                    DeleteFiber(*self.fiber.get());
                } else {
                    ConvertFiberToThread();
                }
            }
        }
    }

    impl std::fmt::Debug for Context {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Context").field("owned", &self.owned).finish()
        }
    }
}

#[cfg(windows)]
pub(crate) use self::windows::Context;
