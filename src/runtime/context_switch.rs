//! Abstraction over userspace multitasking.
//!
//! Provides an implementation for every CPU architecture.
//!
//! A suspended context is nothing but its stack pointer. [jump] spills the callee-saved
//! registers and the floating point control words onto the current stack, then does the
//! reverse on the target stack. [prepare_stack] forges the same frame on a fresh stack,
//! so that the first [jump] into it "returns" into a bootstrap stub that calls the entry.

use std::arch::global_asm;

/// Handle to a stack pointer set up for context switching.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) struct Continuation(*const ());

impl Continuation {
    /// Placeholder for a context that was never suspended.
    pub(super) const EMPTY: Continuation = Continuation(std::ptr::null());

    pub(super) fn is_empty(&self) -> bool {
        self.0.is_null()
    }
}

/// Entry point of a prepared stack, it must never return.
pub(super) type Entry = extern "C" fn(argument: *const ()) -> !;

extern "C" {
    /// Initializes a stack for context switching.
    ///
    /// [stack] is the upper (exclusive) address of the stack memory, it's aligned down as needed.
    /// Jumping to the returned continuation calls [entry] with [argument].
    #[link_name = "coswitch_prepare_stack"]
    pub(super) fn prepare_stack(stack: *mut u8, entry: Entry, argument: *const ()) -> Continuation;

    /// Executes a context switch.
    ///
    /// Spills registers, sets [from] to updated stack pointer.
    /// Sets stack pointer to [to], restores registers.
    #[link_name = "coswitch_jump"]
    pub(super) fn jump(from: *mut Continuation, to: *const Continuation);
}

#[cfg(not(target_arch = "x86_64"))]
compile_error!("coswitch only supports x86_64");

#[cfg(target_arch = "x86_64")]
global_asm!(include_str!("assembly/x86_64.s"));

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::runtime::stack::Stack;

    struct PingPong {
        main: Continuation,
        other: Continuation,
        steps: Cell<u32>,
    }

    extern "C" fn ping_pong(argument: *const ()) -> ! {
        let state = argument as *mut PingPong;
        unsafe {
            (*state).steps.set((*state).steps.get() + 1);
            jump(&mut (*state).other, &(*state).main);
            (*state).steps.set((*state).steps.get() + 1);
            jump(&mut (*state).other, &(*state).main);
        }
        unreachable!()
    }

    #[test]
    fn prepared_stack_is_not_empty() {
        let stack = Stack::new(16 * 1024).unwrap();
        let continuation = unsafe { prepare_stack(stack.base(), ping_pong, std::ptr::null()) };

        assert!(!continuation.is_empty());
        assert!(Continuation::EMPTY.is_empty());
    }

    #[test]
    fn jumps_back_and_forth() {
        let stack = Stack::new(16 * 1024).unwrap();
        let mut state = PingPong {
            main: Continuation::EMPTY,
            other: Continuation::EMPTY,
            steps: Cell::new(0),
        };
        let state = &mut state as *mut PingPong;

        unsafe {
            (*state).other = prepare_stack(stack.base(), ping_pong, state as *const ());

            jump(&mut (*state).main, &(*state).other);
            assert_eq!((*state).steps.get(), 1);

            jump(&mut (*state).main, &(*state).other);
            assert_eq!((*state).steps.get(), 2);
        }
    }
}
