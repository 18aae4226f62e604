//! Cooperative context switching between explicitly allocated stacks.
//!
//! A [`Scheduler`] owns every execution context of one thread of control.
//! Contexts are captured, bound to a [`Stack`] and an entry function, and then entered with an explicit
//! [`Scheduler::switch`]. When an entry function returns, control moves to the context's successor.
//!
//! # Examples
//!
//! ```
//! use coswitch::{Scheduler, Stack, DEFAULT_STACK_SIZE};
//!
//! let scheduler = Scheduler::new();
//! let main = scheduler.main();
//! let worker = scheduler.capture();
//!
//! let stack = Stack::new(DEFAULT_STACK_SIZE)?;
//! scheduler.bind(worker, stack, |_| Ok(()), main)?;
//! scheduler.switch(main, worker)?;
//!
//! assert_eq!(scheduler.status(worker), Some(coswitch::Status::Finished));
//! # Ok::<(), coswitch::Error>(())
//! ```

use std::io;

pub mod demo;
pub mod runtime;

pub use runtime::{ContextId, Scheduler, Stack, Status, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// Everything that can go wrong while creating or switching contexts.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The operating system couldn't provide memory for a stack.
    #[error("resource exhausted")]
    ResourceExhausted(#[from] io::Error),

    /// An argument was rejected before any state changed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The context doesn't exist or isn't in a state that allows the operation.
    #[error("invalid context {context}: {reason}")]
    InvalidContext {
        context: ContextId,
        reason: &'static str,
    },

    /// An entry function returned an error, delivered to its successor.
    #[error("context {context} failed")]
    Failed {
        context: ContextId,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
