//! Registry of cooperative execution contexts and the switch between them.
//!
//! Every context goes through `Captured -> Bound -> Running <-> Suspended -> Finished`.
//! A finished context hands control to its successor, and may be bound again afterwards.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::{fmt, panic, process};

use crate::Error;

mod context_switch;
mod stack;

pub use stack::Stack;

/// Smallest stack accepted by [Scheduler::bind].
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Comfortable stack size for entry functions that format and print.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Handle to a context within the [Scheduler] that created it.
///
/// Slots are reused after [Scheduler::release], the generation tells a stale handle apart.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId {
    index: usize,
    generation: u64,
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Lifecycle of a context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Slot exists, but there's nothing to run yet.
    Captured,
    /// Has a stack, an entry function, and a successor, but never ran.
    Bound,
    /// Currently owns the thread of control.
    Running,
    /// Switched away from, resumes inside [Scheduler::switch].
    Suspended,
    /// Entry function returned, control moved on to the successor.
    Finished,
}

type EntryFn = Box<dyn FnOnce(Scheduler) -> crate::Result<()>>;

struct ContextState {
    generation: u64,
    continuation: context_switch::Continuation,
    status: Status,
    stack: Option<Stack>,
    entry: Option<EntryFn>,
    successor: Option<ContextId>,
}

impl ContextState {
    fn captured(generation: u64) -> Self {
        ContextState {
            generation,
            continuation: context_switch::Continuation::EMPTY,
            status: Status::Captured,
            stack: None,
            entry: None,
            successor: None,
        }
    }
}

/// Failure of a finished context, travelling to its successor.
enum Failure {
    Panicked(Box<dyn Any + Send + 'static>),
    Errored(Error),
}

type Contexts = slab::Slab<ContextState>;

fn lookup(contexts: &Contexts, context: ContextId) -> Option<&ContextState> {
    let state = contexts.get(context.index)?;
    (state.generation == context.generation).then_some(state)
}

fn lookup_mut(contexts: &mut Contexts, context: ContextId) -> Option<&mut ContextState> {
    let state = contexts.get_mut(context.index)?;
    (state.generation == context.generation).then_some(state)
}

fn lookup2_mut(
    contexts: &mut Contexts,
    first: ContextId,
    second: ContextId,
) -> Option<(&mut ContextState, &mut ContextState)> {
    if first.index == second.index {
        return None;
    }

    let (a, b) = contexts.get2_mut(first.index, second.index)?;
    (a.generation == first.generation && b.generation == second.generation).then_some((a, b))
}

struct Registry {
    contexts: RefCell<Contexts>,
    running: Cell<ContextId>,
    main: ContextId,
    next_generation: Cell<u64>,
    failure: Cell<Option<Failure>>,
}

impl Registry {
    /// Takes the entry function of the context that just started running.
    fn take_entry(&self) -> Option<EntryFn> {
        let mut contexts = self.contexts.borrow_mut();
        contexts[self.running.get().index].entry.take()
    }

    /// Marks the running context as finished and hands control to its successor.
    /// Returns the pair of continuations to jump between.
    fn finish(
        &self,
        outcome: Result<(), Failure>,
    ) -> crate::Result<(*mut context_switch::Continuation, *const context_switch::Continuation)> {
        let mut contexts = self.contexts.borrow_mut();
        let finished = self.running.get();

        let successor = contexts[finished.index].successor.ok_or(Error::InvalidContext {
            context: finished,
            reason: "context has no successor",
        })?;
        contexts[finished.index].status = Status::Finished;

        let (current, next) =
            lookup2_mut(&mut contexts, finished, successor)
                .ok_or(Error::InvalidContext {
                    context: successor,
                    reason: "successor no longer exists",
                })?;
        check_enterable(successor, next.status)?;
        next.status = Status::Running;
        self.running.set(successor);

        let failure = match outcome {
            Ok(()) => None,
            Err(Failure::Errored(error @ Error::Failed { .. })) => Some(Failure::Errored(error)),
            Err(Failure::Errored(error)) => Some(Failure::Errored(Error::Failed {
                context: finished,
                source: Box::new(error),
            })),
            Err(panicked) => Some(panicked),
        };
        self.failure.set(failure);

        Ok((
            &mut current.continuation as *mut context_switch::Continuation,
            &next.continuation as *const context_switch::Continuation,
        ))
    }
}

/// Only bound and suspended contexts can receive control.
fn check_enterable(context: ContextId, status: Status) -> crate::Result<()> {
    let reason = match status {
        Status::Bound | Status::Suspended => return Ok(()),
        Status::Captured => "context isn't bound",
        Status::Running => "context is already running",
        Status::Finished => "context already finished",
    };

    Err(Error::InvalidContext { context, reason })
}

/// Owns the execution contexts of one thread of control.
///
/// The context that calls [Scheduler::new] becomes the main context, it runs on the thread's own stack.
/// Clones refer to the same registry; entry functions receive one.
#[derive(Clone)]
pub struct Scheduler {
    registry: Rc<Registry>,
}

impl Scheduler {
    /// Creates a registry whose only context is the caller, already running.
    pub fn new() -> Self {
        let mut contexts = slab::Slab::new();
        let mut state = ContextState::captured(0);
        state.status = Status::Running;
        let main = ContextId {
            index: contexts.insert(state),
            generation: 0,
        };

        Scheduler {
            registry: Rc::new(Registry {
                contexts: RefCell::new(contexts),
                running: Cell::new(main),
                main,
                next_generation: Cell::new(1),
                failure: Cell::new(None),
            }),
        }
    }

    /// Context that created this scheduler.
    pub fn main(&self) -> ContextId {
        self.registry.main
    }

    /// Context that currently owns the thread of control.
    pub fn running(&self) -> ContextId {
        self.registry.running.get()
    }

    /// Returns [None] for unknown or released contexts.
    pub fn status(&self, context: ContextId) -> Option<Status> {
        let contexts = self.registry.contexts.borrow();
        lookup(&contexts, context).map(|state| state.status)
    }

    /// Context that receives control once [context] finishes, if it's bound.
    pub fn successor(&self, context: ContextId) -> Option<ContextId> {
        let contexts = self.registry.contexts.borrow();
        lookup(&contexts, context).and_then(|state| state.successor)
    }

    /// Allocates a new context slot, to be given something to run with [Scheduler::bind].
    pub fn capture(&self) -> ContextId {
        let mut contexts = self.registry.contexts.borrow_mut();
        let generation = self.registry.next_generation.get();
        self.registry.next_generation.set(generation + 1);

        ContextId {
            index: contexts.insert(ContextState::captured(generation)),
            generation,
        }
    }

    /// Makes [context] switch-able: switching to it runs [entry] on [stack],
    /// and once [entry] returns, control moves to [successor].
    ///
    /// Only captured or finished contexts can be bound.
    pub fn bind<F>(&self, context: ContextId, stack: Stack, entry: F, successor: ContextId) -> crate::Result<()>
    where
        F: FnOnce(Scheduler) -> crate::Result<()> + 'static,
    {
        if stack.len() < MIN_STACK_SIZE {
            return Err(Error::InvalidParameter("stack is smaller than MIN_STACK_SIZE"));
        }

        if context == successor {
            return Err(Error::InvalidParameter("context can't be its own successor"));
        }

        let mut contexts = self.registry.contexts.borrow_mut();

        if lookup(&contexts, successor).is_none() {
            return Err(Error::InvalidContext {
                context: successor,
                reason: "unknown successor",
            });
        }

        if context == self.registry.main {
            return Err(Error::InvalidContext {
                context,
                reason: "main context runs on the thread's stack",
            });
        }

        let state = lookup_mut(&mut contexts, context).ok_or(Error::InvalidContext {
            context,
            reason: "unknown context",
        })?;

        match state.status {
            Status::Captured | Status::Finished => {}
            Status::Bound => {
                return Err(Error::InvalidContext {
                    context,
                    reason: "context is already bound",
                })
            }
            Status::Running | Status::Suspended => {
                return Err(Error::InvalidContext {
                    context,
                    reason: "context is still executing",
                })
            }
        }

        // the registry outlives any context that's running, see trampoline
        let argument = Rc::as_ptr(&self.registry) as *const ();
        state.continuation = unsafe { context_switch::prepare_stack(stack.base(), trampoline, argument) };
        state.status = Status::Bound;
        state.stack = Some(stack); // previous stack is dropped, nothing runs on a finished stack
        state.entry = Some(Box::new(entry));
        state.successor = Some(successor);

        Ok(())
    }

    /// Suspends [from] and transfers control to [to].
    ///
    /// Returns once some later switch (or a finishing context) hands control back to [from].
    /// An error returned by an entry function that finished into [from] is returned from here,
    /// a panic is resumed from here.
    pub fn switch(&self, from: ContextId, to: ContextId) -> crate::Result<()> {
        if self.registry.running.get() != from {
            return Err(Error::InvalidContext {
                context: from,
                reason: "context isn't running",
            });
        }

        if from == to {
            return Ok(());
        }

        let (from_continuation, to_continuation) = {
            let mut contexts = self.registry.contexts.borrow_mut();

            let (current, next) = lookup2_mut(&mut contexts, from, to).ok_or(Error::InvalidContext {
                context: to,
                reason: "unknown context",
            })?;
            check_enterable(to, next.status)?;
            debug_assert!(!next.continuation.is_empty());

            current.status = Status::Suspended;
            next.status = Status::Running;
            self.registry.running.set(to);

            (
                &mut current.continuation as *mut context_switch::Continuation,
                &next.continuation as *const context_switch::Continuation,
            )
        };

        // resumes once some context switches back
        unsafe { context_switch::jump(from_continuation, to_continuation) };

        match self.registry.failure.take() {
            None => Ok(()),
            Some(Failure::Errored(error)) => Err(error),
            Some(Failure::Panicked(payload)) => panic::resume_unwind(payload),
        }
    }

    /// Frees a context slot that isn't executing, handing back its stack for reuse.
    pub fn release(&self, context: ContextId) -> crate::Result<Option<Stack>> {
        let mut contexts = self.registry.contexts.borrow_mut();

        if context == self.registry.main {
            return Err(Error::InvalidContext {
                context,
                reason: "main context can't be released",
            });
        }

        let state = lookup(&contexts, context).ok_or(Error::InvalidContext {
            context,
            reason: "unknown context",
        })?;

        if matches!(state.status, Status::Running | Status::Suspended) {
            return Err(Error::InvalidContext {
                context,
                reason: "context is still executing",
            });
        }

        let awaited = contexts.iter().any(|(index, other)| {
            index != context.index
                && other.successor == Some(context)
                && matches!(other.status, Status::Bound | Status::Running | Status::Suspended)
        });
        if awaited {
            return Err(Error::InvalidContext {
                context,
                reason: "context is the successor of an unfinished context",
            });
        }

        Ok(contexts.remove(context.index).stack)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let contexts = self.registry.contexts.borrow();
        f.debug_struct("Scheduler")
            .field("main", &self.registry.main)
            .field("running", &self.registry.running.get())
            .field("contexts", &contexts.len())
            .finish()
    }
}

/// First (and only) frame on a bound context's stack.
extern "C" fn trampoline(argument: *const ()) -> ! {
    // the context that switched here is suspended inside a method of a live Scheduler
    let scheduler = unsafe {
        let registry = argument as *const Registry;
        Rc::increment_strong_count(registry);
        Scheduler {
            registry: Rc::from_raw(registry),
        }
    };

    let outcome = match scheduler.registry.failure.take() {
        Some(failure) => Err(failure), // predecessor failed, pass it along
        None => {
            let entry = scheduler.registry.take_entry();
            let handle = scheduler.clone();
            let result = panic::catch_unwind(panic::AssertUnwindSafe(move || match entry {
                Some(entry) => entry(handle),
                None => Ok(()),
            }));

            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(Failure::Errored(error)),
                Err(payload) => Err(Failure::Panicked(payload)),
            }
        }
    };

    let transfer = scheduler.registry.finish(outcome);
    drop(scheduler); // this stack is never resumed

    match transfer {
        Ok((from, to)) => unsafe { context_switch::jump(from, to) },
        Err(error) => {
            eprintln!("coswitch: can't resume successor: {error}");
            process::abort();
        }
    }

    unreachable!()
}
