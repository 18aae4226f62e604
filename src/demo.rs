//! Three contexts handing control back and forth.
//!
//! Worker1 hands off to Worker2, which hands straight back. Worker1 then finishes into Worker2,
//! and Worker2 finishes into main.

use std::cell::RefCell;
use std::rc::Rc;

use crate::runtime::{Scheduler, Stack, DEFAULT_STACK_SIZE};

/// Runs the scenario to completion, passing each trace line to [trace] as it happens.
pub fn run(trace: impl FnMut(&str) + 'static) -> crate::Result<()> {
    let trace = Rc::new(RefCell::new(trace));
    let emit = move |line: &str| (*trace.borrow_mut())(line);

    let scheduler = Scheduler::new();
    let main = scheduler.main();
    let worker1 = scheduler.capture();
    let worker2 = scheduler.capture();

    let first = emit.clone();
    scheduler.bind(
        worker1,
        Stack::new(DEFAULT_STACK_SIZE)?,
        move |scheduler| {
            first("Worker1 start");
            scheduler.switch(worker1, worker2)?;
            first("Worker1 end");
            Ok(())
        },
        worker2,
    )?;

    let second = emit.clone();
    scheduler.bind(
        worker2,
        Stack::new(DEFAULT_STACK_SIZE)?,
        move |scheduler| {
            second("Worker2 start");
            scheduler.switch(worker2, worker1)?;
            second("Worker2 end");
            Ok(())
        },
        main,
    )?;

    scheduler.switch(main, worker1)?;
    emit("main end");

    Ok(())
}
