//! `spindle sleep-accuracy`: lateness of concurrent coroutine sleeps.

use anyhow::Context;
use crossbeam::channel;
use spindle::{coroutine, Resume, Scheduler, Step, TICKS_PER_MILLISECOND};

pub fn execute(scheduler: &Scheduler, count: usize, millis: u64) -> anyhow::Result<()> {
    let (tx, rx) = channel::unbounded();

    let futures: Vec<_> = (0..count)
        .map(|_| {
            let handle = scheduler.handle();
            let tx = tx.clone();
            let mut deadline = None;
            scheduler.spawn(coroutine(move |resume: Resume| {
                let Some(wake_at) = deadline else {
                    let wake_at = handle.time_source().now() + millis * TICKS_PER_MILLISECOND;
                    deadline = Some(wake_at);
                    return Ok(Step::await_future(&handle.sleep_until(wake_at)));
                };
                resume.take::<()>()?;
                let late = handle.time_source().now().saturating_sub(wake_at);
                // The receiver outlives every task, so a send cannot fail here
                let _ = tx.send(late);
                Ok(Step::Return(late))
            }))
        })
        .collect();
    drop(tx);

    for future in &futures {
        scheduler.wait_for(future).context("sleep task failed")?;
    }

    let samples: Vec<u64> = rx.try_iter().collect();
    let (mean, max) = super::summarize(&samples);
    println!("Sleeps:        {} x {}ms", samples.len(), millis);
    println!("Mean lateness: {:.1}us", mean);
    println!("Max lateness:  {:.1}us", max);
    Ok(())
}
