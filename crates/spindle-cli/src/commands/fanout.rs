//! `spindle fanout`: throughput of nested child task chains.

use anyhow::Context;
use spindle::{Coroutine, Resume, Scheduler, Step};
use std::time::Instant;

/// Spawns a child chain one level shallower and returns its depth plus one
struct Chain {
    depth: u32,
    spawned: bool,
}

impl Coroutine for Chain {
    type Output = u32;

    fn resume(&mut self, input: Resume) -> Step<u32> {
        if self.depth == 0 {
            return Step::Return(0);
        }
        if !self.spawned {
            self.spawned = true;
            return Step::spawn(Chain {
                depth: self.depth - 1,
                spawned: false,
            });
        }
        match input.take::<u32>() {
            Ok(child) => Step::Return(child + 1),
            Err(e) => Step::Fault(e),
        }
    }
}

pub fn execute(scheduler: &Scheduler, tasks: usize, depth: u32) -> anyhow::Result<()> {
    let start = Instant::now();
    let futures: Vec<_> = (0..tasks)
        .map(|_| scheduler.spawn(Chain { depth, spawned: false }))
        .collect();

    for future in &futures {
        let reached = scheduler.wait_for(future).context("chain task failed")?;
        anyhow::ensure!(reached == depth, "chain reached depth {} instead of {}", reached, depth);
    }
    let elapsed = start.elapsed();

    let stats = scheduler.stats();
    let per_sec = stats.tasks_started as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!("Tasks started: {}", stats.tasks_started);
    println!("Completed:     {}", stats.tasks_completed);
    println!("Failed:        {}", stats.tasks_failed);
    println!("Elapsed:       {:.2?}", elapsed);
    println!("Throughput:    {:.0} tasks/s", per_sec);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_reaches_depth() {
        let scheduler = Scheduler::inline();
        let depth = scheduler.wait_for_task(Chain { depth: 6, spawned: false });
        assert_eq!(depth.unwrap(), 6);
        assert_eq!(scheduler.stats().tasks_started, 7);
    }
}
