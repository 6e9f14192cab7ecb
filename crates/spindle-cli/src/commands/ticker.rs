//! `spindle ticker`: drift of a periodic clock.

use anyhow::Context;
use spindle::Scheduler;
use std::time::Duration;

pub fn execute(scheduler: &Scheduler, interval_ms: u64, ticks: u32) -> anyhow::Result<()> {
    anyhow::ensure!(interval_ms > 0, "interval must be at least 1ms");

    let ticker = scheduler.create_clock(Duration::from_millis(interval_ms));
    let time = scheduler.time_source();
    let start = time.now();

    let mut drift = Vec::with_capacity(ticks as usize);
    for k in 1..=u64::from(ticks) {
        scheduler
            .wait_for(&ticker.next_tick())
            .with_context(|| format!("tick {} failed", k))?;
        let boundary = start + k * ticker.interval();
        drift.push(time.now().saturating_sub(boundary));
    }

    let (mean, max) = super::summarize(&drift);
    println!("Ticks:      {} (counted {})", ticks, ticker.ticks());
    println!("Interval:   {}ms", interval_ms);
    println!("Mean drift: {:.1}us", mean);
    println!("Max drift:  {:.1}us", max);
    Ok(())
}
