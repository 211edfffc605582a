//! Job scheduler (§5 "Scheduling model", Design Notes "Scheduler +
//! cooperative tasks"): a trivial driver over `(name, interval, handler)`
//! records, with `max_instances = 1` per job — if a prior invocation is
//! still running when its next tick fires, the tick is skipped rather than
//! queued. No general-purpose scheduler crate is used.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Job {
    name: &'static str,
    interval: Box<dyn Fn() -> Duration + Send + Sync>,
    handler: JobFn,
    running: Arc<AtomicBool>,
}

/// A list of periodic jobs plus a ticker per job and a shutdown broadcast.
pub struct Scheduler {
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Registers a job with a fixed interval.
    pub fn add<F, Fut>(&mut self, name: &'static str, interval: Duration, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_dynamic(name, move || interval, handler);
    }

    /// Registers a job whose interval is re-read on every tick — used by the
    /// block scanner, whose interval collapses to zero in catch-up mode
    /// (§4.5 "Back-pressure").
    pub fn add_dynamic<F, Fut, I>(&mut self, name: &'static str, interval: I, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        I: Fn() -> Duration + Send + Sync + 'static,
    {
        self.jobs.push(Job {
            name,
            interval: Box::new(interval),
            handler: Arc::new(move || Box::pin(handler())),
            running: Arc::new(AtomicBool::new(false)),
        });
    }

    /// Runs every registered job concurrently until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::new();
        for job in self.jobs {
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let wait = (job.interval)();
                    tokio::select! {
                        _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    if job.running.swap(true, Ordering::SeqCst) {
                        tracing::debug!(job = job.name, "tick skipped: previous run still in flight");
                        continue;
                    }
                    let running = job.running.clone();
                    let handler = job.handler.clone();
                    let name = job.name;
                    tracing::debug!(job = name, "tick");
                    (handler)().await;
                    running.store(false, Ordering::SeqCst);
                }
            }));
        }
        let _ = shutdown.changed().await;
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn max_instances_one_skips_overlapping_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        let count2 = count.clone();
        scheduler.add("slow", Duration::from_millis(5), move || {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        let _ = handle.await;
        // Ticks fire every 5ms but each run takes 50ms, so far fewer than
        // 12 invocations should have actually started.
        assert!(count.load(Ordering::SeqCst) < 5);
    }
}
