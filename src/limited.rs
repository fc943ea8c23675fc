//! Runner layer enforcing the global parallelism cap (-j) and the load
//! average ceiling (-l).

use crate::runner::{CommandRunner, OnDone};

pub struct LimitedRunner<R> {
    inner: R,
    parallelism: usize,
    max_load_average: f64,
    load_fn: Box<dyn Fn() -> f64>,
}

impl<R> LimitedRunner<R> {
    pub fn new(inner: R, parallelism: usize, max_load_average: f64) -> Self {
        Self::with_load_fn(
            inner,
            parallelism,
            max_load_average,
            Box::new(current_load_average),
        )
    }

    pub fn with_load_fn(
        inner: R,
        parallelism: usize,
        max_load_average: f64,
        load_fn: Box<dyn Fn() -> f64>,
    ) -> Self {
        LimitedRunner {
            inner,
            parallelism,
            max_load_average,
            load_fn,
        }
    }
}

impl<R: CommandRunner> CommandRunner for LimitedRunner<R> {
    fn invoke(&mut self, command: &str, pool: &str, on_done: OnDone) {
        self.inner.invoke(command, pool, on_done);
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn can_run_more(&self) -> bool {
        if self.inner.size() >= self.parallelism {
            return false;
        }
        if self.max_load_average > 0.0 && (self.load_fn)() > self.max_load_average {
            return false;
        }
        self.inner.can_run_more()
    }

    fn run_commands(&mut self) -> bool {
        self.inner.run_commands()
    }
}

/// The one-minute load average, or 0 when the system will not say.
pub fn current_load_average() -> f64 {
    let mut avg: f64 = 0.0;
    let got = unsafe { libc::getloadavg(&mut avg, 1) };
    if got == 1 {
        avg
    } else {
        0.0
    }
}
