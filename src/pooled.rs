//! Runner layer enforcing named pool depths.
//!
//! A pool with depth d admits at most d commands at a time; the rest wait in
//! a FIFO queue and are handed to the inner runner as slots free up, so
//! commands within one pool always start in submission order.  The built-in
//! `console` pool has depth 1 no matter what the manifest declares.  The
//! unnamed pool and pools with depth 0 pass straight through.

use crate::runner::{CommandRunner, OnDone};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct PoolState {
    depth: usize,
    running: usize,
    queue: VecDeque<(String, OnDone)>,
}

#[derive(Default)]
struct PoolTable {
    pools: HashMap<String, PoolState>,
    /// Total queued across pools; counted into size().
    queued: usize,
    /// Commands whose slot freed up during the last inner turn, waiting to
    /// be handed down.
    unblocked: Vec<(String, String, OnDone)>,
}

pub struct PooledRunner<R> {
    inner: R,
    state: Rc<RefCell<PoolTable>>,
}

impl<R> PooledRunner<R> {
    pub fn new(inner: R, depths: &HashMap<String, u32>) -> Self {
        let mut table = PoolTable::default();
        for (name, &depth) in depths {
            if depth > 0 {
                table.pools.insert(
                    name.clone(),
                    PoolState {
                        depth: depth as usize,
                        running: 0,
                        queue: VecDeque::new(),
                    },
                );
            }
        }
        // The console is a real resource with capacity one.
        table.pools.insert(
            "console".to_owned(),
            PoolState {
                depth: 1,
                running: 0,
                queue: VecDeque::new(),
            },
        );
        PooledRunner {
            inner,
            state: Rc::new(RefCell::new(table)),
        }
    }
}

enum Admission {
    Unlimited,
    Run,
    Queue,
}

impl<R: CommandRunner> PooledRunner<R> {
    /// Hand a command to the inner runner.  The pool slot is already
    /// claimed; the wrapper returns it on completion and promotes the next
    /// queued command.
    fn submit(&mut self, pool: String, command: String, on_done: OnDone) {
        let state = Rc::clone(&self.state);
        let pool_for_inner = pool.clone();
        let wrapped: OnDone = Box::new(move |result| {
            {
                let mut table = state.borrow_mut();
                let next = {
                    let slot = table.pools.get_mut(&pool).expect("pool vanished");
                    slot.running -= 1;
                    slot.queue.pop_front()
                };
                if let Some((cmd, cb)) = next {
                    table.unblocked.push((pool.clone(), cmd, cb));
                }
            }
            on_done(result);
        });
        self.inner.invoke(&command, &pool_for_inner, wrapped);
    }
}

impl<R: CommandRunner> CommandRunner for PooledRunner<R> {
    fn invoke(&mut self, command: &str, pool: &str, on_done: OnDone) {
        let admission = {
            let mut table = self.state.borrow_mut();
            match table.pools.get_mut(pool) {
                None => Admission::Unlimited,
                Some(slot) if slot.running < slot.depth => {
                    slot.running += 1;
                    Admission::Run
                }
                Some(_) => Admission::Queue,
            }
        };
        match admission {
            Admission::Unlimited => self.inner.invoke(command, pool, on_done),
            Admission::Run => self.submit(pool.to_owned(), command.to_owned(), on_done),
            Admission::Queue => {
                let mut table = self.state.borrow_mut();
                table
                    .pools
                    .get_mut(pool)
                    .unwrap()
                    .queue
                    .push_back((command.to_owned(), on_done));
                table.queued += 1;
            }
        }
    }

    fn size(&self) -> usize {
        self.inner.size() + self.state.borrow().queued
    }

    fn can_run_more(&self) -> bool {
        self.inner.can_run_more()
    }

    fn run_commands(&mut self) -> bool {
        let interrupted = self.inner.run_commands();
        // Promote commands released by the completions that just ran.  A
        // promotion's own completion can release more, so loop until quiet.
        loop {
            let unblocked = std::mem::take(&mut self.state.borrow_mut().unblocked);
            if unblocked.is_empty() {
                break;
            }
            for (pool, command, on_done) in unblocked {
                {
                    let mut table = self.state.borrow_mut();
                    table.queued -= 1;
                    table.pools.get_mut(&pool).unwrap().running += 1;
                }
                self.submit(pool, command, on_done);
            }
        }
        interrupted
    }
}
