use std::cmp::min;
use std::collections::VecDeque;
use std::fmt;

use tracing::debug;

/// A contiguous range of heights handed to a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Job {
    pub(crate) kind: JobKind,
    pub(crate) from: u64,
    pub(crate) to: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    /// Historical backfill, including ranges resumed from a checkpoint.
    Catchup,
    /// Heights announced while the node is running.
    Priority,
    /// A single height that failed in a previous run.
    Retry,
}

impl Job {
    pub(crate) fn catchup(from: u64, to: u64) -> Job {
        Job {
            kind: JobKind::Catchup,
            from,
            to,
        }
    }

    pub(crate) fn priority(from: u64, to: u64) -> Job {
        Job {
            kind: JobKind::Priority,
            from,
            to,
        }
    }

    pub(crate) fn retry(height: u64) -> Job {
        Job {
            kind: JobKind::Retry,
            from: height,
            to: height,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} [{}..{}]", self.kind, self.from, self.to)
    }
}

/// Bounded stack of jobs.
///
/// The top of the stack is served first, so later pushes win over earlier
/// ones. When full, the oldest entry at the bottom is dropped.
#[derive(Debug)]
pub(crate) struct PriorityStack {
    jobs: VecDeque<Job>,
    capacity: usize,
}

impl PriorityStack {
    pub(crate) fn new(capacity: usize) -> PriorityStack {
        PriorityStack {
            jobs: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, job: Job) {
        if self.jobs.len() == self.capacity {
            if let Some(dropped) = self.jobs.pop_front() {
                debug!("priority queue full, dropping oldest job {dropped}");
            }
        }
        self.jobs.push_back(job);
    }

    pub(crate) fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_back()
    }

    /// Splits `[from..to]` into `bucket`-sized jobs and pushes them so that
    /// the bucket with the highest heights ends up on top of the stack.
    pub(crate) fn push_stack(&mut self, from: u64, to: u64, bucket: u64) {
        let mut start = from;

        while start <= to {
            let end = min(start + bucket - 1, to);
            self.push(Job::priority(start, end));
            start = end + 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
