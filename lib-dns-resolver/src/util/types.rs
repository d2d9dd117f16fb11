use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use dns_types::protocol::types::*;

/// An error that can occur when trying to resolve a domain.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ResolutionError {
    /// The query deadline elapsed and in-flight subqueries were abandoned.
    #[error("timed out")]
    Timeout,

    /// The referral walk used up its iteration budget.
    #[error("iteration budget exhausted")]
    MaxIterations,

    /// Every candidate nameserver failed or was unreachable.
    #[error("unable to answer '{question}'")]
    DeadEnd { question: Question },

    /// No source port could be leased for an outbound query.
    #[error("source port pool exhausted")]
    PoolExhausted,
}

/// The answer produced by a resolver, in whichever way it was produced.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedAnswer {
    pub rcode: Rcode,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl ResolvedAnswer {
    /// The TTL this answer may be cached for: the minimum TTL in the answer
    /// section, or an hour if the answer section is empty.
    pub fn cache_ttl(&self) -> u32 {
        self.answers
            .iter()
            .map(|rr| rr.ttl)
            .min()
            .unwrap_or(3600)
    }
}

/// A handle to a background task: cache cleanup, the rate limiter sweep,
/// cookie rotation, port-pool reaping.  The subsystem that launches a task
/// keeps its handle; shutdown signals every handle and joins them, so no
/// task outlives the server.
pub struct TaskHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn a task.  The closure receives a shutdown receiver; the task
    /// should finish promptly once it yields `true`.
    pub fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(task(receiver));
        Self { shutdown, handle }
    }

    /// Signal shutdown and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Merge two sets of RRs, keeping a record from the second set only if the
/// first has no records of the same (name, type).  The first set overrides
/// the second.
pub fn prioritising_merge(priority: &mut Vec<ResourceRecord>, new: Vec<ResourceRecord>) {
    let mut seen = std::collections::HashSet::new();

    for rr in priority.iter() {
        seen.insert((rr.name.clone(), rr.rtype_with_data.rtype()));
    }

    for rr in new {
        if !seen.contains(&(rr.name.clone(), rr.rtype_with_data.rtype())) {
            priority.push(rr);
        }
    }
}
