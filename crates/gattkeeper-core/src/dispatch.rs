//! Event delivery: inline on the update worker, or posted to a dedicated
//! dispatch task.
//!
//! With `post_callbacks_to_main_thread` set (the default) every delivery
//! is forwarded through one ordered channel to a spawned dispatch task, so
//! listener channels are filled off the update worker and a slow consumer
//! cannot perturb tick timing. The OTA preset disables posting to cut the
//! extra hop.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type DispatchJob = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
enum Mode {
    Inline,
    Posted(mpsc::UnboundedSender<DispatchJob>),
}

/// Delivers resolved events to listener channels.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    mode: Mode,
}

impl Dispatcher {
    /// Create a dispatcher. When `posted` is set, a forwarder task is
    /// spawned and lives until the token is cancelled.
    pub(crate) fn new(posted: bool, cancel: CancellationToken) -> Self {
        if !posted {
            return Dispatcher { mode: Mode::Inline };
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchJob>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("event dispatcher stopping");
                        break;
                    }
                    job = rx.recv() => match job {
                        Some(job) => job(),
                        None => break,
                    },
                }
            }
        });
        Dispatcher {
            mode: Mode::Posted(tx),
        }
    }

    /// Run a delivery job now (inline) or in order on the dispatch task
    /// (posted). Jobs for a given listener run in submission order either
    /// way.
    pub(crate) fn run(&self, job: impl FnOnce() + Send + 'static) {
        match &self.mode {
            Mode::Inline => job(),
            Mode::Posted(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    // Dispatch task is gone (shutdown); deliveries are
                    // dropped with it.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_inline_runs_immediately() {
        let dispatcher = Dispatcher::new(false, CancellationToken::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        dispatcher.run(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_posted_preserves_order() {
        let dispatcher = Dispatcher::new(true, CancellationToken::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..10 {
            let tx = tx.clone();
            dispatcher.run(move || {
                let _ = tx.send(i);
            });
        }
        for expected in 0..10 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }
}
