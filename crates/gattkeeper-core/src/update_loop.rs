//! The update worker.
//!
//! One spawned task owns the [`Engine`](crate::engine::Engine) and drives
//! it at the configured tick rate. Each tick drains the mailbox (native
//! callbacks and posted closures), advances the scheduler, and flushes
//! events. Commands arriving between ticks wait in the mailbox; nothing
//! is processed inline on a caller's thread.

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{Command, Engine};

pub(crate) async fn run(
    mut engine: Engine,
    mut rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(engine.config.auto_update_rate);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();

    debug!(rate = ?engine.config.auto_update_rate, "update loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                engine.shutdown();
                break;
            }
            _ = interval.tick() => {
                // Drain everything that arrived since the last tick.
                while let Ok(cmd) = rx.try_recv() {
                    engine.handle_command(cmd);
                }
                let now = Instant::now();
                let dt = now.saturating_duration_since(last);
                last = now;
                engine.tick(now, dt);
                engine.flush_events();
            }
        }
    }
    debug!("update loop stopped");
}
