//! Periodic and on-demand sync scheduling.
//!
//! The scheduler ticks on a fixed interval, starts a run for every enabled
//! config whose interval has elapsed, and accepts manual triggers through a
//! bounded queue. At most one run per config is in flight in this process.
//! Each run executes in its own task; a panic inside it is caught at that
//! boundary and recorded as a failed run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tfmirror_schema::TriggeredBy;

use crate::sync::SyncOrchestrator;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("sync trigger queue is full")]
    QueueFull,

    #[error("scheduler is not running")]
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// How often due configs are looked up.
    pub tick: Duration,
    /// Pending manual triggers before [`TriggerError::QueueFull`].
    pub trigger_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            trigger_capacity: 16,
        }
    }
}

/// Cloneable handle for requesting manual runs.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Uuid>,
}

impl SchedulerHandle {
    /// Queue a manual run of `config_id`.
    pub fn trigger(&self, config_id: Uuid) -> Result<(), TriggerError> {
        self.tx.try_send(config_id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TriggerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TriggerError::Stopped,
        })
    }
}

type ActiveSet = Arc<Mutex<HashSet<Uuid>>>;

/// Removes a config from the active set when its run task ends, however it ends.
struct ActiveGuard {
    active: ActiveSet,
    config_id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.config_id);
    }
}

#[derive(Debug)]
pub struct Scheduler {
    dispatcher: Dispatcher,
    options: SchedulerOptions,
    triggers: mpsc::Receiver<Uuid>,
}

/// Starts supervised runs and tracks which configs are in flight.
#[derive(Debug)]
struct Dispatcher {
    orchestrator: SyncOrchestrator,
    active: ActiveSet,
}

impl Scheduler {
    pub fn new(orchestrator: SyncOrchestrator, options: SchedulerOptions) -> (Self, SchedulerHandle) {
        let (tx, triggers) = mpsc::channel(options.trigger_capacity.max(1));
        let scheduler = Self {
            dispatcher: Dispatcher {
                orchestrator,
                active: Arc::default(),
            },
            options,
            triggers,
        };
        (scheduler, SchedulerHandle { tx })
    }

    /// Run until `shutdown` fires, then cancel in-flight runs and wait for them.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            dispatcher,
            options,
            mut triggers,
        } = self;
        let mut interval = tokio::time::interval(options.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        tracing::info!(tick_secs = options.tick.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => dispatcher.dispatch_due(&mut tasks, &shutdown).await,
                Some(config_id) = triggers.recv() => {
                    dispatcher.spawn_run(&mut tasks, config_id, TriggeredBy::Manual, &shutdown);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "sync supervisor task failed");
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "scheduler stopping");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "sync supervisor task failed");
            }
        }
    }
}

impl Dispatcher {
    async fn dispatch_due(&self, tasks: &mut JoinSet<()>, shutdown: &CancellationToken) {
        let due = match self
            .orchestrator
            .store()
            .call(|db| db.configs_due(Utc::now()))
            .await
        {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load due mirror configs");
                return;
            }
        };
        for config in due {
            self.spawn_run(tasks, config.id, TriggeredBy::Scheduler, shutdown);
        }
    }

    /// Start a supervised run unless one is already active for the config.
    fn spawn_run(
        &self,
        tasks: &mut JoinSet<()>,
        config_id: Uuid,
        triggered_by: TriggeredBy,
        shutdown: &CancellationToken,
    ) {
        let inserted = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config_id);
        if !inserted {
            tracing::debug!(%config_id, %triggered_by, "sync already running, not starting another");
            return;
        }
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            config_id,
        };

        let orchestrator = self.orchestrator.clone();
        let cancel = shutdown.child_token();
        tasks.spawn(async move {
            let _guard = guard;
            let runner = orchestrator.clone();
            let run = tokio::spawn(async move { runner.run_sync(config_id, triggered_by, &cancel).await });

            let reason = match run.await {
                Ok(_) => return,
                Err(e) if e.is_panic() => {
                    format!("sync panicked: {}", panic_message(e.into_panic()))
                }
                Err(_) => "sync task aborted".to_string(),
            };
            tracing::error!(%config_id, reason, "sync run did not complete");
            if let Err(e) = orchestrator.record_abandoned_run(config_id, reason).await {
                tracing::error!(%config_id, error = %e, "failed to record abandoned run");
            }
        });
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_queue_is_bounded() {
        let (tx, _rx) = mpsc::channel(2);
        let handle = SchedulerHandle { tx };
        let id = Uuid::new_v4();
        assert_eq!(handle.trigger(id), Ok(()));
        assert_eq!(handle.trigger(id), Ok(()));
        assert_eq!(handle.trigger(id), Err(TriggerError::QueueFull));
    }

    #[tokio::test]
    async fn test_trigger_after_stop() {
        let (tx, rx) = mpsc::channel(2);
        let handle = SchedulerHandle { tx };
        drop(rx);
        assert_eq!(handle.trigger(Uuid::new_v4()), Err(TriggerError::Stopped));
    }

    #[test]
    fn test_active_guard_releases_on_drop() {
        let active: ActiveSet = Arc::default();
        let id = Uuid::new_v4();
        active.lock().unwrap().insert(id);
        drop(ActiveGuard {
            active: Arc::clone(&active),
            config_id: id,
        });
        assert!(active.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panic_message_extracts_payload() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic payload");
    }
}
