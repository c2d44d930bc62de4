//! Time-driven lifecycle transitions.
//!
//! A sweep redelivers tasks abandoned by dead workers, fixes the cleanup time
//! of workshops that have ended, enqueues cleanups that are due and queues
//! teardown of workspaces nobody owns any more. The sweep itself never runs
//! the infrastructure tool. Every step is idempotent, so running a sweep
//! twice in a row does no extra work.

use crate::attendee::AttendeeStatus;
use crate::broadcaster::StatusEvent;
use crate::locks::TargetKey;
use crate::orchestrator::Orchestrator;
use crate::store::StatusChange;
use crate::task::TargetKind;
use crate::workshop::{Workshop, WorkshopStatus};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub redelivered: u64,
    /// Workshops moved from active to completed.
    pub completed: Vec<String>,
    pub cleanups_scheduled: Vec<String>,
    pub cleanups_enqueued: usize,
    pub cleanups_merged: usize,
    pub workshops_cleaned: Vec<String>,
    /// Attendees whose leftover workspace was queued for teardown.
    pub orphan_teardowns: Vec<String>,
    pub errors: Vec<String>,
}

impl SweepSummary {
    /// Nothing was due. Not an error.
    pub fn is_noop(&self) -> bool {
        self.redelivered == 0
            && self.completed.is_empty()
            && self.cleanups_scheduled.is_empty()
            && self.cleanups_enqueued == 0
            && self.workshops_cleaned.is_empty()
            && self.orphan_teardowns.is_empty()
            && self.errors.is_empty()
    }
}

pub struct LifecycleScheduler {
    orchestrator: Orchestrator,
    interval: Duration,
}

impl LifecycleScheduler {
    pub fn new(orchestrator: Orchestrator, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Sweep immediately, then on every tick until `shutdown` turns true.
    ///
    /// Store failures are logged and retried on the next tick; the loop only
    /// ends on shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            "lifecycle scheduler running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("lifecycle scheduler stopped");
    }

    pub async fn sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        self.redeliver_stale_tasks(&mut summary).await;
        self.schedule_ended_workshops(&mut summary).await;
        self.enqueue_due_cleanups(&mut summary).await;
        if self.orchestrator.settings.prune_orphaned_workspaces {
            self.queue_orphan_teardowns(&mut summary).await;
        }

        if summary.is_noop() {
            debug!("lifecycle sweep found nothing due");
        } else {
            info!(
                redelivered = summary.redelivered,
                completed = summary.completed.len(),
                cleanups_scheduled = summary.cleanups_scheduled.len(),
                cleanups_enqueued = summary.cleanups_enqueued,
                cleanups_merged = summary.cleanups_merged,
                orphan_teardowns = summary.orphan_teardowns.len(),
                errors = summary.errors.len(),
                "lifecycle sweep finished"
            );
        }
        summary
    }

    async fn redeliver_stale_tasks(&self, summary: &mut SweepSummary) {
        let orch = &self.orchestrator;
        let now = orch.now();
        let cutoff = now - orch.settings.stale_task_after;

        match orch.store.requeue_running_tasks(cutoff, now).await {
            Ok(0) => {}
            Ok(count) => {
                warn!(count, "redelivered tasks abandoned by their worker");
                summary.redelivered = count;
                orch.wakeups.notify_all_queues();
            }
            Err(e) => record_error(summary, "redelivering stale tasks", e),
        }
    }

    async fn schedule_ended_workshops(&self, summary: &mut SweepSummary) {
        let orch = &self.orchestrator;
        let now = orch.now();

        let ended = match orch.store.ended_workshops_without_cleanup(now).await {
            Ok(ended) => ended,
            Err(e) => return record_error(summary, "listing ended workshops", e),
        };

        for workshop in ended {
            if let Err(e) = self.schedule_cleanup(&workshop, summary).await {
                record_error(summary, &format!("scheduling cleanup of {}", workshop.id), e);
            }
        }
    }

    async fn schedule_cleanup(
        &self,
        workshop: &Workshop,
        summary: &mut SweepSummary,
    ) -> crate::error::Result<()> {
        let orch = &self.orchestrator;
        let now = orch.now();
        let due = workshop.schedule.cleanup_due_at(orch.settings.cleanup_delay)?;

        if orch.store.set_cleanup_scheduled_at(&workshop.id, due, now).await? {
            info!(workshop_id = %workshop.id, cleanup_at = %due, "cleanup scheduled");
            summary.cleanups_scheduled.push(workshop.id.clone());
        }

        if workshop.status == WorkshopStatus::Active {
            let _guard = orch.locks.lock(TargetKey::workshop(&workshop.id)).await;
            let change = StatusChange::workshop(
                &workshop.id,
                WorkshopStatus::Active,
                WorkshopStatus::Completed,
            );
            if orch.store.apply_status_change(&change, now).await? {
                info!(workshop_id = %workshop.id, "workshop completed");
                orch.broadcaster.publish(StatusEvent::workshop(
                    &workshop.id,
                    WorkshopStatus::Completed,
                    now,
                ));
                summary.completed.push(workshop.id.clone());
            }
        }
        Ok(())
    }

    async fn enqueue_due_cleanups(&self, summary: &mut SweepSummary) {
        let orch = &self.orchestrator;

        let due = match orch.store.due_cleanup_workshops(orch.now()).await {
            Ok(due) => due,
            Err(e) => return record_error(summary, "listing due cleanups", e),
        };

        for workshop in due {
            match orch.submit_cleanup(&workshop.id).await {
                Ok(submission) => {
                    info!(
                        workshop_id = %workshop.id,
                        enqueued = submission.admitted.len(),
                        "scheduled cleanup enqueued"
                    );
                    summary.cleanups_enqueued += submission.admitted.len();
                    summary.cleanups_merged += submission.merged.len();
                    summary.workshops_cleaned.push(workshop.id);
                }
                Err(e) => {
                    let context = format!("enqueueing cleanup of {}", workshop.id);
                    record_error(summary, &context, e);
                }
            }
        }
    }

    async fn queue_orphan_teardowns(&self, summary: &mut SweepSummary) {
        let orch = &self.orchestrator;

        let candidates = match orch.engine.workspaces().attendee_ids() {
            Ok(ids) => ids,
            Err(e) => return record_error(summary, "listing workspaces", e),
        };

        for attendee_id in candidates {
            match self.is_orphan(&attendee_id).await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    record_error(summary, &format!("checking workspace of {}", attendee_id), e);
                    continue;
                }
            }

            match orch.dispatcher.submit_teardown(&attendee_id).await {
                Ok(admission) if admission.is_merged() => {
                    debug!(attendee_id = %attendee_id, "workspace teardown already in flight");
                }
                Ok(_) => summary.orphan_teardowns.push(attendee_id),
                Err(e) => {
                    let context = format!("queueing teardown of {}", attendee_id);
                    record_error(summary, &context, e);
                }
            }
        }
    }

    /// A workspace is orphaned when its attendee is gone or deleted and no
    /// task for it is in flight.
    async fn is_orphan(&self, attendee_id: &str) -> crate::error::Result<bool> {
        let store = &self.orchestrator.store;
        let owned = match store.get_attendee(attendee_id).await? {
            Some(attendee) => attendee.status != AttendeeStatus::Deleted,
            None => false,
        };
        if owned {
            return Ok(false);
        }
        Ok(store
            .active_task_for_target(TargetKind::Attendee, attendee_id)
            .await?
            .is_none())
    }
}

fn record_error(summary: &mut SweepSummary, context: &str, err: impl std::fmt::Display) {
    error!(error = %err, "lifecycle sweep failed while {}", context);
    summary.errors.push(format!("{}: {}", context, err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityStore;
    use crate::test_utils::TestHarness;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn completion_waits_for_the_workshop_lock() {
        let h = TestHarness::new().await;
        let (workshop, _) = h.workshop_with(&["anna"]).await;
        h.orchestrator.submit_deployment(&workshop.id).await.unwrap();
        h.drain().await;
        h.clock.set(Utc.with_ymd_and_hms(2025, 3, 10, 17, 0, 0).unwrap());

        let mut events = h.orchestrator.subscribe();
        let guard = h
            .orchestrator
            .locks
            .lock(TargetKey::workshop(&workshop.id))
            .await;
        let orchestrator = h.orchestrator.clone();
        let sweep =
            tokio::spawn(async move { orchestrator.process_due_lifecycle_events().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let held = h.store.get_workshop(&workshop.id).await.unwrap().unwrap();
        assert_eq!(held.status, WorkshopStatus::Active);
        assert!(events.try_recv().is_err());

        drop(guard);
        let summary = sweep.await.unwrap();
        assert_eq!(summary.completed, vec![workshop.id.clone()]);

        let event = events.try_recv().unwrap();
        assert_eq!(event.entity_id, workshop.id);
        assert_eq!(event.new_status, WorkshopStatus::Completed.to_string());
    }
}
