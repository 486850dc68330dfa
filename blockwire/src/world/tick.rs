//! Scheduled block updates and entity ticking.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::io;

use crossbeam_channel::{RecvTimeoutError, Sender};
use glam::IVec3;

use tracing::{trace, warn};

use crate::entity::EntityStatus;

use super::{World, WorldError};


/// The duration of a world tick, 20 ticks per second.
pub const TICK_DURATION: Duration = Duration::from_millis(50);


/// A block update scheduled at a given time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledUpdate {
    pub time: Instant,
    pub pos: IVec3,
}

impl World {

    /// Schedule a block update at the given position, the update is dropped and false
    /// is returned if the time is not strictly in the future.
    pub fn schedule_block_update(&self, time: Instant, pos: IVec3) -> bool {
        if time <= Instant::now() {
            return false;
        }
        self.pending.lock().expect("poisoned").push(ScheduledUpdate { time, pos });
        true
    }

    /// Return true if an update is pending at the given position.
    pub fn update_pending(&self, pos: IVec3) -> bool {
        self.pending.lock().expect("poisoned").iter().any(|update| update.pos == pos)
    }

    /// Number of pending updates.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("poisoned").len()
    }

    /// Run every scheduled update that is due now, see [`Self::do_scheduled_updates_at`].
    pub fn do_scheduled_updates(&self) -> usize {
        self.do_scheduled_updates_at(Instant::now())
    }

    /// Run every scheduled update due at the given instant, each fires the scheduled
    /// tick of the block at its position exactly once and is removed. Updates are 
    /// removed before firing, so that behaviors can schedule new ones. Returns the 
    /// number of updates fired.
    pub fn do_scheduled_updates_at(&self, now: Instant) -> usize {

        let due: Vec<ScheduledUpdate> = {
            let mut pending = self.pending.lock().expect("poisoned");
            let (due, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|update| update.time <= now);
            *pending = kept;
            due
        };

        for update in &due {
            if let Err(e) = self.fire_scheduled_update(update.pos) {
                warn!("scheduled update at {} failed: {e}", update.pos);
            }
        }

        due.len()

    }

    fn fire_scheduled_update(&self, pos: IVec3) -> Result<(), WorldError> {
        let block = self.safe_get_block(pos)?;
        if let Some(behavior) = self.behaviors.get(block.id) {
            behavior.scheduled_tick(self, pos)?;
        }
        Ok(())
    }

    /// Run one physics update on every entity, in spawn order. The entity list is 
    /// snapshotted first, so entities spawned during this tick are only updated on 
    /// the next one and entities removed during this tick are still updated once.
    pub fn tick_entities(&self) {

        let entities = self.entities.lock().expect("poisoned")
            .iter()
            .map(|(&id, entity)| (id, Arc::clone(entity)))
            .collect::<Vec<_>>();

        for (id, entity) in entities {
            let status = entity.lock().expect("poisoned").physics_update(self);
            match status {
                Ok(EntityStatus::Alive) => {}
                Ok(EntityStatus::Dead) => {
                    self.remove_entity(id);
                }
                Err(e) => warn!("entity #{id} physics update failed: {e}"),
            }
        }

    }

    /// Start an independent thread ticking entities of this world at the given 
    /// period. The thread stops when the returned handle is dropped or when the 
    /// world is dropped.
    pub fn start_entity_ticker(self: &Arc<Self>, period: Duration) -> io::Result<EntityTicker> {

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let world = Arc::downgrade(self);

        let thread = thread::Builder::new()
            .name("entity-ticker".to_string())
            .spawn(move || run_entity_ticker(world, period, stop_rx))?;

        Ok(EntityTicker {
            stop: Some(stop_tx),
            thread: Some(thread),
        })

    }

}


fn run_entity_ticker(world: Weak<World>, period: Duration, stop: crossbeam_channel::Receiver<()>) {
    
    trace!("entity ticker started");
    let mut next = Instant::now() + period;

    loop {

        match stop.recv_timeout(next.saturating_duration_since(Instant::now())) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        let Some(world) = world.upgrade() else { break };
        world.tick_entities();
        drop(world);

        next += period;
        let now = Instant::now();
        if next < now {
            // Skip missed ticks instead of catching up.
            next = now + period;
        }

    }

    trace!("entity ticker stopped");

}


/// Handle to a running entity ticker, dropping it stops the ticker and waits for it.
#[derive(Debug)]
pub struct EntityTicker {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EntityTicker {

    /// Return true if the ticker thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

}

impl Drop for EntityTicker {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
