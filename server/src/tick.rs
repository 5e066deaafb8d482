//! Fixed-rate simulation loop
//!
//! Every tick drains the command queue, steps the [`World`], pushes the
//! snapshot datagrams onto the shared UDP queue and then sleeps for whatever
//! is left of the tick budget. Ticks are never skipped: an overrun only
//! shortens the next sleep to zero and raises an alert.

use crate::address::UdpOutbound;
use crate::game::{GameCommand, World, WorldEvent};
use crate::services::AchievementSink;
use crate::session_manager::SessionManager;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAlert {
    /// First over-budget tick of a streak.
    Overrun { elapsed: Duration, interval: Duration },
    /// First tick back under budget after a streak.
    Resynchronized,
}

/// Edge-triggered overrun detector.
#[derive(Debug, Default)]
pub struct KeepUpMonitor {
    behind: bool,
}

impl KeepUpMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_behind(&self) -> bool {
        self.behind
    }

    /// Records how long a tick took and returns an alert when the server
    /// starts or stops falling behind.
    pub fn record(&mut self, elapsed: Duration, interval: Duration) -> Option<TickAlert> {
        let over = elapsed > interval;
        match (self.behind, over) {
            (false, true) => {
                self.behind = true;
                Some(TickAlert::Overrun { elapsed, interval })
            }
            (true, false) => {
                self.behind = false;
                Some(TickAlert::Resynchronized)
            }
            _ => None,
        }
    }
}

/// Everything the tick task needs besides the world itself.
pub struct TickLoop {
    pub world: World,
    pub commands: mpsc::Receiver<GameCommand>,
    pub sessions: Arc<RwLock<SessionManager>>,
    pub udp_queue: mpsc::Sender<UdpOutbound>,
    pub achievements: Arc<dyn AchievementSink>,
    pub interval: Duration,
}

impl TickLoop {
    /// Runs until every command sender is gone.
    pub async fn run(mut self) {
        let mut monitor = KeepUpMonitor::new();
        info!(
            "Simulation running at one tick every {}ms",
            self.interval.as_millis()
        );

        loop {
            let started = Instant::now();
            let open = self.step(started).await;

            let elapsed = started.elapsed();
            match monitor.record(elapsed, self.interval) {
                Some(TickAlert::Overrun { elapsed, interval }) => warn!(
                    "Server can't keep up! Tick took {}ms, budget is {}ms",
                    elapsed.as_millis(),
                    interval.as_millis()
                ),
                Some(TickAlert::Resynchronized) => info!("Server is synchronized again"),
                None => {}
            }

            if !open {
                info!("Command queue closed, stopping simulation");
                return;
            }
            tokio::time::sleep(self.interval.saturating_sub(elapsed)).await;
        }
    }

    /// Runs one tick. Returns false once the command queue is closed.
    pub async fn step(&mut self, now: Instant) -> bool {
        let mut open = true;
        let mut events = Vec::new();
        loop {
            match self.commands.try_recv() {
                Ok(command) => events.extend(self.world.apply_command(command, now)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    open = false;
                    break;
                }
            }
        }

        let outbound = self.world.tick(now);
        let mut dropped = 0;
        for datagram in outbound {
            if self.udp_queue.try_send(datagram).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("UDP queue full, dropped {} snapshot datagrams", dropped);
        }

        self.deliver(events).await;
        open
    }

    async fn deliver(&self, events: Vec<WorldEvent>) {
        if events.is_empty() {
            return;
        }
        let sessions = self.sessions.read().await;
        for event in events {
            match event {
                WorldEvent::Reply { slot, packet } => match sessions.get(slot) {
                    Some(session) => {
                        if session.tcp_tx.try_send(packet).is_err() {
                            debug!("Control queue of slot {} unavailable, reply dropped", slot);
                        }
                    }
                    None => debug!("Reply for released slot {}", slot),
                },
                WorldEvent::Achievement(unlock) => {
                    self.achievements.unlock(&unlock.account, unlock.id)
                }
            }
        }
    }
}
