//! Batch Scheduler Module
//!
//! Runs the two periodic triggers as background tasks and restarts them when
//! the configuration is reloaded.

use super::clock::instant_after;
use super::{trigger, BatchClock};
use crate::batch::BatchingEngine;
use crate::config::BatchConfig;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Batch scheduler
///
/// Owns the timeout and threshold tasks. The timeout task sleeps until the
/// shared clock's deadline, so any reset of the clock postpones it.
///
/// Each firing runs in its own task. Stopping the loops therefore never
/// cancels an execution that is already talking to the gateway.
pub struct Scheduler {
    engine: Arc<BatchingEngine>,
    clock: Arc<BatchClock>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(engine: Arc<BatchingEngine>, clock: Arc<BatchClock>) -> Self {
        Self {
            engine,
            clock,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start both triggers, replacing any running ones.
    pub fn start(&self, config: &BatchConfig) {
        self.stop();
        self.clock.reconfigure(config.timeout_period());

        let mut tasks = Vec::new();
        match self.spawn_timeout_task(config) {
            Some(task) => tasks.push(task),
            None => warn!("Batch timeout is zero, timeout trigger disabled"),
        }
        match self.spawn_threshold_task(config) {
            Some(task) => tasks.push(task),
            None => warn!("Threshold check period is zero, threshold trigger disabled"),
        }

        info!(
            "Scheduler started: timeout {} min, threshold {} checked every {} min",
            config.timeout_minutes, config.threshold_amount, config.check_threshold_minutes
        );
        *self.tasks.lock().unwrap_or_else(|p| p.into_inner()) = tasks;
    }

    /// Apply new periods and threshold; the batch window restarts.
    pub fn reconfigure(&self, config: &BatchConfig) {
        info!("Scheduler reconfiguring");
        self.start(config);
    }

    /// Stop both trigger loops. An execution already started runs to completion.
    pub fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            task.abort();
        }
    }

    /// Seconds until the timeout trigger fires.
    pub fn time_left_secs(&self) -> i64 {
        self.clock.time_left_secs()
    }

    fn spawn_timeout_task(&self, config: &BatchConfig) -> Option<JoinHandle<()>> {
        if config.timeout_period().is_zero() {
            return None;
        }
        let engine = self.engine.clone();
        let clock = self.clock.clone();
        let conf_target = config.conf_target;

        Some(tokio::spawn(async move {
            loop {
                sleep_until(clock.deadline()).await;
                // The clock may have been reset while sleeping
                if clock.deadline() > Instant::now() {
                    continue;
                }
                let (engine, clock) = (engine.clone(), clock.clone());
                let firing = tokio::spawn(async move {
                    trigger::on_timeout(&engine, &clock, conf_target).await;
                });
                if let Err(e) = firing.await {
                    warn!("Timeout trigger task failed: {}", e);
                }
            }
        }))
    }

    fn spawn_threshold_task(&self, config: &BatchConfig) -> Option<JoinHandle<()>> {
        let period = config.check_threshold_period();
        if period.is_zero() {
            return None;
        }
        let engine = self.engine.clone();
        let clock = self.clock.clone();
        let threshold = config.threshold_amount;
        let conf_target = config.conf_target;

        Some(tokio::spawn(async move {
            let mut ticker = interval_at(instant_after(period), period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (engine, clock) = (engine.clone(), clock.clone());
                let firing = tokio::spawn(async move {
                    trigger::on_threshold_check(&engine, &clock, threshold, conf_target).await;
                });
                if let Err(e) = firing.await {
                    warn!("Threshold trigger task failed: {}", e);
                }
            }
        }))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
