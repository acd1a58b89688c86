//! Periodic notification tasks.
//!
//! One task per enabled characteristic family samples the shared
//! [`SimulatorState`], encodes the reading and notifies it through the
//! peripheral. A further task applies accepted control point commands to the
//! simulator. Tasks run until [`NotificationDispatcher::shutdown`] or drop.

use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        RwLock,
    },
    task::JoinHandle,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    noise::NoiseModel,
    peripheral::FitnessPeripheral,
    protocol::{encode_cycling_power_measurement, encode_indoor_bike_data, encode_rsc_measurement},
    simulator::{CyclingPowerFeed, SimulatorState},
    types::{CyclingPowerMode, DomainEvent, SensorReading},
    CYCLING_POWER_MEASUREMENT_UUID, INDOOR_BIKE_DATA_UUID, RSC_MEASUREMENT_UUID,
};

/// Owns the background notification tasks for one peripheral
#[derive(Debug)]
pub struct NotificationDispatcher {
    tasks: Vec<JoinHandle<()>>,
}

impl NotificationDispatcher {
    /// Spawn the tasks for every family the peripheral offers, with entropy-seeded noise
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(peripheral: Arc<FitnessPeripheral>, simulator: Arc<RwLock<SimulatorState>>) -> Self {
        Self::start_with_noise(peripheral, simulator, NoiseModel::from_entropy)
    }

    /// Spawn the tasks, building each task's noise source with `make_noise`
    #[must_use]
    pub fn start_with_noise<R, F>(
        peripheral: Arc<FitnessPeripheral>,
        simulator: Arc<RwLock<SimulatorState>>,
        mut make_noise: F,
    ) -> Self
    where
        R: Rng + Send + 'static,
        F: FnMut() -> NoiseModel<R>,
    {
        let services = peripheral.config().services;
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(forward_events(
            peripheral.subscribe_events(),
            Arc::clone(&simulator),
        )));

        if let Some(mode) = services.cycling_power {
            tasks.push(tokio::spawn(run_cycling_power(
                Arc::clone(&peripheral),
                Arc::clone(&simulator),
                mode,
                make_noise(),
            )));
        }
        if services.ftms {
            tasks.push(tokio::spawn(run_indoor_bike(
                Arc::clone(&peripheral),
                Arc::clone(&simulator),
                make_noise(),
            )));
        }
        if services.rsc {
            tasks.push(tokio::spawn(run_running(
                Arc::clone(&peripheral),
                Arc::clone(&simulator),
                make_noise(),
            )));
        }

        info!("Notification dispatcher started {} task(s)", tasks.len());
        Self { tasks }
    }

    /// Number of spawned tasks, including the event forwarder
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether any task is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Abort every task and wait for them to wind down
    pub async fn shutdown(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for task in &tasks {
            task.abort();
        }
        join_all(tasks).await;
        info!("Notification dispatcher stopped");
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<DomainEvent>,
    simulator: Arc<RwLock<SimulatorState>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => simulator.write().await.apply(&event),
            Err(RecvError::Lagged(missed)) => warn!("Simulator missed {} control event(s)", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_cycling_power<R: Rng + Send>(
    peripheral: Arc<FitnessPeripheral>,
    simulator: Arc<RwLock<SimulatorState>>,
    mode: CyclingPowerMode,
    mut noise: NoiseModel<R>,
) {
    let config = peripheral.config();
    let period = config.notification_interval();
    let keepalive = config.keepalive_timeout();
    let mut feed = CyclingPowerFeed::new(mode, config.wheel_circumference_mm);
    let mut last_emit = Instant::now();

    info!("Cycling power notifications started ({})", mode);
    loop {
        let tick = {
            let state = simulator.read().await;
            feed.tick(&state, &mut noise, period)
        };

        match tick.reading {
            Some(reading) => {
                emit_cycling_power(&peripheral, &reading).await;
                last_emit = Instant::now();
            }
            None if last_emit.elapsed() >= keepalive => {
                debug!("Cycling power idle for {:?}, sending keepalive", last_emit.elapsed());
                emit_cycling_power(&peripheral, &feed.keepalive_reading()).await;
                last_emit = Instant::now();
            }
            None => {}
        }

        sleep(tick.next_in).await;
    }
}

async fn emit_cycling_power(peripheral: &FitnessPeripheral, reading: &SensorReading) {
    match encode_cycling_power_measurement(reading, peripheral.elapsed()) {
        Ok(value) => {
            peripheral.notify(CYCLING_POWER_MEASUREMENT_UUID, value).await;
        }
        Err(e) => warn!("Cycling power encode failed: {}", e),
    }
}

async fn run_indoor_bike<R: Rng + Send>(
    peripheral: Arc<FitnessPeripheral>,
    simulator: Arc<RwLock<SimulatorState>>,
    mut noise: NoiseModel<R>,
) {
    let mut ticker = interval(peripheral.config().notification_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Indoor bike notifications started");
    loop {
        ticker.tick().await;
        let reading = simulator.read().await.indoor_bike_reading(&mut noise);
        match encode_indoor_bike_data(&reading) {
            Ok(value) => {
                peripheral.notify(INDOOR_BIKE_DATA_UUID, value).await;
            }
            Err(e) => warn!("Indoor bike encode failed: {}", e),
        }
    }
}

async fn run_running<R: Rng + Send>(
    peripheral: Arc<FitnessPeripheral>,
    simulator: Arc<RwLock<SimulatorState>>,
    mut noise: NoiseModel<R>,
) {
    let mut ticker = interval(peripheral.config().notification_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("RSC notifications started");
    loop {
        ticker.tick().await;
        let reading = simulator.read().await.running_reading(&mut noise);
        match encode_rsc_measurement(&reading) {
            Ok(value) => {
                peripheral.notify(RSC_MEASUREMENT_UUID, value).await;
            }
            Err(e) => warn!("RSC encode failed: {}", e),
        }
    }
}
