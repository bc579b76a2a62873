// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the phi accrual failure detector. Each endpoint
//! gets a bounded sliding window of heartbeat inter-arrival samples; the
//! suspicion level phi is derived from an exponential fit over the window and
//! listeners are convicted exactly once per threshold crossing.

use crate::app::{
    endpoint::EndpointId,
    state::uptime_nanos,
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
        RwLock,
    },
    time::Duration,
};

/// Samples kept per endpoint.
const SAMPLE_SIZE: usize = 1000;
/// `1 / ln(10)`, converting the exponential tail to a base-10 suspicion.
const PHI_FACTOR: f64 = 0.434294481903251;

/// Receives convictions. Invoked outside the detector's internal lock.
pub trait FailureListener: Send + Sync {
    /// The endpoint crossed the suspicion threshold at level `phi`.
    fn convict(&self, endpoint: &EndpointId, phi: f64);
}

/// One endpoint's bounded window of heartbeat inter-arrival samples.
#[derive(Debug)]
pub struct ArrivalWindow {
    intervals: VecDeque<u64>,
    last_arrival_nanos: u64,
    convicted: bool,
    alive: bool,
}

impl ArrivalWindow {
    fn new(initial_interval: Duration, arrival_nanos: u64) -> Self {
        let mut intervals = VecDeque::with_capacity(SAMPLE_SIZE);
        // seed the fit so phi is defined before real samples accumulate
        intervals.push_back(initial_interval.as_nanos() as u64);
        Self {
            intervals,
            last_arrival_nanos: arrival_nanos,
            convicted: false,
            alive: true,
        }
    }
    fn add(&mut self, arrival_nanos: u64) {
        if self.intervals.len() == SAMPLE_SIZE {
            self.intervals.pop_front();
        }
        self.intervals
            .push_back(arrival_nanos.saturating_sub(self.last_arrival_nanos));
        self.last_arrival_nanos = arrival_nanos;
        self.convicted = false;
        self.alive = true;
    }
    fn mean_nanos(&self) -> f64 {
        self.intervals.iter().sum::<u64>() as f64 / self.intervals.len() as f64
    }
    /// The suspicion level at the given instant: `-log10(1 - F(delta))` for an
    /// exponential fit with rate `1 / mean`.
    pub fn phi(&self, now_nanos: u64) -> f64 {
        let delta = now_nanos.saturating_sub(self.last_arrival_nanos) as f64;
        delta / self.mean_nanos() * PHI_FACTOR
    }
}

/// The phi accrual failure detector.
pub struct FailureDetector {
    phi_threshold: f64,
    initial_interval: Duration,
    windows: Mutex<HashMap<EndpointId, ArrivalWindow>>,
    listeners: RwLock<Vec<Arc<dyn FailureListener>>>,
}

impl FailureDetector {
    /// Create a detector with the given conviction threshold and the interval
    /// used to seed fresh windows.
    pub fn new(phi_threshold: f64, initial_interval: Duration) -> Self {
        Self {
            phi_threshold,
            initial_interval,
            windows: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }
    /// Register a conviction listener.
    pub fn register(&self, listener: Arc<dyn FailureListener>) {
        self.listeners.write().expect("listener lock poisoned").push(listener);
    }
    /// Record a heartbeat arrival at the current monotonic time.
    pub fn report(&self, endpoint: &EndpointId) {
        self.report_at(endpoint, uptime_nanos());
    }
    /// Record a heartbeat arrival at an explicit monotonic timestamp.
    pub fn report_at(&self, endpoint: &EndpointId, arrival_nanos: u64) {
        let mut windows = self.windows.lock().expect("window lock poisoned");
        match windows.get_mut(endpoint) {
            Some(window) => window.add(arrival_nanos),
            None => {
                windows.insert(
                    endpoint.clone(),
                    ArrivalWindow::new(self.initial_interval, arrival_nanos),
                );
            }
        }
    }
    /// Compute phi at the current monotonic time, convicting listeners on a
    /// fresh threshold crossing.
    pub fn interpret(&self, endpoint: &EndpointId) {
        self.interpret_at(endpoint, uptime_nanos());
    }
    /// Compute phi at an explicit monotonic timestamp.
    pub fn interpret_at(&self, endpoint: &EndpointId, now_nanos: u64) {
        let phi = {
            let mut windows = self.windows.lock().expect("window lock poisoned");
            let window = match windows.get_mut(endpoint) {
                Some(window) => window,
                None => return,
            };
            let phi = window.phi(now_nanos);
            if phi <= self.phi_threshold || window.convicted {
                return;
            }
            window.convicted = true;
            window.alive = false;
            phi
        };
        log::debug!("Convicting {} with phi {:.2}", endpoint, phi);
        self.notify(endpoint, phi);
    }
    /// Emit a conviction regardless of phi. Used during orderly shutdown.
    pub fn force_conviction(&self, endpoint: &EndpointId) {
        {
            let mut windows = self.windows.lock().expect("window lock poisoned");
            if let Some(window) = windows.get_mut(endpoint) {
                window.convicted = true;
                window.alive = false;
            }
        }
        self.notify(endpoint, self.phi_threshold);
    }
    /// Discard the endpoint's history.
    pub fn remove(&self, endpoint: &EndpointId) {
        self.windows.lock().expect("window lock poisoned").remove(endpoint);
    }
    /// Whether the endpoint has reported and has not been convicted since.
    pub fn is_alive(&self, endpoint: &EndpointId) -> bool {
        self.windows
            .lock()
            .expect("window lock poisoned")
            .get(endpoint)
            .map(|window| window.alive)
            .unwrap_or(false)
    }
    /// The endpoints currently tracked.
    pub fn tracked(&self) -> Vec<EndpointId> {
        self.windows
            .lock()
            .expect("window lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
    fn notify(&self, endpoint: &EndpointId, phi: f64) {
        let listeners = self.listeners.read().expect("listener lock poisoned").clone();
        for listener in listeners {
            listener.convict(endpoint, phi);
        }
    }
}
