//! Learning-rate schedules.

use std::f64::consts::PI;

use xray_core::{Error, Result, SchedulerSettings};

/// Learning-rate policy advanced once per scheduling period
pub trait LrScheduler: Send {
    /// Current learning rate
    fn lr(&self) -> f64;

    /// Advance one period and return the new learning rate
    fn step(&mut self) -> f64;
}

/// Fixed learning rate
#[derive(Debug, Clone)]
pub struct ConstantLr(pub f64);

impl LrScheduler for ConstantLr {
    fn lr(&self) -> f64 {
        self.0
    }

    fn step(&mut self) -> f64 {
        self.0
    }
}

/// Cosine annealing with linear warm-up and warm restarts.
///
/// Within a cycle of length `T_i`, the rate climbs linearly from the base
/// rate to `eta_max` over `T_up` steps, then follows half a cosine back down.
/// Each restart stretches the decay part by `T_mult` and scales the peak by
/// `gamma`.
#[derive(Debug, Clone)]
pub struct CosineAnnealingWarmUpRestarts {
    base_lr: f64,
    t_mult: usize,
    base_eta_max: f64,
    eta_max: f64,
    t_up: usize,
    gamma: f64,
    /// Length of the current cycle
    t_i: usize,
    /// Position within the current cycle
    t_cur: usize,
    cycle: u32,
}

impl CosineAnnealingWarmUpRestarts {
    pub fn new(base_lr: f64, settings: &SchedulerSettings) -> Result<Self> {
        if settings.t_0 == 0 {
            return Err(Error::Config("t_0 must be positive".to_string()));
        }
        if settings.t_mult == 0 {
            return Err(Error::Config("t_mult must be at least 1".to_string()));
        }
        if settings.t_up >= settings.t_0 {
            return Err(Error::Config(format!(
                "warm-up length {} must be shorter than the first cycle {}",
                settings.t_up, settings.t_0
            )));
        }
        if settings.eta_max < base_lr {
            return Err(Error::Config(format!(
                "eta_max {} below the base learning rate {base_lr}",
                settings.eta_max
            )));
        }

        Ok(Self {
            base_lr,
            t_mult: settings.t_mult,
            base_eta_max: settings.eta_max,
            eta_max: settings.eta_max,
            t_up: settings.t_up,
            gamma: settings.gamma,
            t_i: settings.t_0,
            t_cur: 0,
            cycle: 0,
        })
    }

    /// Completed restarts
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Peak rate of the current cycle
    pub fn eta_max(&self) -> f64 {
        self.eta_max
    }
}

impl LrScheduler for CosineAnnealingWarmUpRestarts {
    fn lr(&self) -> f64 {
        let span = self.eta_max - self.base_lr;
        if self.t_cur < self.t_up {
            self.base_lr + span * self.t_cur as f64 / self.t_up as f64
        } else {
            let progress = (self.t_cur - self.t_up) as f64 / (self.t_i - self.t_up) as f64;
            self.base_lr + span * (1.0 + (PI * progress).cos()) / 2.0
        }
    }

    fn step(&mut self) -> f64 {
        self.t_cur += 1;
        if self.t_cur >= self.t_i {
            self.cycle += 1;
            self.t_cur -= self.t_i;
            self.t_i = (self.t_i - self.t_up) * self.t_mult + self.t_up;
            tracing::debug!(cycle = self.cycle, length = self.t_i, "Learning-rate restart");
        }
        self.eta_max = self.base_eta_max * self.gamma.powi(self.cycle as i32);
        self.lr()
    }
}
