use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{
    config::{self, LearningRateSchedule, SchedulerInterval},
    TrainingError,
};

/// Learning-rate policy advanced once per `interval()` tick.
///
/// `learning_rate()` is the rate for the current position; `step()` advances
/// the position and returns the rate that now applies.
pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn interval(&self) -> SchedulerInterval;
    fn snapshot(&self) -> SchedulerState;
    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

/// Position of a scheduler, persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub strategy: LearningRateSchedule,
    pub base_lr: f64,
    pub position: usize,
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    Step {
        base_lr: f64,
        step_size: usize,
        gamma: f64,
    },
    ConstantWithWarmup {
        base_lr: f64,
        warmup_steps: usize,
    },
    LinearWarmupCosine {
        base_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
        min_lr: f64,
    },
    PolynomialDecay {
        base_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
        min_lr: f64,
        power: f64,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
    ) -> Result<Self, TrainingError> {
        let warmup_steps = cfg.warmup_steps.unwrap_or(0);
        let min_lr = cfg.min_lr.unwrap_or(0.0);
        let horizon = || {
            cfg.total_steps.filter(|steps| *steps > 0).ok_or_else(|| {
                TrainingError::initialization(format!(
                    "{:?} scheduler requires total_steps greater than zero",
                    cfg.strategy
                ))
            })
        };

        match cfg.strategy {
            LearningRateSchedule::Constant => Ok(SchedulerConfig::ConstantWithWarmup {
                base_lr,
                warmup_steps,
            }),
            LearningRateSchedule::Step => Ok(SchedulerConfig::Step {
                base_lr,
                step_size: cfg.step_size,
                gamma: cfg.gamma,
            }),
            LearningRateSchedule::Cosine => Ok(SchedulerConfig::LinearWarmupCosine {
                base_lr,
                total_steps: horizon()?,
                warmup_steps: 0,
                min_lr,
            }),
            LearningRateSchedule::CosineWithWarmup => Ok(SchedulerConfig::LinearWarmupCosine {
                base_lr,
                total_steps: horizon()?,
                warmup_steps,
                min_lr,
            }),
            LearningRateSchedule::Polynomial => Ok(SchedulerConfig::PolynomialDecay {
                base_lr,
                total_steps: horizon()?,
                warmup_steps,
                min_lr,
                power: if cfg.power <= 0.0 { 1.0 } else { cfg.power },
            }),
        }
    }

    pub fn build(
        self,
        interval: SchedulerInterval,
    ) -> Result<Box<dyn LRScheduler>, TrainingError> {
        let base_lr = self.base_lr();
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }

        let (strategy, curve) = match self {
            SchedulerConfig::Step {
                step_size, gamma, ..
            } => {
                if step_size == 0 {
                    return Err(TrainingError::initialization(
                        "step scheduler requires step_size > 0",
                    ));
                }
                (LearningRateSchedule::Step, Curve::Step { step_size, gamma })
            }
            SchedulerConfig::ConstantWithWarmup { warmup_steps, .. } => (
                LearningRateSchedule::Constant,
                Curve::Constant { warmup_steps },
            ),
            SchedulerConfig::LinearWarmupCosine {
                total_steps,
                warmup_steps,
                min_lr,
                ..
            } => {
                check_min_lr(min_lr, base_lr)?;
                let strategy = if warmup_steps == 0 {
                    LearningRateSchedule::Cosine
                } else {
                    LearningRateSchedule::CosineWithWarmup
                };
                (
                    strategy,
                    Curve::Cosine {
                        total_steps,
                        warmup_steps: warmup_steps.min(total_steps),
                        min_lr,
                    },
                )
            }
            SchedulerConfig::PolynomialDecay {
                total_steps,
                warmup_steps,
                min_lr,
                power,
                ..
            } => {
                check_min_lr(min_lr, base_lr)?;
                (
                    LearningRateSchedule::Polynomial,
                    Curve::Polynomial {
                        total_steps,
                        warmup_steps: warmup_steps.min(total_steps),
                        min_lr,
                        power,
                    },
                )
            }
        };

        Ok(Box::new(CurveScheduler {
            strategy,
            interval,
            base_lr,
            curve,
            position: 0,
        }))
    }

    fn base_lr(&self) -> f64 {
        match *self {
            SchedulerConfig::Step { base_lr, .. }
            | SchedulerConfig::ConstantWithWarmup { base_lr, .. }
            | SchedulerConfig::LinearWarmupCosine { base_lr, .. }
            | SchedulerConfig::PolynomialDecay { base_lr, .. } => base_lr,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Curve {
    Step {
        step_size: usize,
        gamma: f64,
    },
    Constant {
        warmup_steps: usize,
    },
    Cosine {
        total_steps: usize,
        warmup_steps: usize,
        min_lr: f64,
    },
    Polynomial {
        total_steps: usize,
        warmup_steps: usize,
        min_lr: f64,
        power: f64,
    },
}

impl Curve {
    fn compute_lr(&self, base_lr: f64, step: usize) -> f64 {
        match *self {
            Curve::Step { step_size, gamma } => {
                let decays = (step / step_size) as i32;
                base_lr * gamma.powi(decays)
            }
            Curve::Constant { warmup_steps } => {
                warmup(base_lr, warmup_steps, step).unwrap_or(base_lr)
            }
            Curve::Cosine {
                total_steps,
                warmup_steps,
                min_lr,
            } => {
                if let Some(lr) = warmup(base_lr, warmup_steps, step) {
                    return lr;
                }
                if total_steps <= warmup_steps {
                    return base_lr.max(min_lr);
                }
                let progress = decay_progress(total_steps, warmup_steps, step);
                let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
                min_lr + (base_lr - min_lr) * cosine
            }
            Curve::Polynomial {
                total_steps,
                warmup_steps,
                min_lr,
                power,
            } => {
                if let Some(lr) = warmup(base_lr, warmup_steps, step) {
                    return lr;
                }
                if total_steps <= warmup_steps {
                    return min_lr;
                }
                let progress = decay_progress(total_steps, warmup_steps, step);
                let decay = (1.0 - progress).max(0.0).powf(power);
                min_lr + (base_lr - min_lr) * decay
            }
        }
    }
}

struct CurveScheduler {
    strategy: LearningRateSchedule,
    interval: SchedulerInterval,
    base_lr: f64,
    curve: Curve,
    position: usize,
}

impl LRScheduler for CurveScheduler {
    fn step(&mut self) -> f64 {
        self.position = self.position.saturating_add(1);
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        self.curve.compute_lr(self.base_lr, self.position)
    }

    fn interval(&self) -> SchedulerInterval {
        self.interval
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            strategy: self.strategy,
            base_lr: self.base_lr,
            position: self.position,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.strategy != self.strategy {
            return Err(TrainingError::runtime(format!(
                "scheduler state was produced by {:?} but the scheduler is {:?}",
                state.strategy, self.strategy
            )));
        }
        self.base_lr = state.base_lr;
        self.position = state.position;
        Ok(())
    }
}

fn warmup(base_lr: f64, warmup_steps: usize, step: usize) -> Option<f64> {
    if warmup_steps > 0 && step < warmup_steps {
        Some(base_lr * (step + 1) as f64 / warmup_steps as f64)
    } else {
        None
    }
}

fn decay_progress(total_steps: usize, warmup_steps: usize, step: usize) -> f64 {
    let effective = step.saturating_sub(warmup_steps) as f64;
    let denom = (total_steps - warmup_steps).max(1) as f64;
    (effective / denom).clamp(0.0, 1.0)
}

fn check_min_lr(min_lr: f64, base_lr: f64) -> Result<(), TrainingError> {
    if min_lr < 0.0 || min_lr > base_lr {
        return Err(TrainingError::initialization(
            "scheduler min_lr must be in [0, base_lr]",
        ));
    }
    Ok(())
}
