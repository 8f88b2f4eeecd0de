use std::fmt;

use serde::Serialize;

/// Active span of a temporal entity, in fractional years since day zero of
/// the simulation. `duration` defaults to infinite (never expires).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Window {
    pub start: f64,
    pub duration: f64,
}

impl Window {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

impl Default for Window {
    fn default() -> Self {
        Self {
            start: 0.0,
            duration: f64::INFINITY,
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobSpec {
    pub name: String,
    pub window: Window,
    /// Annual salary rate at `window.start`.
    pub salary: f64,
    /// Compounds the salary by `exp(rate)` once per calendar-year boundary.
    pub raise_rate: f64,
}

#[derive(Clone, Debug)]
pub struct SpendingSpec {
    pub name: String,
    pub window: Window,
    pub annual: f64,
    pub growth_rate: f64,
    /// Linear growth (`annual += dt * rate`) when false, exponential
    /// (`annual *= exp(rate * dt)`) when true.
    pub exponential: bool,
}

#[derive(Clone, Debug)]
pub struct CostSpec {
    pub name: String,
    pub window: Window,
    pub total: f64,
    pub down_payment: f64,
    pub closing_cost: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FundKind {
    FixedRate { rate: f64 },
    Market,
}

#[derive(Clone, Debug)]
pub struct FundSpec {
    pub name: String,
    pub window: Window,
    pub amount: f64,
    /// Per-calendar-year contribution cap; 0 means unlimited.
    pub limit: f64,
    pub kind: FundKind,
}

/// Fully-resolved entity set for one simulation. Funds are listed in
/// declaration order: withdrawals walk the list front-to-back, contributions
/// back-to-front.
#[derive(Clone, Debug, Default)]
pub struct Scenario {
    pub incomes: Vec<JobSpec>,
    pub spending: Vec<SpendingSpec>,
    pub costs: Vec<CostSpec>,
    pub funds: Vec<FundSpec>,
}

#[derive(Copy, Clone, Debug)]
pub struct SimParams {
    /// Simulated horizon in years.
    pub years: f64,
    /// Number of independent Monte Carlo trials.
    pub trials: u32,
    pub seed: u64,
    /// When set, every trial uses this offset (fraction of the series
    /// length) instead of drawing one from the seeded generator.
    pub start_override: Option<f64>,
    /// Record one `StepRow` per simulated week per trial.
    pub record_steps: bool,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            years: 1.0,
            trials: 1,
            seed: 42,
            start_override: None,
            record_steps: false,
        }
    }
}

/// Per-fund movement within a single weekly step.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundStep {
    pub contributed: f64,
    pub withdrawn: f64,
    pub balance: f64,
}

/// One simulated week of one trial, flows in entity declaration order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRow {
    pub trial: u32,
    pub year: f64,
    pub incomes: Vec<f64>,
    pub expenses: Vec<f64>,
    pub funds: Vec<FundStep>,
    pub bankrupt: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialSummary {
    pub trial: u32,
    /// Offset into the historical series, as a fraction of its length.
    pub offset_percent: f64,
    pub final_balance: f64,
    pub bankrupt: bool,
    /// Total fund balance at the first step where aggregate income reached
    /// zero; `None` if income never did.
    pub retirement_value: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutput {
    pub summaries: Vec<TrialSummary>,
    /// Empty unless `SimParams::record_steps` was set.
    pub steps: Vec<StepRow>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SimError {
    /// A market fund was declared but no historical series was provided.
    MissingMarketData { fund: String },
    /// A price lookup fell at or beyond the second tiling of the series.
    HorizonExceeded {
        year: f64,
        day: usize,
        series_len: usize,
    },
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::MissingMarketData { fund } => {
                write!(f, "fund '{fund}' requires historical market data")
            }
            SimError::HorizonExceeded {
                year,
                day,
                series_len,
            } => write!(
                f,
                "market lookup at year {year:.4} needs day {day} but only \
                 {} days are reachable ({series_len} samples, tiled once)",
                2 * series_len
            ),
        }
    }
}

impl std::error::Error for SimError {}
