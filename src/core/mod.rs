mod engine;
mod market;
mod types;

pub use engine::Simulator;
pub use market::{MarketData, MarketDataError};
pub use types::{
    CostSpec, FundKind, FundSpec, FundStep, JobSpec, Scenario, SimError, SimParams,
    SimulationOutput, SpendingSpec, StepRow, TrialSummary, Window,
};
