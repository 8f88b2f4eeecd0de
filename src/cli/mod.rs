use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::core::{
    CostSpec, FundKind, FundSpec, JobSpec, MarketData, Scenario, SimParams, SpendingSpec, StepRow,
    Simulator, TrialSummary, Window,
};

pub const DEFAULT_DATA_PATH: &str = "market_data.bin";
pub const DEFAULT_SIM_YEARS: f64 = 1.0;
pub const DEFAULT_SIM_COUNT: u32 = 1;
pub const DEFAULT_SIM_SEED: u64 = 42;

/// Fixed registry of entity slots: one job, one recurring spending model,
/// three one-off costs, and three funds. A slot is active only when its
/// primary argument is supplied; funds contribute in reverse declaration
/// order (retirement, market, savings) and withdraw in forward order.
#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    about = "Weekly-step Monte Carlo household finance simulator resampling a historical market series"
)]
pub struct Cli {
    #[arg(
        long,
        default_value = DEFAULT_DATA_PATH,
        help = "Historical price series: raw little-endian f32 daily samples"
    )]
    pub data: PathBuf,

    #[arg(long, default_value_t = DEFAULT_SIM_YEARS, help = "How many simulated years to run")]
    pub sim_years: f64,
    #[arg(
        long,
        default_value_t = DEFAULT_SIM_COUNT,
        help = "How many random date-offset trials to run"
    )]
    pub sim_count: u32,
    #[arg(long, default_value_t = DEFAULT_SIM_SEED, help = "Random number generator seed")]
    pub sim_seed: u64,
    #[arg(
        long,
        help = "Override the per-trial random offset, as a fraction of the series duration in [0, 1)"
    )]
    pub sim_year_start: Option<f64>,
    #[arg(
        long,
        help = "Emit one CSV row per simulated week instead of one summary row per trial"
    )]
    pub verbose: bool,

    #[arg(long, help = "Annual salary in dollars; activates the job slot")]
    pub job_salary: Option<f64>,
    #[arg(long, help = "Annual raise rate, compounded once per calendar year")]
    pub job_rate: Option<f64>,
    #[arg(long, help = "Year the job starts [default: 0]")]
    pub job_start: Option<f64>,
    #[arg(long, help = "How many years the job lasts [default: forever]")]
    pub job_duration: Option<f64>,

    #[arg(long, help = "Annual spending in dollars; activates the spending slot")]
    pub spending_annual: Option<f64>,
    #[arg(long, help = "Annual spending growth rate")]
    pub spending_rate: Option<f64>,
    #[arg(long, help = "Grow spending exponentially instead of linearly")]
    pub spending_is_exp: bool,
    #[arg(long, help = "Year the spending starts [default: 0]")]
    pub spending_start: Option<f64>,
    #[arg(long, help = "How many years the spending lasts [default: forever]")]
    pub spending_duration: Option<f64>,

    #[arg(long, help = "Total cost in dollars; activates the first child slot")]
    pub child_total: Option<f64>,
    #[arg(long, help = "Amount paid up front at the start of the window")]
    pub child_down: Option<f64>,
    #[arg(long, help = "Amount paid once at the end of the window")]
    pub child_close: Option<f64>,
    #[arg(long, help = "Year the cost starts [default: 0]")]
    pub child_start: Option<f64>,
    #[arg(long, help = "How many years the cost amortizes over [default: forever]")]
    pub child_duration: Option<f64>,

    #[arg(long, help = "Total cost in dollars; activates the second child slot")]
    pub child2_total: Option<f64>,
    #[arg(long, help = "Amount paid up front at the start of the window")]
    pub child2_down: Option<f64>,
    #[arg(long, help = "Amount paid once at the end of the window")]
    pub child2_close: Option<f64>,
    #[arg(long, help = "Year the cost starts [default: 0]")]
    pub child2_start: Option<f64>,
    #[arg(long, help = "How many years the cost amortizes over [default: forever]")]
    pub child2_duration: Option<f64>,

    #[arg(long, help = "Total cost in dollars; activates the car slot")]
    pub car_total: Option<f64>,
    #[arg(long, help = "Amount paid up front at the start of the window")]
    pub car_down: Option<f64>,
    #[arg(long, help = "Amount paid once at the end of the window")]
    pub car_close: Option<f64>,
    #[arg(long, help = "Year the cost starts [default: 0]")]
    pub car_start: Option<f64>,
    #[arg(long, help = "How many years the cost amortizes over [default: forever]")]
    pub car_duration: Option<f64>,

    #[arg(long, help = "Starting balance in dollars; activates the fixed-rate savings fund")]
    pub savings_amount: Option<f64>,
    #[arg(long, help = "Annual rate of return, compounded continuously (required with --savings-amount)")]
    pub savings_rate: Option<f64>,
    #[arg(long, help = "Annual contribution limit; 0 means unlimited [default: 0]")]
    pub savings_limit: Option<f64>,
    #[arg(long, help = "Year the fund becomes available [default: 0]")]
    pub savings_start: Option<f64>,
    #[arg(long, help = "How many years the fund lasts [default: forever]")]
    pub savings_duration: Option<f64>,

    #[arg(long, help = "Starting balance in dollars; activates the market fund")]
    pub market_amount: Option<f64>,
    #[arg(long, help = "Annual contribution limit; 0 means unlimited [default: 0]")]
    pub market_limit: Option<f64>,
    #[arg(long, help = "Year the fund becomes available [default: 0]")]
    pub market_start: Option<f64>,
    #[arg(long, help = "How many years the fund lasts [default: forever]")]
    pub market_duration: Option<f64>,

    #[arg(long, help = "Starting balance in dollars; activates the retirement fund")]
    pub retirement_amount: Option<f64>,
    #[arg(long, help = "Annual contribution limit; 0 means unlimited [default: 0]")]
    pub retirement_limit: Option<f64>,
    #[arg(long, help = "Year the fund becomes available [default: 0]")]
    pub retirement_start: Option<f64>,
    #[arg(long, help = "How many years the fund lasts [default: forever]")]
    pub retirement_duration: Option<f64>,
}

fn resolve_window(
    slot: &str,
    start: Option<f64>,
    duration: Option<f64>,
) -> Result<Window, String> {
    let window = Window {
        start: start.unwrap_or(0.0),
        duration: duration.unwrap_or(f64::INFINITY),
    };

    if !window.start.is_finite() || window.start < 0.0 {
        return Err(format!("--{slot}-start must be a finite year >= 0"));
    }
    if window.duration.is_nan() || window.duration <= 0.0 {
        return Err(format!("--{slot}-duration must be > 0"));
    }

    Ok(window)
}

fn require_primary(slot: &str, primary: &str, secondaries: &[Option<f64>]) -> Result<(), String> {
    if secondaries.iter().any(Option::is_some) {
        return Err(format!(
            "--{slot}-{primary} is required when other --{slot}-* arguments are given"
        ));
    }
    Ok(())
}

fn resolve_cost(
    slot: &str,
    total: Option<f64>,
    down: Option<f64>,
    close: Option<f64>,
    start: Option<f64>,
    duration: Option<f64>,
) -> Result<Option<CostSpec>, String> {
    let Some(total) = total else {
        require_primary(slot, "total", &[down, close, start, duration])?;
        return Ok(None);
    };

    if total < 0.0 {
        return Err(format!("--{slot}-total must be >= 0"));
    }
    let down_payment = down.unwrap_or(0.0);
    if !(0.0..=total).contains(&down_payment) {
        return Err(format!("--{slot}-down must be between 0 and --{slot}-total"));
    }
    let closing_cost = close.unwrap_or(0.0);
    if closing_cost < 0.0 {
        return Err(format!("--{slot}-close must be >= 0"));
    }

    Ok(Some(CostSpec {
        name: slot.to_string(),
        window: resolve_window(slot, start, duration)?,
        total,
        down_payment,
        closing_cost,
    }))
}

fn resolve_fund(
    slot: &str,
    amount: Option<f64>,
    limit: Option<f64>,
    start: Option<f64>,
    duration: Option<f64>,
    kind: FundKind,
) -> Result<Option<FundSpec>, String> {
    let Some(amount) = amount else {
        require_primary(slot, "amount", &[limit, start, duration])?;
        return Ok(None);
    };

    if amount < 0.0 {
        return Err(format!("--{slot}-amount must be >= 0"));
    }
    let limit = limit.unwrap_or(0.0);
    if limit < 0.0 {
        return Err(format!("--{slot}-limit must be >= 0"));
    }

    Ok(Some(FundSpec {
        name: slot.to_string(),
        window: resolve_window(slot, start, duration)?,
        amount,
        limit,
        kind,
    }))
}

/// Validates the argument surface and resolves it into the entity set and
/// simulation parameters the core consumes.
pub fn build_scenario(cli: &Cli) -> Result<(Scenario, SimParams), String> {
    if !cli.sim_years.is_finite() || cli.sim_years <= 0.0 {
        return Err("--sim-years must be > 0".to_string());
    }
    if cli.sim_count == 0 {
        return Err("--sim-count must be > 0".to_string());
    }
    if let Some(start) = cli.sim_year_start {
        if !(0.0..1.0).contains(&start) {
            return Err("--sim-year-start must be in [0, 1)".to_string());
        }
    }

    let mut scenario = Scenario::default();

    if let Some(salary) = cli.job_salary {
        if salary < 0.0 {
            return Err("--job-salary must be >= 0".to_string());
        }
        scenario.incomes.push(JobSpec {
            name: "job".to_string(),
            window: resolve_window("job", cli.job_start, cli.job_duration)?,
            salary,
            raise_rate: cli.job_rate.unwrap_or(0.0),
        });
    } else {
        require_primary(
            "job",
            "salary",
            &[cli.job_rate, cli.job_start, cli.job_duration],
        )?;
    }

    if let Some(annual) = cli.spending_annual {
        if annual < 0.0 {
            return Err("--spending-annual must be >= 0".to_string());
        }
        scenario.spending.push(SpendingSpec {
            name: "spending".to_string(),
            window: resolve_window("spending", cli.spending_start, cli.spending_duration)?,
            annual,
            growth_rate: cli.spending_rate.unwrap_or(0.0),
            exponential: cli.spending_is_exp,
        });
    } else {
        if cli.spending_is_exp {
            return Err(
                "--spending-annual is required when other --spending-* arguments are given"
                    .to_string(),
            );
        }
        require_primary(
            "spending",
            "annual",
            &[cli.spending_rate, cli.spending_start, cli.spending_duration],
        )?;
    }

    for cost in [
        resolve_cost(
            "child",
            cli.child_total,
            cli.child_down,
            cli.child_close,
            cli.child_start,
            cli.child_duration,
        )?,
        resolve_cost(
            "child2",
            cli.child2_total,
            cli.child2_down,
            cli.child2_close,
            cli.child2_start,
            cli.child2_duration,
        )?,
        resolve_cost(
            "car",
            cli.car_total,
            cli.car_down,
            cli.car_close,
            cli.car_start,
            cli.car_duration,
        )?,
    ]
    .into_iter()
    .flatten()
    {
        scenario.costs.push(cost);
    }

    if cli.savings_amount.is_some() && cli.savings_rate.is_none() {
        return Err("--savings-rate is required when --savings-amount is given".to_string());
    }
    if cli.savings_amount.is_none() && cli.savings_rate.is_some() {
        return Err(
            "--savings-amount is required when other --savings-* arguments are given".to_string(),
        );
    }

    for fund in [
        resolve_fund(
            "savings",
            cli.savings_amount,
            cli.savings_limit,
            cli.savings_start,
            cli.savings_duration,
            FundKind::FixedRate {
                rate: cli.savings_rate.unwrap_or(0.0),
            },
        )?,
        resolve_fund(
            "market",
            cli.market_amount,
            cli.market_limit,
            cli.market_start,
            cli.market_duration,
            FundKind::Market,
        )?,
        resolve_fund(
            "retirement",
            cli.retirement_amount,
            cli.retirement_limit,
            cli.retirement_start,
            cli.retirement_duration,
            FundKind::Market,
        )?,
    ]
    .into_iter()
    .flatten()
    {
        scenario.funds.push(fund);
    }

    let params = SimParams {
        years: cli.sim_years,
        trials: cli.sim_count,
        seed: cli.sim_seed,
        start_override: cli.sim_year_start,
        record_steps: cli.verbose,
    };

    Ok((scenario, params))
}

/// Parses arguments, runs the simulation, and writes CSV rows to stdout.
pub fn run(cli: Cli) -> Result<(), String> {
    let (scenario, params) = build_scenario(&cli)?;

    let needs_market = scenario
        .funds
        .iter()
        .any(|fund| matches!(fund.kind, FundKind::Market));
    let market = if needs_market {
        Some(Arc::new(
            MarketData::load(&cli.data).map_err(|e| e.to_string())?,
        ))
    } else {
        None
    };

    let output = Simulator::new(&scenario, params, market)
        .map_err(|e| e.to_string())?
        .run()
        .map_err(|e| e.to_string())?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let written = if params.record_steps {
        write_step_rows(&mut out, &scenario, &output.steps)
    } else {
        write_summaries(&mut out, &output.summaries)
    };
    written.map_err(|e| format!("failed to write output: {e}"))
}

pub fn write_summaries(out: &mut impl Write, summaries: &[TrialSummary]) -> io::Result<()> {
    writeln!(out, "start,final,status,retirement_value")?;
    for summary in summaries {
        let status = if summary.bankrupt { "bankrupt" } else { "okay" };
        write!(
            out,
            "{:.5},{:.2},{status},",
            summary.offset_percent, summary.final_balance
        )?;
        match summary.retirement_value {
            Some(value) => writeln!(out, "{value:.2}")?,
            None => writeln!(out, "nan")?,
        }
    }
    Ok(())
}

pub fn write_step_rows(
    out: &mut impl Write,
    scenario: &Scenario,
    steps: &[StepRow],
) -> io::Result<()> {
    write!(out, "id,year")?;
    for job in &scenario.incomes {
        write!(out, ",{}_income", job.name)?;
    }
    for spending in &scenario.spending {
        write!(out, ",{}_expense", spending.name)?;
    }
    for cost in &scenario.costs {
        write!(out, ",{}_expense", cost.name)?;
    }
    for fund in &scenario.funds {
        write!(
            out,
            ",{name}_contributed,{name}_spending,{name}_value",
            name = fund.name
        )?;
    }
    writeln!(out, ",bankrupt")?;

    for row in steps {
        write!(out, "{},{:.5}", row.trial, row.year)?;
        for flow in &row.incomes {
            write!(out, ",{flow:.2}")?;
        }
        for flow in &row.expenses {
            write!(out, ",{flow:.2}")?;
        }
        for fund in &row.funds {
            write!(
                out,
                ",{:.2},{:.2},{:.2}",
                fund.contributed, fund.withdrawn, fund.balance
            )?;
        }
        writeln!(out, ",{}", row.bankrupt as u8)?;
    }
    Ok(())
}
