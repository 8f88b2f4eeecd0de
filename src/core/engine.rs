use std::collections::HashMap;
use std::sync::Arc;

use super::market::MarketData;
use super::types::{
    CostSpec, FundKind, FundSpec, FundStep, JobSpec, Scenario, SimError, SimParams,
    SimulationOutput, SpendingSpec, StepRow, TrialSummary, Window,
};

/// Weekly step of the simulated clock, in years.
const STEP: f64 = 1.0 / 52.0;

/// Fractional years map onto the daily price series at this density.
const DAYS_PER_YEAR: f64 = 365.25;

/// Shared start/duration windowing and the per-entity clock. The clock is
/// advanced on every query, in or out of window, so a later in-window step
/// always measures its elapsed interval from the correct previous point.
#[derive(Clone, Debug)]
struct Timeline {
    start: f64,
    end: f64,
    year: f64,
}

impl Timeline {
    fn new(window: Window) -> Self {
        Self {
            start: window.start,
            end: window.end(),
            year: 0.0,
        }
    }

    /// Moves the clock to `year` and returns the elapsed interval.
    fn advance(&mut self, year: f64) -> f64 {
        let previous = self.year;
        self.year = year;
        year - previous
    }

    fn in_window(&self, year: f64) -> bool {
        year >= self.start && year < self.end
    }
}

#[derive(Clone, Debug)]
struct Job {
    timeline: Timeline,
    salary: f64,
    raise_rate: f64,
}

impl Job {
    fn new(spec: &JobSpec) -> Self {
        Self {
            timeline: Timeline::new(spec.window),
            salary: spec.salary,
            raise_rate: spec.raise_rate,
        }
    }

    fn advance(&mut self, year: f64) -> f64 {
        let dt = self.timeline.advance(year);
        if !self.timeline.in_window(year) || dt <= 0.0 {
            return 0.0;
        }

        // The raise compounds once per calendar-year boundary crossed, not
        // continuously.
        if (year - dt).floor() != year.floor() {
            self.salary *= self.raise_rate.exp();
        }

        dt * self.salary
    }
}

#[derive(Clone, Debug)]
struct Spending {
    timeline: Timeline,
    annual: f64,
    growth_rate: f64,
    exponential: bool,
}

impl Spending {
    fn new(spec: &SpendingSpec) -> Self {
        Self {
            timeline: Timeline::new(spec.window),
            annual: spec.annual,
            growth_rate: spec.growth_rate,
            exponential: spec.exponential,
        }
    }

    fn advance(&mut self, year: f64) -> f64 {
        let dt = self.timeline.advance(year);
        if !self.timeline.in_window(year) || dt <= 0.0 {
            return 0.0;
        }

        if self.exponential {
            self.annual *= (self.growth_rate * dt).exp();
        } else {
            self.annual += dt * self.growth_rate;
        }

        dt * self.annual
    }
}

/// A one-off cost amortized across its window. The down payment is charged
/// in full on the first in-window step; whatever has not amortized by the
/// end of the window is charged, together with the closing cost, as one
/// final lump. After that lump the entity is spent and always yields zero.
#[derive(Clone, Debug)]
struct Cost {
    timeline: Timeline,
    total: f64,
    remaining: f64,
    down_payment: f64,
    closing_cost: f64,
}

impl Cost {
    fn new(spec: &CostSpec) -> Self {
        Self {
            timeline: Timeline::new(spec.window),
            total: spec.total,
            remaining: spec.total,
            down_payment: spec.down_payment,
            closing_cost: spec.closing_cost,
        }
    }

    fn advance(&mut self, year: f64) -> f64 {
        let dt = self.timeline.advance(year);
        if year < self.timeline.start {
            return 0.0;
        }

        if year >= self.timeline.end {
            let charge = self.remaining + self.closing_cost;
            self.remaining = 0.0;
            self.closing_cost = 0.0;
            return charge;
        }

        if self.down_payment > 0.0 {
            let charge = self.down_payment;
            self.total -= charge;
            self.remaining -= charge;
            self.down_payment = 0.0;
            return charge;
        }

        let span = self.timeline.end - self.timeline.start;
        let charge = (dt * self.total / span).min(self.remaining);
        self.remaining -= charge;
        charge
    }
}

/// Closed set of income/expense entities. Cloning preserves the variant by
/// construction, so a per-trial copy can never change concrete type.
#[derive(Clone, Debug)]
enum FlowModel {
    Job(Job),
    Spending(Spending),
    Cost(Cost),
}

impl FlowModel {
    /// Advances the entity's clock to `year` and returns the monetary flow
    /// attributed to the elapsed interval (zero outside the window).
    fn advance(&mut self, year: f64) -> f64 {
        match self {
            FlowModel::Job(job) => job.advance(year),
            FlowModel::Spending(spending) => spending.advance(year),
            FlowModel::Cost(cost) => cost.advance(year),
        }
    }
}

/// Price lookup over the shared historical series, tiled at most once. The
/// wraparound multiplier is fixed at construction; the day offset is set
/// once per trial before stepping begins.
#[derive(Clone, Debug)]
struct MarketGrowth {
    data: Arc<MarketData>,
    wraparound_multiplier: f64,
    day_offset: f64,
}

impl MarketGrowth {
    fn new(data: Arc<MarketData>) -> Self {
        let wraparound_multiplier = data.wraparound_multiplier();
        Self {
            data,
            wraparound_multiplier,
            day_offset: 0.0,
        }
    }

    fn set_offset_percent(&mut self, percent: f64) {
        self.day_offset = percent * self.data.len() as f64;
    }

    fn price(&self, year: f64) -> Result<f64, SimError> {
        let day = (year * DAYS_PER_YEAR + self.day_offset).floor() as usize;
        let len = self.data.len();

        if day < len {
            return Ok(self.data.sample(day) as f64);
        }

        // Second cycle: tile the series once, scaled so it starts where the
        // original left off.
        if day < 2 * len {
            return Ok(self.wraparound_multiplier * self.data.sample(day % len) as f64);
        }

        Err(SimError::HorizonExceeded {
            year,
            day,
            series_len: len,
        })
    }
}

#[derive(Clone, Debug)]
enum Growth {
    FixedRate { rate: f64 },
    Market(MarketGrowth),
}

/// An investment fund: a balance plus buy/sell semantics and a growth rule.
#[derive(Clone, Debug)]
struct Fund {
    timeline: Timeline,
    balance: f64,
    contribution_limit: f64,
    contributed: HashMap<i64, f64>,
    growth: Growth,
}

impl Fund {
    fn new(spec: &FundSpec, market: Option<&Arc<MarketData>>) -> Result<Self, SimError> {
        let growth = match spec.kind {
            FundKind::FixedRate { rate } => Growth::FixedRate { rate },
            FundKind::Market => {
                let data = market.ok_or_else(|| SimError::MissingMarketData {
                    fund: spec.name.clone(),
                })?;
                Growth::Market(MarketGrowth::new(Arc::clone(data)))
            }
        };

        Ok(Self {
            timeline: Timeline::new(spec.window),
            balance: spec.amount,
            contribution_limit: spec.limit,
            contributed: HashMap::new(),
            growth,
        })
    }

    fn balance(&self) -> f64 {
        self.balance
    }

    fn set_offset_percent(&mut self, percent: f64) {
        if let Growth::Market(market) = &mut self.growth {
            market.set_offset_percent(percent);
        }
    }

    /// Deposits up to `amount`, clamped by the remaining contribution
    /// headroom for the current calendar year, and returns the amount
    /// actually deposited. Negative requests are a no-op.
    fn buy(&mut self, amount: f64) -> f64 {
        if amount < 0.0 {
            return 0.0;
        }

        let mut amount = amount;
        if self.contribution_limit > 0.0 {
            let calendar_year = self.timeline.year.floor() as i64;
            let contributed = self.contributed.entry(calendar_year).or_insert(0.0);
            amount = amount.min(self.contribution_limit - *contributed);
            *contributed += amount;
        }

        self.balance += amount;
        amount
    }

    /// Withdraws up to `amount`, never overdrawing, and returns the amount
    /// actually removed. Requests before the fund's start are rejected.
    fn sell(&mut self, amount: f64) -> f64 {
        if self.timeline.year < self.timeline.start {
            return 0.0;
        }
        if amount < 0.0 {
            return 0.0;
        }

        let sold = amount.min(self.balance);
        self.balance -= sold;
        sold
    }

    /// Applies growth for the interval since the previous query and returns
    /// the new balance. Market growth reads the series at the post-advance
    /// clock: the factor for a step ending at `year` after `dt` elapsed is
    /// `price(year + dt) / price(year)`.
    fn grow_to(&mut self, year: f64) -> Result<f64, SimError> {
        let dt = self.timeline.advance(year);
        let factor = match &self.growth {
            Growth::FixedRate { rate } => (rate * dt).exp(),
            Growth::Market(market) => market.price(year + dt)? / market.price(year)?,
        };
        self.balance *= factor;
        Ok(self.balance)
    }
}

/// Monte Carlo driver. Holds one template set of entities built from a
/// resolved `Scenario`; each trial clones the templates, draws (or accepts)
/// a market offset, and steps the weekly clock across the horizon.
pub struct Simulator {
    params: SimParams,
    incomes: Vec<FlowModel>,
    expenses: Vec<FlowModel>,
    funds: Vec<Fund>,
}

impl Simulator {
    pub fn new(
        scenario: &Scenario,
        params: SimParams,
        market: Option<Arc<MarketData>>,
    ) -> Result<Self, SimError> {
        let incomes = scenario
            .incomes
            .iter()
            .map(|spec| FlowModel::Job(Job::new(spec)))
            .collect();

        let mut expenses: Vec<FlowModel> = scenario
            .spending
            .iter()
            .map(|spec| FlowModel::Spending(Spending::new(spec)))
            .collect();
        expenses.extend(
            scenario
                .costs
                .iter()
                .map(|spec| FlowModel::Cost(Cost::new(spec))),
        );

        let funds = scenario
            .funds
            .iter()
            .map(|spec| Fund::new(spec, market.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            params,
            incomes,
            expenses,
            funds,
        })
    }

    pub fn run(&self) -> Result<SimulationOutput, SimError> {
        let mut rng = Rng::new(self.params.seed);
        let mut summaries = Vec::with_capacity(self.params.trials as usize);
        let mut steps = Vec::new();

        for trial in 0..self.params.trials {
            summaries.push(self.run_trial(trial, &mut rng, &mut steps)?);
        }

        Ok(SimulationOutput { summaries, steps })
    }

    fn run_trial(
        &self,
        trial: u32,
        rng: &mut Rng,
        steps: &mut Vec<StepRow>,
    ) -> Result<TrialSummary, SimError> {
        let mut incomes = self.incomes.clone();
        let mut expenses = self.expenses.clone();
        let mut funds = self.funds.clone();

        // The generator is only consulted when no override is given, so an
        // overridden run leaves the offset sequence untouched.
        let offset_percent = match self.params.start_override {
            Some(percent) => percent,
            None => rng.next_f64(),
        };
        for fund in &mut funds {
            fund.set_offset_percent(offset_percent);
        }

        let mut bankrupt = false;
        let mut retirement_value: Option<f64> = None;

        let step_count = self.params.years / STEP;
        let mut week: usize = 1;
        while (week as f64) < step_count {
            let year = week as f64 * STEP;

            let mut total_income = 0.0;
            let mut income_flows = Vec::with_capacity(incomes.len());
            for income in &mut incomes {
                let flow = income.advance(year);
                total_income += flow;
                income_flows.push(flow);
            }

            // First week with no income at all is treated as the start of
            // retirement; balances are snapshotted before this week's
            // growth and contributions.
            if total_income == 0.0 && retirement_value.is_none() {
                retirement_value = Some(funds.iter().map(Fund::balance).sum());
            }

            let mut total_expenses = 0.0;
            let mut expense_flows = Vec::with_capacity(expenses.len());
            for expense in &mut expenses {
                let flow = expense.advance(year);
                total_expenses += flow;
                expense_flows.push(flow);
            }

            let mut to_invest = (total_income - total_expenses).max(0.0);
            let mut to_spend = (total_expenses - total_income).max(0.0);

            // Contribute in reverse declaration order: funds declared later
            // have contribution priority.
            let mut contributed = vec![0.0; funds.len()];
            for index in (0..funds.len()).rev() {
                funds[index].grow_to(year)?;
                let amount = funds[index].buy(to_invest);
                to_invest -= amount;
                contributed[index] = amount;
            }

            // Withdraw in forward declaration order.
            let mut withdrawn = vec![0.0; funds.len()];
            for (index, fund) in funds.iter_mut().enumerate() {
                let amount = fund.sell(to_spend);
                to_spend -= amount;
                withdrawn[index] = amount;
            }

            // Any uncovered expense marks the whole trial, permanently.
            if to_spend > 0.0 {
                bankrupt = true;
            }

            if self.params.record_steps {
                let fund_steps = funds
                    .iter()
                    .enumerate()
                    .map(|(index, fund)| FundStep {
                        contributed: contributed[index],
                        withdrawn: withdrawn[index],
                        balance: fund.balance(),
                    })
                    .collect();
                steps.push(StepRow {
                    trial,
                    year,
                    incomes: income_flows,
                    expenses: expense_flows,
                    funds: fund_steps,
                    bankrupt,
                });
            }

            week += 1;
        }

        Ok(TrialSummary {
            trial,
            offset_percent,
            final_balance: funds.iter().map(Fund::balance).sum(),
            bankrupt,
            retirement_value,
        })
    }
}

struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        let state = if seed == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            seed
        };
        Self { state }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    fn next_f64(&mut self) -> f64 {
        const DENOM: f64 = (1_u64 << 53) as f64;
        let v = self.next_u64() >> 11;
        ((v as f64) + 0.5) / DENOM
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    fn fixed_fund(amount: f64, rate: f64, limit: f64) -> Fund {
        Fund::new(
            &FundSpec {
                name: "test".to_string(),
                window: Window::default(),
                amount,
                limit,
                kind: FundKind::FixedRate { rate },
            },
            None,
        )
        .unwrap()
    }

    fn market_fund(amount: f64, samples: Vec<f32>) -> Fund {
        let data = Arc::new(MarketData::from_samples(samples));
        Fund::new(
            &FundSpec {
                name: "market".to_string(),
                window: Window::default(),
                amount,
                limit: 0.0,
                kind: FundKind::Market,
            },
            Some(&data),
        )
        .unwrap()
    }

    fn flat_series(len: usize) -> Vec<f32> {
        vec![1.0; len]
    }

    fn job_spec(salary: f64, raise_rate: f64, window: Window) -> JobSpec {
        JobSpec {
            name: "job".to_string(),
            window,
            salary,
            raise_rate,
        }
    }

    fn spending_spec(annual: f64, rate: f64, window: Window) -> SpendingSpec {
        SpendingSpec {
            name: "spending".to_string(),
            window,
            annual,
            growth_rate: rate,
            exponential: false,
        }
    }

    #[test]
    fn fixed_rate_fund_compounds_continuously() {
        let mut fund = fixed_fund(1_000.0, 0.07, 0.0);
        let balance = fund.grow_to(2.5).unwrap();
        assert_approx(balance, 1_000.0 * (0.07f64 * 2.5).exp());
    }

    #[test]
    fn fund_growth_applies_over_elapsed_interval_only() {
        let mut fund = fixed_fund(1_000.0, 0.10, 0.0);
        fund.grow_to(1.0).unwrap();
        let balance = fund.grow_to(1.5).unwrap();
        assert_approx(balance, 1_000.0 * (0.10f64 * 1.5).exp());
    }

    #[test]
    fn buy_clamps_to_remaining_annual_headroom() {
        let mut fund = fixed_fund(0.0, 0.0, 1_000.0);
        fund.grow_to(0.5).unwrap();

        assert_approx(fund.buy(800.0), 800.0);
        assert_approx(fund.buy(300.0), 200.0);
        assert_approx(fund.buy(100.0), 0.0);
        assert_approx(fund.balance(), 1_000.0);
    }

    #[test]
    fn contribution_headroom_resets_at_calendar_year_boundary() {
        let mut fund = fixed_fund(0.0, 0.0, 1_000.0);
        fund.grow_to(0.9).unwrap();
        assert_approx(fund.buy(1_500.0), 1_000.0);

        fund.grow_to(1.1).unwrap();
        assert_approx(fund.buy(1_500.0), 1_000.0);
        assert_approx(fund.balance(), 2_000.0);
    }

    #[test]
    fn unlimited_fund_accepts_any_deposit() {
        let mut fund = fixed_fund(0.0, 0.0, 0.0);
        assert_approx(fund.buy(1e9), 1e9);
    }

    #[test]
    fn negative_buy_and_sell_are_no_ops() {
        let mut fund = fixed_fund(500.0, 0.0, 0.0);
        assert_approx(fund.buy(-10.0), 0.0);
        assert_approx(fund.sell(-10.0), 0.0);
        assert_approx(fund.balance(), 500.0);
    }

    #[test]
    fn sell_is_capped_at_balance_and_never_overdraws() {
        let mut fund = fixed_fund(300.0, 0.0, 0.0);
        assert_approx(fund.sell(1_000.0), 300.0);
        assert_approx(fund.balance(), 0.0);
        assert_approx(fund.sell(1.0), 0.0);
    }

    #[test]
    fn sell_before_fund_start_is_rejected() {
        let mut fund = Fund::new(
            &FundSpec {
                name: "late".to_string(),
                window: Window {
                    start: 5.0,
                    duration: f64::INFINITY,
                },
                amount: 1_000.0,
                limit: 0.0,
                kind: FundKind::FixedRate { rate: 0.0 },
            },
            None,
        )
        .unwrap();

        fund.grow_to(1.0).unwrap();
        assert_approx(fund.sell(100.0), 0.0);

        fund.grow_to(6.0).unwrap();
        assert_approx(fund.sell(100.0), 100.0);
    }

    #[test]
    fn job_flow_is_salary_prorated_by_elapsed_interval() {
        let mut job = Job::new(&job_spec(52_000.0, 0.0, Window::default()));
        assert_approx(job.advance(0.5), 26_000.0);
    }

    #[test]
    fn job_raise_fires_once_per_calendar_year_boundary() {
        let raise = 0.1f64;
        let mut job = Job::new(&job_spec(52_000.0, raise, Window::default()));

        assert_approx(job.advance(0.5), 26_000.0);
        // Crossing year 0 -> 1 compounds the salary exactly once.
        assert_approx(job.advance(1.5), 52_000.0 * raise.exp());
    }

    #[test]
    fn out_of_window_queries_yield_zero_but_advance_the_clock() {
        let window = Window {
            start: 1.0,
            duration: 9.0,
        };
        let mut job = Job::new(&job_spec(10_000.0, 0.0, window));

        assert_approx(job.advance(0.5), 0.0);
        // dt measured from the previous (out-of-window) query.
        assert_approx(job.advance(1.5), 10_000.0);
    }

    #[test]
    fn job_yields_zero_at_and_after_window_end() {
        let window = Window {
            start: 0.0,
            duration: 10.0,
        };
        let mut job = Job::new(&job_spec(10_000.0, 0.0, window));
        job.advance(9.5);
        assert_approx(job.advance(10.0), 0.0);
        assert_approx(job.advance(10.5), 0.0);
    }

    #[test]
    fn linear_spending_grows_additively() {
        let mut spending = Spending::new(&spending_spec(1_000.0, 100.0, Window::default()));
        // Rate applied before the flow is taken.
        assert_approx(spending.advance(0.5), 0.5 * 1_050.0);
        assert_approx(spending.advance(1.0), 0.5 * 1_100.0);
    }

    #[test]
    fn exponential_spending_grows_multiplicatively() {
        let mut spending = Spending::new(&SpendingSpec {
            name: "spending".to_string(),
            window: Window::default(),
            annual: 1_000.0,
            growth_rate: 0.2,
            exponential: true,
        });
        assert_approx(spending.advance(0.5), 0.5 * 1_000.0 * (0.2f64 * 0.5).exp());
    }

    #[test]
    fn cost_lifecycle_charges_down_amortization_and_closing_lump() {
        let mut cost = Cost::new(&CostSpec {
            name: "cost".to_string(),
            window: Window {
                start: 0.0,
                duration: 1.0,
            },
            total: 12_000.0,
            down_payment: 2_000.0,
            closing_cost: 500.0,
        });

        let mut charges = Vec::new();
        let mut week = 1;
        while week as f64 * STEP <= 1.5 {
            charges.push(cost.advance(week as f64 * STEP));
            week += 1;
        }

        // Down payment in full on the first in-window step.
        assert_approx(charges[0], 2_000.0);

        // Linear amortization of the remainder until the window closes.
        let per_week = STEP * 10_000.0;
        assert!((charges[1] - per_week).abs() < 1.0);

        // One final lump: unamortized remainder plus closing cost, at the
        // first step at or past the end of the window, then nothing.
        let lump_index = charges.iter().rposition(|c| *c > EPS).unwrap();
        assert!(lump_index >= 51);
        let amortized: f64 = charges[1..lump_index].iter().sum();
        assert_approx(charges[lump_index], (10_000.0 - amortized) + 500.0);

        // Lifetime charges conserve total + close.
        let lifetime: f64 = charges.iter().sum();
        assert_approx(lifetime, 12_500.0);
    }

    #[test]
    fn cost_without_down_payment_amortizes_from_first_step() {
        let mut cost = Cost::new(&CostSpec {
            name: "cost".to_string(),
            window: Window {
                start: 0.0,
                duration: 2.0,
            },
            total: 10_400.0,
            down_payment: 0.0,
            closing_cost: 0.0,
        });
        assert_approx(cost.advance(STEP), STEP * 10_400.0 / 2.0);
    }

    #[test]
    fn market_lookup_resolves_across_the_wraparound_seam() {
        let data = Arc::new(MarketData::from_samples(vec![1.0, 2.0, 3.0, 4.0]));
        let market = MarketGrowth::new(data);

        // Mid-day years keep the floor on the intended sample.
        let year_of = |day: f64| (day + 0.5) / DAYS_PER_YEAR;

        // Last day of the original series.
        assert_approx(market.price(year_of(3.0)).unwrap(), 4.0);
        // First day of the tiled cycle: wraparound multiplier times the
        // first sample.
        assert_approx(market.price(year_of(4.0)).unwrap(), 4.0 * 1.0);
        // Deeper into the tiled cycle.
        assert_approx(market.price(year_of(6.0)).unwrap(), 4.0 * 3.0);
        assert_approx(market.price(year_of(7.0)).unwrap(), 4.0 * 4.0);

        // At or beyond the second cycle there is no sample.
        assert!(matches!(
            market.price(year_of(8.0)),
            Err(SimError::HorizonExceeded { day: 8, .. })
        ));
    }

    #[test]
    fn market_offset_shifts_the_lookup_window() {
        let data = Arc::new(MarketData::from_samples(vec![1.0, 2.0, 3.0, 4.0]));
        let mut market = MarketGrowth::new(data);
        market.set_offset_percent(0.5);
        assert_approx(market.price(0.0).unwrap(), 3.0);
    }

    #[test]
    fn market_fund_growth_follows_relative_price_movement() {
        // Growth for a step ending at `year` reads the series one interval
        // ahead of the post-advance clock.
        let mut fund = market_fund(100.0, vec![1.0, 2.0, 4.0, 8.0]);
        let year = 1.6 / DAYS_PER_YEAR;
        let balance = fund.grow_to(year).unwrap();
        // price(2 * year) / price(year) = sample(3) / sample(1).
        assert_approx(balance, 100.0 * 8.0 / 2.0);
    }

    #[test]
    fn market_fund_on_flat_series_holds_value() {
        let mut fund = market_fund(250.0, flat_series(800));
        fund.grow_to(0.5).unwrap();
        fund.grow_to(1.0).unwrap();
        assert_approx(fund.balance(), 250.0);
    }

    fn one_fund_scenario(fund: FundSpec) -> Scenario {
        Scenario {
            incomes: vec![job_spec(
                50_000.0,
                0.0,
                Window {
                    start: 0.0,
                    duration: 10.0,
                },
            )],
            spending: vec![spending_spec(40_000.0, 0.0, Window::default())],
            costs: Vec::new(),
            funds: vec![fund],
        }
    }

    fn market_fund_spec(name: &str, amount: f64, limit: f64) -> FundSpec {
        FundSpec {
            name: name.to_string(),
            window: Window::default(),
            amount,
            limit,
            kind: FundKind::Market,
        }
    }

    #[test]
    fn surplus_flows_into_the_market_fund_for_the_whole_horizon() {
        let scenario = one_fund_scenario(market_fund_spec("market", 0.0, 0.0));
        let params = SimParams {
            years: 10.0,
            start_override: Some(0.0),
            ..SimParams::default()
        };
        let data = Arc::new(MarketData::from_samples(flat_series(4_000)));
        let output = Simulator::new(&scenario, params, Some(data))
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(output.summaries.len(), 1);
        let summary = &output.summaries[0];

        // Weekly surplus telescopes to final-year times the annual surplus.
        let mut weeks = 0usize;
        while ((weeks + 1) as f64) < 10.0 / STEP {
            weeks += 1;
        }
        let expected = weeks as f64 * STEP * 10_000.0;
        assert!((summary.final_balance - expected).abs() < 1e-6);
        assert!(!summary.bankrupt);
        assert!(summary.retirement_value.is_none());
        assert_eq!(summary.offset_percent, 0.0);
    }

    #[test]
    fn contribution_waterfall_funds_last_declared_fund_first() {
        let mut scenario = one_fund_scenario(market_fund_spec("market", 0.0, 0.0));
        scenario.funds.push(FundSpec {
            name: "retirement".to_string(),
            window: Window::default(),
            amount: 0.0,
            limit: 1_000.0,
            kind: FundKind::Market,
        });

        let params = SimParams {
            years: 1.0,
            start_override: Some(0.0),
            record_steps: true,
            ..SimParams::default()
        };
        let data = Arc::new(MarketData::from_samples(flat_series(800)));
        let output = Simulator::new(&scenario, params, Some(data))
            .unwrap()
            .run()
            .unwrap();

        let first = &output.steps[0];
        let weekly_surplus = first.incomes[0] - first.expenses[0];
        // The capped retirement fund absorbs the full surplus while it has
        // headroom; the market fund gets the spill only.
        assert_approx(first.funds[1].contributed, weekly_surplus);
        assert_approx(first.funds[0].contributed, 0.0);

        // Once the annual cap is hit the surplus spills to the market fund.
        let total_retirement: f64 = output.steps.iter().map(|s| s.funds[1].contributed).sum();
        assert!(total_retirement <= 1_000.0 + 1e-9);
        let total_market: f64 = output.steps.iter().map(|s| s.funds[0].contributed).sum();
        assert!(total_market > 0.0);
    }

    #[test]
    fn shortfall_withdraws_from_first_declared_fund_first() {
        let scenario = Scenario {
            incomes: Vec::new(),
            spending: vec![spending_spec(5_200.0, 0.0, Window::default())],
            costs: Vec::new(),
            funds: vec![
                FundSpec {
                    name: "savings".to_string(),
                    window: Window::default(),
                    amount: 150.0,
                    limit: 0.0,
                    kind: FundKind::FixedRate { rate: 0.0 },
                },
                FundSpec {
                    name: "market".to_string(),
                    window: Window::default(),
                    amount: 10_000.0,
                    limit: 0.0,
                    kind: FundKind::FixedRate { rate: 0.0 },
                },
            ],
        };
        let params = SimParams {
            years: 0.25,
            record_steps: true,
            ..SimParams::default()
        };
        let output = Simulator::new(&scenario, params, None)
            .unwrap()
            .run()
            .unwrap();

        // 100/week of expenses: savings covers week one and part of week
        // two, then the second fund takes over.
        let first = &output.steps[0];
        assert_approx(first.funds[0].withdrawn, 100.0);
        assert_approx(first.funds[1].withdrawn, 0.0);

        let second = &output.steps[1];
        assert_approx(second.funds[0].withdrawn, 50.0);
        assert_approx(second.funds[1].withdrawn, 50.0);

        assert!(!output.summaries[0].bankrupt);
    }

    #[test]
    fn bankruptcy_is_sticky_after_a_single_shortfall() {
        let scenario = Scenario {
            incomes: Vec::new(),
            spending: vec![spending_spec(
                5_200.0,
                0.0,
                Window {
                    start: 0.0,
                    duration: 0.1,
                },
            )],
            costs: Vec::new(),
            funds: vec![FundSpec {
                name: "savings".to_string(),
                window: Window::default(),
                amount: 10.0,
                limit: 0.0,
                kind: FundKind::FixedRate { rate: 0.0 },
            }],
        };
        let params = SimParams {
            years: 0.5,
            record_steps: true,
            ..SimParams::default()
        };
        let output = Simulator::new(&scenario, params, None)
            .unwrap()
            .run()
            .unwrap();

        // The spending window expires after ~5 weeks; later weeks have no
        // shortfall but the trial stays bankrupt.
        let last = output.steps.last().unwrap();
        assert_approx(last.expenses[0], 0.0);
        assert!(last.bankrupt);
        assert!(output.summaries[0].bankrupt);
    }

    #[test]
    fn retirement_value_snapshots_balances_when_income_stops() {
        let scenario = Scenario {
            incomes: vec![job_spec(
                5_200.0,
                0.0,
                Window {
                    start: 0.0,
                    duration: 0.26,
                },
            )],
            spending: Vec::new(),
            costs: Vec::new(),
            funds: vec![FundSpec {
                name: "savings".to_string(),
                window: Window::default(),
                amount: 1_000.0,
                limit: 0.0,
                kind: FundKind::FixedRate { rate: 0.0 },
            }],
        };
        let params = SimParams {
            years: 0.5,
            ..SimParams::default()
        };
        let output = Simulator::new(&scenario, params, None)
            .unwrap()
            .run()
            .unwrap();

        // Income hits zero at week 14 (year ~0.269); thirteen weekly
        // surpluses of 100 have been invested by then.
        let summary = &output.summaries[0];
        let retirement = summary.retirement_value.unwrap();
        assert_approx(retirement, 1_000.0 + 13.0 * 100.0);
    }

    #[test]
    fn horizon_beyond_second_cycle_fails_the_run() {
        let scenario = one_fund_scenario(market_fund_spec("market", 1_000.0, 0.0));
        let params = SimParams {
            years: 1.0,
            start_override: Some(0.0),
            ..SimParams::default()
        };
        let data = Arc::new(MarketData::from_samples(vec![1.0; 10]));
        let result = Simulator::new(&scenario, params, Some(data)).unwrap().run();
        assert!(matches!(result, Err(SimError::HorizonExceeded { .. })));
    }

    #[test]
    fn market_fund_without_data_is_a_configuration_error() {
        let scenario = one_fund_scenario(market_fund_spec("market", 0.0, 0.0));
        let result = Simulator::new(&scenario, SimParams::default(), None);
        assert!(matches!(
            result,
            Err(SimError::MissingMarketData { fund }) if fund == "market"
        ));
    }

    #[test]
    fn fixed_seed_reruns_are_identical() {
        let scenario = one_fund_scenario(market_fund_spec("market", 500.0, 0.0));
        let params = SimParams {
            years: 1.0,
            trials: 8,
            seed: 1234,
            ..SimParams::default()
        };
        let data = Arc::new(MarketData::from_samples(
            (0..800).map(|i| 100.0 + (i % 97) as f32).collect(),
        ));

        let first = Simulator::new(&scenario, params, Some(Arc::clone(&data)))
            .unwrap()
            .run()
            .unwrap();
        let second = Simulator::new(&scenario, params, Some(data))
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(first.summaries, second.summaries);
    }

    #[test]
    fn override_offset_applies_to_every_trial() {
        let scenario = one_fund_scenario(market_fund_spec("market", 500.0, 0.0));
        let params = SimParams {
            years: 1.0,
            trials: 3,
            start_override: Some(0.25),
            ..SimParams::default()
        };
        let data = Arc::new(MarketData::from_samples(flat_series(800)));
        let output = Simulator::new(&scenario, params, Some(data))
            .unwrap()
            .run()
            .unwrap();

        assert!(
            output
                .summaries
                .iter()
                .all(|summary| summary.offset_percent == 0.25)
        );
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(32))]

        #[test]
        fn prop_sell_never_overdraws_or_returns_negative(
            balance in 0.0f64..1e9,
            amount in -1e6f64..2e9,
        ) {
            let mut fund = fixed_fund(balance, 0.0, 0.0);
            let sold = fund.sell(amount);
            prop_assert!(sold >= 0.0);
            prop_assert!(sold <= amount.max(0.0));
            prop_assert!(fund.balance() >= 0.0);
            prop_assert!((fund.balance() + sold - balance).abs() <= 1e-6 || amount < 0.0);
        }

        #[test]
        fn prop_annual_contributions_never_exceed_the_limit(
            limit in 1.0f64..1e6,
            amounts in proptest::collection::vec(0.0f64..1e6, 1..20),
        ) {
            let mut fund = fixed_fund(0.0, 0.0, limit);
            fund.grow_to(0.5).unwrap();

            let mut deposited = 0.0;
            for amount in amounts {
                deposited += fund.buy(amount);
            }
            prop_assert!(deposited <= limit + 1e-6);
            prop_assert!((fund.balance() - deposited).abs() <= 1e-6);
        }

        #[test]
        fn prop_cost_lifetime_charges_conserve_total_plus_close(
            total in 100.0f64..1e6,
            down_fraction in 0.0f64..0.9,
            closing_cost in 0.0f64..1e5,
            start in 0.0f64..2.0,
            duration in 0.2f64..5.0,
        ) {
            let mut cost = Cost::new(&CostSpec {
                name: "cost".to_string(),
                window: Window { start, duration },
                total,
                down_payment: down_fraction * total,
                closing_cost,
            });

            let mut lifetime = 0.0;
            let mut week = 1;
            while week as f64 * STEP <= start + duration + 0.5 {
                lifetime += cost.advance(week as f64 * STEP);
                week += 1;
            }

            prop_assert!((lifetime - (total + closing_cost)).abs() <= 1e-6 * (total + closing_cost));
        }

        #[test]
        fn prop_trial_summaries_are_finite_and_non_negative(
            seed in any::<u64>(),
            salary in 0.0f64..200_000.0,
            annual in 0.0f64..200_000.0,
            amount in 0.0f64..1e6,
        ) {
            let scenario = Scenario {
                incomes: vec![job_spec(salary, 0.0, Window::default())],
                spending: vec![spending_spec(annual, 0.0, Window::default())],
                costs: Vec::new(),
                funds: vec![market_fund_spec("market", amount, 0.0)],
            };
            let params = SimParams {
                years: 1.0,
                trials: 4,
                seed,
                ..SimParams::default()
            };
            let data = Arc::new(MarketData::from_samples(
                (0..800).map(|i| 50.0 + (i % 31) as f32).collect(),
            ));
            let output = Simulator::new(&scenario, params, Some(data)).unwrap().run().unwrap();

            for summary in &output.summaries {
                prop_assert!(summary.final_balance.is_finite());
                prop_assert!(summary.final_balance >= 0.0);
                prop_assert!((0.0..1.0).contains(&summary.offset_percent));
                if let Some(value) = summary.retirement_value {
                    prop_assert!(value.is_finite());
                }
            }
        }

        #[test]
        fn prop_same_seed_and_config_reproduce_summaries(
            seed in any::<u64>(),
            trials in 1u32..6,
        ) {
            let scenario = one_fund_scenario(market_fund_spec("market", 250.0, 0.0));
            let params = SimParams {
                years: 0.5,
                trials,
                seed,
                ..SimParams::default()
            };
            let data = Arc::new(MarketData::from_samples(
                (0..800).map(|i| 10.0 + (i % 13) as f32).collect(),
            ));

            let first = Simulator::new(&scenario, params, Some(Arc::clone(&data)))
                .unwrap()
                .run()
                .unwrap();
            let second = Simulator::new(&scenario, params, Some(data))
                .unwrap()
                .run()
                .unwrap();
            prop_assert_eq!(first.summaries, second.summaries);
        }
    }
}
