use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::cli::{
    Cli, DEFAULT_DATA_PATH, DEFAULT_SIM_COUNT, DEFAULT_SIM_SEED, DEFAULT_SIM_YEARS, build_scenario,
};
use crate::core::{MarketData, SimulationOutput, Simulator};

/// JSON mirror of the command-line surface. Every field is optional; absent
/// fields fall back to the same defaults the CLI uses, and entity slots are
/// activated by their primary field exactly as on the command line.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    sim_years: Option<f64>,
    sim_count: Option<u32>,
    sim_seed: Option<u64>,
    sim_year_start: Option<f64>,
    verbose: Option<bool>,

    job_salary: Option<f64>,
    job_rate: Option<f64>,
    job_start: Option<f64>,
    job_duration: Option<f64>,

    spending_annual: Option<f64>,
    spending_rate: Option<f64>,
    spending_is_exp: Option<bool>,
    spending_start: Option<f64>,
    spending_duration: Option<f64>,

    child_total: Option<f64>,
    child_down: Option<f64>,
    child_close: Option<f64>,
    child_start: Option<f64>,
    child_duration: Option<f64>,

    child2_total: Option<f64>,
    child2_down: Option<f64>,
    child2_close: Option<f64>,
    child2_start: Option<f64>,
    child2_duration: Option<f64>,

    car_total: Option<f64>,
    car_down: Option<f64>,
    car_close: Option<f64>,
    car_start: Option<f64>,
    car_duration: Option<f64>,

    savings_amount: Option<f64>,
    savings_rate: Option<f64>,
    savings_limit: Option<f64>,
    savings_start: Option<f64>,
    savings_duration: Option<f64>,

    market_amount: Option<f64>,
    market_limit: Option<f64>,
    market_start: Option<f64>,
    market_duration: Option<f64>,

    retirement_amount: Option<f64>,
    retirement_limit: Option<f64>,
    retirement_start: Option<f64>,
    retirement_duration: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone)]
struct AppState {
    market: Option<Arc<MarketData>>,
}

fn cli_from_payload(payload: SimulatePayload) -> Cli {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.sim_years {
        cli.sim_years = v;
    }
    if let Some(v) = payload.sim_count {
        cli.sim_count = v;
    }
    if let Some(v) = payload.sim_seed {
        cli.sim_seed = v;
    }
    if let Some(v) = payload.sim_year_start {
        cli.sim_year_start = Some(v);
    }
    if let Some(v) = payload.verbose {
        cli.verbose = v;
    }

    cli.job_salary = payload.job_salary;
    cli.job_rate = payload.job_rate;
    cli.job_start = payload.job_start;
    cli.job_duration = payload.job_duration;

    cli.spending_annual = payload.spending_annual;
    cli.spending_rate = payload.spending_rate;
    cli.spending_is_exp = payload.spending_is_exp.unwrap_or(false);
    cli.spending_start = payload.spending_start;
    cli.spending_duration = payload.spending_duration;

    cli.child_total = payload.child_total;
    cli.child_down = payload.child_down;
    cli.child_close = payload.child_close;
    cli.child_start = payload.child_start;
    cli.child_duration = payload.child_duration;

    cli.child2_total = payload.child2_total;
    cli.child2_down = payload.child2_down;
    cli.child2_close = payload.child2_close;
    cli.child2_start = payload.child2_start;
    cli.child2_duration = payload.child2_duration;

    cli.car_total = payload.car_total;
    cli.car_down = payload.car_down;
    cli.car_close = payload.car_close;
    cli.car_start = payload.car_start;
    cli.car_duration = payload.car_duration;

    cli.savings_amount = payload.savings_amount;
    cli.savings_rate = payload.savings_rate;
    cli.savings_limit = payload.savings_limit;
    cli.savings_start = payload.savings_start;
    cli.savings_duration = payload.savings_duration;

    cli.market_amount = payload.market_amount;
    cli.market_limit = payload.market_limit;
    cli.market_start = payload.market_start;
    cli.market_duration = payload.market_duration;

    cli.retirement_amount = payload.retirement_amount;
    cli.retirement_limit = payload.retirement_limit;
    cli.retirement_start = payload.retirement_start;
    cli.retirement_duration = payload.retirement_duration;

    cli
}

fn default_cli_for_api() -> Cli {
    Cli {
        data: PathBuf::from(DEFAULT_DATA_PATH),
        sim_years: DEFAULT_SIM_YEARS,
        sim_count: DEFAULT_SIM_COUNT,
        sim_seed: DEFAULT_SIM_SEED,
        sim_year_start: None,
        verbose: false,
        job_salary: None,
        job_rate: None,
        job_start: None,
        job_duration: None,
        spending_annual: None,
        spending_rate: None,
        spending_is_exp: false,
        spending_start: None,
        spending_duration: None,
        child_total: None,
        child_down: None,
        child_close: None,
        child_start: None,
        child_duration: None,
        child2_total: None,
        child2_down: None,
        child2_close: None,
        child2_start: None,
        child2_duration: None,
        car_total: None,
        car_down: None,
        car_close: None,
        car_start: None,
        car_duration: None,
        savings_amount: None,
        savings_rate: None,
        savings_limit: None,
        savings_start: None,
        savings_duration: None,
        market_amount: None,
        market_limit: None,
        market_start: None,
        market_duration: None,
        retirement_amount: None,
        retirement_limit: None,
        retirement_start: None,
        retirement_duration: None,
    }
}

fn simulate_from_payload(
    payload: SimulatePayload,
    market: Option<Arc<MarketData>>,
) -> Result<SimulationOutput, String> {
    let cli = cli_from_payload(payload);
    let (scenario, params) = build_scenario(&cli)?;
    Simulator::new(&scenario, params, market)
        .map_err(|e| e.to_string())?
        .run()
        .map_err(|e| e.to_string())
}

pub async fn run_http_server(port: u16, data_path: &Path) -> std::io::Result<()> {
    let market = match MarketData::load(data_path) {
        Ok(data) => Some(Arc::new(data)),
        Err(e) => {
            eprintln!("warning: {e}; requests declaring market funds will be rejected");
            None
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .fallback(not_found_handler)
        .with_state(AppState { market });

    let listener = TcpListener::bind(addr).await?;
    println!("nestegg HTTP API listening on http://{addr}");
    println!("Local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload)
}

async fn simulate_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload)
}

fn simulate_handler_impl(state: AppState, payload: SimulatePayload) -> Response {
    match simulate_from_payload(payload, state.market) {
        Ok(output) => json_response(StatusCode::OK, output),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
