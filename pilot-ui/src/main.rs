//! Pilot dashboard server: submit tasks, stop them, and watch the event stream.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use pilot::intake::{self, TaskQueue};
use pilot::io::config::DEFAULT_CONFIG_PATH;
use pilot::runtime::Runtime;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "pilot-ui")]
#[command(about = "Web dashboard for submitting tasks and following the agent live")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Pilot configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pilot_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "starting pilot-ui");

    let runtime = Runtime::load(&args.config)?;
    let planner = runtime.planner()?;
    let tools = planner.tools().to_vec();
    let (queue, tasks) = TaskQueue::new(
        runtime.config.planner.queue_capacity,
        runtime.config.safety.clone(),
        runtime.stop.clone(),
        runtime.events.clone(),
    );
    let _worker = intake::spawn_worker(planner, tasks, runtime.stop.clone(), |task, outcome| {
        info!(
            task_id = %task.id,
            complete = outcome.complete,
            turns = outcome.turns,
            "task finished"
        );
    })?;

    let state = AppState::new(queue, runtime.events.clone(), runtime.fixes.clone(), tools);
    sse::start_event_bridge(&state, runtime.config.events.subscriber_capacity);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
