use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    dispatch::{render, Interactions},
    load_config,
    pipeline::{ConnectionState, PipelineOptions, PipelineUpdate, StreamPipeline},
    push::StreamRequest,
    OrchestratorClient,
};
use futures::StreamExt;
use protocol::envelope::ResponseEnvelope;
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod render;

use render::TerminalRenderer;

#[derive(Parser, Debug)]
#[command(name = "console", about = "Terminal front end for the orchestrator protocol")]
struct Args {
    /// TOML configuration file (defaults to ./orchestrator-client.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[arg(long, global = true)]
    tenant: Option<String>,
    #[arg(long, global = true)]
    user: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Requests a composed response for a route and renders its chunks.
    Fetch {
        route: String,
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Sends a user action.
    Action {
        action_id: String,
        #[arg(long, default_value = "null")]
        payload: String,
    },
    /// Submits form data as a flat JSON object.
    Submit {
        form_id: String,
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Fetches the adjacency-list form of a route and prints it depth first.
    Graph {
        route: String,
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Follows the push stream for a route until it completes or Ctrl-C.
    Stream {
        route: String,
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        max_events: Option<usize>,
        #[arg(long)]
        no_reconnect: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if let Some(tenant) = args.tenant {
        config.tenant_id = tenant;
    }
    if let Some(user) = args.user {
        config.user_id = user;
    }

    let client = OrchestratorClient::new(&config)
        .with_context(|| format!("failed to build client for {}", config.base_url))?;
    info!(base_url = %config.base_url, tenant_id = %config.tenant_id, "console started");

    match args.command {
        Command::Fetch { route, params } => {
            let envelope = client
                .fetch_orchestrator_output(&route, parse_json("--params", &params)?)
                .await?;
            print_envelope(&envelope);
        }
        Command::Action { action_id, payload } => {
            let envelope = client
                .send_action(&action_id, parse_json("--payload", &payload)?)
                .await?;
            print_envelope(&envelope);
        }
        Command::Submit { form_id, data } => {
            let data: Map<String, Value> = serde_json::from_str(&data)
                .context("--data must be a JSON object")?;
            let envelope = client.submit_form(&form_id, data).await?;
            print_envelope(&envelope);
        }
        Command::Graph { route, params } => {
            let mut graph = client
                .fetch_adjacency_list(&route, parse_json("--params", &params)?)
                .await?;
            let applied = graph.apply_operations().context("failed to apply graph operations")?;
            info!(applied, nodes = graph.nodes.len(), "graph loaded");
            for node in graph.walk() {
                println!("{} [{}] {}", node.id, node.node_type, Value::Object(node.props.clone()));
            }
        }
        Command::Stream {
            route,
            params,
            max_events,
            no_reconnect,
        } => {
            let mut options = PipelineOptions::from_config(&config.stream);
            if let Some(max_events) = max_events {
                options.max_events = max_events;
            }
            if no_reconnect {
                options.auto_reconnect = false;
            }
            let request = StreamRequest::new(route, parse_json("--params", &params)?);
            follow_stream(Arc::new(client), request, options).await;
        }
    }

    Ok(())
}

fn parse_json(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} must be valid JSON"))
}

fn print_envelope(envelope: &ResponseEnvelope) {
    println!("# {} ({})", envelope.request_id, envelope.state);
    if let Some(explanation) = &envelope.explanation {
        println!("{explanation}");
    }
    for chunk in render(envelope, &mut TerminalRenderer, &Interactions::noop()) {
        println!("{}", chunk.output);
    }
}

async fn follow_stream(
    client: Arc<OrchestratorClient>,
    request: StreamRequest,
    options: PipelineOptions,
) {
    let auto_reconnect = options.auto_reconnect;
    let pipeline = StreamPipeline::new(client, request, options);
    let mut updates = Box::pin(pipeline.updates());
    pipeline.connect().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.next() => match update {
                None => break,
                Some(update) => {
                    if show_update(update, auto_reconnect) == Follow::Stop {
                        break;
                    }
                }
            },
        }
    }

    pipeline.disconnect().await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Follow {
    Continue,
    Stop,
}

// Without auto-reconnect a disconnect is final, so following stops there.
fn show_update(update: PipelineUpdate, auto_reconnect: bool) -> Follow {
    match update {
        PipelineUpdate::State(state) => {
            info!(?state, "stream state changed");
            if state == ConnectionState::Disconnected && !auto_reconnect {
                return Follow::Stop;
            }
        }
        PipelineUpdate::Progress(progress) => {
            println!("[{:>5.1}%] {} {}", progress.percentage, progress.stage, progress.message);
        }
        PipelineUpdate::Error(err) => eprintln!("stream error: {err}"),
        PipelineUpdate::Event(event) => {
            if let Some(Ok(envelope)) = event.envelope() {
                print_envelope(&envelope);
                if envelope.state.is_terminal() {
                    return Follow::Stop;
                }
            } else if let Some(error) = event.error() {
                eprintln!("orchestrator error: {}", error.message);
            }
        }
    }
    Follow::Continue
}
