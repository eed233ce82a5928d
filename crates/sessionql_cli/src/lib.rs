//! Command-line client for sessionql.
//!
//! # Usage
//!
//! ```bash
//! # Run a query
//! sessionql --endpoint https://local.nhost.run/v1/graphql --token $TOKEN query '{ todos { id } }'
//!
//! # Read the document from a file and pass variables
//! sessionql query @todos.graphql --variables '{"limit": 10}'
//!
//! # Run a mutation with an extra header
//! sessionql -H x-hasura-role=user mutate 'mutation { delete_todos(where: {}) { affected_rows } }'
//!
//! # Follow a subscription and swap the token after 30 seconds
//! sessionql subscribe 'subscription { todos { id } }' --rotate-token $NEW_TOKEN --rotate-after 30
//! ```
//!
//! The endpoint and token may also come from `SESSIONQL_ENDPOINT` and
//! `SESSIONQL_TOKEN`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use futures::StreamExt;
use sessionql_sdk::{
    Capabilities, Client, ClientConfig, ClientError, Operation, OperationKind, RequestPolicy,
    Response, TokenStore,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sessionql")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// GraphQL endpoint (http or https)
    #[arg(long, global = true, env = "SESSIONQL_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Access token sent as a bearer credential
    #[arg(long, global = true, env = "SESSIONQL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Extra header as NAME=VALUE (repeatable)
    #[arg(short = 'H', long = "header", global = true, value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Default request policy
    #[arg(long, global = true, value_enum)]
    pub policy: Option<Policy>,

    /// Never open WebSocket connections
    #[arg(long, global = true)]
    pub no_streaming: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Policy {
    CacheFirst,
    CacheOnly,
    NetworkOnly,
    CacheAndNetwork,
}

impl From<Policy> for RequestPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::CacheFirst => RequestPolicy::CacheFirst,
            Policy::CacheOnly => RequestPolicy::CacheOnly,
            Policy::NetworkOnly => RequestPolicy::NetworkOnly,
            Policy::CacheAndNetwork => RequestPolicy::CacheAndNetwork,
        }
    }
}

/// Arguments shared by every operation command.
#[derive(Args, Debug)]
pub struct RequestArgs {
    /// GraphQL document, or @path to read it from a file
    pub document: String,

    /// Variables as a JSON object
    #[arg(long)]
    pub variables: Option<String>,

    /// Operation to run in a multi-operation document
    #[arg(long)]
    pub operation_name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a query over HTTP
    Query {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Run a mutation over HTTP
    Mutate {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Follow a subscription over WebSocket
    Subscribe {
        #[command(flatten)]
        request: RequestArgs,

        /// Token to switch to while the subscription runs
        #[arg(long)]
        rotate_token: Option<String>,

        /// Seconds to wait before switching tokens
        #[arg(long, default_value = "5", requires = "rotate_token")]
        rotate_after: u64,

        /// Stop after this many events
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print version information
    Version,
}

/// Runs a parsed command line and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let (request, kind) = match &cli.command {
        Commands::Version => {
            println!("sessionql {}", env!("CARGO_PKG_VERSION"));
            return Ok(0);
        }
        Commands::Query { request } => (request, OperationKind::Query),
        Commands::Mutate { request } => (request, OperationKind::Mutation),
        Commands::Subscribe { request, .. } => (request, OperationKind::Subscription),
    };

    let operation = build_operation(kind, request)?;
    let auth = match &cli.token {
        Some(token) => TokenStore::with_token(token.clone()),
        None => TokenStore::new(),
    };
    let client = Client::builder()
        .config(client_config(&cli)?)
        .auth_provider(Arc::new(auth.clone()))
        .build()?;

    if cli.verbose {
        println!("{} {}", "Endpoint".blue(), client.url());
    }

    let code = match cli.command {
        Commands::Subscribe {
            rotate_token,
            rotate_after,
            limit,
            ..
        } => {
            let rotation = rotate_token.map(|token| (token, Duration::from_secs(rotate_after)));
            follow_subscription(&client, &auth, operation, rotation, limit, cli.quiet).await?
        }
        _ => {
            let response = client.request(operation).await?;
            print_response(&response, cli.quiet)
        }
    };

    client.dispose();
    Ok(code)
}

/// Exit code for a failed run: 3 when the server rejected the credential,
/// 2 for configuration problems, 1 for everything else.
pub fn exit_code(error: &(dyn std::error::Error + 'static)) -> i32 {
    match error.downcast_ref::<ClientError>() {
        Some(error) if error.code.is_auth_error() => 3,
        Some(error) if error.is_fatal() => 2,
        _ => 1,
    }
}

/// Layers command-line flags over `SESSIONQL_*` environment settings.
pub fn client_config(cli: &Cli) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = ClientConfig::from_env()?;
    if let Some(endpoint) = &cli.endpoint {
        config = config.endpoint_url(endpoint.clone());
    }
    for (name, value) in &cli.headers {
        config = config.header(name, value.clone());
    }
    if let Some(policy) = cli.policy {
        config = config.request_policy(policy.into());
    }
    if cli.no_streaming {
        config = config.capabilities(Capabilities::restricted());
    }
    Ok(config)
}

/// Builds the operation described by `request`.
pub fn build_operation(
    kind: OperationKind,
    request: &RequestArgs,
) -> Result<Operation, Box<dyn std::error::Error>> {
    let document = match request.document.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))?,
        None => request.document.clone(),
    };
    let mut operation = Operation::new(kind, document);
    if let Some(variables) = &request.variables {
        let variables: serde_json::Value = serde_json::from_str(variables)
            .map_err(|e| format!("--variables is not valid JSON: {e}"))?;
        if !variables.is_object() {
            return Err("--variables must be a JSON object".into());
        }
        operation = operation.variables(variables);
    }
    if let Some(name) = &request.operation_name {
        operation = operation.operation_name(name.clone());
    }
    Ok(operation)
}

async fn follow_subscription(
    client: &Client,
    auth: &TokenStore,
    operation: Operation,
    rotation: Option<(String, Duration)>,
    limit: Option<usize>,
    quiet: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let mut events = client.subscribe(operation).await?;

    if let Some((token, after)) = rotation {
        let auth = auth.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            info!(after_secs = after.as_secs(), "rotating access token");
            auth.set(Some(token));
        });
    }

    let mut received = 0usize;
    let mut code = 0;
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    break;
                };
                code = code.max(print_response(&event?, quiet));
                received += 1;
                if limit.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if !quiet {
        eprintln!("{} {} event(s)", "Received".green().bold(), received);
    }
    Ok(code)
}

/// Prints data to stdout and GraphQL errors to stderr. Returns 1 when the
/// response carried errors.
fn print_response(response: &Response, quiet: bool) -> i32 {
    if let Some(data) = &response.data {
        match serde_json::to_string_pretty(data) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("{data}"),
        }
    }
    for error in &response.errors {
        eprintln!("{} {}", "Error".red().bold(), error.message);
        if !quiet {
            if let Some(path) = &error.path {
                let path: Vec<String> = path.iter().map(ToString::to_string).collect();
                eprintln!("  {} {}", "-->".blue(), path.join("."));
            }
        }
    }
    i32::from(response.has_errors())
}

/// Parses `NAME=VALUE`.
pub fn parse_header(input: &str) -> Result<(String, String), String> {
    let (name, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{input}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{input}`"));
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}
