//! Stand-in capture agent
//!
//! Sends hand-made reports to a running server and prints the commands it
//! streams back. Useful for exercising the server without Docker.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tr_core::config::{BackoffConfig, DEFAULT_PORT};
use tr_protocol::{Command, ContainerRecord, FlowFragment};
use tr_server::client::AgentClient;

#[derive(Parser)]
#[command(name = "trayce-send")]
#[command(about = "Send agent reports to a Trayce server")]
#[command(version)]
struct Args {
    /// Server address
    #[arg(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    addr: String,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 1)]
    attempts: u32,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report an HTTP request followed by its response
    Flow {
        /// Correlation id shared by both halves
        #[arg(long, default_value = "1234")]
        uuid: String,

        /// Host header of the request
        #[arg(long, default_value = "www.example.com")]
        host: String,

        /// Request path
        #[arg(long, default_value = "/")]
        path: String,

        /// Only send the request half
        #[arg(long)]
        request_only: bool,
    },

    /// Announce that the agent started
    Started,

    /// Report containers, given as ID:IMAGE
    Containers {
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Open the command stream and print received commands
    Listen {
        /// Exit after this many commands
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let client = AgentClient::connect_with_backoff(&args.addr, &BackoffConfig::default(), Some(args.attempts.max(1)))
        .await
        .with_context(|| format!("Failed to connect to {}", args.addr))?;

    match args.command {
        Commands::Flow {
            uuid,
            host,
            path,
            request_only,
        } => {
            let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\n\r\n", path, host);
            let fragment = FlowFragment::request(uuid.clone(), request)
                .with_endpoints("172.17.0.3", "172.17.0.2", "tcp", "http");
            let status = client.send_flows(vec![fragment]).await?;
            println!("request: {}", status);

            if !request_only {
                let response = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"hello\":\"world\"}";
                let fragment = FlowFragment::response(uuid, response)
                    .with_endpoints("172.17.0.3", "172.17.0.2", "tcp", "http");
                let status = client.send_flows(vec![fragment]).await?;
                println!("response: {}", status);
            }
        }

        Commands::Started => {
            println!("{}", client.send_agent_started().await?);
        }

        Commands::Containers { containers } => {
            let records = containers
                .iter()
                .map(|spec| parse_container(spec))
                .collect::<Result<Vec<_>>>()?;
            println!("{}", client.send_containers(records).await?);
        }

        Commands::Listen { count } => {
            let mut stream = client.open_command_stream().await?;
            let mut received = 0;

            while let Some(command) = stream.next_command().await? {
                match &command {
                    Command::SetSettings(settings) => {
                        println!("{}: {}", command.type_name(), settings.container_ids.join(","));
                    }
                }
                received += 1;
                if count.is_some_and(|n| received >= n) {
                    stream.close().await?;
                    break;
                }
            }
        }
    }

    Ok(())
}

fn parse_container(spec: &str) -> Result<ContainerRecord> {
    let Some((id, image)) = spec.split_once(':') else {
        bail!("Expected ID:IMAGE, got {:?}", spec);
    };
    Ok(ContainerRecord {
        id: id.to_string(),
        name: id.to_string(),
        status: "running".to_string(),
        image: image.to_string(),
        ip: String::new(),
    })
}
