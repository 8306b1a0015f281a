// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, io, path::Path, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod command;
mod config;
mod configure;
mod consts;
mod daemon;
mod ping;
mod protocol;
mod start;
mod status;
mod stop;

const DEFAULT_CONFIG_PATH: &str = "jarpool.json";

/// The command line arguments that jarpool expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

In most modes logs are discarded by default, but if jarpool is
running in daemon mode, the logs will go to stderr by default."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short = 'c',
        long = "configuration",
        value_name = "PATH",
        help = "a json file containing configuration"
    )]
    pub configuration: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that jarpool supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Run the supervisor daemon in the foreground")]
    Execute,

    #[clap(about = "Show the status of every managed server")]
    Status,

    #[clap(about = "Start a managed server")]
    Start {
        #[clap(help = "The configured name of the server")]
        name: String,
    },

    #[clap(about = "Stop a managed server

The server is asked to shut itself down via its own console, so
players see the shutdown message and the world saves cleanly.")]
    Stop {
        #[clap(short, long, help = "Message broadcast to players before shutdown")]
        message: Option<String>,
        #[clap(help = "The configured name of the server")]
        name: String,
    },

    #[clap(about = "Start every server that is eligible to start")]
    StartAll,

    #[clap(about = "Stop every running server")]
    StopAll {
        #[clap(short, long, help = "Message broadcast to players before shutdown")]
        message: Option<String>,
    },

    #[clap(about = "Send a console command to a running server")]
    Command {
        #[clap(short, long, help = "The server to send the command to")]
        server: Option<String>,
        #[clap(help = "The console command to inject", required = true)]
        command: Vec<String>,
    },

    #[clap(about = "Check that the daemon is up and answering")]
    Ping,

    #[clap(about = "Write a starter configuration file")]
    Configure {
        #[clap(help = "Where to write the file", default_value = DEFAULT_CONFIG_PATH)]
        path: String,
    },
}

/// Run the jarpool tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let config = load_configuration(&args)?;

    let trace_level = if args.verbose == 0 {
        config
            .str_of("logging.level")
            .and_then(parse_level)
            .unwrap_or(tracing::Level::INFO)
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if let Commands::Execute = args.command {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let port = config.u64_of("networking.port", consts::DEFAULT_PORT as u64) as u16;
    let client = protocol::Client::new(port);

    let res: anyhow::Result<()> = match args.command {
        Commands::Execute => daemon::run(config),
        Commands::Status => status::run(&client),
        Commands::Start { name } => start::run(&client, &name),
        Commands::StartAll => start::run_all(&client),
        Commands::Stop { name, message } => stop::run(&client, &name, message.as_deref()),
        Commands::StopAll { message } => stop::run_all(&client, message.as_deref()),
        Commands::Command { server, command } => {
            command::run(&client, server.as_deref(), &command.join(" "))
        }
        Commands::Ping => ping::run(&client),
        Commands::Configure { path } => configure::run(Path::new(&path)),
    };

    if let Err(err) = res {
        error!("{:?}", err);
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }

    Ok(())
}

/// Load the config named by -c, or the default file if it exists.
/// The daemon refuses to run without one; client commands fall
/// back to built-in defaults.
fn load_configuration(args: &Args) -> anyhow::Result<config::Config> {
    match &args.configuration {
        Some(path) => config::read_config(Path::new(path)),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                config::read_config(default)
            } else if let Commands::Execute = args.command {
                Err(anyhow!("configuration file not found: {}", default.display()))
                    .context("the daemon needs a configuration file (see `jarpool configure`)")
            } else {
                Ok(config::Config::default())
            }
        }
    }
}

fn parse_level(level: &str) -> Option<tracing::Level> {
    match level.to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
