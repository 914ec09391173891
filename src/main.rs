use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use uiprobe::client::{ProbeClient, ProbeResponse};
use uiprobe::component::endpoints as builtin;
use uiprobe::config::ServerConfig;
use uiprobe::logging::{self, LogConfig};
use uiprobe::server::run_file::RunFile;

#[derive(Parser)]
#[command(name = "uiprobe")]
#[command(about = "Drive an application embedding the uiprobe automation server", long_about = None)]
struct Cli {
    #[command(flatten)]
    target: Target,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Server address; overrides the run file
    #[arg(long, global = true)]
    addr: Option<SocketAddr>,

    /// Run file written by the server; defaults to the configured location
    #[arg(long, global = true)]
    run_file: Option<PathBuf>,

    /// TOML configuration used to locate the run file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Whether a component with the id exists
    Exists { id: String },
    /// Whether the component exists and is visible
    Visible { id: String },
    /// Describe a component
    Info {
        id: String,
        #[arg(long)]
        recursive: bool,
    },
    /// Press and release a component
    Click {
        id: String,
        /// Milliseconds between press and release
        #[arg(long)]
        time: Option<u64>,
    },
    /// Save a PNG of a component
    Render {
        id: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        with_children: bool,
    },
    /// Ask the server to sleep
    Sleep {
        #[arg(long, default_value_t = 100)]
        time: u64,
        /// Sleep on the UI thread instead of a worker
        #[arg(long)]
        message_thread: bool,
    },
    /// Run a script file inside the application
    Script { file: PathBuf },
    /// Print the port recorded in the run file
    Port,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogConfig {
        json: cli.json,
        verbose: cli.verbose,
        ..Default::default()
    });

    let target = &cli.target;
    let client = || connect(target);
    match cli.command {
        Commands::Port => {
            let info = RunFile::read(&run_file_path(target)?)?;
            println!("{}", info.port);
        }
        Commands::Exists { id } => print_result(&client()?.call(builtin::COMPONENT_EXISTS, &json!({ "id": id })).await?)?,
        Commands::Visible { id } => print_result(&client()?.call(builtin::COMPONENT_VISIBLE, &json!({ "id": id })).await?)?,
        Commands::Info { id, recursive } => {
            let response = client()?
                .call(builtin::COMPONENT_INFO, &json!({ "id": id, "recursive": recursive }))
                .await?;
            print_result(&response)?
        }
        Commands::Click { id, time } => {
            let mut params = json!({ "id": id });
            if let Some(time) = time {
                params["time"] = json!(time);
            }
            print_result(&client()?.call(builtin::COMPONENT_CLICK, &params).await?)?
        }
        Commands::Render {
            id,
            out,
            with_children,
        } => {
            let response = client()?
                .call(builtin::COMPONENT_RENDER, &json!({ "id": id, "withChildren": with_children }))
                .await?;
            if !response.is_success() {
                response.result::<Value>()?;
                bail!("render failed with status {}", response.status);
            }
            std::fs::write(&out, &response.body)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("{}", out.display());
        }
        Commands::Sleep {
            time,
            message_thread,
        } => {
            let response = client()?
                .call(builtin::SLEEP, &json!({ "time": time, "messageThread": message_thread }))
                .await?;
            print_result(&response)?
        }
        Commands::Script { file } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            print_result(&client()?.run_script(&source).await?)?
        }
    }

    Ok(())
}

fn connect(target: &Target) -> Result<ProbeClient> {
    if let Some(addr) = target.addr {
        return Ok(ProbeClient::new(addr));
    }
    let path = run_file_path(target)?;
    ProbeClient::from_run_file(&path)
        .with_context(|| format!("No running server found via {}", path.display()))
}

fn run_file_path(target: &Target) -> Result<PathBuf> {
    if let Some(path) = &target.run_file {
        return Ok(path.clone());
    }
    let config = ServerConfig::load(target.config.as_deref()).context("Failed to load configuration")?;
    Ok(config.run_file_path())
}

fn print_result(response: &ProbeResponse) -> Result<()> {
    let result: Value = response.result()?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
