// ABOUTME: provides a user-facing cli for running and managing scripts on the local execution daemon.
// ABOUTME: mirrors followed output onto local stdout and stderr and exits with the script's verdict.

use std::io::Write;

use clap::{ArgGroup, Parser, Subcommand};
use scriptbox_common::{
    parse_frame, ExecutionId, ExecutionRef, Frame, ListRequest, Request, ScriptType, StreamKind,
    DEFAULT_LIST_LIMIT,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use scriptctl::{build_execute_request, exit_code_for, RunOptions, ScriptSource};

#[derive(Debug, Parser)]
#[command(name = "scriptctl")]
struct Args {
    #[arg(long, global = true, default_value = "/tmp/scriptboxd.sock")]
    socket_path: String,

    /// Print raw response frames instead of rendering them.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(group(ArgGroup::new("source").required(true).args(["file", "script_id"])))]
    Run {
        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        script_id: Option<String>,

        /// Inferred from the file extension when omitted.
        #[arg(long = "type")]
        script_type: Option<ScriptType>,

        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Seconds; 0 disables the deadline.
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        detach: bool,
    },
    Stop {
        execution_id: ExecutionId,
    },
    Status {
        execution_id: ExecutionId,
    },
    List {
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let request = match args.command {
        Command::Run {
            file,
            script_id,
            script_type,
            params,
            timeout,
            detach,
        } => {
            let source = match (file, script_id) {
                (Some(path), _) => {
                    let content = tokio::fs::read_to_string(&path).await?;
                    ScriptSource::Inline { path, content }
                }
                (None, Some(script_id)) => ScriptSource::Stored { script_id },
                (None, None) => anyhow::bail!("either --file or --script-id is required"),
            };
            build_execute_request(RunOptions {
                source,
                script_type,
                params,
                timeout_sec: timeout,
                follow: !detach,
            })?
        }
        Command::Stop { execution_id } => Request::Stop(ExecutionRef { execution_id }),
        Command::Status { execution_id } => Request::Status(ExecutionRef { execution_id }),
        Command::List { limit } => Request::List(ListRequest { limit }),
        Command::Ping => Request::Ping,
    };

    let code = send(&args.socket_path, &request, args.json).await?;
    std::process::exit(code);
}

/// Sends one request and renders each frame as it arrives. Returns the process exit code.
async fn send(socket_path: &str, request: &Request, json: bool) -> anyhow::Result<i32> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(serde_json::to_string(request)?.as_bytes()).await?;
    stream.shutdown().await?;

    let mut code = 0;
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if json {
            println!("{line}");
        }
        let frame = parse_frame(&line)?;
        if !json {
            render(&frame)?;
        }
        code = match &frame {
            Frame::Finished { record } => exit_code_for(record),
            Frame::Error(_) => 1,
            _ => code,
        };
    }
    Ok(code)
}

fn render(frame: &Frame) -> anyhow::Result<()> {
    match frame {
        Frame::Started { execution_id } => eprintln!("started {execution_id}"),
        Frame::Output(line) => match line.stream {
            StreamKind::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(line.text.as_bytes())?;
                out.flush()?;
            }
            StreamKind::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(line.text.as_bytes())?;
                err.flush()?;
            }
        },
        Frame::Finished { record } => {
            let exit = record
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            eprintln!("{} {} (exit {exit})", record.id, record.status);
        }
        Frame::Stopped { execution_id, live } => {
            if *live {
                println!("stop requested for {execution_id}");
            } else {
                println!("{execution_id} is not running");
            }
        }
        Frame::Status { record: Some(record) } => println!("{}", serde_json::to_string_pretty(record)?),
        Frame::Status { record: None } => println!("unknown execution"),
        Frame::Executions { records } => {
            for record in records {
                println!(
                    "{}  {:<10} {:<8} {}  {}",
                    record.id,
                    record.status,
                    record.script_type,
                    record.started_at.to_rfc3339(),
                    record.script_id
                );
            }
        }
        Frame::Pong => println!("pong"),
        Frame::Error(err) => eprintln!("error: {}", serde_json::to_string(err)?),
    }
    Ok(())
}
