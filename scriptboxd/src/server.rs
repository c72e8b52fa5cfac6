// ABOUTME: hosts the unix socket server that accepts one json request per connection.
// ABOUTME: answers with json-lines frames, streaming script output live when the client follows.

use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use scriptbox_common::{
    parse_request, validate_request, ErrorCode, ExecuteRequest, Frame, OutputLine, Request, RequestError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::pump::OutputSink;
use crate::engine::{Engine, EngineError};
use crate::scripts::ScriptCatalog;

const MAX_REQUEST_BYTES: usize = 256 * 1024;
#[cfg(test)]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(50);
#[cfg(not(test))]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct PeerCredentials {
    pid: i32,
    uid: u32,
    gid: u32,
}

struct Server {
    engine: Engine,
    catalog: ScriptCatalog,
}

pub async fn run(socket_path: &str, engine: Engine, catalog: ScriptCatalog) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path)
            .await
            .with_context(|| format!("remove existing socket at {socket_path}"))?;
    }

    let listener = UnixListener::bind(socket_path).with_context(|| format!("bind {socket_path}"))?;
    info!(socket_path, scripts_dir = %catalog.dir().display(), "listening");

    let server = Arc::new(Server { engine, catalog });
    loop {
        let (stream, _addr) = listener.accept().await?;
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, &server).await {
                warn!(error = %err, "client request failed");
            }
        });
    }
}

async fn handle_client(mut stream: UnixStream, server: &Server) -> anyhow::Result<()> {
    let peer = peer_credentials(&stream);

    let mut input = Vec::new();
    let mut buf = [0u8; 4096];
    let mut exceeded = false;
    let mut idle = false;
    loop {
        let n = match tokio::time::timeout(READ_IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => {
                idle = true;
                break;
            }
        };
        if n == 0 {
            break;
        }
        if exceeded {
            continue;
        }
        if input.len() + n > MAX_REQUEST_BYTES {
            exceeded = true;
            continue;
        }
        input.extend_from_slice(&buf[..n]);
    }

    if exceeded {
        return finish_with_error(&mut stream, ErrorCode::RequestTooLarge, "request exceeds max bytes").await;
    }

    if idle && input.is_empty() {
        return finish_with_error(&mut stream, ErrorCode::ParseFailed, "read timed out").await;
    }

    let input_str = String::from_utf8_lossy(&input);
    let request = match parse_request(&input_str) {
        Ok(r) => r,
        Err(err) => {
            return finish_with_error(&mut stream, ErrorCode::ParseFailed, &format!("parse failed: {err}")).await;
        }
    };

    if let Err(err) = validate_request(&request) {
        return finish_with_error(
            &mut stream,
            ErrorCode::ValidationFailed,
            &format!("validation failed: {}", err.message),
        )
        .await;
    }

    info!(
        peer_pid = peer.map(|p| p.pid),
        peer_uid = peer.map(|p| p.uid),
        peer_gid = peer.map(|p| p.gid),
        request = request_kind(&request),
        "request received"
    );

    match request {
        Request::Execute(exec) => handle_execute(&mut stream, server, exec).await?,
        Request::Stop(target) => {
            let live = server.engine.stop_execution(&target.execution_id);
            write_frame(
                &mut stream,
                &Frame::Stopped {
                    execution_id: target.execution_id,
                    live,
                },
            )
            .await?;
        }
        Request::Status(target) => match server.engine.status(&target.execution_id).await {
            Ok(record) => write_frame(&mut stream, &Frame::Status { record }).await?,
            Err(err) => write_error(&mut stream, ErrorCode::Internal, &format!("{err:#}")).await?,
        },
        Request::List(list) => match server.engine.list(list.limit).await {
            Ok(records) => write_frame(&mut stream, &Frame::Executions { records }).await?,
            Err(err) => write_error(&mut stream, ErrorCode::Internal, &format!("{err:#}")).await?,
        },
        Request::Ping => write_frame(&mut stream, &Frame::Pong).await?,
    }

    stream.shutdown().await?;
    Ok(())
}

async fn handle_execute(stream: &mut UnixStream, server: &Server, exec: ExecuteRequest) -> anyhow::Result<()> {
    let spec = match server.catalog.resolve(&exec).await {
        Ok(spec) => spec,
        Err(err) => return write_error(stream, error_code(&err), &err.to_string()).await,
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let sink: Option<OutputSink> = if exec.follow {
        Some(Arc::new(move |line: &OutputLine| {
            let _ = tx.send(line.clone());
        }))
    } else {
        None
    };

    let execution_id = match server.engine.execute(spec, sink).await {
        Ok(id) => id,
        Err(err) => return write_error(stream, error_code(&err), &err.to_string()).await,
    };
    write_frame(stream, &Frame::Started { execution_id }).await?;

    if !exec.follow {
        return Ok(());
    }

    // the channel closes once the pump has delivered its last line
    while let Some(line) = rx.recv().await {
        if let Err(err) = write_frame(stream, &Frame::Output(line)).await {
            debug!(execution_id = %execution_id, error = %err, "follower went away; execution continues");
            return Ok(());
        }
    }

    match server.engine.wait_finished(&execution_id).await? {
        Some(record) => write_frame(stream, &Frame::Finished { record }).await,
        None => write_error(stream, ErrorCode::Internal, "execution record missing from store").await,
    }
}

fn error_code(err: &EngineError) -> ErrorCode {
    match err {
        EngineError::Spawn { .. } => ErrorCode::SpawnFailed,
        EngineError::UnsupportedScriptType(_) => ErrorCode::UnsupportedScriptType,
        EngineError::MissingScriptType => ErrorCode::ValidationFailed,
        EngineError::ScriptNotFound(_) | EngineError::InvalidScriptId(_) => ErrorCode::ScriptNotFound,
        EngineError::Catalog { .. } | EngineError::Internal(_) => ErrorCode::Internal,
    }
}

fn request_kind(request: &Request) -> &'static str {
    match request {
        Request::Execute(_) => "execute",
        Request::Stop(_) => "stop",
        Request::Status(_) => "status",
        Request::List(_) => "list",
        Request::Ping => "ping",
    }
}

fn peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    let fd = stream.as_raw_fd();

    let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut ucred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    if len as usize != std::mem::size_of::<libc::ucred>() {
        return None;
    }

    Some(PeerCredentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

async fn write_frame(stream: &mut UnixStream, frame: &Frame) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    Ok(())
}

async fn write_error(stream: &mut UnixStream, code: ErrorCode, message: &str) -> anyhow::Result<()> {
    let frame = Frame::Error(RequestError {
        code,
        message: message.to_string(),
    });
    write_frame(stream, &frame).await
}

async fn finish_with_error(stream: &mut UnixStream, code: ErrorCode, message: &str) -> anyhow::Result<()> {
    let _ = write_error(stream, code, message).await;
    let _ = stream.shutdown().await;
    Ok(())
}
