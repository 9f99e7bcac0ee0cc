// Copyright 2020 Joyent, Inc.

//! Serving side of the TCP transport. Each accepted connection carries one
//! request preamble and one call frame; the registry's full response is
//! written back and the connection is shut down.

use std::io::{Error, ErrorKind};
use std::sync::Arc;

use futures::StreamExt;
use slog::{debug, error, info, o, Drain, Logger};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;

use crate::protocol::{FastMessage, FastRpc};
use crate::registry::Registry;
use crate::transport::{status_reply, RequestHead, STATUS_BAD_REQUEST, STATUS_SERVER_ERROR};

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, Error> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::new(
            ErrorKind::UnexpectedEof,
            "connection closed before end of preamble",
        ));
    }
    Ok(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
}

async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<RequestHead, Error> {
    let target = RequestHead::parse_request_line(&read_line(reader).await?)?;
    let mut head = RequestHead::new(target);
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(head);
        }
        let (name, value) = RequestHead::parse_attribute_line(&line)?;
        head.set_attribute(&name, &value);
    }
}

/// Serve the single call carried by `socket`.
pub async fn make_task(socket: TcpStream, registry: Arc<Registry>, log: Option<&Logger>) {
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    let peer = socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let head = match read_head(&mut reader).await {
        Ok(head) => head,
        Err(e) => {
            debug!(log, "unreadable request preamble"; "peer" => &peer, "err" => %e);
            let response = status_reply(STATUS_BAD_REQUEST, &e.to_string());
            if let Err(e) = write_half.write_all(&response).await {
                error!(log, "failed to write response"; "peer" => &peer, "err" => %e);
            }
            let _ = write_half.shutdown().await;
            return;
        }
    };
    debug!(log, "received request"; "peer" => &peer, "target" => head.path());

    let frame: Result<FastMessage, Error> = match FramedRead::new(reader, FastRpc).next().await {
        Some(frame) => frame,
        None => Err(Error::new(
            ErrorKind::UnexpectedEof,
            "connection closed before the call frame",
        )),
    };

    // Handlers may make blocking nested calls of their own.
    let respond_registry = Arc::clone(&registry);
    let response =
        tokio::task::spawn_blocking(move || respond_registry.respond(&head, frame)).await;
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            error!(log, "request handler failed"; "peer" => &peer, "err" => %e);
            status_reply(STATUS_SERVER_ERROR, &format!("request handler failed: {}", e))
        }
    };

    if let Err(e) = write_half.write_all(&response).await {
        error!(log, "failed to write response"; "peer" => &peer, "err" => %e);
    }
    if let Err(e) = write_half.shutdown().await {
        debug!(log, "failed to shut down connection"; "peer" => &peer, "err" => %e);
    }
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>, log: Option<&Logger>) {
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    if let Ok(addr) = listener.local_addr() {
        info!(log, "listening for calls"; "address" => %addr, "url" => registry.base_url());
    }

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let task_log = log.clone();
                let task_registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    make_task(socket, task_registry, Some(&task_log)).await;
                });
            }
            Err(e) => error!(log, "failed to accept socket"; "err" => %e),
        }
    }
}
