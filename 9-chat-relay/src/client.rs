use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::SendArgs,
    frame::write_frame,
    message::SYSTEM_AUTHOR,
};

type ServerLines = Lines<BufReader<OwnedReadHalf>>;
type StdinLines = Lines<BufReader<Stdin>>;

pub async fn run(args: SendArgs) -> Result<()> {
    let (mut server, mut writer) = establish_connection(&args).await?;
    write_frame(&mut writer, &args.username)
        .await
        .context("failed to send username")?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut server, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &SendArgs) -> Result<(ServerLines, OwnedWriteHalf)> {
    let server = args.server();
    let stream = TcpStream::connect(server).await.with_context(|| {
        format!("failed to connect to {server}: the server is either full or shut down")
    })?;

    info!("connected to {}", server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader).lines(), writer))
}

// `next_line` is cancel safe, so a half-received line survives losing the race.
async fn run_client_loop(
    server: &mut ServerLines,
    writer: &mut OwnedWriteHalf,
    stdin: &mut StdinLines,
) -> Result<()> {
    loop {
        select! {
            line = server.next_line() => {
                if !handle_server_line(line).await? {
                    break;
                }
            }
            input = stdin.next_line() => {
                if !handle_stdin_input(input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(line: io::Result<Option<String>>) -> Result<bool> {
    match line? {
        Some(line) => {
            if !line.is_empty() {
                write_stdout(&render_line(&line)).await?;
            }
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    input: io::Result<Option<String>>,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let Some(input) = input? else {
        return Ok(false);
    };

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    write_frame(writer, text).await?;
    Ok(true)
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

/// Splits a relayed line on its first colon into author and text.
/// Announcements from the relay render as `*** text`, chat as `<author> text`.
pub fn render_line(line: &str) -> String {
    match line.split_once(':') {
        Some((SYSTEM_AUTHOR, text)) => format!("*** {}", text.trim_start()),
        Some((author, text)) => format!("<{author}> {}", text.trim_start()),
        None => line.to_string(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
