//! Command execution.

use crate::Commands;
use colored::Colorize;
use myrtle_client::{ClientError, CommandRequest, Connection, NegotiationState};
use myrtle_protocol::{Capabilities, Command, OkPacket, ResponseKind};
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct Info<'a> {
    #[serde(flatten)]
    capabilities: &'a Capabilities,
    mariadb: bool,
    negotiation: NegotiationState,
    tls: bool,
    compressed: bool,
}

/// Executes a command and returns the formatted output.
pub async fn execute(
    conn: &mut Connection,
    cmd: Commands,
    timeout: Option<Duration>,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            run(conn, CommandRequest::new(Command::Ping), timeout).await?;
            Ok("PONG".green().to_string())
        }

        Commands::Info { json } => {
            let caps = conn.capabilities().ok_or(ClientError::NotConnected)?;
            let info = Info {
                capabilities: caps,
                mariadb: caps.is_mariadb(),
                negotiation: conn.negotiation_state(),
                tls: conn.is_tls(),
                compressed: conn.is_compressed(),
            };
            if json {
                return Ok(serde_json::to_string_pretty(&info)?);
            }
            Ok(format!(
                "{} {} ({})\n  thread id:   {}\n  protocol:    {}\n  flags:       {:#010x}\n  charset:     {}\n  auth plugin: {}\n  tls:         {}\n  compressed:  {}",
                "Server".bold(),
                caps.server_version.to_string().cyan(),
                caps.server_version_raw,
                caps.thread_id,
                caps.protocol_version,
                caps.flags.bits(),
                caps.charset,
                caps.auth_plugin.as_deref().unwrap_or("-"),
                info.tls,
                info.compressed
            ))
        }

        Commands::Stats => {
            let request = CommandRequest::new(Command::Statistics);
            let packet = run(conn, request, timeout).await?;
            Ok(String::from_utf8_lossy(packet.read_rest()).into_owned())
        }

        Commands::Query { sql } => {
            let request = CommandRequest::new(Command::Query).with_text(&sql);
            let kind = {
                let packet = run(conn, request, timeout).await?;
                ResponseKind::classify(packet)?
            };
            Ok(describe(kind, conn.last_response()))
        }

        Commands::InitDb { database } => {
            let request = CommandRequest::new(Command::InitDb).with_text(&database);
            run(conn, request, timeout).await?;
            Ok(format!("{} {}", "Database changed to".green(), database.cyan()))
        }

        Commands::ResetConnection => {
            let request = CommandRequest::new(Command::ResetConnection);
            run(conn, request, timeout).await?;
            Ok("Session reset".green().to_string())
        }
    }
}

async fn run<'c>(
    conn: &'c mut Connection,
    request: CommandRequest<'_>,
    timeout: Option<Duration>,
) -> Result<&'c mut myrtle_protocol::Packet, ClientError> {
    let request = match timeout {
        Some(timeout) => request.with_timeout(timeout),
        None => request,
    };
    conn.execute(request).await
}

fn describe(kind: ResponseKind, ok: &OkPacket) -> String {
    match kind {
        ResponseKind::Ok | ResponseKind::Eof => {
            let mut out = format!(
                "{}, {} row(s) affected",
                "Query OK".green(),
                ok.affected_rows
            );
            if ok.last_insert_id != 0 {
                out.push_str(&format!(", last insert id {}", ok.last_insert_id));
            }
            if ok.warnings != 0 {
                out.push_str(&format!(", {} warning(s)", ok.warnings).yellow().to_string());
            }
            if !ok.info.is_empty() {
                out.push_str(&format!("\n{}", ok.info.dimmed()));
            }
            out
        }
        ResponseKind::ResultSet { columns } => format!(
            "{} with {} column(s) (row decoding not supported)",
            "Result set".cyan(),
            columns
        ),
        ResponseKind::LocalInfile => "Server requested LOCAL INFILE (not supported)"
            .yellow()
            .to_string(),
        ResponseKind::Error => "Error".red().to_string(),
    }
}
