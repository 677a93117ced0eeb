mod address;
mod config;
mod error;
mod forward;
mod mime;
mod rewrite;
mod routing;
mod smtp;
mod srs;
mod submit;

use log::{debug, error, info};
use std::env;
use std::io::{self, Read};
use std::process::ExitCode;
use std::sync::Arc;

use crate::config::FilterConfig;
use crate::forward::{Forwarder, Status};
use crate::submit::SmtpSubmitter;

/// sysexits.h EX_TEMPFAIL: Postfix defers the message and retries later.
const EX_TEMPFAIL: u8 = 75;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    info!("[main] fwdfilter starting, command={}", command);

    match command {
        "serve" => {
            let Some(forwarder) = build_forwarder() else {
                return ExitCode::from(EX_TEMPFAIL);
            };
            let listen_addr = forwarder.config().listen_addr.clone();
            let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("[main] cannot listen on {}: {}", listen_addr, e);
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = smtp::serve(listener, Arc::new(forwarder)).await {
                error!("[main] listener stopped: {}", e);
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        "filter" => {
            let (sender, recipients) = parse_filter_args(&args[2..]);
            info!(
                "[filter] running content filter sender={}, recipients={}",
                sender,
                recipients.join(", ")
            );

            let Some(forwarder) = build_forwarder() else {
                return ExitCode::from(EX_TEMPFAIL);
            };
            let mut raw = Vec::new();
            if let Err(e) = io::stdin().read_to_end(&mut raw) {
                error!("[filter] failed to read message from stdin: {}", e);
                return ExitCode::from(EX_TEMPFAIL);
            }
            debug!("[filter] read {} bytes from stdin", raw.len());

            let status = tokio::task::block_in_place(|| forwarder.process(&sender, &recipients, &raw));
            println!("{}", status);
            info!("[filter] content filter completed: {}", status);
            ExitCode::from(exit_status(status))
        }
        _ => {
            println!("Usage: fwdfilter <command>");
            println!();
            println!("Commands:");
            println!("  serve                       Accept mail from the MTA over SMTP (LISTEN_ADDR)");
            println!("  filter -f <sender> -- <rcpt>...");
            println!("                              Process one message read from stdin");
            println!();
            println!("Environment:");
            println!("  LOCAL_DOMAINS (required), FALLBACK_SENDER, ADMIN_ADDRESS, NOTIFY_SENDER,");
            println!("  SUBJECT_PREFIX, FORWARD_DEBUG, LISTEN_ADDR, REINJECT_HOST, REINJECT_PORT,");
            println!("  ADMIN_HOST, ADMIN_PORT, HELO_NAME, SMTP_TIMEOUT_SECS, RUST_LOG");
            ExitCode::SUCCESS
        }
    }
}

fn build_forwarder() -> Option<Forwarder> {
    let config = match FilterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("[main] invalid configuration: {}", e);
            return None;
        }
    };
    let submitter = SmtpSubmitter::new(&config.reinject, &config.helo_name, config.smtp_timeout);
    let notifier = SmtpSubmitter::new(&config.admin_relay, &config.helo_name, config.smtp_timeout);
    Some(Forwarder::new(config, Arc::new(submitter), Arc::new(notifier)))
}

/// Pipe-mode exit status: only a 2xx reply counts as delivered.
fn exit_status(status: Status) -> u8 {
    match status.code() {
        200..=299 => 0,
        _ => EX_TEMPFAIL,
    }
}

/// Parses `-f sender -- rcpt...` as passed by Postfix pipe(8).
fn parse_filter_args(args: &[String]) -> (String, Vec<String>) {
    let mut sender = String::new();
    let mut recipients = Vec::new();
    let mut after_separator = false;
    let mut i = 0;
    while i < args.len() {
        if after_separator {
            recipients.push(args[i].clone());
        } else if args[i] == "-f" {
            i += 1;
            if i < args.len() {
                sender = args[i].clone();
            }
        } else if args[i] == "--" {
            after_separator = true;
        }
        i += 1;
    }
    (sender, recipients)
}
