//! vphone-remote: command-line VRCL supervisor.
//!
//! ```text
//! vphone-remote status
//! vphone-remote dial 5551234 [--method direct]
//! vphone-remote hangup [--call N]
//! vphone-remote set MaxCalls 2
//! vphone-remote watch [--seconds 30]
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use vphone_core::call::DialMethod;
use vphone_core::vrcl::XmlElement;
use vphone_core::vrcl::server::DEFAULT_PORT;
use vphone_core::{
    ApiVersion, Blake3KeyDerivation, DialRequest, RejectReason, VpError, VrclClient,
    VrclClientConfig,
};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vphone-remote", about = "Drive a videophone endpoint over VRCL")]
struct Cli {
    /// Endpoint address.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Shared secret configured on the endpoint.
    #[arg(short, long, default_value = "change me")]
    secret: String,

    /// Highest API version to offer.
    #[arg(long, default_value_t = ApiVersion::CURRENT)]
    api: ApiVersion,

    /// Per-command timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the endpoint status.
    Status,
    /// Round-trip an IsAlive probe.
    Ping,
    /// Place a call.
    Dial {
        dial_string: String,
        #[arg(long)]
        method: Option<DialMethod>,
        /// Keep running and print call events afterwards.
        #[arg(long)]
        follow: bool,
    },
    /// Answer a ringing call.
    Answer {
        #[arg(long)]
        call: Option<u32>,
    },
    /// Reject a ringing call.
    Reject {
        #[arg(long)]
        call: Option<u32>,
        #[arg(long, default_value = "Declined")]
        reason: RejectReason,
    },
    /// Hang up a call (the head call by default).
    Hangup {
        #[arg(long)]
        call: Option<u32>,
    },
    Hold {
        #[arg(long)]
        call: Option<u32>,
    },
    Resume {
        #[arg(long)]
        call: Option<u32>,
    },
    /// Blind-transfer a call.
    Transfer {
        target: String,
        #[arg(long)]
        call: Option<u32>,
    },
    /// Send a text message on a call.
    Text {
        text: String,
        #[arg(long)]
        call: Option<u32>,
    },
    /// Send DTMF digits, one command per digit.
    Dtmf {
        digits: String,
        #[arg(long)]
        call: Option<u32>,
    },
    /// Read a setting.
    Get { name: String },
    /// Write a setting.
    Set { name: String, value: String },
    /// Show or change video privacy.
    Privacy {
        /// on / off; omit to query.
        state: Option<String>,
    },
    /// Print notifications as they arrive.
    Watch {
        /// Stop after this many seconds; runs until Ctrl-C otherwise.
        #[arg(long)]
        seconds: Option<u64>,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = SocketAddr::new(cli.host, cli.port);
    let mut config = VrclClientConfig::new(Arc::new(Blake3KeyDerivation::new(cli.secret)));
    config.api_version = cli.api;
    config.command_timeout = Duration::from_millis(cli.timeout_ms.max(1));

    let mut client = VrclClient::connect(addr, config).await?;
    info!(%addr, version = %client.negotiated_version(), "connected");

    let outcome = execute(&mut client, cli.command).await;
    client.close().await;
    outcome?;
    Ok(())
}

async fn execute(client: &mut VrclClient, command: Command) -> Result<(), VpError> {
    match command {
        Command::Status => {
            let status = client.status().await?;
            for (key, value) in &status.attributes {
                println!("{key:>10}: {value}");
            }
        }
        Command::Ping => {
            let rtt = client.is_alive().await?;
            println!("alive ({} ms)", rtt.as_millis());
        }
        Command::Dial {
            dial_string,
            method,
            follow,
        } => {
            let mut request = DialRequest::new(dial_string);
            if let Some(method) = method {
                request = request.with_method(method);
            }
            let call = client.dial(request).await?;
            println!("call {call} dialing");
            if follow {
                watch(client, None).await;
            }
        }
        Command::Answer { call } => client.answer(call).await?,
        Command::Reject { call, reason } => client.reject(call, reason).await?,
        Command::Hangup { call } => client.hang_up(call).await?,
        Command::Hold { call } => client.hold(call).await?,
        Command::Resume { call } => client.resume(call).await?,
        Command::Transfer { target, call } => client.transfer(call, &target).await?,
        Command::Text { text, call } => client.text_send(call, &text).await?,
        Command::Dtmf { digits, call } => {
            for digit in digits.chars() {
                client.dtmf_send(call, digit).await?;
            }
        }
        Command::Get { name } => println!("{}", client.setting_get(&name).await?),
        Command::Set { name, value } => client.setting_set(&name, &value).await?,
        Command::Privacy { state } => match state {
            Some(state) => {
                let enabled = vphone_core::vrcl::message::parse_switch(&state)?;
                client.video_privacy_set(enabled).await?;
            }
            None => {
                let on = client.video_privacy_get().await?;
                println!("privacy {}", if on { "on" } else { "off" });
            }
        },
        Command::Watch { seconds } => watch(client, seconds.map(Duration::from_secs)).await,
    }
    Ok(())
}

/// Print notifications until the deadline, Ctrl-C or disconnect.
async fn watch(client: &mut VrclClient, limit: Option<Duration>) {
    let deadline = async {
        match limit {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            next = client.next_notification() => match next {
                Some(element) => print_notification(&element),
                None => {
                    println!("connection closed");
                    return;
                }
            },
            _ = tokio::signal::ctrl_c() => return,
            _ = &mut deadline => return,
        }
    }
}

fn print_notification(element: &XmlElement) {
    debug!("{element}");
    let call = element
        .attr("call")
        .map(|c| format!(" call {c}"))
        .unwrap_or_default();
    let detail = element.text();
    if detail.is_empty() {
        println!("{}{call}", element.name);
    } else {
        println!("{}{call}: {detail}", element.name);
    }
}
