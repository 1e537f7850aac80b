//! vpnguard - VPN kill switch & IKEv2 dial manager
//!
//! # Usage
//!
//! ```bash
//! vpnguard plan                         # Preview the kill-switch rule plan
//! vpnguard plan --format json          # Same, as JSON
//! vpnguard interfaces                   # List adapters (pick the tunnel index)
//! vpnguard engage --remote 10.0.0.1    # Engage, allowing the VPN server
//! vpnguard status                       # Engaged / not engaged / indeterminate
//! vpnguard disengage
//! vpnguard connect vpn.example.com --user alice --password s3cret
//! vpnguard stats
//! vpnguard disconnect
//! ```
//!
//! The kill switch and dial commands drive the OS filtering and dial
//! subsystems and are available on Windows; `plan` and `interfaces` work
//! everywhere.

use clap::{Parser, Subcommand};
use ipnetwork::IpNetwork;
use std::path::PathBuf;
use std::process::ExitCode;
use vpnguard::core::killswitch::{self, EngageParams};
use vpnguard::{config, utils, validators};

#[derive(Parser)]
#[command(name = "vpnguard")]
#[command(about = "VPN kill switch & IKEv2 dial manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Engage the kill switch
    Engage {
        /// Remote address to keep reachable (addr or addr/prefix, repeatable)
        #[arg(long = "remote", value_name = "ADDR")]
        remote: Vec<String>,
        /// Local address traffic may originate from (repeatable)
        #[arg(long = "local", value_name = "ADDR")]
        local: Vec<String>,
        /// Interface index of the tunnel adapter to exempt
        #[arg(long, value_name = "INDEX")]
        adapter_index: Option<u32>,
        /// Tunnel process to exempt, by executable path
        #[arg(long, value_name = "PATH")]
        process: Option<PathBuf>,
        /// Keep the rules across reboots
        #[arg(long)]
        persist: bool,
    },
    /// Disengage the kill switch, deleting every installed rule
    Disengage,
    /// Report whether the kill switch is engaged
    Status,
    /// Print the rule plan that engage would install
    Plan {
        /// Output format (text or json)
        #[arg(short, long, default_value = "text")]
        format: String,
        #[arg(long = "remote", value_name = "ADDR")]
        remote: Vec<String>,
        #[arg(long = "local", value_name = "ADDR")]
        local: Vec<String>,
        /// Tunnel adapter LUID to exempt
        #[arg(long, value_name = "LUID")]
        adapter_luid: Option<u64>,
    },
    /// Provision the IKEv2 device and dial it
    Connect {
        /// Remote VPN hostname
        host: String,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        password: String,
        /// Phonebook entry name (defaults to the configured one)
        #[arg(long)]
        device: Option<String>,
    },
    /// Hang up the active connection for the device
    Disconnect {
        #[arg(long)]
        device: Option<String>,
    },
    /// Show a fresh connection statistics snapshot
    Stats {
        #[arg(long)]
        device: Option<String>,
    },
    /// List network interfaces with their indices
    Interfaces,
}

fn init_logging() {
    if let Some(mut log_path) = utils::get_state_dir() {
        log_path.push("vpnguard.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt()
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt::init();
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Parses an allowlist entry; a bare address means an exact-match network
fn parse_network(input: &str) -> Result<IpNetwork, String> {
    if let Ok(network) = input.parse::<IpNetwork>() {
        return Ok(network);
    }
    input
        .parse::<std::net::IpAddr>()
        .map(IpNetwork::from)
        .map_err(|_| format!("invalid address or network: {input:?}"))
}

fn parse_networks(inputs: &[String]) -> Result<Vec<IpNetwork>, String> {
    inputs.iter().map(|s| parse_network(s)).collect()
}

async fn handle_cli(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Plan {
            format,
            remote,
            local,
            adapter_luid,
        } => {
            let config = config::load_config().await;
            let params = EngageParams {
                remote_allow: if remote.is_empty() {
                    config.remote_allow.clone()
                } else {
                    parse_networks(&remote)?
                },
                local_allow: if local.is_empty() {
                    config.local_allow.clone()
                } else {
                    parse_networks(&local)?
                },
                tunnel_adapter: adapter_luid.map(vpnguard::core::filter::InterfaceLuid),
                tunnel_process: config.tunnel_process.clone(),
                persist: config.persist,
                display_name: validators::sanitize_display_name(&config.display_name),
            };
            let plan = killswitch::rule_plan(&params);
            match format.as_str() {
                "text" => print!("{}", killswitch::plan_text(&plan)),
                "json" => println!("{}", serde_json::to_string_pretty(&plan)?),
                _ => return Err("Invalid format. Use 'text' or 'json'.".into()),
            }
        }
        Commands::Interfaces => {
            use network_interface::{NetworkInterface, NetworkInterfaceConfig};
            let mut interfaces = NetworkInterface::show()?;
            interfaces.sort_by_key(|iface| iface.index);
            println!("{:<6} {:<24} ADDRESSES", "INDEX", "NAME");
            for iface in interfaces {
                let addrs: Vec<String> =
                    iface.addr.iter().map(|a| a.ip().to_string()).collect();
                println!("{:<6} {:<24} {}", iface.index, iface.name, addrs.join(", "));
            }
        }
        other => platform_command(other).await?,
    }
    Ok(())
}

#[cfg(windows)]
async fn platform_command(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    use vpnguard::audit;
    use vpnguard::core::dial::{ConnectRequest, Dialer, LinkStatus};
    use vpnguard::core::killswitch::KillSwitch;
    use vpnguard::platform::windows::{adapter_luid, ras::RasDialService, wfp::WfpEngine};

    match command {
        Commands::Engage {
            remote,
            local,
            adapter_index,
            process,
            persist,
        } => {
            let config = config::load_config().await;
            let params = EngageParams {
                remote_allow: if remote.is_empty() {
                    config.remote_allow.clone()
                } else {
                    parse_networks(&remote)?
                },
                local_allow: if local.is_empty() {
                    config.local_allow.clone()
                } else {
                    parse_networks(&local)?
                },
                tunnel_adapter: adapter_index.map(adapter_luid).transpose()?,
                tunnel_process: process.or(config.tunnel_process.clone()),
                persist: persist || config.persist,
                display_name: validators::sanitize_display_name(&config.display_name),
            };

            let switch = KillSwitch::new(WfpEngine::new());
            let rule_count = killswitch::rule_plan(&params).len();
            let result = switch.engage(&params);
            audit::log_engage(
                rule_count,
                params.persist,
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
            result?;
            println!("✓ Kill switch engaged ({rule_count} rules)");
        }
        Commands::Disengage => {
            let switch = KillSwitch::new(WfpEngine::new());
            let result = switch.disengage();
            audit::log_disengage(result.is_ok(), result.as_ref().err().map(ToString::to_string))
                .await;
            result?;
            println!("✓ Kill switch disengaged");
        }
        Commands::Status => {
            let switch = KillSwitch::new(WfpEngine::new());
            println!("Kill switch: {}", switch.status());
        }
        Commands::Connect {
            host,
            user,
            password,
            device,
        } => {
            validators::validate_hostname(&host)?;
            let config = config::load_config().await;
            let device_name = device.unwrap_or(config.device_name);

            let dialer = Dialer::new(RasDialService::new());
            let attempt = dialer.connect(&ConnectRequest {
                device_name: device_name.clone(),
                hostname: host.clone(),
                username: user,
                password,
            })?;

            println!("Dialing {host} ...");
            let outcome = attempt.outcome().await?;
            audit::log_connect(
                &device_name,
                &host,
                &outcome.to_string(),
                outcome == vpnguard::DialOutcome::Connected,
            )
            .await;
            match outcome {
                vpnguard::DialOutcome::Connected => println!("✓ Connected"),
                other => return Err(other.to_string().into()),
            }
        }
        Commands::Disconnect { device } => {
            let config = config::load_config().await;
            let device_name = device.unwrap_or(config.device_name);

            let dialer = Dialer::new(RasDialService::new());
            let result = dialer.disconnect(&device_name);
            audit::log_disconnect(
                &device_name,
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
            result?;
            println!("✓ Disconnected");
        }
        Commands::Stats { device } => {
            let config = config::load_config().await;
            let device_name = device.unwrap_or(config.device_name);

            let dialer = Dialer::new(RasDialService::new());
            let stats = dialer.statistics(&device_name)?;
            println!("Status:      {}", stats.status);
            if stats.status == LinkStatus::Connected {
                println!("Host:        {}", stats.remote_host);
                println!("Sent:        {}", utils::format_bytes(stats.bytes_transmitted));
                println!("Received:    {}", utils::format_bytes(stats.bytes_received));
                println!("Throughput:  {}/s", utils::format_bytes(stats.bps));
                println!("Duration:    {}", utils::format_duration(stats.connect_duration));
            }
        }
        Commands::Plan { .. } | Commands::Interfaces => unreachable!("handled in handle_cli"),
    }
    Ok(())
}

#[cfg(not(windows))]
async fn platform_command(_command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    Err("this command drives the OS filtering/dial subsystems and requires Windows; \
         use `plan` and `interfaces` here"
        .into())
}
