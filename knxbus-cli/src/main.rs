//! knxbus - command-line access to the KNX bus.
//!
//! Dump bus traffic, discover KNXnet/IP servers and read or write
//! interface-object properties over tunneling, routing or a KNX USB
//! interface.

use std::error::Error;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use knxbus_lib::bus::{BusEvent, Layer};
use knxbus_lib::discovery::{discover, DiscoveryConfig};
use knxbus_lib::mgmt::{MgmtConfig, MgmtConnection};
use knxbus_lib::routing::{RoutingConfig, RoutingTransport};
use knxbus_lib::tunnel::{TunnelConfig, TunnelConnection};
use knxbus_lib::usb::{UsbConfig, UsbInterface};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "knxbus")]
#[command(about = "Command-line access to the KNX bus")]
#[command(version)]
struct Cli {
    /// KNXnet/IP gateway address for tunneling and management
    #[arg(short, long, env = "KNX_GATEWAY")]
    gateway: Option<Ipv4Addr>,

    /// KNXnet/IP UDP port
    #[arg(short, long, default_value_t = 3671)]
    port: u16,

    /// Use multicast routing instead of tunneling
    #[arg(long)]
    routing: bool,

    /// Use a KNX USB interface instead of the network
    #[arg(long)]
    usb: bool,

    /// USB device selector: "bus:addr" or a product-string substring
    #[arg(long)]
    device: Option<String>,

    /// Open the connection in busmonitor mode (receive-only)
    #[arg(long)]
    busmonitor: bool,

    /// Connect / response timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every frame received from the bus until interrupted
    Dump,

    /// Discover KNXnet/IP servers on the local network
    Discover {
        /// Seconds to wait for search responses
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },

    /// Read an interface-object property
    ReadProperty {
        /// Interface object type (decimal or 0x-prefixed hex)
        #[arg(short, long, value_parser = parse_u16)]
        object: u16,

        /// Object instance
        #[arg(short, long, default_value_t = 1)]
        instance: u8,

        /// Property id
        #[arg(short = 'P', long, value_parser = parse_u8)]
        property: u8,

        /// Number of elements
        #[arg(short, long, default_value_t = 1)]
        count: u8,

        /// Start index
        #[arg(short, long, default_value_t = 1)]
        start: u16,
    },

    /// Write an interface-object property
    WriteProperty {
        #[arg(short, long, value_parser = parse_u16)]
        object: u16,

        #[arg(short, long, default_value_t = 1)]
        instance: u8,

        #[arg(short = 'P', long, value_parser = parse_u8)]
        property: u8,

        #[arg(short, long, default_value_t = 1)]
        count: u8,

        #[arg(short, long, default_value_t = 1)]
        start: u16,

        /// Data to write, as hex (e.g. "00" or "0a1b")
        #[arg(short, long)]
        data: String,
    },
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hexval) => u16::from_str_radix(hexval, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hexval) => u8::from_str_radix(hexval, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match &cli.command {
        Commands::Dump => dump(&cli).await,
        &Commands::Discover { timeout } => {
            let endpoints = discover(DiscoveryConfig {
                search_timeout: Duration::from_secs(timeout),
                ..Default::default()
            })
            .await?;
            if endpoints.is_empty() {
                println!("no KNXnet/IP servers found");
            }
            for ep in endpoints {
                println!("{} {}", ep.addr, ep.name());
                println!("  KNX address:  {}", ep.knx_address);
                println!("  capabilities: {:?}", ep.capabilities);
                println!("  serial:       {}", hex::encode(ep.serial_number));
                println!("  MAC:          {}", hex::encode(ep.mac_address));
            }
            Ok(())
        }
        &Commands::ReadProperty {
            object,
            instance,
            property,
            count,
            start,
        } => {
            let data = if cli.usb {
                let mut interface = usb_open(&cli).await?;
                let data = interface
                    .read_property(object, instance, property, count, start)
                    .await?;
                interface.close().await?;
                data
            } else {
                let mut conn = mgmt_open(&cli).await?;
                let data = conn
                    .read_property(object, instance, property, count, start)
                    .await?;
                conn.close().await?;
                data
            };
            println!("{}", hex::encode(data));
            Ok(())
        }
        Commands::WriteProperty {
            object,
            instance,
            property,
            count,
            start,
            data,
        } => {
            let (object, instance, property, count, start) =
                (*object, *instance, *property, *count, *start);
            let payload = hex::decode(data)?;
            if cli.usb {
                let mut interface = usb_open(&cli).await?;
                interface
                    .write_property(object, instance, property, count, start, payload)
                    .await?;
                interface.close().await?;
            } else {
                let mut conn = mgmt_open(&cli).await?;
                conn.write_property(object, instance, property, count, start, payload)
                    .await?;
                conn.close().await?;
            }
            println!("ok");
            Ok(())
        }
    }
}

async fn dump(cli: &Cli) -> Result<(), Box<dyn Error>> {
    if cli.usb {
        let mut interface = usb_open(cli).await?;
        loop {
            tokio::select! {
                event = interface.recv() => match event {
                    Some(event) => print_event(event),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        interface.close().await?;
    } else if cli.routing {
        if cli.busmonitor {
            return Err("busmonitor is not available over routing".into());
        }
        let mut transport = RoutingTransport::open(RoutingConfig {
            port: cli.port,
            ..Default::default()
        })
        .await?;
        loop {
            tokio::select! {
                event = transport.recv() => match event {
                    Some(event) => print_event(event),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        transport.close();
    } else {
        let mut conn = tunnel_open(cli).await?;
        loop {
            tokio::select! {
                event = conn.recv() => match event {
                    Some(event) => print_event(event),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        conn.close().await?;
    }
    Ok(())
}

fn print_event(event: BusEvent) {
    match event {
        BusEvent::Frame(frame) => println!("{frame}"),
        BusEvent::Error(reason) => eprintln!("! {reason}"),
        BusEvent::LostMessage { device_state, lost } => {
            println!("! router lost {lost} frames (device state {device_state:#04x})")
        }
        BusEvent::Busy {
            wait_time,
            control,
            busy_counter,
        } => println!("! router busy: wait {wait_time} ms (control {control:#06x}, count {busy_counter})"),
        BusEvent::Reset => println!("! bus reset"),
        BusEvent::Disconnected => println!("! disconnected"),
    }
}

fn gateway_addr(cli: &Cli) -> Result<SocketAddrV4, Box<dyn Error>> {
    let ip = cli
        .gateway
        .ok_or("a gateway address is required (--gateway or KNX_GATEWAY)")?;
    Ok(SocketAddrV4::new(ip, cli.port))
}

async fn tunnel_open(cli: &Cli) -> Result<TunnelConnection, Box<dyn Error>> {
    let layer = if cli.busmonitor {
        Layer::Busmonitor
    } else {
        Layer::LinkLayer
    };
    let config = TunnelConfig::new(gateway_addr(cli)?)
        .with_layer(layer)
        .with_connect_timeout(Duration::from_secs(cli.timeout));
    Ok(TunnelConnection::open(config).await?)
}

async fn mgmt_open(cli: &Cli) -> Result<MgmtConnection, Box<dyn Error>> {
    let config = MgmtConfig::new(gateway_addr(cli)?);
    Ok(MgmtConnection::open(config).await?)
}

async fn usb_open(cli: &Cli) -> Result<UsbInterface, Box<dyn Error>> {
    let config = UsbConfig {
        busmonitor: cli.busmonitor,
        device: cli.device.clone(),
        response_timeout: Duration::from_secs(cli.timeout),
        ..Default::default()
    };
    Ok(UsbInterface::open(config).await?)
}
