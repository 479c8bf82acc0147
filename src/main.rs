use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::info;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ircontrol::config::{self, Config, ConfigFile};
use ircontrol::dispatch::Dispatcher;
use ircontrol::{ingress, transmit};
use ircontrol_shared::code::parse_value;
use ircontrol_shared::{IrCode, Protocol, SerialLink};

#[derive(Debug, StructOpt)]
#[structopt(name = "ircontrol", about = "Infrared remote control bridge")]
struct Opt {
    /// YAML configuration file. Defaults to ircontrol.yml, if present
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// Serial device. Defaults to /dev/ttyUSB0
    #[structopt(long = "device")]
    serial: Option<String>,
    #[structopt(short = "r", long)]
    baudrate: Option<u32>,
    #[structopt(short = "v", long)]
    debug: bool,
    /// Address the command listener binds to
    #[structopt(long)]
    tcp_host: Option<String>,
    #[structopt(short = "p", long)]
    tcp_port: Option<u16>,
    #[structopt(subcommand)]
    cmd: Option<CliCommand>,
}

#[derive(StructOpt, Debug)]
enum CliCommand {
    /// Bridge the receiver to actions and TCP commands to the transmitter
    Run,
    /// Print the loaded code table
    Codes,
    /// Transmit a single code
    Transmit {
        /// Protocol name, e.g. SAMSUNG
        protocol: Protocol,
        bits: u8,
        /// Decimal, or hex with 0x
        #[structopt(parse(try_from_str = parse_code_value))]
        value: u32,
    },
    /// List serial ports
    Ports,
}

fn parse_code_value(s: &str) -> Result<u32, String> {
    parse_value(s).ok_or_else(|| format!("invalid value `{}`", s))
}

/// Command line first, then the config file, then built in defaults.
struct Settings {
    serial: String,
    baudrate: u32,
    listen: String,
    max_connections: usize,
    shutdown_grace: Duration,
}

impl Settings {
    fn resolve(opt: &Opt, file: &ConfigFile) -> Self {
        let host = opt
            .tcp_host
            .clone()
            .or_else(|| file.tcp_host.clone())
            .unwrap_or_else(|| config::DEFAULT_TCP_HOST.to_string());
        let port = opt
            .tcp_port
            .or(file.tcp_port)
            .unwrap_or(config::DEFAULT_TCP_PORT);

        Settings {
            serial: opt
                .serial
                .clone()
                .or_else(|| file.serial.clone())
                .unwrap_or_else(|| config::DEFAULT_SERIAL.to_string()),
            baudrate: opt
                .baudrate
                .or(file.baudrate)
                .unwrap_or(config::DEFAULT_BAUDRATE),
            listen: format!("{}:{}", host, port),
            max_connections: file
                .max_connections
                .unwrap_or(config::DEFAULT_MAX_CONNECTIONS),
            shutdown_grace: Duration::from_millis(
                file.shutdown_grace_ms
                    .unwrap_or(config::DEFAULT_SHUTDOWN_GRACE_MS),
            ),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let loglevel = if opt.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(loglevel)
        .parse_default_env()
        .init();

    if let Some(CliCommand::Ports) = opt.cmd {
        for port in SerialLink::list_ports()? {
            println!("{}", port.port_name);
        }
        return Ok(());
    }

    let config_path = opt
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG));
    let file = match &opt.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::load_or_default(&config_path)?,
    };
    let settings = Settings::resolve(&opt, &file);

    match opt.cmd {
        Some(CliCommand::Transmit {
            protocol,
            bits,
            value,
        }) => {
            let code = IrCode::new(protocol, bits, value);
            let mut link = SerialLink::new();
            transmit::transmit(&mut link, &settings.serial, settings.baudrate, &code)
        }
        Some(CliCommand::Codes) => {
            let codes = config::load_codes(&file, base_dir(&config_path));
            print!("{}", codes.to_text());
            Ok(())
        }
        Some(CliCommand::Run) | Some(CliCommand::Ports) | None => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async {
                let config = Config::build(&file, base_dir(&config_path))?;
                run(Arc::new(config), settings).await
            })
        }
    }
}

fn base_dir(config: &Path) -> &Path {
    config.parent().unwrap_or_else(|| Path::new("."))
}

async fn run(config: Arc<Config>, settings: Settings) -> anyhow::Result<()> {
    info!(
        "{} codes, {} actions",
        config.codes.len(),
        config.actions.len()
    );

    let listener = TcpListener::bind(settings.listen.as_str())
        .await
        .with_context(|| format!("binding {}", settings.listen))?;

    let token = CancellationToken::new();
    let connections = TaskTracker::new();

    let dispatcher = Arc::new(Dispatcher::new(
        SerialLink::new(),
        config.clone(),
        settings.serial.clone(),
        settings.baudrate,
    ));

    // The serial side blocks, it gets a thread of its own.
    let dispatch_task = tokio::task::spawn_blocking({
        let dispatcher = dispatcher.clone();
        let token = token.clone();
        move || dispatcher.run(&token)
    });

    let ingress_task = tokio::spawn(ingress::serve(
        listener,
        dispatcher.clone(),
        settings.max_connections,
        connections.clone(),
        token.clone(),
    ));

    tokio::spawn({
        let token = token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, shutting down");
                    token.cancel();
                }
                Err(e) => log::error!("Cannot listen for ctrl-c: {}", e),
            }
        }
    });

    ingress_task.await?;
    dispatch_task.await?;

    connections.close();
    connections.wait().await;
    config.actions.executor().shutdown(settings.shutdown_grace).await;

    info!("Bye");
    Ok(())
}
