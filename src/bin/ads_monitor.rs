use std::{sync::Arc, time::UNIX_EPOCH};

use adsars::{
    ConnectionRegistry, TargetDescriptor, Update, Value,
    address::{AddressDefaults, AddressDescriptor},
    client::Subscription,
};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Options {
    #[command(subcommand)]
    command: Command,
    /// PLC IP address, used for symbol names given without an ads:// address
    #[clap(long, global = true)]
    ip: Option<std::net::Ipv4Addr>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Read symbols once
    Get {
        #[clap(required = true, id = "ADDRESS")]
        addresses: Vec<String>,
    },
    /// Write a value to a symbol
    Put {
        #[clap(id = "ADDRESS")]
        address: String,
        value: String,
    },
    /// Print every change of symbols until interrupted
    Monitor {
        #[clap(required = true, id = "ADDRESS")]
        addresses: Vec<String>,
        /// Poll every this many seconds, instead of using notifications
        #[clap(long)]
        poll: Option<f64>,
    },
    /// List the symbols of a PLC runtime
    Symbols {
        /// Target as host[:port], e.g. 192.168.0.10 or 5.1.2.3.1.1@192.168.0.10:852
        target: String,
    },
}

fn resolve_address(
    opts: &Options,
    address: &str,
    poll: Option<f64>,
) -> Result<AddressDescriptor, adsars::ClientError> {
    let defaults = AddressDefaults {
        ip_address: opts.ip,
        poll_rate: poll,
        ..Default::default()
    };
    Ok(AddressDescriptor::with_defaults(address, &defaults)?)
}

async fn monitor(name: String, mut updates: Subscription) {
    while let Ok(update) = updates.recv().await {
        match update {
            Update::Value { timestamp, value } => {
                let seconds = timestamp
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default();
                println!("{name} {seconds:.3} {value}");
            }
            Update::Connection(true) => info!("{name} connected"),
            Update::Connection(false) => println!("{name} *** disconnected"),
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    let filter = EnvFilter::default()
        .add_directive(
            match opts.verbose {
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                2.. => LevelFilter::TRACE,
            }
            .into(),
        )
        .add_directive("tokio=off".parse().expect("static directive"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_level(true)
        .init();

    if let Err(e) = run(&opts).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(opts: &Options) -> Result<(), adsars::ClientError> {
    let registry = Arc::new(ConnectionRegistry::new());
    match &opts.command {
        Command::Get { addresses } => {
            for address in addresses {
                let descriptor = resolve_address(opts, address, None)?;
                let handle = registry.open_symbol(&descriptor.to_string()).await?;
                let info = handle.info();
                println!(
                    "{} ({}) = {}",
                    descriptor.symbol_path,
                    info.type_spec.type_name,
                    handle.read().await?
                );
                handle.close().await;
            }
        }
        Command::Put { address, value } => {
            let descriptor = resolve_address(opts, address, None)?;
            let handle = registry.open_symbol(&descriptor.to_string()).await?;
            handle.write(&Value::from(value.as_str())).await?;
            println!("{} = {}", descriptor.symbol_path, handle.read().await?);
            handle.close().await;
        }
        Command::Monitor { addresses, poll } => {
            let mut monitors = JoinSet::new();
            let mut handles = Vec::new();
            for address in addresses {
                let descriptor = resolve_address(opts, address, *poll)?;
                let handle = registry.open_symbol(&descriptor.to_string()).await?;
                monitors.spawn(monitor(descriptor.symbol_path.clone(), handle.subscribe()));
                handles.push(handle);
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted."),
                _ = monitors.join_all() => (),
            }
            for handle in handles {
                handle.close().await;
            }
        }
        Command::Symbols { target } => {
            let descriptor: AddressDescriptor = format!("ads://{target}/_").parse()?;
            let target: TargetDescriptor = descriptor.target;
            let session = registry.acquire(&target);
            // Keep the session open for the duration of the upload
            session.register_symbol("");
            let result = session.read_device_info().await;
            if let Ok(device) = &result {
                println!("{target}: {device}");
            }
            let symbols = session.enumerate_symbols().await;
            session.release_symbol("");
            let mut symbols: Vec<_> = symbols?.into_values().collect();
            symbols.sort_by(|a, b| a.name.cmp(&b.name));
            for symbol in symbols {
                println!(
                    "{:<48} {:<24} {:#06x}:{:<8x} {}",
                    symbol.name, symbol.type_name, symbol.index_group, symbol.index_offset, symbol.comment
                );
            }
        }
    }
    Ok(())
}
