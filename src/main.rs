use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{debug, info, LevelFilter};

use crate::prelude::*;
use crate::registry::CsvSubnetRegistry;
use crate::subnet::config::{Config, NetmaskPolicy, DEFAULT_CONFIG_PATH};
use crate::subnet::{Role, SubnetManager};

mod error;
mod prelude;
mod registry;
mod subnet;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Subnet registry for an OpenVPN server", long_about = None)]
struct Args {
    /// Path to the subnet registry CSV
    #[clap(long, env = "OVPN_SUBNETS_REGISTRY")]
    registry: Option<PathBuf>,

    /// Path to the JSON configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Accept non-contiguous netmasks by counting their set bits
    #[clap(long)]
    permissive_netmask: bool,

    /// Increase log verbosity
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Check a subnet against the registry without saving it
    Validate { subnet: String },
    /// Allocate a subnet under a name
    Allocate { name: String, subnet: String },
    /// Allocate the OpenVPN tunnel subnet
    Tunnel { subnet: String },
    /// Allocate the server LAN subnet
    Lan { subnet: String },
    /// Show the subnet allocated to a name
    Get { name: String },
    /// List every allocation
    List,
    /// List client allocations
    Clients,
    /// Remove every allocation with this name
    Remove { name: String },
    /// Print the server config's `server`, `push "route"` and `route` directives
    Routes,
    /// Print the `iroute` directive for a client
    Iroute { name: String },
}

fn main() -> Void {
    let args = Args::parse();
    init_logger(args.verbose);
    debug!("args: {:?}", args);

    let sm = build_manager(&args)?;
    info!("subnet registry: {}", sm.registry.path().display());
    run(&sm, &args.command)
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn build_manager(args: &Args) -> Res<SubnetManager> {
    let cfg = match &args.config {
        Some(path) => Config::load(path, true)?,
        None => Config::load(Path::new(DEFAULT_CONFIG_PATH), false)?,
    };
    debug!("config: {:?}", cfg);
    let registry_path = args
        .registry
        .clone()
        .unwrap_or_else(|| cfg.get_registry_path());
    let policy = if args.permissive_netmask {
        NetmaskPolicy::Permissive
    } else {
        cfg.netmask_policy
    };
    Ok(SubnetManager::new(CsvSubnetRegistry::new(registry_path), policy))
}

fn run(sm: &SubnetManager, command: &Command) -> Void {
    match command {
        Command::Validate { subnet } => {
            let sn = sm.validate(subnet)?;
            println!("{}", sn);
        }
        Command::Allocate { name, subnet } => {
            let alloc = sm.allocate(name, subnet)?;
            info!("saved subnet for {}: {}", alloc.name, alloc.subnet);
            println!("{},{}", alloc.name, alloc.subnet);
        }
        Command::Tunnel { subnet } => allocate_role(sm, Role::OpenvpnTunnel, subnet)?,
        Command::Lan { subnet } => allocate_role(sm, Role::ServerLan, subnet)?,
        Command::Get { name } => match sm.registry.find_by_name(name)? {
            Some(sn) => println!("{}", sn),
            None => bail!("no subnet allocated for {}", name),
        },
        Command::List => {
            for alloc in sm.registry.list_all()? {
                println!("{},{}", alloc.name, alloc.subnet);
            }
        }
        Command::Clients => {
            for alloc in sm.list_client_subnets()? {
                println!("{},{}", alloc.name, alloc.subnet);
            }
        }
        Command::Remove { name } => {
            sm.registry.remove_by_name(name)?;
            info!("removed subnet for {}", name);
        }
        Command::Routes => {
            for line in sm.server_directives()? {
                println!("{}", line);
            }
        }
        Command::Iroute { name } => match sm.iroute_directive(name)? {
            Some(line) => println!("{}", line),
            None => bail!("no subnet allocated for {}", name),
        },
    }
    Ok(())
}

fn allocate_role(sm: &SubnetManager, role: Role, subnet: &str) -> Void {
    if let Some(existing) = sm.subnet_for_role(role)? {
        bail!("{} is already set to {}", role, existing);
    }
    let alloc = sm
        .allocate_role(role, subnet)
        .with_context(|| format!("allocate {}", role))?;
    info!("saved subnet for {}: {}", alloc.name, alloc.subnet);
    println!("{},{}", alloc.name, alloc.subnet);
    Ok(())
}
