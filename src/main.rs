//! `nvc-cli`: thin argument-parsing front end over `nvc_core`.
//!
//! Grounded on `original_source/src/cli/main.c`'s top-level dispatch:
//! `env_logger::init()` first, parse, dispatch, print-and-exit-nonzero
//! on failure. Carries no business logic of its own.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use nix::unistd::{Gid, Uid};

use nvc_core::{Config, Container, ContainerConfig, Context, ContainerFlags, DriverOpts, LibraryFlags};

#[derive(Parser)]
#[command(name = "nvc-cli", version = env!("CARGO_PKG_VERSION"), about = "Prepares a container's rootfs for NVIDIA GPU access")]
struct Cli {
    /// Write debug output to this file instead of stderr.
    #[arg(long, global = true, value_name = "FILE")]
    debug: Option<PathBuf>,

    /// Attempt to load missing kernel modules (unsupported in this build).
    #[arg(long, global = true)]
    load_kmods: bool,

    /// Run the driver RPC child as UID[:GID] instead of the kernel's overflow identity.
    #[arg(long, global = true, value_name = "UID[:GID]")]
    user: Option<String>,

    /// Path to `ld.so.cache` on the host.
    #[arg(long, global = true, value_name = "PATH", default_value = "/etc/ld.so.cache")]
    ldcache: PathBuf,

    /// Host driver root.
    #[arg(long, global = true, value_name = "PATH", default_value = "/")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved driver/device information as JSON.
    Info {
        #[arg(long, value_name = "OPTS", default_value = DriverOpts::DEFAULT)]
        driver_opts: String,
    },
    /// List discovered GPU devices as JSON.
    List,
    /// Inject the driver into a container's rootfs.
    Configure {
        /// PID of a process inside the target container.
        #[arg(long)]
        pid: i32,
        /// Container rootfs (absolute).
        #[arg(long)]
        rootfs: PathBuf,
        /// Container capability flags, e.g. "supervised compute video".
        #[arg(long, default_value = ContainerFlags::DEFAULT)]
        container_opts: String,
        /// Requirement expression to check against the host driver before mounting (repeatable).
        #[arg(long = "require", value_name = "EXPR")]
        requires: Vec<String>,
        /// Update `ld.so.cache` inside the container after mounting.
        #[arg(long)]
        no_ldcache_update: bool,
    },
    /// Emit a shell completion script to stdout.
    GenerateCompletion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_user(spec: &str) -> Result<(Uid, Gid), String> {
    let (uid_s, gid_s) = spec.split_once(':').ok_or_else(|| format!("expected UID:GID, got '{spec}'"))?;
    let uid: u32 = uid_s.parse().map_err(|_| format!("invalid uid '{uid_s}'"))?;
    let gid: u32 = gid_s.parse().map_err(|_| format!("invalid gid '{gid_s}'"))?;
    Ok((Uid::from_raw(uid), Gid::from_raw(gid)))
}

fn run(cli: Cli) -> nvc_core::Result<()> {
    if let Commands::GenerateCompletion { shell } = &cli.command {
        generate(*shell, &mut Cli::command(), "nvc-cli", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = Config {
        root: cli.root,
        ldcache: cli.ldcache,
        uid: None,
        gid: None,
    };
    if let Some(spec) = &cli.user {
        let (uid, gid) = parse_user(spec).map_err(|e| nvc_core::NvcError::invalid("invalid argument", e))?;
        config.uid = Some(uid);
        config.gid = Some(gid);
    }

    let mut ctx = Context::new(config);
    let lib_opts = if cli.load_kmods { LibraryFlags::parse("load-kmods")? } else { LibraryFlags::default() };

    match cli.command {
        Commands::Info { driver_opts } => {
            ctx.init(lib_opts, DriverOpts::DEFAULT)?;
            let opts = DriverOpts::parse(&driver_opts)?;
            let info = ctx.driver_info(&opts)?;
            println!("{}", serde_json::to_string_pretty(&DriverInfoView::from(&info)).unwrap_or_default());
            ctx.shutdown()
        }
        Commands::List => {
            ctx.init(lib_opts, DriverOpts::DEFAULT)?;
            let devices = ctx.device_info()?;
            let view: Vec<_> = devices.iter().map(DeviceInfoView::from).collect();
            println!("{}", serde_json::to_string_pretty(&view).unwrap_or_default());
            ctx.shutdown()
        }
        Commands::Configure { pid, rootfs, container_opts, requires, no_ldcache_update } => {
            ctx.init(lib_opts, DriverOpts::DEFAULT)?;
            let cfg = ContainerConfig::new(pid, rootfs);
            let container = Container::new(&cfg, &container_opts)?;

            let opts = DriverOpts::parse(DriverOpts::DEFAULT)?;
            let info = ctx.driver_info(&opts)?;
            let devices = ctx.device_info()?;
            nvc_core::dsl::check_requirements(&requires, &info, &devices)?;

            ctx.driver_mount(&container, &info)?;

            for device in devices {
                ctx.device_mount(&container, &device)?;
            }

            if !no_ldcache_update {
                ctx.ldcache_update(&container)?;
            }
            ctx.shutdown()
        }
        Commands::GenerateCompletion { .. } => unreachable!("handled above"),
    }
}

/// JSON-friendly projection of [`nvc_core::DriverInfo`]; the library
/// type itself carries no `serde` impls since it is not wire data.
#[derive(serde::Serialize)]
struct DriverInfoView {
    nvrm_version: String,
    cuda_version: String,
    bins: Vec<String>,
    libs: Vec<String>,
    libs32: Vec<String>,
    devices: Vec<String>,
    ipcs: Vec<String>,
}

impl From<&nvc_core::DriverInfo> for DriverInfoView {
    fn from(info: &nvc_core::DriverInfo) -> Self {
        DriverInfoView {
            nvrm_version: info.nvrm_version.clone(),
            cuda_version: info.cuda_version.clone(),
            bins: info.bins.iter().map(|p| p.display().to_string()).collect(),
            libs: info.libs.iter().map(|p| p.display().to_string()).collect(),
            libs32: info.libs32.iter().map(|p| p.display().to_string()).collect(),
            devices: info.devices.iter().map(|d| d.path.display().to_string()).collect(),
            ipcs: info.ipcs.iter().map(|p| p.display().to_string()).collect(),
        }
    }
}

#[derive(serde::Serialize)]
struct DeviceInfoView {
    uuid: String,
    busid: String,
    arch: String,
    brand: String,
    model: String,
    node: String,
}

impl From<&nvc_core::DeviceInfo> for DeviceInfoView {
    fn from(d: &nvc_core::DeviceInfo) -> Self {
        DeviceInfoView {
            uuid: d.uuid.clone(),
            busid: d.busid.clone(),
            arch: d.arch.clone(),
            brand: d.brand.as_str().to_string(),
            model: d.model.clone(),
            node: d.node.path.display().to_string(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = &cli.debug {
        match std::fs::File::create(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("nvc-cli: could not open debug file {}: {e}", path.display()),
        }
    }
    builder.init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nvc-cli: {e}");
            ExitCode::FAILURE
        }
    }
}
