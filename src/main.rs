//! workspace-control: one lifecycle action on one Nimbus workspace VM.
//!
//! Exactly one action flag is given per invocation. The exit status encodes
//! the outcome (see [`nimbus_workspace::error`]).

use std::backtrace::Backtrace;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use tracing::{error, info};

use nimbus_workspace::config::ControlConfig;
use nimbus_workspace::controller::LifecycleController;
use nimbus_workspace::error::{
    EXIT_INCOMPATIBLE_ENV, EXIT_INVALID_INPUT, EXIT_OK, Result, WorkspaceError,
};
use nimbus_workspace::logging;
use nimbus_workspace::paths::DEFAULT_CONTROL_CONF;
use nimbus_workspace::request::{CreateRecord, CreateRequest};

#[derive(Parser, Debug)]
#[command(name = "workspace-control", version, about = "Nimbus workspace VM lifecycle control")]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["create", "remove", "info", "reboot", "pause", "unpause", "propagate", "unpropagate"])
))]
struct Args {
    /// Validate, allocate leases and boot a new VM
    #[arg(long)]
    create: bool,

    /// Shut down or destroy a VM and release its leases
    #[arg(long)]
    remove: bool,

    /// Print the persisted record and hypervisor state as JSON
    #[arg(long)]
    info: bool,

    #[arg(long)]
    reboot: bool,

    #[arg(long)]
    pause: bool,

    #[arg(long)]
    unpause: bool,

    /// Fetch remote images into the instance directory
    #[arg(long)]
    propagate: bool,

    /// Copy instance images back to their sources
    #[arg(long)]
    unpropagate: bool,

    /// VM name
    #[arg(long)]
    name: Option<String>,

    /// `;;`-separated image locators; the first is the root image
    #[arg(long)]
    images: Option<String>,

    /// `;;`-separated guest devices, one per image
    #[arg(long)]
    imagemounts: Option<String>,

    /// `;;`-separated NIC specifications
    #[arg(long)]
    networking: Option<String>,

    /// Guest memory in MB
    #[arg(long)]
    memory: Option<u64>,

    #[arg(long)]
    vcpus: Option<u32>,

    /// Kernel basename from the configured kernel directory
    #[arg(long)]
    kernel: Option<String>,

    #[arg(long)]
    kernelargs: Option<String>,

    #[arg(long)]
    ramdisk: Option<String>,

    /// `;;`-separated `source;guest-path` pairs copied into the root image
    #[arg(long)]
    mnttasks: Option<String>,

    /// `;;`-separated unpropagation targets, one per remote image
    #[arg(long)]
    unproptargets: Option<String>,

    /// On remove, also delete the VM's instance directory
    #[arg(long)]
    deleteall: bool,

    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONTROL_CONF)]
    conf: PathBuf,
}

impl Args {
    fn name(&self) -> Result<String> {
        self.name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| WorkspaceError::InvalidInput("--name is required".into()))
    }

    /// The create/propagate request carried by the flags.
    fn request(&self) -> Result<CreateRequest> {
        let images = self
            .images
            .clone()
            .ok_or_else(|| WorkspaceError::InvalidInput("--images is required".into()))?;
        let imagemounts = self
            .imagemounts
            .clone()
            .ok_or_else(|| WorkspaceError::InvalidInput("--imagemounts is required".into()))?;
        Ok(CreateRequest {
            name: self.name()?,
            images,
            imagemounts,
            networking: self.networking.clone(),
            memory_mb: self.memory,
            vcpus: self.vcpus,
            kernel: self.kernel.clone(),
            kernel_args: self.kernelargs.clone(),
            ramdisk: self.ramdisk.clone(),
            mount_tasks: self.mnttasks.clone(),
        })
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(if e.use_stderr() { EXIT_INVALID_INPUT } else { EXIT_OK });
        }
    };

    let config = match ControlConfig::load(&args.conf) {
        Ok(config) => config,
        Err(e) => {
            let _log_guard = logging::init("workspace-control", None);
            return fail(e);
        }
    };
    let _log_guard = logging::init("workspace-control", config.logging.log_dir.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::from(EXIT_INCOMPATIBLE_ENV);
        }
    };

    match runtime.block_on(run(&args, config)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => fail(e),
    }
}

fn fail(e: WorkspaceError) -> ExitCode {
    error!(exit_code = e.exit_code(), "{e}");
    eprintln!("{e}");
    if matches!(e, WorkspaceError::Programming(_)) {
        eprintln!("{}", Backtrace::force_capture());
    }
    ExitCode::from(e.exit_code())
}

async fn run(args: &Args, config: ControlConfig) -> Result<u8> {
    let controller = LifecycleController::from_config(config)?;

    if args.create {
        let spec = controller.create(&args.request()?).await?;
        info!(vm = %spec.name, memory_mb = spec.memory_mb, nics = spec.nics.len(), "created");
        return Ok(EXIT_OK);
    }

    let name = args.name()?;

    if args.remove {
        let outcome = controller.remove(&name, args.deleteall).await?;
        return Ok(outcome.exit_code());
    }
    if args.info {
        let record: Option<CreateRecord> = controller.store().load_record(&name)?;
        let running = controller.info(&name).await?;
        let report = serde_json::json!({
            "name": name,
            "record": record,
            "running": running,
        });
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| WorkspaceError::unexpected(format!("rendering info: {e}")))?;
        println!("{text}");
        return Ok(EXIT_OK);
    }
    if args.reboot {
        controller.reboot(&name).await?;
    } else if args.pause {
        controller.pause(&name).await?;
    } else if args.unpause {
        controller.unpause(&name).await?;
    } else if args.propagate {
        controller.propagate(&args.request()?).await?;
    } else if args.unpropagate {
        controller
            .unpropagate(&args.request()?, args.unproptargets.as_deref())
            .await?;
    }
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_action_is_required() {
        assert!(Args::try_parse_from(["workspace-control", "--name", "vm1"]).is_err());
        assert!(
            Args::try_parse_from(["workspace-control", "--create", "--remove", "--name", "vm1"])
                .is_err()
        );
        let args = Args::try_parse_from(["workspace-control", "--remove", "--name", "vm1", "--deleteall"])
            .unwrap();
        assert!(args.remove && args.deleteall);
        assert_eq!(args.conf, PathBuf::from(DEFAULT_CONTROL_CONF));
    }

    #[test]
    fn create_needs_images_and_mounts() {
        let args = Args::try_parse_from(["workspace-control", "--create", "--name", "vm1"]).unwrap();
        let err = args.request().unwrap_err();
        assert_eq!(err.exit_code(), EXIT_INVALID_INPUT);

        let args = Args::try_parse_from([
            "workspace-control",
            "--create",
            "--name=vm1",
            "--images=file://root.img",
            "--imagemounts=sda1",
            "--memory=256",
        ])
        .unwrap();
        let request = args.request().unwrap();
        assert_eq!(request.memory_mb, Some(256));
        assert_eq!(request.imagemounts, "sda1");
    }
}
