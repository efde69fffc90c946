//! workspace-pilot: reserve dom0 memory for a batch slot, hold it for the
//! requested duration and give it back, or recover with `--killnine`.

use std::backtrace::Backtrace;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

use nimbus_workspace::error::{
    EXIT_INCOMPATIBLE_ENV, EXIT_INVALID_INPUT, EXIT_OK, Result, WorkspaceError,
};
use nimbus_workspace::logging;
use nimbus_workspace::paths::DEFAULT_PILOT_CONF;
use nimbus_workspace::pilot::signals::forward_termination_signals;
use nimbus_workspace::pilot::{
    EngineSettings, PilotConfig, SlotContext, SlotReservationEngine, build_listeners,
    local_hostname,
};

#[derive(Parser, Debug)]
#[command(name = "workspace-pilot", version, about = "Nimbus dom0 slot reservation pilot")]
#[command(group(ArgGroup::new("mode").required(true).args(["reserveslot", "killnine"])))]
struct Args {
    /// Reserve a slot and hold it for --duration seconds
    #[arg(long)]
    reserveslot: bool,

    /// Destroy all guests and return their memory to dom0
    #[arg(long)]
    killnine: bool,

    /// Slot memory in MB
    #[arg(long)]
    memory: Option<u64>,

    /// Slot duration in seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Seconds the batch system grants between its termination signal and the kill
    #[arg(long)]
    graceperiod: Option<u64>,

    /// Slot identifier (UUID)
    #[arg(long)]
    slotid: Option<String>,

    /// http(s) URL overriding the configured notification endpoint
    #[arg(long)]
    contact: Option<String>,

    /// Configuration file
    #[arg(long, default_value = DEFAULT_PILOT_CONF)]
    conf: PathBuf,
}

fn required<T: Copy>(value: Option<T>, flag: &str) -> Result<T> {
    value.ok_or_else(|| WorkspaceError::InvalidInput(format!("--{flag} is required with --reserveslot")))
}

fn parse_slot_id(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text)
        .map_err(|e| WorkspaceError::InvalidInput(format!("--slotid '{text}' is not a UUID: {e}")))
}

fn parse_contact(text: &str) -> Result<Url> {
    let url = Url::parse(text)
        .map_err(|e| WorkspaceError::InvalidInput(format!("--contact '{text}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WorkspaceError::InvalidInput(format!(
            "--contact '{text}' must be an http or https URL"
        )));
    }
    Ok(url)
}

impl Args {
    fn slot_context(&self, config: &PilotConfig) -> Result<SlotContext> {
        let contact = self.contact.as_deref().map(parse_contact).transpose()?;
        let hostname = config.notify.hostname.clone().unwrap_or_else(local_hostname);

        if self.killnine {
            let slot_id = self.slotid.as_deref().map(parse_slot_id).transpose()?;
            return Ok(SlotContext {
                slot_id: slot_id.unwrap_or_else(Uuid::new_v4),
                memory_mb: self.memory.unwrap_or(0),
                duration: Duration::ZERO,
                graceperiod: Duration::ZERO,
                hostname,
                contact,
                listener_timeout: config.pilot.listener_timeout(),
                kill_nine: true,
            });
        }

        let memory_mb = required(self.memory, "memory")?;
        let duration = required(self.duration, "duration")?;
        let graceperiod = required(self.graceperiod, "graceperiod")?;
        let slot_id = parse_slot_id(
            self.slotid
                .as_deref()
                .ok_or_else(|| WorkspaceError::InvalidInput("--slotid is required with --reserveslot".into()))?,
        )?;
        if memory_mb == 0 {
            return Err(WorkspaceError::InvalidInput("--memory must be positive".into()));
        }
        if duration == 0 {
            return Err(WorkspaceError::InvalidInput("--duration must be positive".into()));
        }

        Ok(SlotContext {
            slot_id,
            memory_mb,
            duration: Duration::from_secs(duration),
            graceperiod: Duration::from_secs(graceperiod),
            hostname,
            contact,
            listener_timeout: config.pilot.listener_timeout(),
            kill_nine: false,
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

    let config = match PilotConfig::load(&args.conf) {
        Ok(config) => config,
        Err(e) => {
            let _log_guard = logging::init("workspace-pilot", None);
            return fail(e);
        }
    };
    let log_guard = logging::init("workspace-pilot", config.logging.log_dir.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::from(EXIT_INCOMPATIBLE_ENV);
        }
    };

    match runtime.block_on(run(&args, &config)) {
        Ok(Exit::Normal(code)) => ExitCode::from(code),
        Ok(Exit::Signalled(code)) => {
            drop(log_guard);
            std::process::exit(i32::from(code));
        }
        Err(e) => fail(e),
    }
}

enum Exit {
    Normal(u8),
    /// A termination signal ended the reservation.
    Signalled(u8),
}

fn fail(e: WorkspaceError) -> ExitCode {
    error!(exit_code = e.exit_code(), "{e}");
    eprintln!("{e}");
    if matches!(e, WorkspaceError::Programming(_)) {
        eprintln!("{}", Backtrace::force_capture());
    }
    ExitCode::from(e.exit_code())
}

async fn run(args: &Args, config: &PilotConfig) -> Result<Exit> {
    let ctx = args.slot_context(config)?;
    let engine = SlotReservationEngine::new(
        build_listeners(config),
        EngineSettings {
            earlywaitratio: config.pilot.earlywaitratio,
            evaluate: config.pilot.evaluate,
        },
    );

    if args.killnine {
        let report = engine.kill_nine(ctx).await;
        info!(killed = report.killed.len(), state = %report.final_state(), "killnine finished");
        return Ok(Exit::Normal(report.exit_code()));
    }

    let mut interrupts = forward_termination_signals().map_err(|e| {
        WorkspaceError::IncompatibleEnvironment(format!("installing signal handlers: {e}"))
    })?;
    let report = engine.reserve(ctx, &mut interrupts).await;
    let code = report.exit_code();
    info!(
        history = ?report.history,
        exit_code = code,
        "pilot finished"
    );

    Ok(match report.interrupt {
        Some(_) => Exit::Signalled(code),
        None => Exit::Normal(code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["workspace-pilot"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn reserveslot_requires_every_parameter() {
        let config = PilotConfig::default();
        let args = parse(&["--reserveslot", "--memory", "512", "--duration", "60"]);
        let err = args.slot_context(&config).unwrap_err();
        assert_eq!(err.exit_code(), EXIT_INVALID_INPUT);
        assert!(err.to_string().contains("--graceperiod"));

        let args = parse(&[
            "--reserveslot",
            "--memory=512",
            "--duration=60",
            "--graceperiod=10",
            "--slotid=1b4e28ba-2fa1-11d2-883f-0016d3cca427",
            "--contact=https://service.example.org/slots",
        ]);
        let ctx = args.slot_context(&config).unwrap();
        assert_eq!(ctx.duration, Duration::from_secs(60));
        assert!(!ctx.kill_nine);
        assert_eq!(ctx.contact.unwrap().host_str(), Some("service.example.org"));
    }

    #[test]
    fn slot_id_and_contact_are_checked() {
        let config = PilotConfig::default();
        let base = ["--reserveslot", "--memory=512", "--duration=60", "--graceperiod=10"];

        let mut argv = base.to_vec();
        argv.push("--slotid=not-a-uuid");
        assert!(parse(&argv).slot_context(&config).is_err());

        let mut argv = base.to_vec();
        argv.extend(["--slotid=1b4e28ba-2fa1-11d2-883f-0016d3cca427", "--contact=ftp://x/y"]);
        assert!(parse(&argv).slot_context(&config).is_err());
    }

    #[test]
    fn modes_are_exclusive() {
        assert!(Args::try_parse_from(["workspace-pilot", "--memory=5"]).is_err());
        assert!(Args::try_parse_from(["workspace-pilot", "--reserveslot", "--killnine"]).is_err());
        let ctx = parse(&["--killnine"]).slot_context(&PilotConfig::default()).unwrap();
        assert!(ctx.kill_nine);
        assert_eq!(ctx.memory_mb, 0);
    }
}
