//! Remote notification of reservation events.
//!
//! Each event is first POSTed over HTTP with digest authentication (`curl
//! --digest`). When that fails the same event is written over SSH with
//! `<remote-exe> write <slotid+++hostname> <event> <exitcode> [<extra>]`.
//! Delivery succeeds if either channel does.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};

use super::config::NotifySection;
use super::listener::{HandlerOutcome, KilledVm, SlotContext, StateChangeListener};
use super::state::ReservationState;
use crate::error::{EXIT_OK, EXIT_UNEXPECTED};
use crate::exec::CommandRunner;

const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=5",
];

pub const KILLED_VMS_EVENT: &str = "killed-vms";

/// One event on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEvent {
    pub id: String,
    pub event: String,
    pub exit_code: u8,
    pub extra: Option<String>,
}

impl WireEvent {
    pub fn new(ctx: &SlotContext, event: &str, exit_code: u8, extra: Option<String>) -> Self {
        Self {
            id: ctx.wire_id(),
            event: event.to_string(),
            exit_code,
            extra,
        }
    }

    /// HTTP body: one field per line.
    pub fn http_body(&self) -> String {
        let mut body = format!("{}\n{}\n{}\n", self.id, self.event, self.exit_code);
        if let Some(extra) = &self.extra {
            body.push_str(extra);
            body.push('\n');
        }
        body
    }

    /// Remote command line run over SSH.
    pub fn ssh_command(&self, remote_exe: &str) -> String {
        let mut cmd = format!(
            "{} write {} {} {}",
            shell_quote(remote_exe),
            shell_quote(&self.id),
            shell_quote(&self.event),
            self.exit_code
        );
        if let Some(extra) = &self.extra {
            cmd.push(' ');
            cmd.push_str(&shell_quote(extra));
        }
        cmd
    }
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '+' | ':' | '@' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `name:mem` pairs, comma separated.
pub fn describe_killed(killed: &[KilledVm]) -> String {
    killed
        .iter()
        .map(|vm| format!("{}:{}", vm.name, vm.memory_mb))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct RemoteNotifier {
    runner: CommandRunner,
    config: NotifySection,
}

impl RemoteNotifier {
    pub fn new(runner: CommandRunner, config: NotifySection) -> Self {
        Self { runner, config }
    }

    pub async fn send(&self, ctx: &SlotContext, event: &WireEvent) -> Result<()> {
        let url = ctx
            .contact
            .as_ref()
            .map(|u| u.to_string())
            .or_else(|| self.config.http_url.clone());

        let http_err = match &url {
            Some(url) => match self.post(url, event).await {
                Ok(()) => {
                    info!(event = %event.event, url = %url, "notification posted");
                    return Ok(());
                }
                Err(e) => {
                    warn!(event = %event.event, url = %url, error = %format!("{e:#}"), "HTTP notification failed");
                    Some(e)
                }
            },
            None => None,
        };

        match (&self.config.ssh_target, &self.config.ssh_remote_exe) {
            (Some(target), Some(exe)) => {
                self.ssh_write(target, exe, event)
                    .await
                    .with_context(|| match &http_err {
                        Some(e) => format!("HTTP notification also failed: {e:#}"),
                        None => "no HTTP endpoint configured".to_string(),
                    })?;
                info!(event = %event.event, target = %target, "notification written over SSH");
                Ok(())
            }
            _ => match http_err {
                Some(e) => Err(e),
                None => bail!("no notification channel configured"),
            },
        }
    }

    pub fn curl_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "--silent".to_string(),
            "--show-error".to_string(),
            "--fail".to_string(),
            "--max-time".to_string(),
            self.runner.timeout().as_secs().max(1).to_string(),
        ];
        if let Some(user) = &self.config.http_user {
            let password = self.config.http_password.as_deref().unwrap_or_default();
            args.extend([
                "--digest".to_string(),
                "--user".to_string(),
                format!("{user}:{password}"),
            ]);
        }
        args.extend([
            "--header".to_string(),
            "Content-Type: text/plain".to_string(),
            "--data-binary".to_string(),
            "@-".to_string(),
            url.to_string(),
        ]);
        args
    }

    async fn post(&self, url: &str, event: &WireEvent) -> Result<()> {
        let output = self
            .runner
            .run_with_stdin(&self.config.curl, &self.curl_args(url), &event.http_body())
            .await?;
        if !output.success() {
            bail!("curl POST to {url} failed ({})", output.describe());
        }
        Ok(())
    }

    async fn ssh_write(&self, target: &str, exe: &str, event: &WireEvent) -> Result<()> {
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
        args.extend([target.to_string(), event.ssh_command(exe)]);
        self.runner
            .run_checked(&self.config.ssh, &args, "ssh notification")
            .await?;
        Ok(())
    }

    async fn notify(&self, ctx: &SlotContext, state: ReservationState, exit_code: u8, extra: Option<String>) -> Result<()> {
        let event = WireEvent::new(ctx, state.event_name(), exit_code, extra);
        self.send(ctx, &event).await
    }
}

#[async_trait]
impl StateChangeListener for RemoteNotifier {
    fn name(&self) -> &str {
        "remote-notifier"
    }

    async fn reserved(&self, ctx: &SlotContext) -> Result<HandlerOutcome> {
        self.notify(ctx, ReservationState::Reserved, EXIT_OK, None).await?;
        Ok(HandlerOutcome::default())
    }

    async fn early_unreserving(&self, ctx: &SlotContext) -> Result<HandlerOutcome> {
        self.notify(ctx, ReservationState::EarlyUnreserving, EXIT_OK, None).await?;
        Ok(HandlerOutcome::default())
    }

    async fn unreserved(&self, ctx: &SlotContext) -> Result<HandlerOutcome> {
        self.notify(ctx, ReservationState::Unreserved, EXIT_OK, None).await?;
        Ok(HandlerOutcome::default())
    }

    async fn error_evaluating(&self, ctx: &SlotContext, errors: &str) -> Result<()> {
        self.notify(ctx, ReservationState::ErrorEvaluating, EXIT_UNEXPECTED, Some(errors.to_string())).await
    }

    async fn error_reserving(&self, ctx: &SlotContext, errors: &str) -> Result<()> {
        self.notify(ctx, ReservationState::ErrorReserving, EXIT_UNEXPECTED, Some(errors.to_string())).await
    }

    async fn error_reserved(&self, ctx: &SlotContext, errors: &str) -> Result<()> {
        self.notify(ctx, ReservationState::ErrorReserved, EXIT_UNEXPECTED, Some(errors.to_string())).await
    }

    async fn error_early_unreserving(&self, ctx: &SlotContext, errors: &str) -> Result<()> {
        self.notify(ctx, ReservationState::ErrorEarlyUnreserving, EXIT_UNEXPECTED, Some(errors.to_string())).await
    }

    async fn error_unreserving(&self, ctx: &SlotContext, errors: &str) -> Result<()> {
        self.notify(ctx, ReservationState::ErrorUnreserving, EXIT_UNEXPECTED, Some(errors.to_string())).await
    }

    async fn killed_vms_notification(&self, ctx: &SlotContext, killed: &[KilledVm]) -> Result<()> {
        let event = WireEvent::new(ctx, KILLED_VMS_EVENT, EXIT_OK, Some(describe_killed(killed)));
        self.send(ctx, &event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use uuid::Uuid;

    fn ctx() -> SlotContext {
        SlotContext {
            slot_id: Uuid::parse_str("6f1c1f0e-0000-4000-8000-000000000001").unwrap(),
            memory_mb: 512,
            duration: Duration::from_secs(60),
            graceperiod: Duration::from_secs(10),
            hostname: "node1".into(),
            contact: None,
            listener_timeout: Duration::from_secs(5),
            kill_nine: false,
        }
    }

    /// Fake curl and ssh under `dir`. curl exits with `curl_status`.
    fn notifier(dir: &Path, curl_status: i32) -> RemoteNotifier {
        let curl = dir.join("curl");
        let ssh = dir.join("ssh");
        std::fs::write(
            &curl,
            format!(
                "echo \"$@\" > {args}\ncat > {body}\nexit {curl_status}\n",
                args = dir.join("curl.args").display(),
                body = dir.join("curl.body").display(),
            ),
        )
        .unwrap();
        std::fs::write(
            &ssh,
            format!("for a in \"$@\"; do echo \"$a\"; done > {}\n", dir.join("ssh.args").display()),
        )
        .unwrap();

        let runner = CommandRunner::new(Some(PathBuf::from("/bin/sh")), Duration::from_secs(5));
        RemoteNotifier::new(
            runner,
            NotifySection {
                http_url: Some("https://service.example.org/pilot".into()),
                http_user: Some("pilot".into()),
                http_password: Some("secret".into()),
                ssh_target: Some("nimbus@service".into()),
                ssh_remote_exe: Some("/opt/nimbus/bin/pilot-notify".into()),
                curl,
                ssh,
                hostname: None,
            },
        )
    }

    #[test]
    fn body_and_ssh_command_follow_the_wire_format() {
        let event = WireEvent::new(&ctx(), "error-reserving", 4, Some("xen-memory: it's full".into()));
        assert_eq!(
            event.http_body(),
            "6f1c1f0e-0000-4000-8000-000000000001+++node1\nerror-reserving\n4\nxen-memory: it's full\n"
        );
        assert_eq!(
            event.ssh_command("/opt/bin/notify"),
            r"/opt/bin/notify write 6f1c1f0e-0000-4000-8000-000000000001+++node1 error-reserving 4 'xen-memory: it'\''s full'"
        );
    }

    #[tokio::test]
    async fn http_success_skips_ssh() {
        let tmp = tempfile::tempdir().unwrap();
        let notifier = notifier(tmp.path(), 0);
        notifier.reserved(&ctx()).await.unwrap();

        let args = std::fs::read_to_string(tmp.path().join("curl.args")).unwrap();
        assert!(args.contains("--digest --user pilot:secret"));
        assert!(args.trim_end().ends_with("https://service.example.org/pilot"));
        let body = std::fs::read_to_string(tmp.path().join("curl.body")).unwrap();
        assert_eq!(body, "6f1c1f0e-0000-4000-8000-000000000001+++node1\nreserved\n0\n");
        assert!(!tmp.path().join("ssh.args").exists());
    }

    #[tokio::test]
    async fn http_failure_falls_back_to_ssh() {
        let tmp = tempfile::tempdir().unwrap();
        let notifier = notifier(tmp.path(), 22);
        let killed = vec![KilledVm {
            name: "guest1".into(),
            vmm_id: Some(3),
            memory_mb: 256,
        }];
        notifier.killed_vms_notification(&ctx(), &killed).await.unwrap();

        let args = std::fs::read_to_string(tmp.path().join("ssh.args")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(args[args.len() - 2], "nimbus@service");
        assert_eq!(
            args[args.len() - 1],
            "/opt/nimbus/bin/pilot-notify write 6f1c1f0e-0000-4000-8000-000000000001+++node1 killed-vms 0 guest1:256"
        );
    }

    #[tokio::test]
    async fn contact_overrides_configured_url() {
        let tmp = tempfile::tempdir().unwrap();
        let notifier = notifier(tmp.path(), 0);
        let mut ctx = ctx();
        ctx.contact = Some(url::Url::parse("http://other.example.org:8080/slots").unwrap());
        notifier.unreserved(&ctx).await.unwrap();

        let args = std::fs::read_to_string(tmp.path().join("curl.args")).unwrap();
        assert!(args.trim_end().ends_with("http://other.example.org:8080/slots"));
    }

    #[tokio::test]
    async fn every_error_state_is_forwarded() {
        let tmp = tempfile::tempdir().unwrap();
        let notifier = notifier(tmp.path(), 0);
        let body = || std::fs::read_to_string(tmp.path().join("curl.body")).unwrap();
        let prefix = "6f1c1f0e-0000-4000-8000-000000000001+++node1";

        notifier.error_evaluating(&ctx(), "xen-memory: too small").await.unwrap();
        assert_eq!(body(), format!("{prefix}\nerror-evaluating\n4\nxen-memory: too small\n"));

        notifier.error_reserved(&ctx(), "remote-notifier: refused").await.unwrap();
        assert_eq!(body(), format!("{prefix}\nerror-reserved\n4\nremote-notifier: refused\n"));
    }
}
