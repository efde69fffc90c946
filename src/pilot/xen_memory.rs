//! dom0 memory listener: shrinks dom0 to open a slot and grows it back when
//! the slot is returned.

use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{error, info, warn};

use super::listener::{HandlerOutcome, KilledVm, SlotContext, StateChangeListener};
use crate::vm::xen::{XenCliDriver, parse_free_memory, parse_xm_list};
use crate::vm::{DomainStatus, VmmDriver};

pub const DOM0: &str = "Domain-0";

pub struct XenMemoryListener {
    xm: XenCliDriver,
    dom0_min_mb: u64,
    dom0_max_mb: Option<u64>,
    /// MB taken from dom0 by a `mem-set` this process issued and not yet
    /// given back.
    taken_mb: Mutex<Option<u64>>,
}

impl XenMemoryListener {
    pub fn new(xm: XenCliDriver, dom0_min_mb: u64, dom0_max_mb: Option<u64>) -> Self {
        Self {
            xm,
            dom0_min_mb,
            dom0_max_mb,
            taken_mb: Mutex::new(None),
        }
    }

    /// Current dom0 allocation in MB.
    pub async fn dom0_memory_mb(&self) -> Result<u64> {
        let output = self.xm.xm(&["list".to_string(), DOM0.to_string()]).await?;
        if !output.success() {
            bail!("xm list {DOM0} failed ({})", output.describe());
        }
        parse_xm_list(&output.stdout)
            .into_iter()
            .find(|vm| vm.handle == DOM0 || vm.vmm_id == Some(0))
            .map(|vm| vm.mem_mb)
            .with_context(|| format!("xm list did not report {DOM0}"))
    }

    async fn free_memory_mb(&self) -> Result<u64> {
        let output = self.xm.xm(&["info".to_string()]).await?;
        if !output.success() {
            bail!("xm info failed ({})", output.describe());
        }
        parse_free_memory(&output.stdout).context("could not find free_memory in xm info output")
    }

    async fn mem_set(&self, target_mb: u64) -> Result<()> {
        let args = vec!["mem-set".to_string(), DOM0.to_string(), target_mb.to_string()];
        let output = self.xm.xm(&args).await?;
        if !output.success() {
            bail!("xm mem-set {DOM0} {target_mb} failed ({})", output.describe());
        }
        info!(target_mb, "dom0 memory target set");
        Ok(())
    }

    /// Reserving target: `current - requested`, never below the minimum.
    pub fn reserve_target(&self, current_mb: u64, requested_mb: u64) -> Result<u64> {
        let target = current_mb.checked_sub(requested_mb).with_context(|| {
            format!("cannot take {requested_mb} MB from dom0, it only has {current_mb} MB")
        })?;
        if target < self.dom0_min_mb {
            bail!(
                "taking {requested_mb} MB would leave dom0 with {target} MB, below the {} MB minimum",
                self.dom0_min_mb
            );
        }
        Ok(target)
    }

    /// Unreserving target: `current + returned`.
    pub fn grow_target(&self, current_mb: u64, returned_mb: u64) -> Result<u64> {
        current_mb.checked_add(returned_mb).with_context(|| {
            format!("cannot return {returned_mb} MB to dom0, it already has {current_mb} MB")
        })
    }

    fn record_taken(&self, taken: Option<u64>) {
        match self.taken_mb.lock() {
            Ok(mut slot) => *slot = taken,
            Err(poisoned) => *poisoned.into_inner() = taken,
        }
    }

    fn take_recorded(&self) -> Option<u64> {
        match self.taken_mb.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Destroy every guest, best effort. Returns the ones that went away.
    async fn kill_all_guests(&self) -> Vec<KilledVm> {
        let output = match self.xm.xm(&["list".to_string()]).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                error!(detail = %output.describe(), "xm list failed, cannot find guests to kill");
                return Vec::new();
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "xm list failed, cannot find guests to kill");
                return Vec::new();
            }
        };

        let guests: Vec<_> = parse_xm_list(&output.stdout)
            .into_iter()
            .filter(|vm| vm.handle != DOM0 && vm.vmm_id != Some(0))
            .collect();
        warn!(count = guests.len(), "destroying all guests to return memory to dom0");

        let mut killed = Vec::new();
        for guest in guests {
            match self.xm.destroy(&guest.handle).await {
                Ok(status) => {
                    if status == DomainStatus::NotFound {
                        info!(vm = %guest.handle, "guest vanished before destroy");
                    } else {
                        warn!(vm = %guest.handle, mem_mb = guest.mem_mb, "guest destroyed");
                    }
                    killed.push(KilledVm {
                        name: guest.handle,
                        vmm_id: guest.vmm_id,
                        memory_mb: guest.mem_mb,
                    });
                }
                Err(e) => {
                    error!(vm = %guest.handle, error = %format!("{e:#}"), "could not destroy guest");
                }
            }
        }
        killed
    }
}

#[async_trait]
impl StateChangeListener for XenMemoryListener {
    fn name(&self) -> &str {
        "xen-memory"
    }

    async fn evaluating(&self, ctx: &SlotContext) -> Result<HandlerOutcome> {
        let current = self.dom0_memory_mb().await?;
        let target = self.reserve_target(current, ctx.memory_mb)?;
        info!(current_mb = current, target_mb = target, "slot fits in dom0");
        Ok(HandlerOutcome::default())
    }

    async fn reserving(&self, ctx: &SlotContext) -> Result<HandlerOutcome> {
        let current = self.dom0_memory_mb().await?;
        let target = self.reserve_target(current, ctx.memory_mb)?;
        info!(current_mb = current, requested_mb = ctx.memory_mb, target_mb = target, "shrinking dom0");
        self.mem_set(target).await?;
        self.record_taken(Some(ctx.memory_mb));
        Ok(HandlerOutcome::default())
    }

    /// Another listener failed the reservation: give back what this one took.
    async fn error_reserving(&self, _ctx: &SlotContext, _errors: &str) -> Result<()> {
        let Some(taken) = self.take_recorded() else {
            info!("dom0 was not shrunk, nothing to restore");
            return Ok(());
        };
        let current = self.dom0_memory_mb().await?;
        let target = self.grow_target(current, taken)?;
        warn!(current_mb = current, target_mb = target, "reservation failed, restoring dom0");
        self.mem_set(target).await
    }

    async fn unreserving(&self, ctx: &SlotContext) -> Result<HandlerOutcome> {
        let current = self.dom0_memory_mb().await?;

        if ctx.kill_nine {
            let killed = self.kill_all_guests().await;
            let target = match self.dom0_max_mb {
                Some(max) => max,
                None => self.grow_target(current, ctx.memory_mb)?,
            };
            warn!(current_mb = current, target_mb = target, "killnine: restoring dom0 memory");
            self.mem_set(target).await?;
            return Ok(HandlerOutcome::killed(killed));
        }

        let target = self.grow_target(current, ctx.memory_mb)?;
        let mut killed = Vec::new();
        match self.free_memory_mb().await {
            Ok(free) if free >= ctx.memory_mb => {}
            Ok(free) => {
                warn!(free_mb = free, needed_mb = ctx.memory_mb, "not enough free memory to return the slot");
                killed = self.kill_all_guests().await;
                match self.free_memory_mb().await {
                    Ok(free) if free >= ctx.memory_mb => {}
                    Ok(free) => error!(
                        free_mb = free,
                        needed_mb = ctx.memory_mb,
                        "CRITICAL: memory still short after killing guests, setting dom0 target anyway"
                    ),
                    Err(e) => error!(error = %format!("{e:#}"), "could not re-read free memory"),
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "could not read free memory, returning slot anyway"),
        }

        info!(current_mb = current, target_mb = target, "growing dom0");
        self.mem_set(target).await?;
        self.record_taken(None);
        Ok(HandlerOutcome::killed(killed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use crate::exec::CommandRunner;

    /// Fake `xm` that reports dom0 at `dom0` MB and `free` MB free, logs every
    /// call and, once `destroy` ran, reports `after_kill` MB free.
    fn fake_xm(dir: &Path, dom0: u64, free: u64, after_kill: u64) -> XenMemoryListener {
        let log = dir.join("calls");
        let killed = dir.join("killed");
        let script = dir.join("xm");
        std::fs::write(
            &script,
            format!(
                r#"echo "$@" >> {log}
case "$1" in
  list)
    echo "Name                 ID   Mem VCPUs      State   Time(s)"
    echo "Domain-0              0  {dom0}     2     r-----   100.0"
    [ -n "$2" ] || echo "guest1               3   256     1     -b----    10.0"
    ;;
  info)
    if [ -f {killed} ]; then echo "free_memory            : {after_kill}"; else echo "free_memory            : {free}"; fi
    ;;
  destroy) touch {killed} ;;
  mem-set) ;;
esac
"#,
                log = log.display(),
                killed = killed.display(),
            ),
        )
        .unwrap();
        let runner = CommandRunner::new(Some(PathBuf::from("/bin/sh")), Duration::from_secs(5));
        XenMemoryListener::new(XenCliDriver::new(runner, script, "file".into()), 256, Some(2048))
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn ctx(memory_mb: u64, kill_nine: bool) -> SlotContext {
        SlotContext {
            slot_id: uuid::Uuid::nil(),
            memory_mb,
            duration: Duration::from_secs(60),
            graceperiod: Duration::from_secs(10),
            hostname: "node1".into(),
            contact: None,
            listener_timeout: Duration::from_secs(5),
            kill_nine,
        }
    }

    #[test]
    fn reserve_target_respects_minimum() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = fake_xm(tmp.path(), 1024, 0, 0);
        assert_eq!(listener.reserve_target(1024, 512).unwrap(), 512);
        assert_eq!(listener.reserve_target(1024, 768).unwrap(), 256);
        assert!(listener.reserve_target(1024, 769).is_err());
        assert!(listener.reserve_target(100, 200).is_err());
    }

    #[tokio::test]
    async fn reserving_shrinks_dom0() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = fake_xm(tmp.path(), 1024, 0, 0);
        listener.reserving(&ctx(512, false)).await.unwrap();
        assert!(calls(tmp.path()).contains(&"mem-set Domain-0 512".to_string()));

        assert!(listener.reserving(&ctx(900, false)).await.is_err());
    }

    #[tokio::test]
    async fn unreserving_with_enough_free_memory_kills_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = fake_xm(tmp.path(), 512, 600, 600);
        let outcome = listener.unreserving(&ctx(512, false)).await.unwrap();
        assert!(outcome.killed.is_empty());
        let calls = calls(tmp.path());
        assert!(!calls.iter().any(|c| c.starts_with("destroy")));
        assert_eq!(calls.last().unwrap(), "mem-set Domain-0 1024");
    }

    #[tokio::test]
    async fn unreserving_short_of_memory_kills_guests_and_reports_them() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = fake_xm(tmp.path(), 512, 100, 356);
        let outcome = listener.unreserving(&ctx(512, false)).await.unwrap();
        assert_eq!(outcome.killed.len(), 1);
        assert_eq!(outcome.killed[0].name, "guest1");
        // Still short after the kill: the target is applied regardless.
        let calls = calls(tmp.path());
        assert!(calls.contains(&"destroy guest1".to_string()));
        assert_eq!(calls.last().unwrap(), "mem-set Domain-0 1024");
    }

    #[tokio::test]
    async fn kill_nine_restores_the_configured_maximum() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = fake_xm(tmp.path(), 512, 4096, 4096);
        let outcome = listener.unreserving(&ctx(0, true)).await.unwrap();
        assert_eq!(outcome.killed.len(), 1);
        assert_eq!(calls(tmp.path()).last().unwrap(), "mem-set Domain-0 2048");
    }

    #[test]
    fn grow_target_rejects_overflow() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = fake_xm(tmp.path(), 1024, 0, 0);
        assert_eq!(listener.grow_target(512, 512).unwrap(), 1024);
        assert!(listener.grow_target(u64::MAX, 1).is_err());
    }

    #[tokio::test]
    async fn failed_reservation_gives_back_only_what_was_taken() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = fake_xm(tmp.path(), 1024, 0, 0);

        // Nothing taken yet: no mem-set.
        listener.error_reserving(&ctx(512, false), "other: failed").await.unwrap();
        assert!(!tmp.path().join("calls").exists());

        listener.reserving(&ctx(512, false)).await.unwrap();
        listener.error_reserving(&ctx(512, false), "other: failed").await.unwrap();
        // The fake keeps reporting 1024 MB, so the restore target is 1024 + 512.
        assert_eq!(calls(tmp.path()).last().unwrap(), "mem-set Domain-0 1536");

        // Already restored: a second error is a no-op.
        let before = calls(tmp.path()).len();
        listener.error_reserving(&ctx(512, false), "other: failed").await.unwrap();
        assert_eq!(calls(tmp.path()).len(), before);
    }
}
