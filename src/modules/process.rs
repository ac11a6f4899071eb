//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Process module: running-process checks against `/proc`, plus the
//! `execute` action (child-process spawn with a mandatory uid drop).

use std::any::Any;
use std::os::unix::process::CommandExt;
use std::time::Duration;

use nix::unistd::{Uid, User};
use tokio::io::AsyncReadExt;

use crate::config::{ConfigError, Tree};
use crate::dispatch::{Configurator, Dispatcher, ModuleFactory};
use crate::moduleapi::{
    check_failed_status, Action, ActionContext, ActionError, ActionList, ActionListSettings,
    ActionSettings, ModuleApi, ModuleRunStatus,
};
use crate::rt::block_on;

pub const NAME: &str = "process";
const ACTIONS: &[&str] = &["execute"];
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CAPTURE: usize = 4096;

pub const FACTORY: ModuleFactory = ModuleFactory {
    name: NAME,
    actions: ACTIONS,
    load,
    parse_action,
};

#[derive(Debug, Clone)]
struct PasswdEntry {
    uid: u32,
    name: String,
}

fn parse_cmdline(tree: &Tree<'_>, field: &'static str) -> Result<Vec<String>, ConfigError> {
    let value = tree.require(field)?;
    if let Some(s) = value.as_str() {
        return Ok(s.split_whitespace().map(str::to_owned).collect());
    }
    let items = value.as_array().ok_or_else(|| ConfigError::WrongType {
        path: tree.path.to_owned(),
        field,
        expected: "a string or an array of strings",
    })?;
    items
        .iter()
        .map(|v| {
            v.as_str().map(str::to_owned).ok_or_else(|| ConfigError::WrongType {
                path: tree.path.to_owned(),
                field,
                expected: "an array of strings",
            })
        })
        .collect()
}

fn parse_user(tree: &Tree<'_>, field: &'static str) -> Result<PasswdEntry, ConfigError> {
    let value = tree.require(field)?;
    let user = if let Some(uid) = value.as_integer() {
        User::from_uid(Uid::from_raw(uid as u32))
    } else if let Some(name) = value.as_str() {
        User::from_name(name)
    } else {
        return Err(ConfigError::WrongType {
            path: tree.path.to_owned(),
            field,
            expected: "a uid or username",
        });
    };

    match user {
        Ok(Some(u)) => Ok(PasswdEntry {
            uid: u.uid.as_raw(),
            name: u.name,
        }),
        Ok(None) | Err(_) => Err(ConfigError::Invalid {
            path: tree.path.to_owned(),
            message: format!("user '{}' doesn't exist", value),
        }),
    }
}

fn parse_timeout(tree: &Tree<'_>) -> Result<Option<Duration>, ConfigError> {
    match tree.get("timeout") {
        None => Ok(Some(DEFAULT_TIMEOUT)),
        Some(v) => {
            let secs = v.as_integer().ok_or_else(|| ConfigError::WrongType {
                path: tree.path.to_owned(),
                field: "timeout",
                expected: "an integer number of seconds",
            })?;
            match secs {
                0 => Ok(None),
                n if n > 0 => Ok(Some(Duration::from_secs(n as u64))),
                _ => Err(ConfigError::Invalid {
                    path: tree.path.to_owned(),
                    message: "'timeout' cannot be negative".to_owned(),
                }),
            }
        }
    }
}

/// One entry of `/proc`, read with direct syscalls rather than a
/// bespoke `/proc`-scanning crate.
struct ProcEntry {
    basename: String,
    cmdline: Vec<String>,
    uid: u32,
}

fn scan_processes() -> Vec<ProcEntry> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(proc) = read_proc_entry(pid) {
            out.push(proc);
        }
    }
    out
}

fn read_proc_entry(pid: u32) -> Option<ProcEntry> {
    let base = format!("/proc/{pid}");
    let basename = std::fs::read_to_string(format!("{base}/comm")).ok()?.trim().to_owned();
    let cmdline_raw = std::fs::read(format!("{base}/cmdline")).ok()?;
    let cmdline = cmdline_raw
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    let uid = read_proc_uid(&base)?;
    Some(ProcEntry { basename, cmdline, uid })
}

fn read_proc_uid(base: &str) -> Option<u32> {
    let status = std::fs::read_to_string(format!("{base}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

fn login_name(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
}

#[derive(Debug)]
pub struct ProcessCheckSettings {
    basename: String,
    cmdline: Option<Vec<String>>,
    user: Option<PasswdEntry>,
    on_error: ActionListSettings,
}

fn parse_process_check(
    tree: &Tree<'_>,
    configurator: &Configurator,
) -> Result<ProcessCheckSettings, ConfigError> {
    let basename = tree.str("basename")?;

    let cmdline = match tree.get("cmdline") {
        None => None,
        Some(_) => Some(parse_cmdline(tree, "cmdline")?),
    };

    let user = match tree.get("user") {
        None => None,
        Some(_) => Some(parse_user(tree, "user")?),
    };

    let mut on_error = ActionListSettings::default();
    for v in tree.array_or_empty("on_error")? {
        let sub = Tree::new(v, "on_error");
        on_error.entries.push(configurator.configure_action(&sub)?);
    }

    Ok(ProcessCheckSettings { basename, cmdline, user, on_error })
}

pub struct ProcessSettings {
    process_checks: Vec<ProcessCheckSettings>,
}

fn load(tree: &Tree<'_>, configurator: &Configurator) -> Result<Box<dyn ModuleApi>, ConfigError> {
    let mut process_checks = Vec::new();
    for v in tree.array_or_empty("process_checks")? {
        let sub = Tree::new(v, "process_checks");
        process_checks.push(parse_process_check(&sub, configurator)?);
    }
    Ok(Box::new(ProcessModule {
        settings: ProcessSettings { process_checks },
    }))
}

#[derive(Debug, Clone)]
pub struct ActionExecuteSettings {
    action_name: String,
    cmdline: Vec<String>,
    user: PasswdEntry,
    on_fail_or_output: Option<ActionListSettings>,
    timeout: Option<Duration>,
}

impl ActionSettings for ActionExecuteSettings {
    fn action_name(&self) -> &str {
        &self.action_name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn ActionSettings> {
        Box::new(self.clone())
    }
}

fn parse_action(
    action_name: &str,
    tree: &Tree<'_>,
    configurator: &Configurator,
) -> Result<Box<dyn ActionSettings>, ConfigError> {
    let cmdline = parse_cmdline(tree, "cmdline")?;
    if cmdline.is_empty() {
        return Err(ConfigError::Invalid {
            path: tree.path.to_owned(),
            message: "'cmdline' must be non-empty".to_owned(),
        });
    }
    let user = parse_user(tree, "user")?;
    let timeout = parse_timeout(tree)?;

    let on_fail_or_output = match tree.get("on_fail_or_output") {
        None => None,
        Some(_) => {
            let mut list = ActionListSettings::default();
            for v in tree.array("on_fail_or_output")? {
                let sub = Tree::new(v, "on_fail_or_output");
                list.entries.push(configurator.configure_action(&sub)?);
            }
            Some(list)
        }
    };

    Ok(Box::new(ActionExecuteSettings {
        action_name: format!("{NAME}.{action_name}"),
        cmdline,
        user,
        on_fail_or_output,
        timeout,
    }))
}

/// Runs inside the child between fork and exec: drops privileges to
/// `uid`, verifies the drop took effect, and merges stderr into stdout
/// when `merge_stderr` (stdout has already been dup'd onto fd 1 by the
/// time this runs).
fn child_setup(uid: u32, merge_stderr: bool) -> std::io::Result<()> {
    nix::unistd::setresuid(Uid::from_raw(uid), Uid::from_raw(uid), Uid::from_raw(uid))
        .map_err(std::io::Error::from)?;

    let (ruid, euid, suid) = unsafe {
        let mut r = 0;
        let mut e = 0;
        let mut s = 0;
        if libc::getresuid(&mut r, &mut e, &mut s) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        (r, e, s)
    };
    if ruid != uid || euid != uid || suid != uid {
        return Err(std::io::Error::other("uid drop did not take effect"));
    }

    if merge_stderr {
        unsafe {
            if libc::dup2(1, 2) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }

    Ok(())
}

fn build_command(settings: &ActionExecuteSettings, capture: bool) -> tokio::process::Command {
    let mut cmd = std::process::Command::new(&settings.cmdline[0]);
    cmd.args(&settings.cmdline[1..]);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(if capture {
        std::process::Stdio::piped()
    } else {
        std::process::Stdio::null()
    });
    cmd.stderr(std::process::Stdio::null());

    let uid = settings.user.uid;
    unsafe {
        cmd.pre_exec(move || child_setup(uid, capture));
    }

    tokio::process::Command::from(cmd)
}

struct RunOutcome {
    status: std::process::ExitStatus,
    output: Vec<u8>,
    truncated: bool,
}

async fn run_child(
    mut child: tokio::process::Child,
    timeout: Option<Duration>,
) -> Result<RunOutcome, ActionError> {
    let mut stdout = child.stdout.take();
    let read = async move {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.take((MAX_CAPTURE + 1) as u64).read_to_end(&mut buf).await;
        }
        let truncated = buf.len() > MAX_CAPTURE;
        buf.truncate(MAX_CAPTURE);
        (buf, truncated)
    };

    let wait_and_read = async { tokio::join!(child.wait(), read) };

    let (status, (output, truncated)) = match timeout {
        Some(dur) => match tokio::time::timeout(dur, wait_and_read).await {
            Ok((status, read)) => (status, read),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ActionError::from("process timed out"));
            }
        },
        None => wait_and_read.await,
    };

    let status = status.map_err(|e| ActionError(format!("failed to wait for process: {e}")))?;
    Ok(RunOutcome { status, output, truncated })
}

struct ExecuteAction<'a> {
    settings: ActionExecuteSettings,
    dispatch: &'a Dispatcher,
}

impl<'a> Action for ExecuteAction<'a> {
    fn execute(&self, context: &ActionContext) -> Result<(), ActionError> {
        block_on(self.run(context))
    }
}

impl<'a> ExecuteAction<'a> {
    async fn run(&self, context: &ActionContext) -> Result<(), ActionError> {
        let capture = self.settings.on_fail_or_output.is_some();
        tracing::info!(cmdline = ?self.settings.cmdline, "executing");

        let mut cmd = build_command(&self.settings, capture);
        let child = cmd
            .spawn()
            .map_err(|e| ActionError(format!("failed to spawn '{}': {e}", self.settings.cmdline[0])))?;

        let outcome = run_child(child, self.settings.timeout).await;

        match &self.settings.on_fail_or_output {
            None => {
                let outcome = outcome?;
                if outcome.status.success() {
                    Ok(())
                } else {
                    Err(ActionError(format!(
                        "'{}' exited with {}",
                        self.settings.cmdline.join(" "),
                        outcome.status
                    )))
                }
            }
            Some(list) => {
                let message = match outcome {
                    Ok(outcome) if outcome.status.success() && outcome.output.is_empty() => {
                        return Ok(());
                    }
                    Ok(outcome) => {
                        describe(context, Some(outcome.status), &outcome.output, outcome.truncated)
                    }
                    Err(e) => describe_error(context, &e),
                };
                let sub_context = ActionContext::new(NAME, message);
                if ActionList::new(list).run(self.dispatch, &sub_context) {
                    Ok(())
                } else {
                    Err(ActionError::from("one or more on_fail_or_output actions failed"))
                }
            }
        }
    }
}

fn describe(
    context: &ActionContext,
    status: Option<std::process::ExitStatus>,
    output: &[u8],
    truncated: bool,
) -> String {
    let mut msg = context.message.clone();
    if let Some(status) = status {
        if !status.success() {
            msg.push_str(&format!("; exited with {status}"));
        }
    }
    if !output.is_empty() {
        msg.push_str("; output: ");
        msg.push_str(&String::from_utf8_lossy(output));
        if truncated {
            msg.push_str(" [truncated]");
        }
    }
    msg
}

fn describe_error(context: &ActionContext, e: &ActionError) -> String {
    format!("{}; {e}", context.message)
}

/// Result of matching a set of `/proc` entries against a process check,
/// factored out of `do_process_check` so the basename/cmdline/user
/// filtering pipeline is testable without a real `/proc`.
#[derive(Debug, PartialEq, Eq)]
enum CheckMatch {
    Satisfied,
    NoBasename,
    NoCmdline,
    NoUser,
}

fn match_check(procs: &[ProcEntry], check: &ProcessCheckSettings) -> CheckMatch {
    let name_matches: Vec<&ProcEntry> = procs.iter().filter(|p| p.basename == check.basename).collect();
    if name_matches.is_empty() {
        return CheckMatch::NoBasename;
    }

    let cmdline_matches: Vec<&&ProcEntry> = match &check.cmdline {
        None => name_matches.iter().collect(),
        Some(cmdline) => {
            let matches: Vec<&&ProcEntry> =
                name_matches.iter().filter(|p| &p.cmdline == cmdline).collect();
            if matches.is_empty() {
                return CheckMatch::NoCmdline;
            }
            matches
        }
    };

    if let Some(user) = &check.user {
        let user_matches = cmdline_matches
            .iter()
            .any(|p| login_name(p.uid).as_deref() == Some(user.name.as_str()));
        if !user_matches {
            return CheckMatch::NoUser;
        }
    }

    CheckMatch::Satisfied
}

pub struct ProcessModule {
    settings: ProcessSettings,
}

impl ProcessModule {
    fn check_failed(
        &self,
        dispatch: &Dispatcher,
        check: &ProcessCheckSettings,
        reason: &str,
    ) -> bool {
        tracing::warn!(basename = %check.basename, reason, "process_check failed");
        let context = ActionContext::new(
            NAME,
            format!("process_check: process {} {}", check.basename, reason),
        );
        ActionList::new(&check.on_error).run(dispatch, &context)
    }

    fn do_process_check(&self, check: &ProcessCheckSettings, dispatch: &Dispatcher) -> ModuleRunStatus {
        tracing::debug!(basename = %check.basename, "checking processes");

        let reason = match match_check(&scan_processes(), check) {
            CheckMatch::Satisfied => {
                tracing::info!(basename = %check.basename, "process_check satisfied");
                return ModuleRunStatus::Ok;
            }
            CheckMatch::NoBasename => "no match for basename",
            CheckMatch::NoCmdline => "no match for cmdline",
            CheckMatch::NoUser => "no match for user",
        };

        check_failed_status(self.check_failed(dispatch, check, reason))
    }
}

impl ModuleApi for ProcessModule {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, dispatch: &Dispatcher) -> ModuleRunStatus {
        let mut status = ModuleRunStatus::Ok;
        for check in &self.settings.process_checks {
            status = status.max(self.do_process_check(check, dispatch));
        }
        status
    }

    fn make_action<'a>(
        &'a self,
        action_name: &str,
        settings: &dyn ActionSettings,
        dispatch: &'a Dispatcher,
    ) -> Result<Box<dyn Action + 'a>, ActionError> {
        if action_name != "execute" {
            return Err(ActionError(format!("no such process action '{action_name}'")));
        }
        let settings = settings
            .as_any()
            .downcast_ref::<ActionExecuteSettings>()
            .ok_or_else(|| ActionError::from("settings type mismatch for process action"))?
            .clone();
        Ok(Box::new(ExecuteAction { settings, dispatch }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toml::Value;

    fn entry(basename: &str, cmdline: &[&str], uid: u32) -> ProcEntry {
        ProcEntry {
            basename: basename.to_owned(),
            cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
            uid,
        }
    }

    fn check(basename: &str, cmdline: Option<Vec<&str>>, user: Option<(u32, &str)>) -> ProcessCheckSettings {
        ProcessCheckSettings {
            basename: basename.to_owned(),
            cmdline: cmdline.map(|v| v.iter().map(|s| s.to_string()).collect()),
            user: user.map(|(uid, name)| PasswdEntry { uid, name: name.to_owned() }),
            on_error: ActionListSettings::default(),
        }
    }

    #[test]
    fn basename_only_match() {
        let procs = vec![entry("sshd", &["/usr/sbin/sshd", "-D"], 0)];
        let c = check("sshd", None, None);
        assert_eq!(match_check(&procs, &c), CheckMatch::Satisfied);
    }

    #[test]
    fn missing_basename_fails() {
        let procs = vec![entry("nginx", &["nginx"], 0)];
        let c = check("sshd", None, None);
        assert_eq!(match_check(&procs, &c), CheckMatch::NoBasename);
    }

    #[test]
    fn cmdline_mismatch_fails() {
        let procs = vec![entry("nginx", &["nginx", "-g", "daemon off;"], 0)];
        let c = check("nginx", Some(vec!["nginx", "-c", "/etc/nginx.conf"]), None);
        assert_eq!(match_check(&procs, &c), CheckMatch::NoCmdline);
    }

    #[test]
    fn cmdline_match_among_several_basename_matches() {
        let procs = vec![
            entry("worker", &["worker", "--pool", "a"], 0),
            entry("worker", &["worker", "--pool", "b"], 0),
        ];
        let c = check("worker", Some(vec!["worker", "--pool", "b"]), None);
        assert_eq!(match_check(&procs, &c), CheckMatch::Satisfied);
    }

    #[test]
    fn parse_timeout_absent_defaults_to_five_seconds() {
        let value: Value = toml::from_str("cmdline = \"true\"").unwrap();
        let tree = Tree::new(&value, "action");
        assert_eq!(parse_timeout(&tree).unwrap(), Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn parse_timeout_zero_means_indefinite() {
        let value: Value = toml::from_str("timeout = 0").unwrap();
        let tree = Tree::new(&value, "action");
        assert_eq!(parse_timeout(&tree).unwrap(), None);
    }

    #[test]
    fn parse_timeout_positive_seconds() {
        let value: Value = toml::from_str("timeout = 30").unwrap();
        let tree = Tree::new(&value, "action");
        assert_eq!(parse_timeout(&tree).unwrap(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn parse_timeout_negative_is_invalid() {
        let value: Value = toml::from_str("timeout = -1").unwrap();
        let tree = Tree::new(&value, "action");
        assert!(matches!(parse_timeout(&tree), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn describe_marks_truncated_output() {
        let context = ActionContext::new(NAME, "process_check: foo failed");
        let msg = describe(&context, None, b"hello", true);
        assert!(msg.ends_with("[truncated]"));
    }

    #[test]
    fn describe_does_not_mark_exact_capture_as_truncated() {
        let context = ActionContext::new(NAME, "process_check: foo failed");
        let msg = describe(&context, None, &vec![b'a'; MAX_CAPTURE], false);
        assert!(!msg.ends_with("[truncated]"));
    }
}
