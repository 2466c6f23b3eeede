//! Host command collectors.

use std::process::{Output, Stdio};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::domain::{UnitError, UnitResult};
use crate::scheduler::{DiagnosisUnit, UnitContext};

/// Prefix that runs a command inside the namespaces of the host's PID 1.
const NSENTER_PREFIX: [&str; 8] = [
    "nsenter", "--target", "1", "--mount", "--uts", "--ipc", "--net", "--pid",
];

/// Built-in collectors shipped with the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinCollector {
    /// Resolver configuration.
    Dns,

    /// NAT table, where kube-proxy keeps service rules.
    Iptables,

    /// The kubelet's command line.
    KubeletCmd,

    /// Recent kubelet journal.
    SystemLogs,
}

impl BuiltinCollector {
    pub fn all() -> &'static [BuiltinCollector] {
        &[
            BuiltinCollector::Dns,
            BuiltinCollector::Iptables,
            BuiltinCollector::KubeletCmd,
            BuiltinCollector::SystemLogs,
        ]
    }

    /// Unit name, also the artifact namespace.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinCollector::Dns => "dns",
            BuiltinCollector::Iptables => "iptables",
            BuiltinCollector::KubeletCmd => "kubeletcmd",
            BuiltinCollector::SystemLogs => "systemlogs",
        }
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        match self {
            BuiltinCollector::Dns => vec![
                CommandSpec::new("resolv.conf", &["cat", "/etc/resolv.conf"]),
                CommandSpec::new("hosts", &["cat", "/etc/hosts"]),
            ],
            BuiltinCollector::Iptables => vec![
                CommandSpec::new("nat", &["iptables", "-t", "nat", "-L", "-n", "-v"]),
                CommandSpec::new("filter", &["iptables", "-t", "filter", "-L", "-n", "-v"]),
            ],
            BuiltinCollector::KubeletCmd => {
                vec![CommandSpec::new("kubelet", &["ps", "-o", "cmd=", "-C", "kubelet"])]
            }
            BuiltinCollector::SystemLogs => vec![CommandSpec::new(
                "kubelet.log",
                &["journalctl", "-u", "kubelet", "--no-pager", "-n", "2000"],
            )],
        }
    }
}

impl FromStr for BuiltinCollector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuiltinCollector::all()
            .iter()
            .copied()
            .find(|c| c.name() == s.trim())
            .ok_or_else(|| {
                format!("unknown collector {s:?} (expected dns|iptables|kubeletcmd|systemlogs)")
            })
    }
}

/// One command and the artifact its stdout lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Local artifact name.
    pub artifact: String,
    /// argv; the first element is the executable.
    pub argv: Vec<String>,
}

impl CommandSpec {
    pub fn new(artifact: &str, argv: &[&str]) -> Self {
        Self {
            artifact: artifact.to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Runs a fixed list of commands and stores their output.
///
/// Commands run one after another. A failing command does not stop the
/// others; the unit fails at the end if any command failed. Stdout is always
/// kept; stderr is stored as `<artifact>.stderr` for failing commands.
#[derive(Debug, Clone)]
pub struct CommandCollector {
    name: String,
    commands: Vec<CommandSpec>,
    host_namespace: bool,
}

impl CommandCollector {
    pub fn new(name: impl Into<String>, commands: Vec<CommandSpec>) -> Self {
        Self {
            name: name.into(),
            commands,
            host_namespace: false,
        }
    }

    pub fn from_builtin(collector: BuiltinCollector) -> Self {
        Self::new(collector.name(), collector.commands())
    }

    /// Run every command through `nsenter` in the host's namespaces.
    pub fn with_host_namespace(mut self, enabled: bool) -> Self {
        self.host_namespace = enabled;
        self
    }

    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    fn argv(&self, spec: &CommandSpec) -> Vec<String> {
        host_argv(spec, self.host_namespace)
    }
}

/// argv of `spec`, wrapped in `nsenter` when `host_namespace` is set.
pub(crate) fn host_argv(spec: &CommandSpec, host_namespace: bool) -> Vec<String> {
    if host_namespace {
        NSENTER_PREFIX
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once("--".to_string()))
            .chain(spec.argv.iter().cloned())
            .collect()
    } else {
        spec.argv.clone()
    }
}

/// Spawn `argv` and wait for its output, killing it if `ctx` is cancelled.
///
/// A non-zero exit is not an error here; callers inspect `Output::status`.
pub(crate) async fn run_command(
    ctx: &UnitContext,
    spec: &CommandSpec,
    argv: &[String],
) -> UnitResult<Output> {
    let (exe, args) = argv.split_first().ok_or_else(|| UnitError::Command {
        command: spec.artifact.clone(),
        detail: "empty command".to_string(),
    })?;

    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| UnitError::Command {
            command: spec.display(),
            detail: e.to_string(),
        })?;

    // Dropping the wait future drops the child, which kills it.
    tokio::select! {
        _ = ctx.cancelled() => Err(UnitError::Cancelled),
        output = child.wait_with_output() => Ok(output?),
    }
}

/// Error text for a command that ran but did not exit successfully.
pub(crate) fn exit_detail(output: &Output) -> String {
    match output.status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[async_trait]
impl DiagnosisUnit for CommandCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &UnitContext) -> UnitResult<()> {
        let mut failures = Vec::new();

        for spec in &self.commands {
            let output = match run_command(ctx, spec, &self.argv(spec)).await {
                Ok(output) => output,
                Err(UnitError::Cancelled) => return Err(UnitError::Cancelled),
                Err(e) => {
                    failures.push(e.to_string());
                    continue;
                }
            };

            if output.status.success() {
                debug!(
                    command = %spec.display(),
                    bytes = output.stdout.len(),
                    "command collected"
                );
                ctx.emit(&spec.artifact, output.stdout);
                continue;
            }

            let detail = exit_detail(&output);
            if !output.stdout.is_empty() {
                ctx.emit(&spec.artifact, output.stdout);
            }
            ctx.emit(&format!("{}.stderr", spec.artifact), output.stderr);
            failures.push(
                UnitError::Command {
                    command: spec.display(),
                    detail,
                }
                .to_string(),
            );
        }

        match UnitError::from_failures(&failures, self.commands.len()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(artifact: &str, script: &str) -> CommandSpec {
        CommandSpec::new(artifact, &["sh", "-c", script])
    }

    #[test]
    fn test_builtin_names_parse_back() {
        for collector in BuiltinCollector::all() {
            assert_eq!(collector.name().parse::<BuiltinCollector>().unwrap(), *collector);
            assert!(!collector.commands().is_empty());
        }
        assert!("helm".parse::<BuiltinCollector>().is_err());
    }

    #[test]
    fn test_host_namespace_argv() {
        let collector =
            CommandCollector::from_builtin(BuiltinCollector::Dns).with_host_namespace(true);
        let argv = collector.argv(&collector.commands()[0]);
        assert_eq!(argv[0], "nsenter");
        assert_eq!(argv[8], "--");
        assert_eq!(&argv[9..], &["cat", "/etc/resolv.conf"]);

        let plain = CommandCollector::from_builtin(BuiltinCollector::Dns);
        assert_eq!(plain.argv(&plain.commands()[0])[0], "cat");
    }

    #[tokio::test]
    async fn test_collects_stdout() {
        let unit = CommandCollector::new("shell", vec![sh("greeting", "echo hello")]);
        let (ctx, emitted) = UnitContext::detached("shell", Duration::from_secs(10));

        unit.execute(&ctx).await.unwrap();
        let artifacts = emitted.take();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "shell/greeting");
        assert_eq!(artifacts[0].content, b"hello\n");
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_output_and_other_commands() {
        let unit = CommandCollector::new(
            "shell",
            vec![
                sh("broken", "echo partial; echo oops >&2; exit 3"),
                sh("fine", "echo ok"),
                CommandSpec::new("missing", &["/definitely/not/a/binary"]),
            ],
        );
        let (ctx, emitted) = UnitContext::detached("shell", Duration::from_secs(10));

        let err = unit.execute(&ctx).await.unwrap_err();
        match err {
            UnitError::Incomplete { failed, total, first } => {
                assert_eq!((failed, total), (2, 3));
                assert!(first.contains("exit code 3"), "{first}");
            }
            other => panic!("unexpected error: {other}"),
        }

        let names: Vec<_> = emitted.take().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["shell/broken", "shell/broken.stderr", "shell/fine"]);
    }

    #[tokio::test]
    async fn test_cancellation_kills_command() {
        let unit = CommandCollector::new("slow", vec![sh("nap", "sleep 30")]);
        let (ctx, _emitted) = UnitContext::detached("slow", Duration::from_secs(60));
        let token = ctx.cancellation_token().clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let err = unit.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, UnitError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
