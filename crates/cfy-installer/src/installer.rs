//! Agentless installation: reach the machine, copy the upload directory,
//! run the bootstrap script and wait for the agent to join the grid.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cfy_infra::types::{FileTransferMode, RemoteExecutionMode};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{EnvironmentFileBuilder, ShellCommandBuilder};
use crate::deadline::Deadline;
use crate::details::InstallationDetails;
use crate::error::Phase;
use crate::listener::{InstallerEvents, InstallerListener, names};
use crate::registration::{GridMembership, wait_for_registration};
use crate::remote::{Connector, RemoteAuth, RemoteError, RemoteSession, RemoteTarget};
use crate::retry::{RetryError, RetryPolicy};
use crate::{Error, Result, script_errors, upload};

/// Bootstrap script file name, without extension.
pub const BOOTSTRAP_SCRIPT: &str = "bootstrap-management";

const DEFAULT_REGISTRATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    NotStarted,
    CheckingConnection,
    Uploading,
    ExecutingBootstrap,
    AwaitingAgentRegistration,
    Registered,
    Failed,
    TimedOut,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::CheckingConnection => "checking connection",
            Self::Uploading => "uploading",
            Self::ExecutingBootstrap => "executing bootstrap",
            Self::AwaitingAgentRegistration => "awaiting agent registration",
            Self::Registered => "registered",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
        })
    }
}

/// Outcome of a successful installation.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub host: String,
    pub state: InstallState,
    pub connection_attempts: u32,
    pub files_uploaded: usize,
    /// Whether registration was confirmed through a [`GridMembership`]
    /// handle. Without one, a clean bootstrap exit is taken as registration.
    pub registration_confirmed: bool,
    pub elapsed: Duration,
}

/// Installs the grid agent on machines that have nothing but SSH or WinRM.
#[derive(Clone)]
pub struct AgentlessInstaller {
    connector: Arc<dyn Connector>,
    events: InstallerEvents,
    retry: RetryPolicy,
    membership: Option<Arc<dyn GridMembership>>,
    registration_poll_interval: Duration,
}

impl AgentlessInstaller {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            events: InstallerEvents::default(),
            retry: RetryPolicy::default(),
            membership: None,
            registration_poll_interval: DEFAULT_REGISTRATION_POLL_INTERVAL,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_membership(mut self, membership: Arc<dyn GridMembership>) -> Self {
        self.membership = Some(membership);
        self
    }

    pub fn with_registration_poll_interval(mut self, interval: Duration) -> Self {
        self.registration_poll_interval = interval;
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn InstallerListener>) {
        self.events.add(listener);
    }

    /// Run the whole installation within `timeout`. Every remote call gets
    /// only what is left of that budget.
    pub async fn install_on_machine(
        &self,
        details: &InstallationDetails,
        timeout: Duration,
    ) -> Result<InstallReport> {
        let started = Instant::now();
        let deadline = Deadline::after(timeout);
        let host = details.target_host()?.to_string();
        let auth = RemoteAuth::from_parts(
            &host,
            details.password.as_deref(),
            details.key_file.as_deref(),
        )?;
        let target = RemoteTarget {
            host: host.clone(),
            username: details.username.clone(),
            auth,
            local_dir: details.local_dir.clone(),
        };

        let mut attempt = Attempt {
            host: &host,
            state: InstallState::NotStarted,
        };
        let result = self.run(&mut attempt, details, &target, deadline).await;
        match result {
            Ok((connection_attempts, files_uploaded, registration_confirmed)) => {
                attempt.enter(InstallState::Registered);
                self.events
                    .publish(names::INSTALL_COMPLETED_ON_NODE, &[host.clone()]);
                let state = attempt.state;
                let elapsed = started.elapsed();
                info!(host = %host, ?elapsed, "agentless installation completed");
                Ok(InstallReport {
                    host,
                    state,
                    connection_attempts,
                    files_uploaded,
                    registration_confirmed,
                    elapsed,
                })
            }
            Err(e) => {
                let failed_in = attempt.state;
                attempt.enter(if e.is_timeout() {
                    InstallState::TimedOut
                } else {
                    InstallState::Failed
                });
                warn!(host = %host, state = %failed_in, error = %e, "agentless installation failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        attempt: &mut Attempt<'_>,
        details: &InstallationDetails,
        target: &RemoteTarget,
        deadline: Deadline,
    ) -> Result<(u32, usize, bool)> {
        let host = target.host.as_str();

        attempt.enter(InstallState::CheckingConnection);
        self.events
            .publish(names::ATTEMPTING_TO_ACCESS_VM, &[host.to_string()]);
        let mut connection_attempts = self
            .check_connection(host, details.file_transfer_mode.port(), deadline)
            .await?;
        let exec_port = details.remote_execution_mode.port();
        if exec_port != details.file_transfer_mode.port() {
            connection_attempts += self.check_connection(host, exec_port, deadline).await?;
        }

        attempt.enter(InstallState::Uploading);
        self.events
            .publish(names::UPLOADING_FILES_TO_NODE, &[host.to_string()]);
        let files_uploaded = self.upload(details, target, deadline).await?;

        attempt.enter(InstallState::ExecutingBootstrap);
        self.events
            .publish(names::LAUNCHING_AGENT_ON_NODE, &[host.to_string()]);
        self.execute_bootstrap(details, target, deadline).await?;

        let Some(membership) = &self.membership else {
            debug!(host, "no grid membership handle, bootstrap exit status taken as registration");
            return Ok((connection_attempts, files_uploaded, false));
        };
        attempt.enter(InstallState::AwaitingAgentRegistration);
        self.events
            .publish(names::WAITING_FOR_AGENT, &[host.to_string()]);
        if !wait_for_registration(
            membership.as_ref(),
            host,
            self.registration_poll_interval,
            deadline,
        )
        .await
        {
            return Err(Error::Timeout {
                phase: Phase::Registration,
                host: host.to_string(),
            });
        }
        Ok((connection_attempts, files_uploaded, true))
    }

    /// Probe `port` until it accepts a connection. Returns the number of
    /// attempts it took.
    async fn check_connection(&self, host: &str, port: u16, deadline: Deadline) -> Result<u32> {
        let ((), attempts) = self
            .with_retries(host, port, Phase::ConnectionCheck, deadline, |remaining| {
                self.connector.probe(host, port, remaining)
            })
            .await?;
        Ok(attempts)
    }

    /// Run `op` under the retry policy, announcing every retry. Returns the
    /// value and the number of attempts it took.
    async fn with_retries<T, F, Fut>(
        &self,
        host: &str,
        port: u16,
        phase: Phase,
        deadline: Deadline,
        op: F,
    ) -> Result<(T, u32)>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let mut attempts = 1;
        let outcome = self
            .retry
            .retry(deadline, op, |attempt, err: &RemoteError, delay| {
                attempts = attempt + 1;
                self.events.publish(
                    names::RETRYING_CONNECTION,
                    &[
                        host.to_string(),
                        port.to_string(),
                        attempt.to_string(),
                        err.to_string(),
                    ],
                );
                debug!(host, port, attempt, ?delay, "port not reachable yet");
            })
            .await;

        match outcome {
            Ok(value) => Ok((value, attempts)),
            Err(RetryError::Permanent(e)) => Err(e.into_installer(phase, host)),
            Err(RetryError::Exhausted { last, attempts }) => Err(Error::installer(
                phase,
                host,
                format!("port {port} unreachable after {attempts} attempts"),
            )
            .with_source(last)),
            Err(RetryError::DeadlineExceeded { .. }) => Err(Error::Timeout {
                phase,
                host: host.to_string(),
            }),
        }
    }

    async fn open_exec(
        &self,
        details: &InstallationDetails,
        target: &RemoteTarget,
        phase: Phase,
        deadline: Deadline,
    ) -> Result<Box<dyn RemoteSession>> {
        let mode = details.remote_execution_mode;
        let (session, _) = self
            .with_retries(&target.host, mode.port(), phase, deadline, |remaining| {
                self.connector.open_exec(target, mode, remaining)
            })
            .await?;
        Ok(session)
    }

    async fn open_transfer(
        &self,
        details: &InstallationDetails,
        target: &RemoteTarget,
        deadline: Deadline,
    ) -> Result<Box<dyn RemoteSession>> {
        let mode = details.file_transfer_mode;
        let (session, _) = self
            .with_retries(&target.host, mode.port(), Phase::Upload, deadline, |remaining| {
                self.connector.open_transfer(target, mode, remaining)
            })
            .await?;
        Ok(session)
    }

    /// Copy the upload directory. CIFS has no shell of its own, so the
    /// remote directory is then prepared over the exec channel.
    async fn upload(
        &self,
        details: &InstallationDetails,
        target: &RemoteTarget,
        deadline: Deadline,
    ) -> Result<usize> {
        let host = target.host.as_str();
        let env_file = environment_file(details);
        let files = upload::collect_files(details).await?;

        let mut shell = match details.file_transfer_mode {
            FileTransferMode::Cifs => {
                Some(self.open_exec(details, target, Phase::Upload, deadline).await?)
            }
            FileTransferMode::Scp | FileTransferMode::Sftp => None,
        };
        let mut transfer = match self.open_transfer(details, target, deadline).await {
            Ok(session) => session,
            Err(e) => {
                if let Some(shell) = shell.as_mut() {
                    shell.close().await;
                }
                return Err(e);
            }
        };

        let prepared = match shell.as_mut() {
            Some(shell) => {
                upload::prepare_remote_directory(
                    shell.as_mut(),
                    details.remote_execution_mode,
                    details,
                    &files,
                    host,
                    deadline,
                )
                .await
            }
            None => {
                upload::prepare_remote_directory(
                    transfer.as_mut(),
                    RemoteExecutionMode::Ssh,
                    details,
                    &files,
                    host,
                    deadline,
                )
                .await
            }
        };
        let uploaded = match prepared {
            Ok(()) => {
                upload::send_files(transfer.as_mut(), details, &files, &env_file, host, deadline)
                    .await
            }
            Err(e) => Err(e),
        };

        transfer.close().await;
        if let Some(shell) = shell.as_mut() {
            shell.close().await;
        }
        uploaded
    }

    async fn execute_bootstrap(
        &self,
        details: &InstallationDetails,
        target: &RemoteTarget,
        deadline: Deadline,
    ) -> Result<()> {
        let host = target.host.as_str();
        let mode = details.remote_execution_mode;
        let command = bootstrap_command(details);
        debug!(host, mode = mode_name(mode), "launching bootstrap script");

        let mut session = self
            .open_exec(details, target, Phase::Bootstrap, deadline)
            .await?;
        let executed = match budget(deadline, Phase::Bootstrap, host) {
            Ok(remaining) => session
                .exec(&command.to_string(), remaining)
                .await
                .map_err(|e| e.into_installer(Phase::Bootstrap, host)),
            Err(e) => Err(e),
        };
        session.close().await;
        let output = executed?;

        if mode == RemoteExecutionMode::Winrm {
            for line in output.output.lines() {
                self.events
                    .publish(names::POWERSHELL_OUTPUT_LINE, &[line.to_string()]);
            }
        }
        debug!(host, exit_status = output.exit_status, output = %output.output, "bootstrap script finished");

        if !output.success() {
            return Err(Error::installer(
                Phase::Bootstrap,
                host,
                script_errors::message_for_exit_code(output.exit_status, &output.output),
            ));
        }
        Ok(())
    }
}

/// Tracks the current state of one installation for logging.
struct Attempt<'a> {
    host: &'a str,
    state: InstallState,
}

impl Attempt<'_> {
    fn enter(&mut self, next: InstallState) {
        debug!(host = self.host, from = %self.state, to = %next, "installer state");
        self.state = next;
    }
}

fn mode_name(mode: RemoteExecutionMode) -> &'static str {
    match mode {
        RemoteExecutionMode::Ssh => "ssh",
        RemoteExecutionMode::Winrm => "winrm",
    }
}

fn budget(deadline: Deadline, phase: Phase, host: &str) -> Result<Duration> {
    let remaining = deadline.remaining();
    if remaining.is_zero() {
        return Err(Error::Timeout {
            phase,
            host: host.to_string(),
        });
    }
    Ok(remaining)
}

fn remote_dir(details: &InstallationDetails) -> &str {
    details.remote_dir.trim_end_matches('/')
}

fn quoted_or_empty(value: Option<&str>) -> String {
    value.map(|v| format!("\"{v}\"")).unwrap_or_default()
}

/// Variables handed to the bootstrap script, in export order.
pub fn bootstrap_environment(details: &InstallationDetails) -> Vec<(String, String)> {
    let dir = remote_dir(details);
    let mut vars: Vec<(String, String)> = vec![
        ("LUS_IP_ADDRESS".into(), details.locator.clone().unwrap_or_default()),
        (
            "GSA_MODE".into(),
            if details.is_management { "lus" } else { "agent" }.into(),
        ),
        ("NO_WEB_SERVICES".into(), details.no_web_services.to_string()),
        ("MACHINE_IP_ADDRESS".into(), details.machine_ip().to_string()),
        ("MACHINE_ZONES".into(), details.zones.join(",")),
        ("GIGASPACES_LINK".into(), quoted_or_empty(details.cloudify_url.as_deref())),
        (
            "GIGASPACES_OVERRIDES_LINK".into(),
            quoted_or_empty(details.overrides_url.as_deref()),
        ),
        ("WORKING_HOME_DIRECTORY".into(), dir.to_string()),
        (
            "CLOUDIFY_AGENT_ENV_PRIVATE_IP".into(),
            details.private_ip.clone().unwrap_or_default(),
        ),
        (
            "CLOUDIFY_AGENT_ENV_PUBLIC_IP".into(),
            details.public_ip.clone().unwrap_or_default(),
        ),
        (
            "CLOUDIFY_CLOUD_TEMPLATE_NAME".into(),
            details.template_name.clone().unwrap_or_default(),
        ),
    ];
    if let Some(id) = details.reservation_id {
        vars.push(("GSA_RESERVATION_ID".into(), id.to_string()));
    }
    if details.is_management {
        if let Some(cloud_file) = &details.cloud_file {
            vars.push(("CLOUD_FILE".into(), format!("{dir}/{cloud_file}")));
        }
    }
    vars.push(("USERNAME".into(), details.username.clone()));
    if let Some(password) = &details.password {
        vars.push(("PASSWORD".into(), password.clone()));
    }
    for (name, value) in &details.extra_remote_environment {
        vars.push((name.clone(), value.clone()));
    }
    vars
}

/// Remote path of the bootstrap script for this machine's script language.
pub fn bootstrap_script_path(details: &InstallationDetails) -> String {
    format!(
        "{}/{BOOTSTRAP_SCRIPT}.{}",
        remote_dir(details),
        details.script_language.script_extension()
    )
}

pub fn bootstrap_command(details: &InstallationDetails) -> ShellCommandBuilder {
    let mut command = ShellCommandBuilder::new(details.remote_execution_mode);
    for (name, value) in bootstrap_environment(details) {
        command.export_var(&name, &value);
    }
    let script = bootstrap_script_path(details);
    command.chmod_executable(&script).call(&script);
    command
}

pub fn environment_file(details: &InstallationDetails) -> EnvironmentFileBuilder {
    let mut file = EnvironmentFileBuilder::new(details.script_language);
    for (name, value) in bootstrap_environment(details) {
        file.export_var(&name, &value);
    }
    file
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::tests::{PanickingListener, RecordingListener};
    use crate::registration::tests::CountingMembership;
    use crate::remote::fake::FakeConnector;
    use cfy_infra::types::{MachineDetails, ScriptLanguage};
    use std::fs;

    fn upload_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bootstrap-management.sh"), "#!/bin/bash\n").unwrap();
        fs::write(dir.path().join("gsa.properties"), "a=b").unwrap();
        dir
    }

    fn machine() -> MachineDetails {
        MachineDetails {
            public_address: Some("1.2.3.4".into()),
            private_address: Some("10.0.0.2".into()),
            remote_username: Some("root".into()),
            remote_password: Some("secret".into()),
            template_name: Some("SMALL_LINUX".into()),
            ..Default::default()
        }
    }

    fn details(dir: &std::path::Path) -> InstallationDetails {
        InstallationDetails::builder(dir)
            .remote_dir("/tmp/gs-files/")
            .zones(["web", "db"])
            .cloudify_url("http://repo/gigaspaces.tar.gz")
            .env("EXTRA", "1")
            .build()
            .unwrap()
            .for_machine(&machine())
            .unwrap()
    }

    fn installer(connector: &FakeConnector) -> AgentlessInstaller {
        AgentlessInstaller::new(Arc::new(connector.clone()))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(5), None))
    }

    #[test]
    fn bootstrap_command_exports_in_order() {
        let dir = upload_dir();
        let cmd = bootstrap_command(&details(dir.path())).to_string();
        assert_eq!(
            cmd,
            "export LUS_IP_ADDRESS=10.0.0.2;export GSA_MODE=agent;export NO_WEB_SERVICES=false;\
             export MACHINE_IP_ADDRESS=10.0.0.2;export MACHINE_ZONES=web,db;\
             export GIGASPACES_LINK=\"http://repo/gigaspaces.tar.gz\";export GIGASPACES_OVERRIDES_LINK=;\
             export WORKING_HOME_DIRECTORY=/tmp/gs-files;export CLOUDIFY_AGENT_ENV_PRIVATE_IP=10.0.0.2;\
             export CLOUDIFY_AGENT_ENV_PUBLIC_IP=1.2.3.4;export CLOUDIFY_CLOUD_TEMPLATE_NAME=SMALL_LINUX;\
             export USERNAME=root;export PASSWORD=secret;export EXTRA=1;\
             chmod +x /tmp/gs-files/bootstrap-management.sh;/tmp/gs-files/bootstrap-management.sh"
        );
    }

    #[test]
    fn management_machines_get_lus_mode_and_cloud_file() {
        let dir = upload_dir();
        let details = InstallationDetails::builder(dir.path())
            .remote_dir("/tmp/gs-files")
            .management(true)
            .cloud_file("my-cloud.groovy")
            .reservation_id(uuid::Uuid::nil())
            .build()
            .unwrap()
            .for_machine(&machine())
            .unwrap();
        let vars = bootstrap_environment(&details);
        let get = |name: &str| {
            vars.iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("GSA_MODE"), Some("lus"));
        assert_eq!(get("CLOUD_FILE"), Some("/tmp/gs-files/my-cloud.groovy"));
        assert_eq!(
            get("GSA_RESERVATION_ID"),
            Some("00000000-0000-0000-0000-000000000000")
        );
    }

    #[test]
    fn windows_machines_get_batch_script() {
        let dir = upload_dir();
        let md = MachineDetails {
            remote_execution_mode: RemoteExecutionMode::Winrm,
            script_language: ScriptLanguage::WindowsBatch,
            remote_directory: Some("/C$/Users/Administrator/gs-files".into()),
            ..machine()
        };
        let details = InstallationDetails::builder(dir.path())
            .remote_dir("/tmp/unused")
            .build()
            .unwrap()
            .for_machine(&md)
            .unwrap();
        let cmd = bootstrap_command(&details).to_string();
        assert!(cmd.starts_with("$ENV:LUS_IP_ADDRESS='10.0.0.2';"));
        assert!(cmd.contains("$ENV:WORKING_HOME_DIRECTORY='C:\\Users\\Administrator\\gs-files';"));
        assert!(cmd.ends_with(";C:\\Users\\Administrator\\gs-files\\bootstrap-management.bat"));
        assert!(!cmd.contains("chmod"));
        assert_eq!(environment_file(&details).file_name(), "cloudify_env.bat");
    }

    #[tokio::test(start_paused = true)]
    async fn installs_and_reports_events() {
        let dir = upload_dir();
        let connector = FakeConnector::with_delay(Duration::from_secs(1));
        connector.remote().refused_probes = 2;
        let installer = installer(&connector);
        let recorder = Arc::new(RecordingListener::default());
        installer.add_listener(Arc::new(PanickingListener));
        installer.add_listener(recorder.clone());

        let report = installer
            .install_on_machine(&details(dir.path()), Duration::from_secs(120))
            .await
            .unwrap();

        assert_eq!(report.state, InstallState::Registered);
        assert_eq!(report.connection_attempts, 3);
        assert_eq!(report.files_uploaded, 3);
        assert!(!report.registration_confirmed);
        assert_eq!(
            recorder.names(),
            vec![
                "attempting_to_access_vm",
                "retrying_connection",
                "retrying_connection",
                "uploading_files_to_node",
                "launching_agent_on_node",
                "install_completed_on_node",
            ]
        );
        let remote = connector.remote();
        assert_eq!(remote.open_sessions, 0);
        assert!(remote.files.contains_key("/tmp/gs-files/cloudify_env.sh"));
        assert!(remote.commands.last().unwrap().ends_with("/tmp/gs-files/bootstrap-management.sh"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_sessions_refused_while_the_daemon_starts() {
        let dir = upload_dir();
        let connector = FakeConnector::with_delay(Duration::from_secs(1));
        connector.remote().refused_opens = 2;
        let installer = installer(&connector);
        let recorder = Arc::new(RecordingListener::default());
        installer.add_listener(recorder.clone());

        let report = installer
            .install_on_machine(&details(dir.path()), Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(report.state, InstallState::Registered);
        assert_eq!(
            recorder.names(),
            vec![
                "attempting_to_access_vm",
                "uploading_files_to_node",
                "retrying_connection",
                "retrying_connection",
                "launching_agent_on_node",
                "install_completed_on_node",
            ]
        );
        let remote = connector.remote();
        let transfer_opens = remote.calls.iter().filter(|c| c.op == "open_transfer").count();
        assert_eq!(transfer_opens, 3);
        assert_eq!(remote.open_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_refused_until_the_deadline_time_out() {
        let dir = upload_dir();
        let connector = FakeConnector::with_delay(Duration::from_secs(1));
        connector.remote().refused_opens = usize::MAX;

        let err = installer(&connector)
            .install_on_machine(&details(dir.path()), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { phase: Phase::Upload, .. }), "{err}");
        assert_eq!(connector.remote().open_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn installs_windows_machines_over_winrm_and_cifs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bootstrap-management.bat"), "@echo off\r\n").unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(dir.path().join("config/gsa.properties"), "a=b").unwrap();
        let md = MachineDetails {
            remote_execution_mode: RemoteExecutionMode::Winrm,
            file_transfer_mode: FileTransferMode::Cifs,
            script_language: ScriptLanguage::WindowsBatch,
            remote_directory: Some("/C$/Users/Administrator/gs-files".into()),
            remote_username: Some("Administrator".into()),
            ..machine()
        };
        let details = InstallationDetails::builder(dir.path())
            .remote_dir("/tmp/unused")
            .build()
            .unwrap()
            .for_machine(&md)
            .unwrap();
        let connector = FakeConnector::with_delay(Duration::from_secs(1));

        let report = installer(&connector)
            .install_on_machine(&details, Duration::from_secs(120))
            .await
            .unwrap();

        assert_eq!(report.state, InstallState::Registered);
        assert_eq!(report.files_uploaded, 3);
        let remote = connector.remote();
        assert_eq!(remote.transfer_modes, vec![FileTransferMode::Cifs]);
        assert_eq!(
            remote.exec_modes,
            vec![RemoteExecutionMode::Winrm, RemoteExecutionMode::Winrm]
        );
        assert_eq!(
            remote.commands[0],
            "New-Item -ItemType Directory -Force -Path 'C:\\Users\\Administrator\\gs-files' | Out-Null; \
             New-Item -ItemType Directory -Force -Path 'C:\\Users\\Administrator\\gs-files\\config' | Out-Null"
        );
        for file in ["bootstrap-management.bat", "config/gsa.properties", "cloudify_env.bat"] {
            let path = format!("/C$/Users/Administrator/gs-files/{file}");
            assert!(remote.files.contains_key(&path), "{path} was not uploaded");
        }
        assert!(
            remote
                .commands
                .last()
                .unwrap()
                .ends_with(";C:\\Users\\Administrator\\gs-files\\bootstrap-management.bat")
        );
        assert_eq!(remote.open_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_step_gets_only_the_remaining_budget() {
        let dir = upload_dir();
        let connector = FakeConnector::with_delay(Duration::from_secs(2));
        connector.remote().refused_probes = 1;
        let timeout = Duration::from_secs(60);
        let start = Instant::now();

        installer(&connector)
            .install_on_machine(&details(dir.path()), timeout)
            .await
            .unwrap();

        let remote = connector.remote();
        assert!(remote.calls.len() > 5);
        for call in &remote.calls {
            let elapsed = call.at - start;
            assert!(
                call.timeout <= timeout - elapsed,
                "{} got {:?} after {:?}",
                call.op,
                call.timeout,
                elapsed
            );
        }
        let budgets: Vec<Duration> = remote.calls.iter().map(|c| c.timeout).collect();
        assert!(budgets.windows(2).all(|w| w[1] <= w[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_mid_upload_and_closes_sessions() {
        let dir = upload_dir();
        let connector = FakeConnector::with_delay(Duration::from_secs(4));
        let err = installer(&connector)
            .install_on_machine(&details(dir.path()), Duration::from_secs(15))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { phase: Phase::Upload, .. }), "{err}");
        assert_eq!(connector.remote().open_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reinstall_with_clean_removes_stale_files() {
        let dir = upload_dir();
        let connector = FakeConnector::default();
        connector
            .remote()
            .files
            .insert("/tmp/gs-files/stale.jar".into(), b"old".to_vec());
        let mut details = details(dir.path());
        details.delete_remote_directory_contents = true;

        installer(&connector)
            .install_on_machine(&details, Duration::from_secs(60))
            .await
            .unwrap();

        let remote = connector.remote();
        assert!(!remote.files.contains_key("/tmp/gs-files/stale.jar"));
        assert!(remote.files.contains_key("/tmp/gs-files/bootstrap-management.sh"));
        assert!(remote.files.contains_key("/tmp/gs-files/gsa.properties"));
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_existing_files_without_clean() {
        let dir = upload_dir();
        let connector = FakeConnector::default();
        connector
            .remote()
            .files
            .insert("/tmp/gs-files/stale.jar".into(), b"old".to_vec());

        installer(&connector)
            .install_on_machine(&details(dir.path()), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(connector.remote().files.contains_key("/tmp/gs-files/stale.jar"));
    }

    #[tokio::test(start_paused = true)]
    async fn script_exit_code_becomes_the_message() {
        let dir = upload_dir();
        let connector = FakeConnector {
            exec_exit_status: 115,
            ..Default::default()
        };
        let err = installer(&connector)
            .install_on_machine(&details(dir.path()), Duration::from_secs(60))
            .await
            .unwrap_err();

        match err {
            Error::Installer { phase, message, .. } => {
                assert_eq!(phase, Phase::Bootstrap);
                assert!(message.starts_with("Current user is not a sudoer"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(connector.remote().open_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_credentials_fail_before_any_io() {
        let dir = upload_dir();
        let connector = FakeConnector::default();
        let mut details = details(dir.path());
        details.key_file = Some(dir.path().join("missing.pem"));

        let err = installer(&connector)
            .install_on_machine(&details, Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert!(connector.remote().calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_registration() {
        let dir = upload_dir();
        let connector = FakeConnector::default();
        let installer = installer(&connector)
            .with_membership(Arc::new(CountingMembership::new(3)))
            .with_registration_poll_interval(Duration::from_secs(1));

        let report = installer
            .install_on_machine(&details(dir.path()), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(report.registration_confirmed);
        assert_eq!(report.state, InstallState::Registered);

        let never = AgentlessInstaller::new(Arc::new(connector.clone()))
            .with_membership(Arc::new(CountingMembership::new(usize::MAX)))
            .with_registration_poll_interval(Duration::from_secs(1));
        let err = never
            .install_on_machine(&details(dir.path()), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { phase: Phase::Registration, .. }));
    }
}
