#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobctl_common::ControlConfig;
use jobctl_profiles::RunProfile;
use jobd::{ChannelSink, ControlError, JobControl, JobEvent, LaunchedProcess, ProcessLauncher};
use tokio::sync::mpsc::UnboundedReceiver;

pub const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Records every command line instead of running it. Calls listed in
/// `fail_on` (zero-based) fail.
#[derive(Default)]
pub struct RecordingLauncher {
    pub lines: Mutex<Vec<String>>,
    pub fail_on: Vec<usize>,
}

impl RecordingLauncher {
    pub fn failing_on(fail_on: Vec<usize>) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            fail_on,
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for RecordingLauncher {
    async fn launch(&self, command_line: &str) -> jobd::Result<LaunchedProcess> {
        let mut lines = self.lines.lock().unwrap();
        let call = lines.len();
        lines.push(command_line.to_string());
        if self.fail_on.contains(&call) {
            return Err(ControlError::Launch(format!("refused call {}", call)));
        }
        Ok(LaunchedProcess {
            pid: None,
            exit: None,
        })
    }
}

/// Loopback config over a port range that was free a moment ago.
pub fn loopback_config() -> ControlConfig {
    let probe = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let start = probe.local_addr().unwrap().port();
    drop(probe);
    ControlConfig {
        start_port: start,
        end_port: start.saturating_add(32),
        bind_address: "127.0.0.1".to_string(),
        advertised_addresses: vec!["127.0.0.1".to_string()],
        executable_dir: "/opt/jobs/bin".to_string(),
        ..ControlConfig::default()
    }
}

pub async fn start(
    config: ControlConfig,
    launcher: Arc<RecordingLauncher>,
) -> JobControl {
    JobControl::start(config, launcher).await.unwrap()
}

pub fn master_addr(control: &JobControl) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], control.port()))
}

pub fn single_replica_profile() -> RunProfile {
    let mut profile = RunProfile::new("local");
    profile.add_command_parts("$command", 1, 1, 0).unwrap();
    profile
}

pub fn channel() -> (Arc<ChannelSink>, UnboundedReceiver<JobEvent>) {
    let (sink, events) = ChannelSink::new();
    (Arc::new(sink), events)
}

pub async fn next_event(events: &mut UnboundedReceiver<JobEvent>) -> JobEvent {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for job event")
        .expect("event channel closed")
}
