//! 测试用的内存传输层

use crate::error::DeployError;
use crate::transport::{RemoteSession, Transport};
use crate::types::SshTarget;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct FakeSession {
    responses: HashMap<String, Result<String, String>>,
    executed: Arc<Mutex<Vec<String>>>,
    state: Option<Arc<FakeState>>,
}

impl FakeSession {
    pub fn respond(mut self, command: &str, result: Result<&str, &str>) -> Self {
        self.responses.insert(
            command.to_string(),
            result.map(str::to_string).map_err(str::to_string),
        );
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl RemoteSession for FakeSession {
    fn run(&mut self, command: &str) -> Result<String, DeployError> {
        self.executed.lock().unwrap().push(command.to_string());
        match self.responses.get(command) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(e)) => Err(DeployError::CommandExecutionError(e.clone())),
            None => Err(DeployError::CommandExecutionError(format!(
                "{}: command not found",
                command
            ))),
        }
    }

    fn close(self: Box<Self>) {
        if let Some(state) = &self.state {
            state.closed.fetch_add(1, Ordering::SeqCst);
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct FakeState {
    sessions: Mutex<HashMap<String, FakeSession>>,
    connect_failures: Mutex<HashMap<String, usize>>,
    connects: Mutex<Vec<SshTarget>>,
    connect_delay: Mutex<Duration>,
    local: Mutex<HashMap<String, Result<String, String>>>,
    local_executed: Mutex<Vec<String>>,
    closed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// 按地址返回预设会话；未登记的地址视为不可达
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, address: &str, session: FakeSession) -> Self {
        self.state
            .sessions
            .lock()
            .unwrap()
            .insert(address.to_string(), session);
        self
    }

    /// 前 `times` 次连接该地址时失败
    pub fn fail_connects(self, address: &str, times: usize) -> Self {
        self.state
            .connect_failures
            .lock()
            .unwrap()
            .insert(address.to_string(), times);
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.state.connect_delay.lock().unwrap() = delay;
        self
    }

    pub fn with_local(self, command: &str, result: Result<&str, &str>) -> Self {
        self.state.local.lock().unwrap().insert(
            command.to_string(),
            result.map(str::to_string).map_err(str::to_string),
        );
        self
    }

    pub fn connects(&self) -> Vec<SshTarget> {
        self.state.connects.lock().unwrap().clone()
    }

    pub fn connect_count(&self, address: &str) -> usize {
        self.connects().iter().filter(|t| t.address == address).count()
    }

    pub fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn executed(&self, address: &str) -> Vec<String> {
        self.state
            .sessions
            .lock()
            .unwrap()
            .get(address)
            .map(|s| s.executed())
            .unwrap_or_default()
    }

    pub fn local_executed(&self) -> Vec<String> {
        self.state.local_executed.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError> {
        self.state.connects.lock().unwrap().push(target.clone());

        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let fail = {
            let mut failures = self.state.connect_failures.lock().unwrap();
            match failures.get_mut(&target.address) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        let session = self.state.sessions.lock().unwrap().get(&target.address).cloned();
        match session {
            Some(mut session) if !fail => {
                session.state = Some(self.state.clone());
                Ok(Box::new(session))
            }
            _ => {
                self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(DeployError::SshConnectionError(format!(
                    "Failed to connect to {}:{}: connection refused",
                    target.address, target.port
                )))
            }
        }
    }

    fn run_local(&self, command: &str) -> Result<String, DeployError> {
        self.state
            .local_executed
            .lock()
            .unwrap()
            .push(command.to_string());
        match self.state.local.lock().unwrap().get(command) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(e)) => Err(DeployError::LocalCommandError(e.clone())),
            None => Ok(String::new()),
        }
    }
}
