use crate::error::DeployError;
use crate::ssh::SshClient;
use crate::types::SshTarget;
use std::process::Command;
use tracing::{debug, warn};

/// 一个已认证的远程命令会话
pub trait RemoteSession: Send {
    /// 执行一条命令，返回 stdout+stderr 合并后的输出；非零退出码视为错误
    fn run(&mut self, command: &str) -> Result<String, DeployError>;

    fn close(self: Box<Self>);
}

/// 远程/本地命令执行的传输层，不包含任何重试逻辑
///
/// 所有方法都是阻塞的，异步调用方应在 `spawn_blocking` 中使用。
pub trait Transport: Send + Sync {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError>;

    fn run_local(&self, command: &str) -> Result<String, DeployError> {
        run_local(command)
    }
}

/// 关闭会话，`None` 时什么也不做
pub fn close_session(session: Option<Box<dyn RemoteSession>>) {
    if let Some(session) = session {
        session.close();
    }
}

/// connect → run → close，命令失败时同样会关闭会话
pub fn run_remote(
    transport: &dyn Transport,
    target: &SshTarget,
    command: &str,
) -> Result<String, DeployError> {
    let mut session = transport.connect(target)?;
    let result = session.run(command);
    close_session(Some(session));
    result.map_err(|e| match e {
        DeployError::CommandExecutionError(msg) => {
            DeployError::CommandExecutionError(format!("{} on {}: {}", command, target.address, msg))
        }
        other => other,
    })
}

/// 通过本地 shell 执行命令
///
/// stdout 与 stderr 分别捕获；失败时错误信息中附带 stderr。
pub fn run_local(command: &str) -> Result<String, DeployError> {
    debug!("Executing local command: {}", command);

    let output = local_shell(command).output().map_err(|e| {
        DeployError::LocalCommandError(format!("Failed to spawn '{}': {}", command, e))
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("Local command '{}' exited with {}", command, output.status);
        return Err(DeployError::LocalCommandError(format!(
            "'{}' exited with {}\nstderr: {}",
            command,
            output.status,
            stderr.trim_end()
        )));
    }

    Ok(stdout)
}

#[cfg(windows)]
fn local_shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", command]);
    cmd
}

#[cfg(not(windows))]
fn local_shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd
}

/// 基于 ssh2 的传输实现
#[derive(Debug, Default, Clone)]
pub struct SshTransport;

impl Transport for SshTransport {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError> {
        Ok(Box::new(SshClient::connect(target)?))
    }
}

impl RemoteSession for SshClient {
    fn run(&mut self, command: &str) -> Result<String, DeployError> {
        let result = self.execute_command(command)?;
        let output = result.combined_output();
        if result.exit_code != 0 {
            return Err(DeployError::CommandExecutionError(format!(
                "exit code {}\n{}",
                result.exit_code,
                output.trim_end()
            )));
        }
        Ok(output)
    }

    fn close(self: Box<Self>) {
        self.disconnect();
    }
}
