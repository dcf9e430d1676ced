use crate::error::DeployError;
use crate::types::{CommandResult, HostKeyPolicy, SshTarget};
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::io::prelude::*;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// SSH 客户端（阻塞式，调用方负责放到 blocking 线程中执行）
pub struct SshClient {
    pub(super) session: Session,
    pub(super) target: SshTarget,
}

impl SshClient {
    /// 建立一次已认证的 SSH 会话，不做重试
    pub fn connect(target: &SshTarget) -> Result<Self, DeployError> {
        let address = format!("{}:{}", target.address, target.port);
        debug!("Attempting to dial {} as {}", address, target.credentials.username);

        let tcp = Self::dial(&address, target.timeout_ms)?;

        // 禁用 Nagle 算法，减少小包延迟
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        // 握手与认证阶段用连接超时，认证后换成命令超时
        session.set_timeout(target.timeout_ms);

        session.handshake().map_err(|e| {
            DeployError::SshConnectionError(format!("SSH handshake with {} failed: {}", address, e))
        })?;

        Self::verify_host_key(&session, target)?;

        if !target.credentials.is_usable() {
            return Err(DeployError::AuthenticationError(format!(
                "No usable credentials for {}",
                address
            )));
        }

        session
            .userauth_password(&target.credentials.username, &target.credentials.password)
            .map_err(|e| {
                DeployError::AuthenticationError(format!(
                    "Password authentication as '{}' on {} failed: {}",
                    target.credentials.username, address, e
                ))
            })?;

        if !session.authenticated() {
            return Err(DeployError::AuthenticationError(format!(
                "Authentication failed for {}",
                address
            )));
        }

        session.set_timeout(target.command_timeout_ms);
        info!("Successfully connected to {}", address);

        Ok(Self {
            session,
            target: target.clone(),
        })
    }

    fn dial(address: &str, timeout_ms: u32) -> Result<TcpStream, DeployError> {
        let connect_err = |e: std::io::Error| {
            DeployError::SshConnectionError(format!("Failed to connect to {}: {}", address, e))
        };

        if timeout_ms == 0 {
            return TcpStream::connect(address).map_err(connect_err);
        }

        let timeout = Duration::from_millis(timeout_ms as u64);
        let mut last_error = None;
        for socket_addr in address.to_socket_addrs().map_err(connect_err)? {
            match TcpStream::connect_timeout(&socket_addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => connect_err(e),
            None => DeployError::SshConnectionError(format!("No address resolved for {}", address)),
        })
    }

    /// 按策略校验主机密钥
    fn verify_host_key(session: &Session, target: &SshTarget) -> Result<(), DeployError> {
        let known_hosts_path = match &target.host_key_policy {
            HostKeyPolicy::AcceptAny => return Ok(()),
            HostKeyPolicy::KnownHosts(path) => path,
        };

        let (key, _) = session.host_key().ok_or_else(|| {
            DeployError::SshConnectionError(format!("{} did not present a host key", target.address))
        })?;

        let mut known_hosts = session.known_hosts()?;
        known_hosts.read_file(Path::new(known_hosts_path), KnownHostFileKind::OpenSSH)?;

        match known_hosts.check_port(&target.address, target.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::Mismatch => Err(DeployError::SshConnectionError(format!(
                "Host key for {} does not match {}",
                target.address,
                known_hosts_path.display()
            ))),
            CheckResult::NotFound => Err(DeployError::SshConnectionError(format!(
                "Host {} not present in {}",
                target.address,
                known_hosts_path.display()
            ))),
            CheckResult::Failure => Err(DeployError::SshConnectionError(format!(
                "Failed to check host key for {}",
                target.address
            ))),
        }
    }

    /// 执行远程命令
    pub fn execute_command(&self, command: &str) -> Result<CommandResult, DeployError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        channel.read_to_string(&mut stdout)?;
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        debug!(
            "Command '{}' on '{}' executed with exit code: {}",
            command, self.target.address, exit_code
        );

        Ok(CommandResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// 断开会话
    pub fn disconnect(self) {
        if let Err(e) = self.session.disconnect(None, "closing", None) {
            debug!("Disconnect from {} reported: {}", self.target.address, e);
        }
    }
}
