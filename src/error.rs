use thiserror::Error;
use serde::Serialize;

#[derive(Error, Debug, Serialize)]
pub enum DeployError {
    /// 地址范围、playbook 或 inventory 文档格式错误（不会触发任何网络操作）
    #[error("Format error: {0}")]
    FormatError(String),

    #[error("SSH connection failed: {0}")]
    SshConnectionError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Command execution failed: {0}")]
    CommandExecutionError(String),

    #[error("Local command failed: {0}")]
    LocalCommandError(String),

    #[error("Credentials missing: {0}")]
    CredentialsMissing(String),

    #[error("OS detection failed: {0}")]
    DetectionError(String),

    #[error("Inventory error: {0}")]
    InventoryError(String),

    #[error("Playbook error: {0}")]
    PlaybookError(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Operation timed out: {0}")]
    TimeoutError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("SSH error: {0}")]
    Ssh2Error(String),
}

impl DeployError {
    /// 是否属于连接类错误（TCP/SSH 拨号、握手、认证）
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DeployError::SshConnectionError(_)
                | DeployError::AuthenticationError(_)
                | DeployError::Ssh2Error(_)
                | DeployError::TimeoutError(_)
        )
    }
}

impl From<std::io::Error> for DeployError {
    fn from(error: std::io::Error) -> Self {
        DeployError::IoError(error.to_string())
    }
}

impl From<ssh2::Error> for DeployError {
    fn from(error: ssh2::Error) -> Self {
        DeployError::Ssh2Error(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(DeployError::SshConnectionError("refused".into()).is_connectivity());
        assert!(DeployError::AuthenticationError("bad password".into()).is_connectivity());
        assert!(DeployError::TimeoutError("dial".into()).is_connectivity());
        assert!(!DeployError::CommandExecutionError("exit 1".into()).is_connectivity());
        assert!(!DeployError::CredentialsMissing("none".into()).is_connectivity());
    }
}
