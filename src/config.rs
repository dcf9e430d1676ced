use crate::credentials;
use crate::discovery::LIVENESS_PORTS;
use crate::error::DeployError;
use crate::types::{Credentials, HostKeyPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// 引擎运行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub inventory_path: PathBuf,
    pub playbooks_dir: PathBuf,
    /// 探测与任务分发的最大并发数
    pub max_concurrency: usize,
    pub probe_timeout_ms: u64,
    /// 存活探测尝试的端口
    pub liveness_ports: Vec<u16>,
    pub detection_retries: u32,
    pub detection_retry_delay_ms: u64,
    pub detection_timeout_ms: u64,
    pub ssh_timeout_ms: u32,
    /// 远程命令读写超时，0 表示不限
    pub command_timeout_ms: u32,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub host_key_policy: HostKeyPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inventory_path: PathBuf::from("inventory.yaml"),
            playbooks_dir: PathBuf::from("playbooks"),
            max_concurrency: 16,
            probe_timeout_ms: 2_000,
            liveness_ports: LIVENESS_PORTS.to_vec(),
            detection_retries: 3,
            detection_retry_delay_ms: 2_000,
            detection_timeout_ms: 5_000,
            ssh_timeout_ms: 10_000,
            command_timeout_ms: 0,
            host_key_policy: HostKeyPolicy::AcceptAny,
        }
    }
}

impl EngineConfig {
    /// 从YAML文件加载配置，文件不存在时使用默认值
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DeployError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| DeployError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: EngineConfig = serde_yaml::from_str(&content)
            .map_err(|e| DeployError::ConfigError(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        if self.max_concurrency == 0 {
            return Err(DeployError::ConfigError(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.liveness_ports.is_empty() {
            return Err(DeployError::ConfigError(
                "liveness_ports must list at least one port".to_string(),
            ));
        }
        if self.detection_retries == 0 {
            return Err(DeployError::ConfigError(
                "detection_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn detection_retry_delay(&self) -> Duration {
        Duration::from_millis(self.detection_retry_delay_ms)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    /// 环境变量中的 SSH 凭据覆盖
    pub fn env_override(&self) -> Option<Credentials> {
        credentials::env_override()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.detection_retries, 3);
        assert_eq!(config.detection_timeout(), Duration::from_secs(5));
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eagle.yaml");
        std::fs::write(
            &path,
            "max_concurrency: 4\nliveness_ports: [22, 5985]\ncommand_timeout_ms: 30000\nhost_key_policy:\n  known_hosts: /etc/ssh/ssh_known_hosts\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.probe_timeout_ms, 2_000);
        assert_eq!(config.liveness_ports, vec![22, 5985]);
        assert_eq!(config.command_timeout_ms, 30_000);
        assert_eq!(
            config.host_key_policy,
            HostKeyPolicy::KnownHosts(PathBuf::from("/etc/ssh/ssh_known_hosts"))
        );
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eagle.yaml");
        std::fs::write(&path, "max_concurrency: 0\n").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(DeployError::ConfigError(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EngineConfig::load("/nonexistent/eagle.yaml").unwrap();
        assert_eq!(config.inventory_path, PathBuf::from("inventory.yaml"));
    }
}
