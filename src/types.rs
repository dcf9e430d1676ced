use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// SSH 用户名/密码对
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// 用户名和密码都非空才算可用
    pub fn is_usable(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// 从可能为空的两个字段构造凭据，任一为空则返回 None
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        let creds = Self::new(username.unwrap_or_default(), password.unwrap_or_default());
        creds.is_usable().then_some(creds)
    }
}

/// 主机密钥校验策略
///
/// 默认 `AcceptAny` 不做任何校验，与历史行为一致，但这是不安全的。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    #[default]
    AcceptAny,
    KnownHosts(PathBuf),
}

/// 一次 SSH 连接所需的全部信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub address: String,
    pub port: u16,
    pub credentials: Credentials,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// 拨号、握手与认证的超时（毫秒），0 表示不限
    pub timeout_ms: u32,
    /// 认证后远程命令读写的超时（毫秒），0 表示不限
    #[serde(default)]
    pub command_timeout_ms: u32,
}

impl Default for SshTarget {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 22,
            credentials: Credentials::default(),
            host_key_policy: HostKeyPolicy::AcceptAny,
            timeout_ms: 10_000,
            command_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    /// stdout 与 stderr 合并后的输出
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

/// 单个 (task, host) 执行单元的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub task_name: String,
    pub host: String,
    pub success: bool,
    /// 成功时为命令输出，失败时为错误描述
    pub output: String,
}

/// 一次运行的汇总
#[derive(Debug, Clone, Serialize, Default)]
pub struct RunSummary {
    pub outcomes: Vec<ExecutionOutcome>,
    pub skipped: Vec<(String, String)>,
}

impl RunSummary {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }

    pub fn success_rate(&self) -> f32 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.success_count() as f32 / self.outcomes.len() as f32
    }
}

/// 加锁；持锁线程 panic 过也照样取出数据
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn outcome(host: &str, success: bool) -> ExecutionOutcome {
        ExecutionOutcome {
            task_name: "uptime".to_string(),
            host: host.to_string(),
            success,
            output: String::new(),
        }
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(RunSummary::default().success_rate(), 0.0);

        let summary = RunSummary {
            outcomes: vec![
                outcome("10.0.0.1", true),
                outcome("10.0.0.2", false),
                outcome("10.0.0.3", true),
                outcome("10.0.0.4", true),
            ],
            skipped: Vec::new(),
        };
        assert_eq!(summary.failure_count(), 1);
        assert_eq!(summary.success_rate(), 0.75);
    }

    #[test]
    fn test_lock_unpoisoned_keeps_data() {
        let outcomes = Arc::new(Mutex::new(vec![outcome("10.0.0.1", true)]));
        let poisoner = outcomes.clone();
        let joined = std::thread::spawn(move || {
            let mut guard = poisoner.lock().unwrap();
            guard.push(outcome("10.0.0.2", false));
            panic!("unit panicked while holding the lock");
        })
        .join();

        assert!(joined.is_err());
        assert!(outcomes.is_poisoned());
        let hosts: Vec<String> = lock_unpoisoned(&outcomes).iter().map(|o| o.host.clone()).collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_command_timeout_defaults_to_unlimited() {
        let yaml = "address: 10.0.0.1\nport: 22\ncredentials:\n  username: a\n  password: b\ntimeout_ms: 3000\n";
        let target: SshTarget = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(target.timeout_ms, 3000);
        assert_eq!(target.command_timeout_ms, 0);
    }
}
