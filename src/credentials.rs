use crate::error::DeployError;
use crate::types::Credentials;

/// 环境变量：本次运行的 SSH 用户名覆盖
pub const SSH_USER_ENV: &str = "EAGLE_SSH_USER";
/// 环境变量：本次运行的 SSH 密码覆盖
pub const SSH_PASSWORD_ENV: &str = "EAGLE_SSH_PASSWORD";

/// 参与凭据解析的各个来源
#[derive(Debug, Clone, Default)]
pub struct CredentialSources {
    pub env_override: Option<Credentials>,
    pub task: Option<Credentials>,
    pub host: Option<Credentials>,
    pub inventory: Option<Credentials>,
}

/// 凭据来自哪一层
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Environment,
    Task,
    Host,
    Inventory,
}

impl CredentialSources {
    /// 是否存在任何一层可用的凭据
    pub fn any(&self) -> bool {
        self.layers()
            .iter()
            .any(|(_, c)| c.is_some_and(|c| c.is_usable()))
    }

    fn layers(&self) -> [(CredentialSource, Option<&Credentials>); 4] {
        [
            (CredentialSource::Environment, self.env_override.as_ref()),
            (CredentialSource::Task, self.task.as_ref()),
            (CredentialSource::Host, self.host.as_ref()),
            (CredentialSource::Inventory, self.inventory.as_ref()),
        ]
    }
}

/// 按优先级解析凭据：环境变量覆盖 > task > host > inventory 兜底
///
/// 用户名或密码为空的一层视为缺失，继续向下查找。
pub fn resolve_credentials(
    sources: &CredentialSources,
) -> Result<(Credentials, CredentialSource), DeployError> {
    sources
        .layers()
        .into_iter()
        .find_map(|(source, creds)| {
            creds
                .filter(|c| c.is_usable())
                .map(|c| (c.clone(), source))
        })
        .ok_or_else(|| {
            DeployError::CredentialsMissing(
                "no SSH username/password from environment, task, host or inventory".to_string(),
            )
        })
}

/// 读取环境变量覆盖，两个变量都非空时才生效
pub fn env_override() -> Option<Credentials> {
    let username = std::env::var(SSH_USER_ENV).ok();
    let password = std::env::var(SSH_PASSWORD_ENV).ok();
    Credentials::from_parts(username.as_deref(), password.as_deref())
}
