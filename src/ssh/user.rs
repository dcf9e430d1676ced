use crate::error::DeployError;
use crate::types::Credentials;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

/// playbook 中表示"创建用户"的保留命令
pub const ADD_USER_COMMAND: &str = "add_user";

const DEFAULT_WINDOWS_GROUP: &str = "Users";

/// 目标主机的操作系统族
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    Linux,
}

impl OsFamily {
    /// 根据 inventory 中记录的 OS 标签推断族；未知标签按 Linux 处理
    pub fn from_label(label: &str) -> Self {
        if label.to_lowercase().contains("windows") {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `-EncodedCommand` 需要 UTF-16LE 编码后的 base64
fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

/// 构建创建用户的远程命令
///
/// Windows 走 PowerShell `New-LocalUser` + `Add-LocalGroupMember`，
/// Linux 走 `useradd` + `chpasswd`。
pub fn build_add_user_command(
    family: OsFamily,
    user: &Credentials,
    group: Option<&str>,
) -> Result<String, DeployError> {
    if !user.is_usable() {
        return Err(DeployError::CredentialsMissing(
            "add_user task requires both username and password".to_string(),
        ));
    }

    let command = match family {
        OsFamily::Windows => {
            let group = group.unwrap_or(DEFAULT_WINDOWS_GROUP);
            let script = format!(
                "$p = ConvertTo-SecureString {} -AsPlainText -Force; New-LocalUser -Name {} -Password $p; Add-LocalGroupMember -Group {} -Member {}",
                ps_quote(&user.password),
                ps_quote(&user.username),
                ps_quote(group),
                ps_quote(&user.username),
            );
            format!(
                "powershell.exe -NoProfile -NonInteractive -EncodedCommand {}",
                encode_powershell(&script)
            )
        }
        OsFamily::Linux => {
            let mut cmd = format!(
                "useradd -m {} && echo {} | chpasswd",
                sh_quote(&user.username),
                sh_quote(&format!("{}:{}", user.username, user.password)),
            );
            if let Some(group) = group {
                cmd.push_str(&format!(
                    " && usermod -aG {} {}",
                    sh_quote(group),
                    sh_quote(&user.username)
                ));
            }
            cmd
        }
    };

    debug!("Built add_user command for '{}' ({:?})", user.username, family);
    Ok(command)
}
