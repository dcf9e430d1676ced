use crate::error::DeployError;
use crate::ssh::ADD_USER_COMMAND;
use crate::types::Credentials;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

pub const PORT_SETTING: &str = "port";

/// 端口既可能是数字，也可能是数字字符串（旧版 schema）
fn port_from_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }
    .filter(|p| *p != 0)
}

fn de_optional_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => port_from_value(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid port value: {:?}", v))),
    }
}

fn de_lossy_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "expected a string, found {:?}",
                other
            )));
        }
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "ssh_pass")]
    pub ssh_password: Option<String>,
    /// `add_user` 任务要创建的用户
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// 由执行器在分发时填写
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_optional_port"
    )]
    pub port: Option<u16>,
}

impl Task {
    pub fn command(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            ssh_user: None,
            ssh_password: None,
            username: None,
            password: None,
            group: None,
            host: String::new(),
            port: None,
        }
    }

    pub fn add_user(name: &str, username: &str, password: &str) -> Self {
        let mut task = Self::command(name, ADD_USER_COMMAND);
        task.username = Some(username.to_string());
        task.password = Some(password.to_string());
        task
    }

    pub fn with_ssh_credentials(mut self, username: &str, password: &str) -> Self {
        self.ssh_user = Some(username.to_string());
        self.ssh_password = Some(password.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// 任务自带的 SSH 凭据
    pub fn ssh_credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(self.ssh_user.as_deref(), self.ssh_password.as_deref())
    }

    pub fn is_add_user(&self) -> bool {
        self.command.trim() == ADD_USER_COMMAND
    }

    /// `add_user` 任务要创建的用户凭据
    pub fn new_user(&self) -> Credentials {
        Credentials::new(
            self.username.as_deref().unwrap_or_default(),
            self.password.as_deref().unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    pub name: String,
    #[serde(default, deserialize_with = "de_lossy_string")]
    pub version: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

impl Playbook {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: String::new(),
            hosts: Vec::new(),
            tasks: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    pub fn add_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn on_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.settings
            .insert(PORT_SETTING.to_string(), Value::Number(port.into()));
        self
    }

    /// settings 中的端口，数字和数字字符串都接受
    pub fn port(&self) -> Result<u16, DeployError> {
        self.settings
            .get(PORT_SETTING)
            .and_then(port_from_value)
            .ok_or_else(|| {
                DeployError::PlaybookError(format!(
                    "Port is not specified in the settings of playbook '{}'",
                    self.name
                ))
            })
    }

    /// 把旧版字符串端口改写成数字，返回是否有改动
    pub fn normalize(&mut self) -> bool {
        let Some(value) = self.settings.get(PORT_SETTING) else {
            return false;
        };
        if matches!(value, Value::String(_)) {
            if let Some(port) = port_from_value(value) {
                self.settings
                    .insert(PORT_SETTING.to_string(), Value::Number(port.into()));
                return true;
            }
        }
        false
    }

    /// 执行前的格式检查
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.tasks.is_empty() {
            return Err(DeployError::PlaybookError(format!(
                "No tasks found in playbook '{}'",
                self.name
            )));
        }
        if let Some(task) = self.tasks.iter().find(|t| t.command.trim().is_empty()) {
            return Err(DeployError::PlaybookError(format!(
                "Task '{}' has an empty command",
                task.name
            )));
        }
        self.port()?;
        Ok(())
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, DeployError> {
        serde_yaml::from_str(content)
            .map_err(|e| DeployError::FormatError(format!("Failed to parse playbook YAML: {}", e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DeployError> {
        let path = path.as_ref();
        info!("Loading playbook from file: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::PlaybookError(format!(
                "Failed to read playbook file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), DeployError> {
        let mut playbook = self.clone();
        playbook.normalize();
        let yaml_content = serde_yaml::to_string(&playbook)
            .map_err(|e| DeployError::PlaybookError(format!("Failed to serialize playbook: {}", e)))?;

        std::fs::write(path, yaml_content)
            .map_err(|e| DeployError::PlaybookError(format!("Failed to write playbook file: {}", e)))
    }
}

/// 列出目录中的 YAML playbook，可按关键字过滤
pub fn list_playbooks<P: AsRef<Path>>(dir: P, keyword: Option<&str>) -> Result<Vec<String>, DeployError> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        DeployError::PlaybookError(format!(
            "Failed to read playbooks directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut playbooks: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name.ends_with(".yaml") || name.ends_with(".yml"))
        .filter(|name| keyword.is_none_or(|k| name.contains(k)))
        .collect();
    playbooks.sort();

    debug!("Found {} playbooks in {}", playbooks.len(), dir.display());
    Ok(playbooks)
}
