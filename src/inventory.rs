use crate::error::DeployError;
use crate::telemetry::EventSink;
use crate::types::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const UNKNOWN_OS: &str = "Unknown";

fn default_os() -> String {
    UNKNOWN_OS.to_string()
}

/// inventory 中的一台主机，以 address 为唯一键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "ssh_password")]
    pub ssh_pass: Option<String>,
}

impl Host {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            hostname: String::new(),
            os: default_os(),
            ssh_user: None,
            ssh_pass: None,
        }
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub fn with_os(mut self, os: &str) -> Self {
        self.os = os.to_string();
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.ssh_user = Some(username.to_string());
        self.ssh_pass = Some(password.to_string());
        self
    }

    /// 主机级凭据（两项都非空时才返回）
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(self.ssh_user.as_deref(), self.ssh_pass.as_deref())
    }

    /// 按地址或主机名精确匹配
    pub fn matches(&self, key: &str) -> bool {
        self.address == key || (!self.hostname.is_empty() && self.hostname == key)
    }
}

/// 已登记的用户，供 playbook 渲染时作为凭据块使用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub group: String,
}

impl RegisteredUser {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Inventory {
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default, alias = "ssh_password")]
    pub ssh_pass: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<RegisteredUser>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// inventory 级别的兜底凭据
    pub fn fallback_credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(Some(&self.ssh_user), Some(&self.ssh_pass))
    }

    pub fn set_fallback_credentials(&mut self, credentials: &Credentials) {
        self.ssh_user = credentials.username.clone();
        self.ssh_pass = credentials.password.clone();
    }

    /// 按地址或主机名查找主机（地址优先）
    pub fn find_host(&self, key: &str) -> Option<&Host> {
        self.hosts
            .iter()
            .find(|h| h.address == key)
            .or_else(|| self.hosts.iter().find(|h| h.matches(key)))
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.hosts.iter().any(|h| h.address == address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.address.clone()).collect()
    }

    pub fn add_host(&mut self, host: Host) -> Result<(), DeployError> {
        if host.address.trim().is_empty() {
            return Err(DeployError::InventoryError("Host address cannot be empty".to_string()));
        }
        if self.contains_address(&host.address) {
            return Err(DeployError::InventoryError(format!(
                "Duplicate host entry: {}",
                host.address
            )));
        }
        self.hosts.push(host);
        Ok(())
    }

    /// 用新记录替换 address 对应的主机；新地址不能与其他主机冲突
    pub fn update_host(&mut self, address: &str, host: Host) -> Result<(), DeployError> {
        let index = self
            .hosts
            .iter()
            .position(|h| h.address == address)
            .ok_or_else(|| DeployError::InventoryError(format!("Host {} not found", address)))?;

        if host.address != address && self.contains_address(&host.address) {
            return Err(DeployError::InventoryError(format!(
                "Duplicate host entry: {}",
                host.address
            )));
        }

        self.hosts[index] = host;
        Ok(())
    }

    pub fn delete_host(&mut self, address: &str) -> Result<Host, DeployError> {
        let index = self
            .hosts
            .iter()
            .position(|h| h.address == address)
            .ok_or_else(|| DeployError::InventoryError(format!("Host {} not found", address)))?;
        Ok(self.hosts.remove(index))
    }

    /// 合并新发现的主机，跳过已存在的地址；返回实际加入的地址
    pub fn merge_hosts(&mut self, hosts: Vec<Host>) -> Vec<String> {
        let mut known: HashSet<String> = self.hosts.iter().map(|h| h.address.clone()).collect();
        let mut added = Vec::new();

        for host in hosts {
            if known.insert(host.address.clone()) {
                added.push(host.address.clone());
                self.hosts.push(host);
            } else {
                debug!("Skipping already known host {}", host.address);
            }
        }

        added
    }

    /// 校验：地址非空且不重复
    pub fn validate(&self) -> Result<(), DeployError> {
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.address.trim().is_empty() {
                return Err(DeployError::InventoryError(format!(
                    "Host configuration incomplete: {:?}",
                    host
                )));
            }
            if !seen.insert(host.address.as_str()) {
                return Err(DeployError::InventoryError(format!(
                    "Duplicate host entry: {}",
                    host.address
                )));
            }
        }
        Ok(())
    }

    /// 检查 playbook 中的主机是否都在 inventory 中
    pub fn match_hosts(&self, playbook_hosts: &[String]) -> Result<Vec<&Host>, DeployError> {
        playbook_hosts
            .iter()
            .map(|key| {
                self.find_host(key).ok_or_else(|| {
                    DeployError::InventoryError(format!("Host {} not found in inventory", key))
                })
            })
            .collect()
    }

    pub fn users(&self) -> &[RegisteredUser] {
        &self.users
    }

    pub fn register_user(&mut self, user: RegisteredUser) {
        if let Some(existing) = self.users.iter_mut().find(|u| u.username == user.username) {
            *existing = user;
        } else {
            self.users.push(user);
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, DeployError> {
        let inventory: Inventory = serde_yaml::from_str(content)
            .map_err(|e| DeployError::FormatError(format!("Failed to parse inventory YAML: {}", e)))?;
        inventory.validate()?;
        Ok(inventory)
    }

    pub fn to_yaml_string(&self) -> Result<String, DeployError> {
        serde_yaml::to_string(self)
            .map_err(|e| DeployError::InventoryError(format!("Failed to serialize inventory: {}", e)))
    }
}

/// 持久化的 inventory 文件
///
/// 每个操作都重新读取文件，修改后整体写回；进程间没有锁。
pub struct InventoryStore {
    path: PathBuf,
    events: Arc<dyn EventSink>,
}

impl InventoryStore {
    pub fn new<P: AsRef<Path>>(path: P, events: Arc<dyn EventSink>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            events,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取 inventory；文件不存在时返回空 inventory
    pub fn load(&self) -> Result<Inventory, DeployError> {
        if !self.path.exists() {
            warn!("Inventory file {} not found, starting empty", self.path.display());
            return Ok(Inventory::new());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            DeployError::InventoryError(format!(
                "Failed to read inventory file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let inventory = Inventory::from_yaml_str(&content)?;
        debug!(
            "Loaded {} hosts from {}",
            inventory.hosts.len(),
            self.path.display()
        );
        Ok(inventory)
    }

    /// 写入临时文件后 rename，避免写到一半的文件被读到
    pub fn save(&self, inventory: &Inventory) -> Result<(), DeployError> {
        inventory.validate()?;
        let content = inventory.to_yaml_string()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DeployError::InventoryError(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let temp_path = self.path.with_extension(format!(
            "tmp.{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::write(&temp_path, content)
            .and_then(|_| std::fs::rename(&temp_path, &self.path))
            .map_err(|e| {
                let _ = std::fs::remove_file(&temp_path);
                DeployError::InventoryError(format!(
                    "Failed to write inventory file {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        self.events.info(
            "Inventory",
            "Inventory saved",
            json!({ "path": self.path.display().to_string(), "hosts": inventory.hosts.len() }),
        );
        Ok(())
    }

    pub fn add_host(&self, host: Host) -> Result<(), DeployError> {
        let mut inventory = self.load()?;
        let address = host.address.clone();
        inventory.add_host(host)?;
        self.save(&inventory)?;
        self.events.info("Inventory", "Host added", json!({ "address": address }));
        Ok(())
    }

    pub fn update_host(&self, address: &str, host: Host) -> Result<(), DeployError> {
        let mut inventory = self.load()?;
        let new_address = host.address.clone();
        inventory.update_host(address, host)?;
        self.save(&inventory)?;
        self.events.info(
            "Inventory",
            "Host updated",
            json!({ "address": address, "new_address": new_address }),
        );
        Ok(())
    }

    pub fn delete_host(&self, address: &str) -> Result<Host, DeployError> {
        let mut inventory = self.load()?;
        let removed = inventory.delete_host(address)?;
        self.save(&inventory)?;
        self.events.info("Inventory", "Host deleted", json!({ "address": address }));
        Ok(removed)
    }

    /// 合并一批主机并只保存一次
    pub fn merge_hosts(&self, hosts: Vec<Host>) -> Result<Vec<String>, DeployError> {
        let mut inventory = self.load()?;
        let added = inventory.merge_hosts(hosts);
        if !added.is_empty() {
            self.save(&inventory)?;
        }
        self.events.info(
            "Inventory",
            "Hosts merged",
            json!({ "added": added.clone(), "total": inventory.hosts.len() }),
        );
        Ok(added)
    }

    pub fn find_host(&self, key: &str) -> Result<Option<Host>, DeployError> {
        Ok(self.load()?.find_host(key).cloned())
    }

    pub fn set_fallback_credentials(&self, credentials: &Credentials) -> Result<(), DeployError> {
        let mut inventory = self.load()?;
        inventory.set_fallback_credentials(credentials);
        self.save(&inventory)?;
        self.events.info(
            "Inventory",
            "Fallback credentials updated",
            json!({ "username": credentials.username }),
        );
        Ok(())
    }
}
