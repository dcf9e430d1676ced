use crate::error::DeployError;
use crate::inventory::UNKNOWN_OS;
use crate::telemetry::EventSink;
use crate::transport::{close_session, RemoteSession, Transport};
use crate::types::{Credentials, HostKeyPolicy, SshTarget};
use regex::Regex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const SSH_PORT: u16 = 22;
const WINDOWS_PORTS: [u16; 3] = [445, 139, 135];
const BANNER_SIZE: usize = 256;

static OS_RELEASE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(NAME|VERSION_ID)\s*=\s*"?([^"]*)"?\s*$"#).expect("valid os-release regex")
});

/// 指纹识别的可调参数
#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// TCP 探测阶段读取 SSH banner 的端口，`None` 时跳过
    pub banner_port: Option<u16>,
    /// 任一开放即判定为 Windows 的端口
    pub windows_ports: Vec<u16>,
    pub probe_timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    /// 单台主机整个识别过程的上限
    pub overall_timeout: Duration,
    pub ssh_port: u16,
    pub ssh_timeout_ms: u32,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            banner_port: Some(SSH_PORT),
            windows_ports: WINDOWS_PORTS.to_vec(),
            probe_timeout: Duration::from_secs(2),
            retries: 3,
            retry_delay: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(5),
            ssh_port: SSH_PORT,
            ssh_timeout_ms: 5_000,
            host_key_policy: HostKeyPolicy::AcceptAny,
        }
    }
}

impl DetectionSettings {
    pub fn from_config(config: &crate::config::EngineConfig) -> Self {
        Self {
            probe_timeout: config.probe_timeout(),
            retries: config.detection_retries,
            retry_delay: config.detection_retry_delay(),
            overall_timeout: config.detection_timeout(),
            ssh_timeout_ms: config.ssh_timeout_ms,
            host_key_policy: config.host_key_policy.clone(),
            ..Self::default()
        }
    }
}

/// 一次识别的结果：无法识别时 `os` 为 "Unknown"，`error` 说明原因
#[derive(Debug)]
pub struct Detection {
    pub os: String,
    pub error: Option<DeployError>,
}

impl Detection {
    fn found(os: String) -> Self {
        Self { os, error: None }
    }

    fn unknown(error: DeployError) -> Self {
        Self {
            os: UNKNOWN_OS.to_string(),
            error: Some(error),
        }
    }

    pub fn is_known(&self) -> bool {
        self.error.is_none()
    }
}

/// 远程命令阶段的一种识别方法
pub struct DetectionMethod {
    pub name: &'static str,
    pub command: &'static str,
    pub parse: fn(&str) -> Option<String>,
}

/// 远程命令识别链，按顺序尝试
pub const DETECTION_METHODS: [DetectionMethod; 6] = [
    DetectionMethod {
        name: "powershell",
        command: "powershell.exe -Command \"(Get-CimInstance Win32_OperatingSystem).Caption\"",
        parse: parse_windows_caption,
    },
    DetectionMethod {
        name: "os-release",
        command: "cat /etc/os-release",
        parse: parse_os_release,
    },
    DetectionMethod {
        name: "lsb_release",
        command: "lsb_release -a 2>/dev/null || cat /etc/lsb-release",
        parse: parse_lsb_release,
    },
    DetectionMethod {
        name: "redhat-release",
        command: "cat /etc/redhat-release",
        parse: parse_redhat_release,
    },
    DetectionMethod {
        name: "hostnamectl",
        command: "hostnamectl",
        parse: parse_hostnamectl,
    },
    DetectionMethod {
        name: "uname",
        command: "uname -a",
        parse: parse_uname,
    },
];

pub fn parse_windows_caption(output: &str) -> Option<String> {
    let caption = output.trim();
    if !caption.to_lowercase().contains("windows") {
        return None;
    }
    Some(caption.strip_prefix("Microsoft ").unwrap_or(caption).to_string())
}

pub fn parse_os_release(output: &str) -> Option<String> {
    let mut name = None;
    let mut version = None;

    for line in output.lines() {
        if let Some(caps) = OS_RELEASE_FIELD.captures(line) {
            let value = caps[2].trim().to_string();
            match &caps[1] {
                "NAME" => name = Some(value),
                _ => version = Some(value),
            }
        }
    }

    match (name.filter(|n| !n.is_empty()), version.filter(|v| !v.is_empty())) {
        (Some(name), Some(version)) => Some(format!("Linux - {} {}", name, version)),
        (Some(name), None) => Some(format!("Linux - {}", name)),
        _ => None,
    }
}

pub fn parse_lsb_release(output: &str) -> Option<String> {
    let mut id = None;
    let mut release = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(['=', ':']) else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "DISTRIB_ID" | "Distributor ID" => id = Some(value),
            "DISTRIB_RELEASE" | "Release" => release = Some(value),
            _ => {}
        }
    }

    match (id.filter(|i| !i.is_empty()), release.filter(|r| !r.is_empty())) {
        (Some(id), Some(release)) => Some(format!("Linux - {} {}", id, release)),
        (Some(id), None) => Some(format!("Linux - {}", id)),
        _ => None,
    }
}

pub fn parse_redhat_release(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| format!("Linux - {}", l))
}

pub fn parse_hostnamectl(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, value) = line.split_once("Operating System:")?;
        let value = value.trim();
        (!value.is_empty()).then(|| format!("Linux - {}", value))
    })
}

/// 最后手段：只做关键字匹配，其余一律视为通用 Linux
pub fn parse_uname(output: &str) -> Option<String> {
    const DISTROS: [(&str, &str); 4] = [
        ("ubuntu", "Linux - Ubuntu"),
        ("fedora", "Linux - Fedora"),
        ("centos", "Linux - CentOS"),
        ("debian", "Linux - Debian"),
    ];

    let output = output.trim().to_lowercase();
    if output.is_empty() {
        return None;
    }

    let label = DISTROS
        .iter()
        .find(|(keyword, _)| output.contains(keyword))
        .map(|(_, label)| *label)
        .unwrap_or("Linux - Generic");
    Some(label.to_string())
}

/// 根据 SSH banner 判断操作系统
pub fn classify_banner(banner: &str) -> Option<String> {
    let banner = banner.to_lowercase();
    if banner.contains("ubuntu") {
        Some("Linux - Ubuntu".to_string())
    } else if banner.contains("fedora") {
        Some("Linux - Fedora".to_string())
    } else if banner.contains("openssh") && banner.contains("windows") {
        Some("Windows".to_string())
    } else {
        None
    }
}

async fn connect_port(address: &str, port: u16, probe_timeout: Duration) -> Option<TcpStream> {
    let target = format!("{}:{}", address, port);
    match timeout(probe_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            debug!("TCP probe {} failed: {}", target, e);
            None
        }
        Err(_) => {
            debug!("TCP probe {} timed out", target);
            None
        }
    }
}

async fn read_banner(mut stream: TcpStream, read_timeout: Duration) -> String {
    let mut buf = [0u8; BANNER_SIZE];
    match timeout(read_timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) => String::from_utf8_lossy(&buf[..n]).into_owned(),
        _ => String::new(),
    }
}

/// TCP 探测阶段：各端口并发连接，再按端口角色判定
///
/// 先看 banner 端口的 SSH banner，再看 Windows 端口，任一开放即判定为 Windows。
pub async fn tcp_probe(
    address: &str,
    banner_port: Option<u16>,
    windows_ports: &[u16],
    probe_timeout: Duration,
) -> Option<String> {
    let banner = banner_port.map(|port| {
        let address = address.to_string();
        tokio::spawn(async move {
            let stream = connect_port(&address, port, probe_timeout).await?;
            Some(read_banner(stream, probe_timeout).await)
        })
    });

    let windows: Vec<_> = windows_ports
        .iter()
        .map(|&port| {
            let address = address.to_string();
            tokio::spawn(async move { connect_port(&address, port, probe_timeout).await.is_some() })
        })
        .collect();

    if let Some(handle) = banner {
        if let Some(label) = handle.await.ok().flatten().and_then(|b| classify_banner(&b)) {
            return Some(label);
        }
    }

    let mut windows_open = false;
    for handle in windows {
        windows_open |= handle.await.unwrap_or(false);
    }
    windows_open.then(|| "Windows".to_string())
}

/// 在已建立的会话上依次执行识别链，返回第一个解析成功的结果
pub fn detect_via_session(
    session: &mut dyn RemoteSession,
    cancelled: &AtomicBool,
) -> Option<(&'static str, String)> {
    for method in DETECTION_METHODS.iter() {
        if cancelled.load(Ordering::Relaxed) {
            debug!("Detection cancelled before method '{}'", method.name);
            return None;
        }

        match session.run(method.command) {
            Ok(output) => {
                if let Some(os) = (method.parse)(&output) {
                    return Some((method.name, os));
                }
                debug!("Detection method '{}' gave no usable result", method.name);
            }
            Err(e) => debug!("Detection method '{}' failed: {}", method.name, e),
        }
    }
    None
}

/// 被丢弃时置位取消标记，让阻塞线程中的识别尽快退出
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// 操作系统指纹识别
pub struct OsFingerprinter {
    transport: Arc<dyn Transport>,
    settings: DetectionSettings,
    events: Arc<dyn EventSink>,
}

impl OsFingerprinter {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: DetectionSettings,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            transport,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    async fn probe_tcp(&self, address: &str) -> Option<String> {
        let os = tcp_probe(
            address,
            self.settings.banner_port,
            &self.settings.windows_ports,
            self.settings.probe_timeout,
        )
        .await?;
        info!("TCP probe identified {} as {}", address, os);
        Some(os)
    }

    /// 完整识别一次：先 TCP 探测，再走远程命令链
    ///
    /// 无法识别时结果为 "Unknown"，并带上失败原因。
    pub async fn detect(&self, address: &str, credentials: Option<&Credentials>) -> Detection {
        if let Some(os) = self.probe_tcp(address).await {
            return Detection::found(os);
        }
        match self.detect_remote(address, credentials).await {
            Ok(os) => Detection::found(os),
            Err(e) => Detection::unknown(e),
        }
    }

    /// 远程命令阶段，在 blocking 线程中执行
    pub async fn detect_remote(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String, DeployError> {
        let credentials = credentials.filter(|c| c.is_usable()).cloned().ok_or_else(|| {
            DeployError::DetectionError(format!(
                "TCP probe inconclusive for {} and no credentials for remote detection",
                address
            ))
        })?;

        let target = SshTarget {
            address: address.to_string(),
            port: self.settings.ssh_port,
            credentials,
            host_key_policy: self.settings.host_key_policy.clone(),
            timeout_ms: self.settings.ssh_timeout_ms,
            command_timeout_ms: self.settings.ssh_timeout_ms,
        };

        self.events.debug(
            "OSDetect",
            "Remote detection attempt",
            json!({ "address": address, "port": target.port }),
        );

        let cancelled = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(cancelled.clone());
        let transport = self.transport.clone();

        let result = tokio::task::spawn_blocking(move || {
            if cancelled.load(Ordering::Relaxed) {
                return Err(DeployError::TimeoutError(format!(
                    "detection for {} cancelled",
                    target.address
                )));
            }
            let mut session = transport.connect(&target)?;
            let detected = detect_via_session(session.as_mut(), &cancelled);
            close_session(Some(session));
            detected.ok_or_else(|| {
                DeployError::DetectionError(format!(
                    "unable to determine OS for host {}",
                    target.address
                ))
            })
        })
        .await
        .map_err(|e| DeployError::DetectionError(format!("detection task aborted: {}", e)))?;

        let (method, os) = result?;
        info!("Detected {} as {} via {}", address, os, method);
        Ok(os)
    }

    /// 发现批次中使用：重试 + 总超时，任何失败都落到 "Unknown"
    ///
    /// 超时后整个 future 被丢弃，正在进行的远程识别通过取消标记终止。
    pub async fn detect_with_retry(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> Detection {
        let attempts = async {
            if let Some(os) = self.probe_tcp(address).await {
                return Ok(os);
            }

            let credentials = credentials.ok_or_else(|| {
                DeployError::DetectionError(format!(
                    "TCP probe inconclusive for {} and no credentials for remote detection",
                    address
                ))
            })?;

            let mut last_error = None;
            for attempt in 1..=self.settings.retries {
                if attempt > 1 {
                    sleep(self.settings.retry_delay).await;
                }
                match self.detect_remote(address, Some(credentials)).await {
                    Ok(os) => return Ok(os),
                    Err(e) => {
                        warn!(
                            "OS detection attempt {}/{} for {} failed: {}",
                            attempt, self.settings.retries, address, e
                        );
                        last_error = Some(e);
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| {
                DeployError::DetectionError(format!("all detection methods failed for {}", address))
            }))
        };

        match timeout(self.settings.overall_timeout, attempts).await {
            Ok(Ok(os)) => {
                self.events.info(
                    "OSDetect",
                    "OS detected",
                    json!({ "address": address, "os": os }),
                );
                Detection::found(os)
            }
            Ok(Err(e)) => {
                self.events.warning(
                    "OSDetect",
                    "OS detection failed",
                    json!({ "address": address, "error": e.to_string() }),
                );
                Detection::unknown(e)
            }
            Err(_) => {
                let timeout_ms = self.settings.overall_timeout.as_millis() as u64;
                self.events.warning(
                    "OSDetect",
                    "OS detection timed out",
                    json!({ "address": address, "timeout_ms": timeout_ms }),
                );
                Detection::unknown(DeployError::TimeoutError(format!(
                    "OS detection for {} exceeded {}ms",
                    address, timeout_ms
                )))
            }
        }
    }
}
