// 主机发现：地址展开、存活探测、指纹识别、合并进 inventory
mod range;

pub use range::{parse_range, MAX_RANGE_SIZE};

use crate::error::DeployError;
use crate::fingerprint::OsFingerprinter;
use crate::inventory::{Host, InventoryStore};
use crate::telemetry::EventSink;
use crate::types::{lock_unpoisoned, Credentials};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 存活探测默认尝试的端口
pub const LIVENESS_PORTS: [u16; 7] = [22, 80, 443, 445, 139, 135, 3389];

/// 针对单个地址的探测能力
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn is_alive(&self, address: &str) -> bool;

    /// 反向解析主机名，失败时返回空字符串
    async fn lookup_hostname(&self, address: &str) -> String;

    /// 识别操作系统，无法识别时返回 "Unknown"
    async fn detect_os(&self, address: &str, credentials: Option<&Credentials>) -> String;
}

/// 基于 TCP 连接、反向 DNS 和 SSH 的真实网络探测
pub struct NetworkProbe {
    fingerprinter: OsFingerprinter,
    liveness_ports: Vec<u16>,
    probe_timeout: Duration,
}

impl NetworkProbe {
    pub fn new(fingerprinter: OsFingerprinter) -> Self {
        let probe_timeout = fingerprinter.settings().probe_timeout;
        Self {
            fingerprinter,
            liveness_ports: LIVENESS_PORTS.to_vec(),
            probe_timeout,
        }
    }

    pub fn with_liveness_ports(mut self, ports: Vec<u16>) -> Self {
        self.liveness_ports = ports;
        self
    }
}

#[async_trait]
impl HostProbe for NetworkProbe {
    /// 任一端口连接成功或被主动拒绝（RST）都说明主机在线
    async fn is_alive(&self, address: &str) -> bool {
        let handles: Vec<_> = self
            .liveness_ports
            .iter()
            .map(|&port| {
                let target = format!("{}:{}", address, port);
                let probe_timeout = self.probe_timeout;
                tokio::spawn(async move {
                    match timeout(probe_timeout, TcpStream::connect(&target)).await {
                        Ok(Ok(_)) => true,
                        Ok(Err(e)) => e.kind() == ErrorKind::ConnectionRefused,
                        Err(_) => false,
                    }
                })
            })
            .collect();

        let mut alive = false;
        for handle in handles {
            alive |= handle.await.unwrap_or(false);
        }
        debug!("Liveness check for {}: {}", address, alive);
        alive
    }

    async fn lookup_hostname(&self, address: &str) -> String {
        let Ok(ip) = address.parse::<IpAddr>() else {
            debug!("Hostname lookup skipped, {} is not an IP address", address);
            return String::new();
        };

        // getnameinfo 是阻塞调用
        let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
        match timeout(self.probe_timeout, lookup).await {
            Ok(Ok(Ok(name))) => name.trim_end_matches('.').to_string(),
            Ok(Ok(Err(e))) => {
                debug!("Reverse lookup for {} failed: {}", address, e);
                String::new()
            }
            Ok(Err(e)) => {
                warn!("Reverse lookup task for {} failed: {}", address, e);
                String::new()
            }
            Err(_) => {
                debug!("Reverse lookup for {} timed out", address);
                String::new()
            }
        }
    }

    async fn detect_os(&self, address: &str, credentials: Option<&Credentials>) -> String {
        let detection = self.fingerprinter.detect_with_retry(address, credentials).await;
        if let Some(e) = &detection.error {
            debug!("{} recorded as {}: {}", address, detection.os, e);
        }
        detection.os
    }
}

/// 一次发现批次的结果
#[derive(Debug, Clone, Serialize, Default)]
pub struct DiscoveryReport {
    pub candidates: usize,
    pub already_known: Vec<String>,
    pub alive: Vec<Host>,
    pub added: Vec<String>,
}

pub struct HostDiscoverer {
    store: Arc<InventoryStore>,
    probe: Arc<dyn HostProbe>,
    events: Arc<dyn EventSink>,
    max_concurrency: usize,
}

impl HostDiscoverer {
    pub fn new(store: Arc<InventoryStore>, probe: Arc<dyn HostProbe>, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            probe,
            events,
            max_concurrency: 16,
        }
    }

    /// 设置最大并发探测数
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// 展开地址范围、并发探测，并把新主机合并进 inventory
    pub async fn discover(&self, range: &str) -> Result<DiscoveryReport, DeployError> {
        let candidates = parse_range(range)?;

        let inventory = self.store.load()?;
        let known: HashSet<String> = inventory.addresses().into_iter().collect();
        let fallback = inventory.fallback_credentials();

        let (already_known, to_probe): (Vec<String>, Vec<String>) =
            candidates.iter().cloned().partition(|a| known.contains(a));

        info!(
            "Discovering {} addresses ({} already known) with max {} concurrent probes",
            candidates.len(),
            already_known.len(),
            self.max_concurrency
        );
        self.events.info(
            "Discovery",
            "Discovery started",
            json!({ "range": range, "candidates": candidates.len(), "known": already_known.len() }),
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let found: Arc<Mutex<Vec<Host>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for address in to_probe {
            let semaphore = semaphore.clone();
            let probe = self.probe.clone();
            let events = self.events.clone();
            let found = found.clone();
            let credentials = fallback.clone();

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };

                if !probe.is_alive(&address).await {
                    debug!("{} did not respond", address);
                    return;
                }

                events.info("Discovery", "Host alive", json!({ "address": address }));
                let hostname = probe.lookup_hostname(&address).await;
                let os = probe.detect_os(&address, credentials.as_ref()).await;

                let host = Host::new(&address).with_hostname(&hostname).with_os(&os);
                lock_unpoisoned(&found).push(host);
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Discovery probe task failed: {}", e);
            }
        }

        let mut alive = std::mem::take(&mut *lock_unpoisoned(&found));
        alive.sort_by_key(|h| h.address.parse::<std::net::Ipv4Addr>().ok());

        let added = self.store.merge_hosts(alive.clone())?;

        self.events.info(
            "Discovery",
            "Discovery finished",
            json!({ "alive": alive.len(), "added": added.clone() }),
        );

        Ok(DiscoveryReport {
            candidates: candidates.len(),
            already_known,
            alive,
            added,
        })
    }
}
