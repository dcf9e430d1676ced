use crate::config::EngineConfig;
use crate::credentials::{resolve_credentials, CredentialSources};
use crate::error::DeployError;
use crate::inventory::{Host, InventoryStore};
use crate::playbook::{Playbook, Task};
use crate::ssh::{build_add_user_command, OsFamily};
use crate::telemetry::EventSink;
use crate::transport::{run_remote, Transport};
use crate::types::{
    lock_unpoisoned, Credentials, ExecutionOutcome, HostKeyPolicy, RunSummary, SshTarget,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const LOOPBACK_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// 单个 (task, host) 执行单元
#[derive(Debug, Clone)]
enum Dispatch {
    Remote(SshTarget),
    Local,
}

/// 任务执行器：按 (task, host) 并发分发，统一收集结果
pub struct TaskExecutor {
    store: Arc<InventoryStore>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventSink>,
    env_override: Option<Credentials>,
    max_concurrency: usize,
    host_key_policy: HostKeyPolicy,
    ssh_timeout_ms: u32,
    command_timeout_ms: u32,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<InventoryStore>,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            env_override: None,
            max_concurrency: 16,
            host_key_policy: HostKeyPolicy::AcceptAny,
            ssh_timeout_ms: 10_000,
            command_timeout_ms: 0,
        }
    }

    /// 按引擎配置设置并发数与 SSH 参数
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.max_concurrency = config.max_concurrency.max(1);
        self.host_key_policy = config.host_key_policy.clone();
        self.ssh_timeout_ms = config.ssh_timeout_ms;
        self.command_timeout_ms = config.command_timeout_ms;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// 本次运行的最高优先级凭据
    pub fn with_env_override(mut self, credentials: Option<Credentials>) -> Self {
        self.env_override = credentials.filter(|c| c.is_usable());
        self
    }

    /// 运行 playbook；`target_hosts` 非空时替换 playbook 自带的主机列表
    pub async fn run_playbook(
        &self,
        playbook: &Playbook,
        target_hosts: Option<&[String]>,
    ) -> Result<RunSummary, DeployError> {
        playbook.validate()?;
        let port = playbook.port()?;
        let hosts = match target_hosts {
            Some(hosts) if !hosts.is_empty() => hosts.to_vec(),
            _ => playbook.hosts.clone(),
        };

        info!("Running playbook '{}' on {} hosts", playbook.name, hosts.len());
        self.execute(&playbook.tasks, &hosts, port).await
    }

    /// 在给定主机上执行所有任务
    ///
    /// inventory 加载失败直接返回错误；单个主机的失败只记录在结果里。
    pub async fn execute(
        &self,
        tasks: &[Task],
        hosts: &[String],
        port: u16,
    ) -> Result<RunSummary, DeployError> {
        let inventory = self.store.load()?;

        let mut lookup: HashMap<&str, &Host> = HashMap::new();
        for host in &inventory.hosts {
            lookup.insert(host.address.as_str(), host);
            if !host.hostname.is_empty() {
                lookup.entry(host.hostname.as_str()).or_insert(host);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let outcomes: Arc<Mutex<Vec<ExecutionOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let mut skipped = Vec::new();
        let mut handles = Vec::new();

        info!(
            "Dispatching {} tasks to {} hosts with max {} concurrent units",
            tasks.len(),
            hosts.len(),
            self.max_concurrency
        );

        for task in tasks {
            for key in hosts {
                let Some(host) = lookup.get(key.as_str()).copied() else {
                    warn!("Host {} not found in inventory, skipping task '{}'", key, task.name);
                    self.events.warning(
                        "Executor",
                        "Host not in inventory",
                        json!({ "task": task.name, "host": key }),
                    );
                    skipped.push((task.name.clone(), key.clone()));
                    continue;
                };

                let mut task = task.clone();
                task.host = host.address.clone();
                let host = host.clone();

                let dispatch = match self.plan(&task, &host, port, inventory.fallback_credentials()) {
                    Ok(dispatch) => dispatch,
                    Err(e) => {
                        self.record_failure(&outcomes, &task, &e);
                        continue;
                    }
                };

                let semaphore = semaphore.clone();
                let transport = self.transport.clone();
                let events = self.events.clone();
                let outcomes = outcomes.clone();

                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };

                    events.info(
                        "Executor",
                        "Dispatch started",
                        json!({ "task": task.name, "host": task.host }),
                    );

                    let unit_task = task.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        run_unit(transport.as_ref(), &unit_task, &host, &dispatch)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        Err(DeployError::CommandExecutionError(format!("unit aborted: {}", e)))
                    });

                    let connectivity = result.as_ref().is_err_and(DeployError::is_connectivity);
                    let outcome = match result {
                        Ok(output) => {
                            info!("Task '{}' succeeded on {}", task.name, task.host);
                            ExecutionOutcome {
                                task_name: task.name.clone(),
                                host: task.host.clone(),
                                success: true,
                                output,
                            }
                        }
                        Err(e) => {
                            error!("Task '{}' failed on {}: {}", task.name, task.host, e);
                            ExecutionOutcome {
                                task_name: task.name.clone(),
                                host: task.host.clone(),
                                success: false,
                                output: e.to_string(),
                            }
                        }
                    };

                    events.info(
                        "Executor",
                        "Dispatch finished",
                        json!({
                            "task": task.name,
                            "host": task.host,
                            "success": outcome.success,
                            "connectivity": connectivity
                        }),
                    );
                    lock_unpoisoned(&outcomes).push(outcome);
                }));
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Dispatch unit panicked: {}", e);
            }
        }

        let outcomes = std::mem::take(&mut *lock_unpoisoned(&outcomes));
        let summary = RunSummary { outcomes, skipped };

        info!(
            "Execution completed: {} succeeded, {} failed, {} skipped",
            summary.success_count(),
            summary.failure_count(),
            summary.skipped.len()
        );
        self.events.info(
            "Executor",
            "Run finished",
            json!({
                "succeeded": summary.success_count(),
                "failed": summary.failure_count(),
                "skipped": summary.skipped.len()
            }),
        );
        Ok(summary)
    }

    /// 决定远程还是本地执行
    ///
    /// 任何一层凭据可用就走 SSH；都没有时只有回环主机可以本地执行。
    fn plan(
        &self,
        task: &Task,
        host: &Host,
        port: u16,
        fallback: Option<Credentials>,
    ) -> Result<Dispatch, DeployError> {
        let sources = CredentialSources {
            env_override: self.env_override.clone(),
            task: task.ssh_credentials(),
            host: host.credentials(),
            inventory: fallback,
        };

        if !sources.any() && LOOPBACK_HOSTS.contains(&host.address.as_str()) {
            debug!("No credentials for loopback host {}, running locally", host.address);
            return Ok(Dispatch::Local);
        }

        let (credentials, source) = resolve_credentials(&sources).map_err(|_| {
            DeployError::CredentialsMissing(format!(
                "no SSH credentials for task '{}' on host {}",
                task.name, host.address
            ))
        })?;
        debug!("Using {:?} credentials for {} on {}", source, task.name, host.address);

        Ok(Dispatch::Remote(SshTarget {
            address: host.address.clone(),
            port: task.port.unwrap_or(port),
            credentials,
            host_key_policy: self.host_key_policy.clone(),
            timeout_ms: self.ssh_timeout_ms,
            command_timeout_ms: self.command_timeout_ms,
        }))
    }

    fn record_failure(&self, outcomes: &Mutex<Vec<ExecutionOutcome>>, task: &Task, error: &DeployError) {
        error!("Task '{}' failed on {}: {}", task.name, task.host, error);
        self.events.error(
            "Executor",
            "Dispatch rejected",
            json!({ "task": task.name, "host": task.host, "error": error.to_string() }),
        );
        lock_unpoisoned(outcomes).push(ExecutionOutcome {
            task_name: task.name.clone(),
            host: task.host.clone(),
            success: false,
            output: error.to_string(),
        });
    }
}

/// 阻塞执行一个单元
fn run_unit(
    transport: &dyn Transport,
    task: &Task,
    host: &Host,
    dispatch: &Dispatch,
) -> Result<String, DeployError> {
    let command = if task.is_add_user() {
        build_add_user_command(
            OsFamily::from_label(&host.os),
            &task.new_user(),
            task.group.as_deref(),
        )?
    } else {
        task.command.clone()
    };

    match dispatch {
        Dispatch::Remote(target) => run_remote(transport, target, &command),
        Dispatch::Local => transport.run_local(&command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Inventory;
    use crate::telemetry::MemorySink;
    use crate::testing::{FakeSession, FakeTransport};
    use std::time::Duration;

    fn store_with(inventory: &Inventory) -> (tempfile::TempDir, Arc<InventoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InventoryStore::new(
            dir.path().join("inventory.yaml"),
            Arc::new(MemorySink::new()),
        ));
        store.save(inventory).unwrap();
        (dir, store)
    }

    fn two_host_inventory() -> Inventory {
        let mut inventory = Inventory::new();
        inventory
            .add_host(Host::new("10.0.0.1").with_hostname("web1").with_os("Linux - Ubuntu 22.04"))
            .unwrap();
        inventory
            .add_host(Host::new("10.0.0.2").with_hostname("win1").with_os("Windows Server 2019"))
            .unwrap();
        inventory.set_fallback_credentials(&Credentials::new("admin", "adminpw"));
        inventory
    }

    fn executor(store: Arc<InventoryStore>, transport: &FakeTransport) -> TaskExecutor {
        TaskExecutor::new(store, Arc::new(transport.clone()), Arc::new(MemorySink::new()))
    }

    fn hosts(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_reachable_host() {
        let (_dir, store) = store_with(&two_host_inventory());
        let transport = FakeTransport::new().with_host(
            "10.0.0.1",
            FakeSession::default()
                .respond("uptime", Ok("up 3 days"))
                .respond("whoami", Ok("admin")),
        );

        let tasks = vec![Task::command("uptime", "uptime"), Task::command("whoami", "whoami")];
        let summary = executor(store, &transport)
            .execute(&tasks, &hosts(&["10.0.0.1", "10.0.0.2"]), 22)
            .await
            .unwrap();

        assert_eq!(summary.outcomes.len(), 4);
        assert_eq!(summary.success_count(), 2);
        assert_eq!(summary.failure_count(), 2);
        assert!(summary
            .outcomes
            .iter()
            .filter(|o| o.success)
            .all(|o| o.host == "10.0.0.1"));
        assert_eq!(transport.closed_count(), 2);
    }

    #[tokio::test]
    async fn test_hostname_lookup_and_unknown_host_skipped() {
        let (_dir, store) = store_with(&two_host_inventory());
        let transport = FakeTransport::new()
            .with_host("10.0.0.1", FakeSession::default().respond("uptime", Ok("up")));

        let summary = executor(store, &transport)
            .execute(&[Task::command("uptime", "uptime")], &hosts(&["web1", "10.9.9.9"]), 22)
            .await
            .unwrap();

        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes[0].host, "10.0.0.1");
        assert!(summary.outcomes[0].success);
        assert_eq!(summary.skipped, vec![("uptime".to_string(), "10.9.9.9".to_string())]);
    }

    #[tokio::test]
    async fn test_credentials_missing_never_connects() {
        let mut inventory = Inventory::new();
        inventory.add_host(Host::new("10.0.0.1")).unwrap();
        let (_dir, store) = store_with(&inventory);
        let transport = FakeTransport::new().with_host("10.0.0.1", FakeSession::default());

        let summary = executor(store, &transport)
            .execute(&[Task::command("uptime", "uptime")], &hosts(&["10.0.0.1"]), 22)
            .await
            .unwrap();

        assert_eq!(summary.failure_count(), 1);
        assert!(summary.outcomes[0].output.contains("Credentials missing"));
        assert!(transport.connects().is_empty());
    }

    #[tokio::test]
    async fn test_credential_precedence_and_port_override() {
        let mut inventory = two_host_inventory();
        inventory.hosts[0].ssh_user = Some("hostuser".to_string());
        inventory.hosts[0].ssh_pass = Some("hostpw".to_string());
        let (_dir, store) = store_with(&inventory);
        let transport = FakeTransport::new()
            .with_host("10.0.0.1", FakeSession::default().respond("id", Ok("uid=0")));

        let tasks = vec![
            Task::command("host creds", "id"),
            Task::command("task creds", "id")
                .with_ssh_credentials("taskuser", "taskpw")
                .with_port(2222),
        ];
        executor(store.clone(), &transport)
            .execute(&tasks, &hosts(&["10.0.0.1"]), 22)
            .await
            .unwrap();

        let mut connects = transport.connects();
        connects.sort_by_key(|t| t.port);
        assert_eq!(connects[0].credentials.username, "hostuser");
        assert_eq!(connects[0].port, 22);
        assert_eq!(connects[1].credentials.username, "taskuser");
        assert_eq!(connects[1].port, 2222);

        let transport = FakeTransport::new()
            .with_host("10.0.0.1", FakeSession::default().respond("id", Ok("uid=0")));
        executor(store, &transport)
            .with_env_override(Some(Credentials::new("envuser", "envpw")))
            .execute(&tasks, &hosts(&["10.0.0.1"]), 22)
            .await
            .unwrap();
        assert!(transport
            .connects()
            .iter()
            .all(|t| t.credentials.username == "envuser"));
    }

    #[tokio::test]
    async fn test_add_user_uses_os_specific_command() {
        let (_dir, store) = store_with(&two_host_inventory());
        let linux_cmd = build_add_user_command(
            OsFamily::Linux,
            &Credentials::new("alice", "s3cret"),
            Some("sudo"),
        )
        .unwrap();
        let windows_cmd = build_add_user_command(
            OsFamily::Windows,
            &Credentials::new("alice", "s3cret"),
            Some("sudo"),
        )
        .unwrap();
        let transport = FakeTransport::new()
            .with_host("10.0.0.1", FakeSession::default().respond(&linux_cmd, Ok("")))
            .with_host("10.0.0.2", FakeSession::default().respond(&windows_cmd, Ok("")));

        let task = Task::add_user("create alice", "alice", "s3cret").with_group("sudo");
        let summary = executor(store, &transport)
            .execute(&[task], &hosts(&["10.0.0.1", "10.0.0.2"]), 22)
            .await
            .unwrap();

        assert_eq!(summary.success_count(), 2);
        assert_eq!(transport.executed("10.0.0.1"), vec![linux_cmd]);
        assert_eq!(transport.executed("10.0.0.2"), vec![windows_cmd]);
    }

    #[tokio::test]
    async fn test_add_user_without_new_user_fails_unit() {
        let (_dir, store) = store_with(&two_host_inventory());
        let transport = FakeTransport::new().with_host("10.0.0.1", FakeSession::default());

        let summary = executor(store, &transport)
            .execute(&[Task::command("broken", "add_user")], &hosts(&["10.0.0.1"]), 22)
            .await
            .unwrap();

        assert_eq!(summary.failure_count(), 1);
        assert!(transport.connects().is_empty());
    }

    #[tokio::test]
    async fn test_session_closed_when_command_fails() {
        let (_dir, store) = store_with(&two_host_inventory());
        let transport = FakeTransport::new()
            .with_host("10.0.0.1", FakeSession::default().respond("false", Err("exit status 1")));

        let summary = executor(store, &transport)
            .execute(&[Task::command("fail", "false")], &hosts(&["10.0.0.1"]), 22)
            .await
            .unwrap();

        assert_eq!(summary.failure_count(), 1);
        assert!(summary.outcomes[0].output.contains("exit status 1"));
        assert_eq!(transport.closed_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_is_bounded() {
        let mut inventory = Inventory::new();
        let mut transport = FakeTransport::new().with_connect_delay(Duration::from_millis(30));
        let mut keys = Vec::new();
        for i in 1..=8 {
            let address = format!("10.0.1.{}", i);
            inventory.add_host(Host::new(&address)).unwrap();
            transport = transport.with_host(&address, FakeSession::default().respond("true", Ok("")));
            keys.push(address);
        }
        inventory.set_fallback_credentials(&Credentials::new("admin", "adminpw"));
        let (_dir, store) = store_with(&inventory);

        let summary = executor(store, &transport)
            .with_max_concurrency(2)
            .execute(&[Task::command("noop", "true")], &keys, 22)
            .await
            .unwrap();

        assert_eq!(summary.success_count(), 8);
        assert!(transport.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_loopback_without_credentials_runs_locally() {
        let mut inventory = Inventory::new();
        inventory.add_host(Host::new("127.0.0.1").with_hostname("localhost")).unwrap();
        let (_dir, store) = store_with(&inventory);
        let transport = FakeTransport::new().with_local("echo hi", Ok("hi\n"));

        let summary = executor(store, &transport)
            .execute(&[Task::command("echo", "echo hi")], &hosts(&["localhost"]), 22)
            .await
            .unwrap();

        assert_eq!(summary.success_count(), 1);
        assert_eq!(summary.outcomes[0].output, "hi\n");
        assert_eq!(transport.local_executed(), vec!["echo hi"]);
        assert!(transport.connects().is_empty());
    }

    #[tokio::test]
    async fn test_run_playbook_validates_and_overrides_hosts() {
        let (_dir, store) = store_with(&two_host_inventory());
        let transport = FakeTransport::new()
            .with_host("10.0.0.1", FakeSession::default().respond("uptime", Ok("up")));
        let executor = executor(store, &transport);

        let playbook = Playbook::new("uptime")
            .on_hosts(hosts(&["10.0.0.2"]))
            .add_task(Task::command("uptime", "uptime"))
            .with_port(2200);
        let summary = executor
            .run_playbook(&playbook, Some(&hosts(&["10.0.0.1"])))
            .await
            .unwrap();
        assert_eq!(summary.success_count(), 1);
        assert_eq!(transport.connects()[0].port, 2200);

        let empty = Playbook::new("empty").on_hosts(hosts(&["10.0.0.1"])).with_port(22);
        assert!(executor.run_playbook(&empty, None).await.is_err());
        assert!(transport.connects().len() == 1);
    }

    #[tokio::test]
    async fn test_corrupt_inventory_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.yaml");
        std::fs::write(&path, "hosts: [not, a, host").unwrap();
        let store = Arc::new(InventoryStore::new(&path, Arc::new(MemorySink::new())));
        let transport = FakeTransport::new();

        let result = executor(store, &transport)
            .execute(&[Task::command("uptime", "uptime")], &hosts(&["10.0.0.1"]), 22)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_finished_events_flag_connectivity_failures() {
        let (_dir, store) = store_with(&two_host_inventory());
        let transport = FakeTransport::new()
            .with_host("10.0.0.1", FakeSession::default().respond("false", Err("exit status 1")));
        let events = Arc::new(MemorySink::new());

        TaskExecutor::new(store, Arc::new(transport), events.clone())
            .execute(&[Task::command("fail", "false")], &hosts(&["10.0.0.1", "10.0.0.2"]), 22)
            .await
            .unwrap();

        let finished: HashMap<String, bool> = events
            .events_in("Executor")
            .into_iter()
            .filter(|e| e.message == "Dispatch finished")
            .map(|e| {
                let host = e.data["host"].as_str().unwrap_or_default().to_string();
                (host, e.data["connectivity"].as_bool().unwrap_or_default())
            })
            .collect();
        assert_eq!(finished.get("10.0.0.1"), Some(&false));
        assert_eq!(finished.get("10.0.0.2"), Some(&true));
    }

    #[tokio::test]
    async fn test_configured_timeouts_reach_ssh_target() {
        let (_dir, store) = store_with(&two_host_inventory());
        let transport = FakeTransport::new()
            .with_host("10.0.0.1", FakeSession::default().respond("uptime", Ok("up")));
        let config = EngineConfig {
            ssh_timeout_ms: 3_000,
            command_timeout_ms: 60_000,
            ..EngineConfig::default()
        };

        executor(store, &transport)
            .with_config(&config)
            .execute(&[Task::command("uptime", "uptime")], &hosts(&["10.0.0.1"]), 22)
            .await
            .unwrap();

        let connects = transport.connects();
        assert_eq!(connects[0].timeout_ms, 3_000);
        assert_eq!(connects[0].command_timeout_ms, 60_000);
    }
}
