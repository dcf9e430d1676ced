use anyhow::Context;
use clap::{Parser, Subcommand};
use eagle_deploy::{
    list_playbooks, tracing_sink, Credentials, DetectionSettings, EngineConfig, Host,
    HostDiscoverer, InventoryStore, NetworkProbe, OsFingerprinter, Playbook, PlaybookRenderer,
    RenderOptions, SshTransport, TaskExecutor,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "eagle-deploy")]
#[command(about = "Discover hosts, render playbooks and run them over SSH.")]
struct CommandLine {
    /// 引擎配置文件
    #[arg(long, short, default_value = "eagle.yaml")]
    config: PathBuf,

    /// 覆盖配置中的最大并发数
    #[arg(long)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover hosts in an address or range (e.g. 10.0.0.1-254)
    #[command(alias = "d")]
    Discover { range: String },
    /// Inspect or edit the inventory
    #[command(subcommand)]
    Hosts(HostCommands),
    /// List playbooks, optionally filtered by keyword
    Playbooks { keyword: Option<String> },
    /// Render a playbook template with inventory data
    #[command(alias = "r")]
    Render {
        template: PathBuf,
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// 新用户名（inventory 中没有登记用户时必填）
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Run a playbook against its hosts
    Run {
        playbook: PathBuf,
        /// 逗号分隔的主机列表，替换 playbook 中的 hosts
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,
        /// 有主机不在 inventory 中时直接报错，而不是跳过
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum HostCommands {
    List,
    Add {
        address: String,
        #[arg(long, default_value = "")]
        hostname: String,
        #[arg(long)]
        os: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    Update {
        address: String,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        os: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    Delete { address: String },
    /// Set the inventory-wide fallback SSH credentials
    Credentials { user: String, password: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化tracing日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cli = CommandLine::parse();
    let mut config = EngineConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    if let Some(concurrency) = cli.concurrency {
        config = config.with_max_concurrency(concurrency);
    }

    let events = tracing_sink();
    let store = Arc::new(InventoryStore::new(&config.inventory_path, events.clone()));

    match cli.command {
        Commands::Discover { range } => {
            let fingerprinter = OsFingerprinter::new(
                Arc::new(SshTransport),
                DetectionSettings::from_config(&config),
                events.clone(),
            );
            let probe = Arc::new(
                NetworkProbe::new(fingerprinter).with_liveness_ports(config.liveness_ports.clone()),
            );
            let discoverer = HostDiscoverer::new(store, probe, events)
                .with_max_concurrency(config.max_concurrency);

            let report = discoverer.discover(&range).await?;
            for host in &report.alive {
                let marker = if report.added.contains(&host.address) { "+" } else { " " };
                println!("{} {:<16} {:<24} {}", marker, host.address, host.hostname, host.os);
            }
            println!(
                "Scanned {} addresses ({} already known), {} alive, {} added",
                report.candidates,
                report.already_known.len(),
                report.alive.len(),
                report.added.len()
            );
        }
        Commands::Hosts(command) => run_hosts_command(&store, command)?,
        Commands::Playbooks { keyword } => {
            for name in list_playbooks(&config.playbooks_dir, keyword.as_deref())? {
                println!("{}", name);
            }
        }
        Commands::Render {
            template,
            output,
            user,
            password,
        } => {
            let renderer = PlaybookRenderer::new(store, events);
            let options = RenderOptions {
                new_user: Credentials::from_parts(user.as_deref(), password.as_deref()),
            };
            let path = renderer.render_file(&template, output.as_deref(), &options)?;
            println!("Rendered playbook written to {}", path.display());
        }
        Commands::Run {
            playbook,
            hosts,
            strict,
        } => {
            let playbook = Playbook::load(&playbook)
                .with_context(|| format!("loading playbook {}", playbook.display()))?;
            if strict {
                let targets = if hosts.is_empty() { &playbook.hosts } else { &hosts };
                store.load()?.match_hosts(targets)?;
            }
            let executor = TaskExecutor::new(store, Arc::new(SshTransport), events)
                .with_config(&config)
                .with_env_override(config.env_override());

            let summary = executor.run_playbook(&playbook, Some(hosts.as_slice())).await?;
            for outcome in &summary.outcomes {
                let status = if outcome.success { "ok" } else { "FAILED" };
                println!("[{}] {} on {}", status, outcome.task_name, outcome.host);
                if !outcome.output.trim().is_empty() {
                    println!("    {}", outcome.output.trim().replace('\n', "\n    "));
                }
            }
            for (task, host) in &summary.skipped {
                println!("[skipped] {} on {} (not in inventory)", task, host);
            }
            println!(
                "{} of {} units succeeded ({:.0}%)",
                summary.success_count(),
                summary.outcomes.len(),
                summary.success_rate() * 100.0
            );
        }
    }

    Ok(())
}

fn run_hosts_command(store: &InventoryStore, command: HostCommands) -> anyhow::Result<()> {
    match command {
        HostCommands::List => {
            let inventory = store.load()?;
            for host in &inventory.hosts {
                let auth = if host.credentials().is_some() { "own credentials" } else { "" };
                println!("{:<16} {:<24} {:<32} {}", host.address, host.hostname, host.os, auth);
            }
            println!("{} hosts in {}", inventory.hosts.len(), store.path().display());
        }
        HostCommands::Add {
            address,
            hostname,
            os,
            user,
            password,
        } => {
            let mut host = Host::new(&address).with_hostname(&hostname);
            if let Some(os) = os {
                host = host.with_os(&os);
            }
            if let Some(creds) = Credentials::from_parts(user.as_deref(), password.as_deref()) {
                host = host.with_credentials(&creds.username, &creds.password);
            }
            store.add_host(host)?;
            println!("Added {}", address);
        }
        HostCommands::Update {
            address,
            hostname,
            os,
            user,
            password,
        } => {
            let mut host = store
                .find_host(&address)?
                .with_context(|| format!("host {} not found in inventory", address))?;
            if let Some(hostname) = hostname {
                host.hostname = hostname;
            }
            if let Some(os) = os {
                host.os = os;
            }
            if user.is_some() {
                host.ssh_user = user;
            }
            if password.is_some() {
                host.ssh_pass = password;
            }
            let key = host.address.clone();
            store.update_host(&key, host)?;
            println!("Updated {}", key);
        }
        HostCommands::Delete { address } => {
            let removed = store.delete_host(&address)?;
            println!("Deleted {}", removed.address);
        }
        HostCommands::Credentials { user, password } => {
            store.set_fallback_credentials(&Credentials::new(&user, &password))?;
            println!("Fallback credentials updated");
        }
    }
    Ok(())
}
