use crate::error::DeployError;
use crate::inventory::{InventoryStore, RegisteredUser};
use crate::playbook::Playbook;
use crate::telemetry::EventSink;
use crate::types::Credentials;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tera::{Context, Tera, Value};
use tracing::{debug, error, info};

const TEMPLATE_NAME: &str = "playbook";
const RENDERED_PREFIX: &str = "processed_";

/// 渲染参数
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// inventory 中没有登记用户时使用并登记的新凭据
    pub new_user: Option<Credentials>,
}

#[derive(Debug, Serialize)]
struct UserBlock {
    #[serde(rename = "UserName")]
    user_name: String,
    #[serde(rename = "UserPassword")]
    user_password: String,
}

/// 模板函数 `env(name="VAR", default="")`
fn env_function(args: &HashMap<String, Value>) -> tera::Result<Value> {
    let name = args
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg("env() requires a string `name` argument"))?;

    match std::env::var(name) {
        Ok(value) => Ok(Value::String(value)),
        Err(_) => match args.get("default") {
            Some(default) => Ok(default.clone()),
            None => Err(tera::Error::msg(format!("environment variable {} is not set", name))),
        },
    }
}

/// 过滤器 `value | contains(needle="x")`
fn contains_filter(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let needle = args
        .get("needle")
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg("contains requires a string `needle` argument"))?;

    let found = match value {
        Value::String(s) => s.contains(needle),
        Value::Array(items) => items.iter().any(|i| i.as_str() == Some(needle)),
        _ => false,
    };
    Ok(Value::Bool(found))
}

/// 默认输出路径：模板同目录下的 `processed_<文件名>`
pub fn rendered_path(template_path: &Path) -> PathBuf {
    let file_name = template_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "playbook.yaml".to_string());
    template_path.with_file_name(format!("{}{}", RENDERED_PREFIX, file_name))
}

/// 用 inventory 数据渲染 playbook 模板（Tera）
pub struct PlaybookRenderer {
    store: Arc<InventoryStore>,
    events: Arc<dyn EventSink>,
}

impl PlaybookRenderer {
    pub fn new(store: Arc<InventoryStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// 选定凭据块：优先取第一个已登记用户，否则登记调用方提供的新凭据
    fn resolve_user(&self, options: &RenderOptions) -> Result<Credentials, DeployError> {
        let inventory = self.store.load()?;
        if let Some(user) = inventory.users().first() {
            return Ok(user.credentials());
        }

        let new_user = options.new_user.clone().filter(|c| c.is_usable()).ok_or_else(|| {
            DeployError::CredentialsMissing(
                "inventory has no registered user and no new credentials were supplied".to_string(),
            )
        })?;

        let mut inventory = inventory;
        inventory.register_user(RegisteredUser {
            username: new_user.username.clone(),
            password: new_user.password.clone(),
            group: String::new(),
        });
        self.store.save(&inventory)?;
        self.events.info(
            "Inventory",
            "User registered",
            json!({ "username": new_user.username }),
        );
        Ok(new_user)
    }

    fn build_context(&self, options: &RenderOptions) -> Result<Context, DeployError> {
        let user = self.resolve_user(options)?;
        let inventory = self.store.load()?;

        let mut context = Context::new();
        context.insert("Hosts", &inventory.hosts);
        context.insert(
            "User",
            &UserBlock {
                user_name: user.username,
                user_password: user.password,
            },
        );
        debug!("Template context built with {} hosts", inventory.hosts.len());
        Ok(context)
    }

    /// 渲染模板字符串
    pub fn render_str(&self, template: &str, options: &RenderOptions) -> Result<String, DeployError> {
        let mut tera = Tera::default();
        tera.register_function("env", env_function);
        tera.register_filter("contains", contains_filter);

        tera.add_raw_template(TEMPLATE_NAME, template).map_err(|e| {
            error!("Failed to parse template: {}", e);
            DeployError::TemplateError(format!("Failed to parse template: {}", describe(&e)))
        })?;

        let context = self.build_context(options)?;
        tera.render(TEMPLATE_NAME, &context).map_err(|e| {
            error!("Failed to render template: {}", e);
            DeployError::TemplateError(format!("Failed to render template: {}", describe(&e)))
        })
    }

    /// 渲染模板文件并写出具体 playbook，返回输出路径
    ///
    /// 渲染结果必须能解析为 playbook，否则不写文件。
    pub fn render_file(
        &self,
        template_path: &Path,
        output_path: Option<&Path>,
        options: &RenderOptions,
    ) -> Result<PathBuf, DeployError> {
        let template = std::fs::read_to_string(template_path).map_err(|e| {
            DeployError::TemplateError(format!(
                "Failed to read template {}: {}",
                template_path.display(),
                e
            ))
        })?;

        let rendered = self.render_str(&template, options)?;
        Playbook::from_yaml_str(&rendered)?;

        let output = output_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| rendered_path(template_path));
        std::fs::write(&output, rendered).map_err(|e| {
            DeployError::TemplateError(format!("Failed to write {}: {}", output.display(), e))
        })?;

        info!("Rendered {} to {}", template_path.display(), output.display());
        self.events.info(
            "Renderer",
            "Playbook rendered",
            json!({
                "template": template_path.display().to_string(),
                "output": output.display().to_string()
            }),
        );
        Ok(output)
    }
}

/// tera 的错误把真正原因放在 source 链里
fn describe(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
