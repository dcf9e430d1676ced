// SSH 客户端核心模块
mod client;
pub mod user;

pub use client::SshClient;
pub use user::{build_add_user_command, OsFamily, ADD_USER_COMMAND};
