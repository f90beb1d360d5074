//! 配置管理模块
//!
//! 命令行参数与环境变量决定连接哪两个集群、监听哪些命名空间；
//! 可选的 YAML/JSON 配置文件调整协调行为（历史长度、并发数、超时与重新入队间隔）。

use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use status_sync_common::{Error, Result, DEFAULT_HISTORY_LIMIT};

/// 命令行参数
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "policy-status-sync", version, about = "同步 hub 集群与受管集群之间的治理策略")]
pub struct Cli {
    /// hub 集群的 kubeconfig 文件
    #[arg(long = "hub-cluster-configfile", env = "HUB_CONFIG")]
    pub hub_config: Option<PathBuf>,

    /// 受管集群的 kubeconfig 文件，未设置时使用集群内配置或默认 kubeconfig
    #[arg(long = "cluster-configfile", env = "MANAGED_CONFIG")]
    pub managed_config: Option<PathBuf>,

    /// 监听的命名空间，多个命名空间以逗号分隔
    #[arg(long = "watch-namespace", env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// 配置文件路径（YAML 或 JSON）
    #[arg(long = "config", env = "STATUS_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// 并发协调的工作者数量
    #[arg(long)]
    pub workers: Option<usize>,

    /// 每个模板保留的历史条目数
    #[arg(long)]
    pub history_limit: Option<usize>,

    /// 日志级别
    #[arg(long)]
    pub log_level: Option<String>,

    /// 是否把受管集群的策略状态同步回 hub 集群
    #[arg(long)]
    pub sync_status_to_hub: Option<bool>,

    /// 打印 Policy CRD 后退出
    #[arg(long)]
    pub print_crd: bool,
}

/// 协调行为配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 每个模板保留的历史条目数
    pub history_limit: usize,
    /// 并发协调的工作者数量
    pub workers: usize,
    /// 单次 API 调用超时（秒）
    pub request_timeout_secs: u64,
    /// 成功协调后重新检查的间隔（秒）
    pub resync_interval_secs: u64,
    /// 永久错误后重新入队的间隔（秒）
    pub permanent_error_requeue_secs: u64,
    /// 瞬时错误退避上限（秒）
    pub max_backoff_secs: u64,
    /// 是否把受管集群的策略状态同步回 hub 集群
    pub sync_status_to_hub: bool,
    /// 日志级别
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            workers: 4,
            request_timeout_secs: 30,
            resync_interval_secs: 300,
            permanent_error_requeue_secs: 300,
            max_backoff_secs: 300,
            sync_status_to_hub: true,
            log_level: "info".to_string(),
        }
    }
}

impl SyncConfig {
    /// 加载配置：配置文件（可选）之上叠加 `STATUS_SYNC_` 前缀的环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => {
                    return Err(Error::Config(format!(
                        "不支持的配置文件格式，仅支持 YAML 或 JSON: {:?}",
                        path
                    )))
                }
            };
            builder = builder.add_source(File::from(path).format(format));
            debug!("从 {:?} 加载配置", path);
        }

        let config = builder
            .add_source(Environment::with_prefix("STATUS_SYNC").try_parsing(true))
            .build()
            .map_err(|e| Error::Config(format!("构建配置失败: {}", e)))?;

        let sync_config = config
            .try_deserialize::<SyncConfig>()
            .map_err(|e| Error::Config(format!("配置格式错误: {}", e)))?;

        sync_config.validate()?;
        Ok(sync_config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.history_limit == 0 {
            return Err(Error::Config("history_limit 必须大于 0".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers 必须大于 0".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs 必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 用命令行参数覆盖配置
    pub fn apply_cli(mut self, cli: &Cli) -> Result<Self> {
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
        if let Some(history_limit) = cli.history_limit {
            self.history_limit = history_limit;
        }
        if let Some(log_level) = &cli.log_level {
            self.log_level = log_level.clone();
        }
        if let Some(sync_status_to_hub) = cli.sync_status_to_hub {
            self.sync_status_to_hub = sync_status_to_hub;
        }
        self.validate()?;
        Ok(self)
    }

    /// 单次 API 调用超时
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 成功协调后重新检查的间隔
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// 永久错误后重新入队的间隔
    pub fn permanent_error_requeue(&self) -> Duration {
        Duration::from_secs(self.permanent_error_requeue_secs)
    }

    /// 瞬时错误退避上限
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// 解析监听的命名空间列表
pub fn parse_watch_namespaces(value: Option<&str>) -> Result<Vec<String>> {
    let namespaces: Vec<String> = value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .collect();

    if namespaces.is_empty() {
        return Err(Error::Config("WATCH_NAMESPACE 必须设置".to_string()));
    }

    Ok(namespaces)
}
