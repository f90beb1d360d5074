use anyhow::{Context, Result};
use clap::Parser;
use kube::CustomResourceExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use status_sync_operator::config::{Cli, SyncConfig};
use status_sync_operator::crd::Policy;
use status_sync_operator::StatusSyncOperator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_crd {
        let crd = serde_yaml::to_string(&Policy::crd()).context("序列化 Policy CRD 失败")?;
        print!("{}", crd);
        return Ok(());
    }

    let config = SyncConfig::load(cli.config.as_deref())
        .context("加载配置失败")?
        .apply_cli(&cli)
        .context("命令行参数无效")?;

    init_tracing(&config.log_level);
    info!("policy-status-sync 版本 {}", env!("CARGO_PKG_VERSION"));

    let operator = StatusSyncOperator::new(&cli, config).await?;
    operator.start().await?;

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    info!("收到退出信号，正在停止");
    operator.stop().await;

    Ok(())
}

/// 初始化日志，`RUST_LOG` 优先于配置中的日志级别
fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
