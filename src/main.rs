mod client;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use server::admin::BulkAction;
use server::config::Config;

#[derive(Parser)]
#[command(name = "ovpn-guard", version, about = "ovpn-guard - OpenVPN 客户端有效期、流量与在线监控")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true, default_value = "ovpn-guard.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 前台运行守护进程（监控循环 + 管理 API）
    Run,

    /// 查看在线客户端
    Status,

    /// 列出所有客户端及有效期
    Clients,

    /// 签发新客户端
    Create {
        name: String,

        /// 有效天数（无法解析时使用默认值）
        #[arg(long)]
        days: Option<String>,
    },

    /// 从现在起续期并解除封禁
    Renew { name: String, days: String },

    /// 封禁客户端并踢下线
    Block { name: String },

    /// 解除封禁
    Unblock { name: String },

    /// 吊销证书并删除客户端
    Remove { name: String },

    /// 批量操作；不给选择时列出候选序号
    Bulk {
        /// block、unblock 或 remove
        action: BulkAction,

        /// 例如 all、1,2,5、3-7
        selection: Option<String>,
    },

    /// 查看流量统计
    Traffic {
        /// 清空统计（旧数据会先备份）
        #[arg(long)]
        clear: bool,
    },

    /// 改写模板和所有 .ovpn 中的服务器地址（改动前自动备份）
    Remote { host: String, port: u16 },

    /// 离线解析 status 文件并输出 JSON
    Parse {
        /// status 文件路径，默认取配置中的路径
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

/// 命令行模式只输出警告以上的日志
fn init_cli_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Run = cli.command {
        return server::run_server(&cli.config).await;
    }

    init_cli_tracing();
    let config = Config::load(&cli.config)?;

    if let Command::Parse { file } = &cli.command {
        let path = file.clone().unwrap_or_else(|| config.paths.status_log.clone());
        return client::parse_status_file(&path).await;
    }

    let admin = client::AdminClient::new(&config.admin.url, config.find_admin_secret())?;

    match cli.command {
        Command::Status => client::print_status(&admin).await,
        Command::Clients => client::print_clients(&admin).await,
        Command::Create { name, days } => client::create(&admin, &name, days.as_deref()).await,
        Command::Renew { name, days } => client::renew(&admin, &name, &days).await,
        Command::Block { name } => client::block(&admin, &name).await,
        Command::Unblock { name } => client::unblock(&admin, &name).await,
        Command::Remove { name } => client::remove(&admin, &name).await,
        Command::Bulk { action, selection } => {
            client::bulk(&admin, &action.to_string(), selection.as_deref()).await
        }
        Command::Traffic { clear } => client::traffic(&admin, clear).await,
        Command::Remote { host, port } => client::update_remote(&admin, &host, port).await,
        Command::Run | Command::Parse { .. } => Ok(()),
    }
}
