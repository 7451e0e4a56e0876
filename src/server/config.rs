//! 守护进程配置模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 管理密钥环境变量
pub const SECRET_ENV: &str = "OVPN_GUARD_SECRET";

/// 全局配置
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// 文件与目录
    #[serde(default)]
    pub paths: PathsConfig,

    /// OpenVPN 管理接口
    #[serde(default)]
    pub management: ManagementConfig,

    /// 监控循环参数
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Telegram 通知（可选，不配置时告警只写日志）
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,

    /// 管理 API
    #[serde(default)]
    pub admin: AdminConfig,

    /// 日志目录（设置后按天轮转写文件）
    #[serde(default)]
    pub log_dir: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PathsConfig {
    /// OpenVPN status 文件
    #[serde(default = "default_status_log")]
    pub status_log: PathBuf,

    /// client-config-dir，每个客户端一个开关文件
    #[serde(default = "default_ccd_dir")]
    pub ccd_dir: PathBuf,

    /// .ovpn 客户端配置所在目录
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    /// OpenVPN 配置目录（client-template.txt、server.conf、tls 密钥）
    #[serde(default = "default_openvpn_dir")]
    pub openvpn_dir: PathBuf,

    #[serde(default = "default_easyrsa_dir")]
    pub easyrsa_dir: PathBuf,

    /// CRL 发布位置
    #[serde(default = "default_crl_target")]
    pub crl_target: PathBuf,

    /// 数据目录（有效期表、流量表、管理密钥）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_status_log() -> PathBuf {
    PathBuf::from("/var/log/openvpn/status.log")
}

fn default_ccd_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn/ccd")
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("/root")
}

fn default_openvpn_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn")
}

fn default_easyrsa_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn/easy-rsa")
}

fn default_crl_target() -> PathBuf {
    PathBuf::from("/etc/openvpn/crl.pem")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/root/monitor_bot")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            status_log: default_status_log(),
            ccd_dir: default_ccd_dir(),
            keys_dir: default_keys_dir(),
            openvpn_dir: default_openvpn_dir(),
            easyrsa_dir: default_easyrsa_dir(),
            crl_target: default_crl_target(),
            data_dir: default_data_dir(),
        }
    }
}

impl PathsConfig {
    /// 逻辑有效期存储文件
    pub fn expiry_store(&self) -> PathBuf {
        self.data_dir.join("clients_meta.json")
    }

    /// 累计流量文件
    pub fn traffic_db(&self) -> PathBuf {
        self.data_dir.join("traffic_usage.json")
    }

    /// 客户端 .ovpn 文件
    pub fn bundle_path(&self, name: &str) -> PathBuf {
        self.keys_dir.join(format!("{}.ovpn", name))
    }

    pub fn issued_cert(&self, name: &str) -> PathBuf {
        self.easyrsa_dir.join("pki").join("issued").join(format!("{}.crt", name))
    }

    pub fn private_key(&self, name: &str) -> PathBuf {
        self.easyrsa_dir.join("pki").join("private").join(format!("{}.key", name))
    }

    pub fn cert_request(&self, name: &str) -> PathBuf {
        self.easyrsa_dir.join("pki").join("reqs").join(format!("{}.req", name))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ManagementConfig {
    #[serde(default = "default_mgmt_host")]
    pub host: String,

    #[serde(default = "default_mgmt_port")]
    pub port: u16,

    /// 每次套接字操作的超时（秒）
    #[serde(default = "default_mgmt_timeout")]
    pub timeout_secs: u64,

    /// 本地 unix 管理套接字（TCP 不可用时回退）
    #[serde(default = "default_mgmt_socket")]
    pub socket: PathBuf,

    /// 踢下线命令，实际发送 `<kill_command> <name>`
    #[serde(default = "default_kill_command")]
    pub kill_command: String,
}

fn default_mgmt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mgmt_port() -> u16 {
    7505
}

fn default_mgmt_timeout() -> u64 {
    3
}

fn default_mgmt_socket() -> PathBuf {
    PathBuf::from("/var/run/openvpn.sock")
}

fn default_kill_command() -> String {
    "kill".to_string()
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            host: default_mgmt_host(),
            port: default_mgmt_port(),
            timeout_secs: default_mgmt_timeout(),
            socket: default_mgmt_socket(),
            kill_command: default_kill_command(),
        }
    }
}

impl ManagementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitorConfig {
    /// 轮询 status 文件的间隔（秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// 到期检查间隔（秒），默认 12 小时
    #[serde(default = "default_enforce_interval")]
    pub enforce_interval_secs: u64,

    /// 在线数低于该值时告警
    #[serde(default = "default_min_online_alert")]
    pub min_online_alert: usize,

    /// 两次在线告警之间的最小间隔（秒）
    #[serde(default = "default_alert_interval")]
    pub alert_interval_secs: u64,

    /// 流量表写盘节流（秒）
    #[serde(default = "default_traffic_save_interval")]
    pub traffic_save_interval_secs: u64,

    /// 提前几天提醒即将到期
    #[serde(default = "default_expiry_notice_days")]
    pub expiry_notice_days: i64,

    /// 天数无法解析时使用的默认值
    #[serde(default = "default_expiry_days")]
    pub default_expiry_days: i64,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_enforce_interval() -> u64 {
    43200
}

fn default_min_online_alert() -> usize {
    15
}

fn default_alert_interval() -> u64 {
    300
}

fn default_traffic_save_interval() -> u64 {
    60
}

fn default_expiry_notice_days() -> i64 {
    1
}

fn default_expiry_days() -> i64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            enforce_interval_secs: default_enforce_interval(),
            min_online_alert: default_min_online_alert(),
            alert_interval_secs: default_alert_interval(),
            traffic_save_interval_secs: default_traffic_save_interval(),
            expiry_notice_days: default_expiry_notice_days(),
            default_expiry_days: default_expiry_days(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn enforce_interval(&self) -> Duration {
        Duration::from_secs(self.enforce_interval_secs)
    }

    pub fn alert_interval(&self) -> Duration {
        Duration::from_secs(self.alert_interval_secs)
    }

    pub fn traffic_save_interval(&self) -> Duration {
        Duration::from_secs(self.traffic_save_interval_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,

    /// 接收告警的管理员 chat id
    pub admin_chat_id: i64,

    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AdminConfig {
    /// 管理 API 监听地址，只应绑定回环
    #[serde(default = "default_admin_bind")]
    pub bind: String,

    /// CLI 访问管理 API 的地址
    #[serde(default = "default_admin_url")]
    pub url: String,

    /// 管理密钥 (可选，默认从环境变量 OVPN_GUARD_SECRET 读取)
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_admin_bind() -> String {
    "127.0.0.1:7510".to_string()
}

fn default_admin_url() -> String {
    "http://127.0.0.1:7510".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: default_admin_bind(),
            url: default_admin_url(),
            secret: None,
        }
    }
}

impl Config {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = fs::read_to_string(path_ref)
            .with_context(|| format!("无法读取配置文件: {}", path_ref.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path_ref.display()))?;

        Ok(config)
    }

    /// 依次在给定路径、可执行文件目录、上级目录里找配置文件，不打日志
    pub fn locate(path_str: &str) -> Option<PathBuf> {
        let exe_path = std::env::current_exe().ok();
        let exe_dir = exe_path.as_ref().and_then(|p| p.parent());

        [
            Some(PathBuf::from(path_str)),
            exe_dir.map(|d| d.join(path_str)),
            Some(PathBuf::from(format!("../{}", path_str))),
        ]
        .into_iter()
        .flatten()
        .find(|p| p.exists())
    }

    /// 按候选位置查找并加载配置，找不到时使用默认值
    pub fn load(path_str: &str) -> Result<Self> {
        match Self::locate(path_str) {
            Some(path) => {
                let config = Self::from_file(&path)?;
                tracing::info!("📋 加载配置文件: {}", path.display());
                Ok(config)
            }
            None => {
                tracing::warn!("找不到配置文件 {}，使用默认配置", path_str);
                Ok(Self::default())
            }
        }
    }

    /// 获取管理密钥（优先从环境变量读取，其次从配置文件，最后自动生成）
    pub fn get_admin_secret(&self) -> Result<String> {
        if let Ok(secret) = std::env::var(SECRET_ENV) {
            if !secret.is_empty() {
                return Ok(secret);
            }
        }

        if let Some(ref secret) = self.admin.secret {
            if !secret.is_empty() {
                return Ok(secret.clone());
            }
        }

        self.get_or_generate_secret()
    }

    /// CLI 侧读取密钥：不生成新密钥，只读取已有的
    pub fn find_admin_secret(&self) -> Option<String> {
        if let Ok(secret) = std::env::var(SECRET_ENV) {
            if !secret.is_empty() {
                return Some(secret);
            }
        }
        if let Some(ref secret) = self.admin.secret {
            if !secret.is_empty() {
                return Some(secret.clone());
            }
        }
        fs::read_to_string(self.secret_file())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn secret_file(&self) -> PathBuf {
        self.paths.data_dir.join("admin_secret.key")
    }

    /// 从文件获取或生成新的管理密钥
    fn get_or_generate_secret(&self) -> Result<String> {
        let secret_file = self.secret_file();

        if let Ok(secret) = fs::read_to_string(&secret_file) {
            let secret = secret.trim();
            if !secret.is_empty() {
                return Ok(secret.to_string());
            }
        }

        let secret = generate_random_secret(48);

        fs::create_dir_all(&self.paths.data_dir)
            .with_context(|| format!("无法创建数据目录: {}", self.paths.data_dir.display()))?;
        fs::write(&secret_file, &secret)
            .with_context(|| format!("无法保存管理密钥: {}", secret_file.display()))?;
        tracing::info!("🔑 已生成并保存新的管理密钥到: {}", secret_file.display());

        Ok(secret)
    }
}

/// 生成随机密钥
fn generate_random_secret(length: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..length)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
