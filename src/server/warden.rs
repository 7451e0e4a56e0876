//! 顶层服务对象
//!
//! 持有有效期表与流量总账，监控循环和管理 API 都通过它读写，
//! 每个“读-改-写盘”序列都在对应的互斥锁内完成。

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::access::{format_expire, remove_if_exists, validate_client_name, AccessFlag, AccessStore};
use super::admin::{
    parse_bulk_selection, parse_days, AdminError, AdminResult, BulkAction, BulkSummary,
};
use super::bundle::{self, RemoteUpdate};
use super::ca::{CertAuthority, EasyRsa};
use super::config::Config;
use super::enforcer::{enforce_expiries, EnforceReport, ExpiryNotice, ExpiryWatch};
use super::notifier::{build_notifier, Notifier};
use super::session_control::{ManagementControl, SessionControl};
use super::status::{read_status, StatusSnapshot};
use super::traffic::{format_gb, TrafficLedger, TrafficRow};

/// 在线客户端
#[derive(Debug, Clone, Serialize)]
pub struct OnlineClient {
    pub name: String,
    pub tunnel_addr: String,
    pub real_address: Option<String>,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub connected_since: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub online: Vec<OnlineClient>,
    pub online_count: usize,
    pub key_count: usize,
}

/// 客户端总览中的一行
#[derive(Debug, Clone, Serialize)]
pub struct ClientOverview {
    pub name: String,
    pub flag: AccessFlag,
    pub expire: Option<String>,
    pub days_left: Option<i64>,
    pub online: bool,
    /// 累计流量（收发合计）
    pub traffic: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedClient {
    pub name: String,
    pub expire: String,
    pub days: i64,
    pub bundle: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovedClient {
    pub name: String,
    pub revoked: bool,
    pub crl_updated: bool,
    pub terminated: bool,
}

pub struct Warden {
    config: Arc<Config>,
    access: Mutex<AccessStore>,
    traffic: Mutex<TrafficLedger>,
    notifier: Arc<dyn Notifier>,
    ca: Arc<dyn CertAuthority>,
}

impl Warden {
    pub fn new(
        config: Arc<Config>,
        control: Arc<dyn SessionControl>,
        notifier: Arc<dyn Notifier>,
        ca: Arc<dyn CertAuthority>,
    ) -> Self {
        let access = AccessStore::load(
            config.paths.expiry_store(),
            config.paths.ccd_dir.clone(),
            control,
        );
        let traffic = TrafficLedger::load(
            config.paths.traffic_db(),
            config.monitor.traffic_save_interval(),
        );

        Self {
            config,
            access: Mutex::new(access),
            traffic: Mutex::new(traffic),
            notifier,
            ca,
        }
    }

    /// 按配置组装真实的管理接口、通知渠道和 easy-rsa
    pub fn from_config(config: Arc<Config>) -> anyhow::Result<Self> {
        let control: Arc<dyn SessionControl> = Arc::new(ManagementControl::new(&config.management));
        let notifier = build_notifier(&config)?;
        let ca: Arc<dyn CertAuthority> = Arc::new(EasyRsa::new(config.paths.clone()));
        Ok(Self::new(config, control, notifier, ca))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    // ---------- 监控循环使用 ----------

    pub async fn snapshot(&self) -> StatusSnapshot {
        read_status(&self.config.paths.status_log).await
    }

    /// keys_dir 下所有 .ovpn 的文件名（不含扩展名），已排序
    pub fn key_names(&self) -> Vec<String> {
        let dir = &self.config.paths.keys_dir;
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("⚠️ 无法读取密钥目录 {}: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) != Some("ovpn") {
                    return None;
                }
                path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }

    /// 累计本轮流量并按节流写盘
    pub async fn accrue(&self, snapshot: &StatusSnapshot) -> bool {
        let mut ledger = self.traffic.lock().await;
        let changed = ledger.accrue(&snapshot.sessions);
        if let Err(e) = ledger.save(false, Instant::now()) {
            warn!("⚠️ 保存流量表失败: {:#}", e);
        }
        changed
    }

    pub async fn enforce(&self, now: DateTime<Utc>) -> EnforceReport {
        let access = self.access.lock().await;
        enforce_expiries(&access, now).await
    }

    pub async fn expiry_notices(&self, watch: &mut ExpiryWatch, now: DateTime<Utc>) -> Vec<ExpiryNotice> {
        let access = self.access.lock().await;
        watch.due(&access, now)
    }

    /// 强制写出流量表（退出前）
    pub async fn flush_traffic(&self) {
        let mut ledger = self.traffic.lock().await;
        if !ledger.is_dirty() {
            return;
        }
        match ledger.save(true, Instant::now()) {
            Ok(_) => info!("💾 流量表已写盘"),
            Err(e) => error!("❌ 退出前保存流量表失败: {:#}", e),
        }
    }

    // ---------- 查询 ----------

    /// 在线客户端：以路由表为准，补上连接列表里的计数
    pub async fn status(&self) -> StatusReport {
        let snapshot = self.snapshot().await;
        let online: Vec<OnlineClient> = snapshot
            .tunnel_addrs
            .iter()
            .map(|(name, tunnel_addr)| {
                let session = snapshot.session(name);
                OnlineClient {
                    name: name.clone(),
                    tunnel_addr: tunnel_addr.clone(),
                    real_address: session.map(|s| s.real_address.clone()),
                    bytes_recv: session.map(|s| s.bytes_recv).unwrap_or(0),
                    bytes_sent: session.map(|s| s.bytes_sent).unwrap_or(0),
                    connected_since: session.map(|s| s.connected_since.clone()),
                }
            })
            .collect();

        StatusReport {
            online_count: snapshot.online_count(),
            key_count: self.key_names().len(),
            online,
        }
    }

    pub async fn clients(&self, now: DateTime<Utc>) -> Vec<ClientOverview> {
        let snapshot = self.snapshot().await;
        let access = self.access.lock().await;
        let ledger = self.traffic.lock().await;

        self.key_names()
            .into_iter()
            .map(|name| {
                let expiry = access.get_expiry(&name, now);
                let used = ledger.usage(&name).unwrap_or_default();
                ClientOverview {
                    flag: access.access_flag(&name),
                    expire: expiry.map(|(at, _)| format_expire(&at)),
                    days_left: expiry.map(|(_, left)| left),
                    online: snapshot.is_online(&name),
                    traffic: format_gb(used.total()),
                    name,
                }
            })
            .collect()
    }

    pub async fn traffic_report(&self) -> Vec<TrafficRow> {
        self.traffic.lock().await.report()
    }

    // ---------- 管理操作 ----------

    fn check_name(name: &str) -> AdminResult<()> {
        if validate_client_name(name) {
            Ok(())
        } else {
            Err(AdminError::InvalidName(name.to_string()))
        }
    }

    /// 密钥、证书或有效期记录任一存在即视为已知客户端
    async fn is_known(&self, name: &str) -> bool {
        self.config.paths.bundle_path(name).exists()
            || self.ca.has_certificate(name)
            || self.access.lock().await.contains(name)
    }

    async fn require_known(&self, name: &str) -> AdminResult<()> {
        Self::check_name(name)?;
        if self.is_known(name).await {
            Ok(())
        } else {
            Err(AdminError::UnknownClient(name.to_string()))
        }
    }

    pub async fn create(
        &self,
        name: &str,
        days: Option<&str>,
        now: DateTime<Utc>,
    ) -> AdminResult<CreatedClient> {
        Self::check_name(name)?;
        if self.is_known(name).await || self.traffic.lock().await.contains(name) {
            return Err(AdminError::AlreadyExists(name.to_string()));
        }

        // 天数必须在签发证书之前校验
        let days = parse_days(days, self.config.monitor.default_expiry_days)?;

        let outcome = self.ca.issue(name).await?;
        if !outcome.success {
            return Err(anyhow!("签发证书失败: {}", tail(&outcome.output)).into());
        }

        let expire_at = self
            .access
            .lock()
            .await
            .set_expiry_from_now(name, days, now)?;

        let bundle = bundle::write_bundle(&self.config.paths, name)?;

        info!("🆕 已创建客户端 {}，有效期 {} 天", name, days);
        Ok(CreatedClient {
            name: name.to_string(),
            expire: format_expire(&expire_at),
            days,
            bundle: bundle.display().to_string(),
        })
    }

    pub async fn renew(&self, name: &str, days: Option<&str>, now: DateTime<Utc>) -> AdminResult<String> {
        self.require_known(name).await?;
        let days = parse_days(days, self.config.monitor.default_expiry_days)?;
        let expire_at = self
            .access
            .lock()
            .await
            .set_expiry_from_now(name, days, now)?;
        Ok(format_expire(&expire_at))
    }

    /// 返回踢线命令是否发出
    pub async fn block(&self, name: &str) -> AdminResult<bool> {
        self.require_known(name).await?;
        let access = self.access.lock().await;
        Ok(access.block(name).await?)
    }

    pub async fn unblock(&self, name: &str) -> AdminResult<()> {
        self.require_known(name).await?;
        self.access.lock().await.unblock(name)?;
        Ok(())
    }

    /// 吊销证书、更新 CRL 并删除该客户端的全部文件与记录
    pub async fn remove(&self, name: &str) -> AdminResult<RemovedClient> {
        self.require_known(name).await?;

        let revoked = self.revoke_if_issued(name).await.map_err(AdminError::Internal)?;
        let crl_updated = self.regenerate_crl().await;
        let terminated = self.purge(name).await?;

        info!("🗑️ 已删除客户端 {}", name);
        Ok(RemovedClient {
            name: name.to_string(),
            revoked,
            crl_updated,
            terminated,
        })
    }

    /// 返回是否真的执行了吊销；没有证书时视为成功
    async fn revoke_if_issued(&self, name: &str) -> anyhow::Result<bool> {
        if !self.ca.has_certificate(name) {
            return Ok(false);
        }
        let outcome = self.ca.revoke(name).await?;
        if outcome.success {
            Ok(true)
        } else {
            Err(anyhow!("吊销失败: {}", tail(&outcome.output)))
        }
    }

    async fn regenerate_crl(&self) -> bool {
        match self.ca.gen_crl().await {
            Ok(outcome) if outcome.success => true,
            Ok(outcome) => {
                error!("❌ 生成 CRL 失败: {}", tail(&outcome.output));
                false
            }
            Err(e) => {
                error!("❌ 生成 CRL 失败: {:#}", e);
                false
            }
        }
    }

    /// 删除文件与记录后踢线，返回踢线命令是否发出
    async fn purge(&self, name: &str) -> AdminResult<bool> {
        let paths = &self.config.paths;
        let files: [PathBuf; 4] = [
            paths.bundle_path(name),
            paths.issued_cert(name),
            paths.private_key(name),
            paths.cert_request(name),
        ];
        for path in &files {
            if let Err(e) = remove_if_exists(path) {
                warn!("⚠️ {:#}", e);
            }
        }

        let control = {
            let mut access = self.access.lock().await;
            if let Err(e) = access.remove_flag(name) {
                warn!("⚠️ {:#}", e);
            }
            access.remove_expiry(name)?;
            access.control().clone()
        };

        self.traffic.lock().await.remove(name)?;

        Ok(control.terminate(name).await)
    }

    /// 批量操作的候选列表，序号从 1 开始
    pub async fn bulk_candidates(&self, action: BulkAction) -> Vec<String> {
        let keys = self.key_names();
        match action {
            BulkAction::Remove => keys,
            BulkAction::Block | BulkAction::Unblock => {
                let access = self.access.lock().await;
                let want_disabled = action == BulkAction::Unblock;
                keys.into_iter()
                    .filter(|name| access.is_disabled(name) == want_disabled)
                    .collect()
            }
        }
    }

    pub async fn bulk(&self, action: BulkAction, selection: &str) -> AdminResult<BulkSummary> {
        let candidates = self.bulk_candidates(action).await;
        let (indexes, errors) = parse_bulk_selection(selection, candidates.len());
        if !errors.is_empty() {
            return Err(AdminError::InvalidSelection(errors));
        }
        if indexes.is_empty() {
            return Err(AdminError::NothingSelected);
        }

        let selected: Vec<String> = indexes.iter().map(|i| candidates[i - 1].clone()).collect();
        let mut summary = BulkSummary::new(action, selected.clone());

        match action {
            BulkAction::Block => {
                let access = self.access.lock().await;
                for name in &selected {
                    match access.block(name).await {
                        Ok(_) => summary.succeeded.push(name.clone()),
                        Err(e) => summary.fail(name, format!("{:#}", e)),
                    }
                }
            }
            BulkAction::Unblock => {
                let access = self.access.lock().await;
                for name in &selected {
                    match access.unblock(name) {
                        Ok(()) => summary.succeeded.push(name.clone()),
                        Err(e) => summary.fail(name, format!("{:#}", e)),
                    }
                }
            }
            BulkAction::Remove => {
                let mut revoked = Vec::new();
                for name in &selected {
                    match self.revoke_if_issued(name).await {
                        Ok(_) => revoked.push(name.clone()),
                        Err(e) => summary.fail(name, format!("{:#}", e)),
                    }
                }
                summary.crl_updated = Some(self.regenerate_crl().await);
                for name in revoked {
                    match self.purge(&name).await {
                        Ok(_) => summary.succeeded.push(name),
                        Err(e) => summary.fail(&name, e.to_string()),
                    }
                }
            }
        }

        info!(
            "📦 批量 {}: 请求 {}，成功 {}，失败 {}",
            action,
            summary.requested.len(),
            summary.succeeded.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// 服务器地址变更：改写模板与所有客户端配置中的 remote 行
    pub async fn update_remote(&self, host: &str, port: u16) -> AdminResult<RemoteUpdate> {
        let host = host.trim();
        if !valid_remote_host(host) || port == 0 {
            return Err(AdminError::InvalidRemote(format!("{} {}", host, port)));
        }
        let names = self.key_names();
        Ok(bundle::update_remote(&self.config.paths, &names, host, port))
    }

    /// 清空流量统计，返回备份文件路径
    pub async fn clear_traffic(&self) -> AdminResult<Option<String>> {
        let backup = self.traffic.lock().await.clear()?;
        Ok(backup.map(|p| p.display().to_string()))
    }
}

/// 主机名或 IP，不能带空白，写进 remote 行后不能改变行结构
fn valid_remote_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'))
}

/// 命令输出只保留最后几行
fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::server::ca::CommandOutcome;
    use crate::server::session_control::tests::RecordingControl;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;

    /// 在测试目录里模拟 easy-rsa：签发时写出证书与私钥
    pub(crate) struct FakeCa {
        pub paths: crate::server::config::PathsConfig,
        pub revoke_fails: HashSet<String>,
        pub calls: std::sync::Mutex<Vec<String>>,
    }

    impl FakeCa {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CertAuthority for FakeCa {
        async fn issue(&self, name: &str) -> anyhow::Result<CommandOutcome> {
            self.calls.lock().unwrap().push(format!("issue {}", name));
            fs::write(self.paths.issued_cert(name), "-----BEGIN CERTIFICATE-----\nC\n-----END CERTIFICATE-----\n")?;
            fs::write(self.paths.private_key(name), "K")?;
            fs::write(self.paths.cert_request(name), "R")?;
            Ok(CommandOutcome { success: true, output: String::new() })
        }

        async fn revoke(&self, name: &str) -> anyhow::Result<CommandOutcome> {
            self.calls.lock().unwrap().push(format!("revoke {}", name));
            Ok(CommandOutcome {
                success: !self.revoke_fails.contains(name),
                output: "revoke output".to_string(),
            })
        }

        async fn gen_crl(&self) -> anyhow::Result<CommandOutcome> {
            self.calls.lock().unwrap().push("gen-crl".to_string());
            Ok(CommandOutcome { success: true, output: String::new() })
        }

        fn has_certificate(&self, name: &str) -> bool {
            self.paths.issued_cert(name).exists()
        }
    }

    /// 记录通知内容，可设置为发送失败
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: std::sync::Mutex<Vec<String>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingNotifier {
        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, text: &str) -> anyhow::Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("offline");
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    pub(crate) struct Fixture {
        pub warden: Arc<Warden>,
        pub control: Arc<RecordingControl>,
        pub ca: Arc<FakeCa>,
        pub notifier: Arc<RecordingNotifier>,
    }

    pub(crate) fn fixture_with(dir: &Path, revoke_fails: &[&str]) -> Fixture {
        let mut config = Config::default();
        config.paths.status_log = dir.join("status.log");
        config.paths.ccd_dir = dir.join("ccd");
        config.paths.keys_dir = dir.join("keys");
        config.paths.openvpn_dir = dir.join("openvpn");
        config.paths.easyrsa_dir = dir.join("easy-rsa");
        config.paths.crl_target = dir.join("crl.pem");
        config.paths.data_dir = dir.join("data");

        let pki = config.paths.easyrsa_dir.join("pki");
        for sub in ["issued", "private", "reqs"] {
            fs::create_dir_all(pki.join(sub)).unwrap();
        }
        fs::write(pki.join("ca.crt"), "CA").unwrap();
        fs::create_dir_all(&config.paths.openvpn_dir).unwrap();
        fs::write(config.paths.openvpn_dir.join("client-template.txt"), "client\n").unwrap();
        fs::create_dir_all(&config.paths.keys_dir).unwrap();

        let control = Arc::new(RecordingControl::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ca = Arc::new(FakeCa {
            paths: config.paths.clone(),
            revoke_fails: revoke_fails.iter().map(|s| s.to_string()).collect(),
            calls: std::sync::Mutex::new(Vec::new()),
        });

        let warden = Arc::new(Warden::new(
            Arc::new(config),
            control.clone(),
            notifier.clone(),
            ca.clone(),
        ));
        Fixture { warden, control, ca, notifier }
    }

    pub(crate) fn fixture(dir: &Path) -> Fixture {
        fixture_with(dir, &[])
    }

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_create_issues_and_sets_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());

        let created = f.warden.create("alice", Some("30"), t0()).await.unwrap();
        assert_eq!(created.days, 30);
        assert_eq!(created.expire, "2025-10-01T12:00:00Z");
        assert!(Path::new(&created.bundle).exists());
        assert_eq!(f.warden.key_names(), vec!["alice".to_string()]);

        let clients = f.warden.clients(t0() + Duration::minutes(1)).await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].days_left, Some(29));
        assert_eq!(clients[0].flag, AccessFlag::Enabled);
        assert!(!clients[0].online);
        assert_eq!(clients[0].traffic, "0.00 GB");

        // 同名再次创建
        let err = f.warden.create("alice", None, t0()).await.unwrap_err();
        assert!(matches!(err, AdminError::AlreadyExists(_)));
        assert_eq!(f.ca.calls(), vec!["issue alice".to_string()]);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names_and_defaults_days() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());

        let err = f.warden.create("../root", None, t0()).await.unwrap_err();
        assert!(matches!(err, AdminError::InvalidName(_)));

        let created = f.warden.create("bob", Some("many"), t0()).await.unwrap();
        assert_eq!(created.days, 30);
    }

    #[tokio::test]
    async fn test_oversized_days_rejected_before_issuing() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());

        let err = f.warden.create("zed", Some("100000000"), t0()).await.unwrap_err();
        assert!(matches!(err, AdminError::InvalidDays(_)));
        assert!(f.ca.calls().is_empty());
        assert!(!f.warden.config().paths.issued_cert("zed").exists());

        // 名字没有被占用
        let created = f.warden.create("zed", Some("30"), t0()).await.unwrap();
        assert_eq!(created.days, 30);

        let err = f.warden.renew("zed", Some("100000000"), t0()).await.unwrap_err();
        assert!(matches!(err, AdminError::InvalidDays(_)));
        let clients = f.warden.clients(t0()).await;
        assert_eq!(clients[0].expire.as_deref(), Some("2025-10-01T12:00:00Z"));
    }

    #[tokio::test]
    async fn test_block_renew_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        f.warden.create("bob", Some("10"), t0()).await.unwrap();

        f.warden.block("bob").await.unwrap();
        assert_eq!(f.control.calls(), vec!["bob".to_string()]);
        assert_eq!(f.warden.bulk_candidates(BulkAction::Unblock).await, vec!["bob".to_string()]);

        let expire = f.warden.renew("bob", Some("5"), t0()).await.unwrap();
        assert_eq!(expire, "2025-09-06T12:00:00Z");
        assert!(f.warden.bulk_candidates(BulkAction::Unblock).await.is_empty());

        let err = f.warden.renew("ghost", Some("5"), t0()).await.unwrap_err();
        assert!(matches!(err, AdminError::UnknownClient(_)));
        let err = f.warden.block("ghost").await.unwrap_err();
        assert!(matches!(err, AdminError::UnknownClient(_)));
    }

    #[tokio::test]
    async fn test_remove_purges_everything() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        f.warden.create("carol", None, t0()).await.unwrap();

        let removed = f.warden.remove("carol").await.unwrap();
        assert!(removed.revoked);
        assert!(removed.crl_updated);
        assert!(removed.terminated);

        let paths = &f.warden.config().paths;
        assert!(!paths.bundle_path("carol").exists());
        assert!(!paths.issued_cert("carol").exists());
        assert!(!paths.private_key("carol").exists());
        assert!(!paths.cert_request("carol").exists());
        assert!(!paths.ccd_dir.join("carol").exists());
        assert!(f.warden.key_names().is_empty());
        assert_eq!(
            f.ca.calls(),
            vec!["issue carol".to_string(), "revoke carol".to_string(), "gen-crl".to_string()]
        );

        let err = f.warden.remove("carol").await.unwrap_err();
        assert!(matches!(err, AdminError::UnknownClient(_)));
    }

    #[tokio::test]
    async fn test_bulk_block_and_selection_errors() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        for name in ["a1", "a2", "a3", "a4"] {
            f.warden.create(name, None, t0()).await.unwrap();
        }

        let summary = f.warden.bulk(BulkAction::Block, "1, 3-4").await.unwrap();
        assert_eq!(summary.requested, vec!["a1", "a3", "a4"]);
        assert_eq!(summary.succeeded.len(), 3);
        assert!(summary.failed.is_empty());

        // 现在只剩 a2 可封禁
        assert_eq!(f.warden.bulk_candidates(BulkAction::Block).await, vec!["a2".to_string()]);
        let err = f.warden.bulk(BulkAction::Block, "2").await.unwrap_err();
        assert!(matches!(err, AdminError::InvalidSelection(ref e) if e.len() == 1));

        let summary = f.warden.bulk(BulkAction::Unblock, "all").await.unwrap();
        assert_eq!(summary.succeeded, vec!["a1", "a3", "a4"]);
    }

    #[tokio::test]
    async fn test_bulk_remove_continues_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_with(dir.path(), &["b2"]);
        for name in ["b1", "b2", "b3"] {
            f.warden.create(name, None, t0()).await.unwrap();
        }

        let summary = f.warden.bulk(BulkAction::Remove, "all").await.unwrap();
        assert_eq!(summary.requested.len(), 3);
        assert_eq!(summary.succeeded, vec!["b1", "b3"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].name, "b2");
        assert_eq!(summary.crl_updated, Some(true));
        assert_eq!(f.warden.key_names(), vec!["b2".to_string()]);
    }

    #[tokio::test]
    async fn test_update_remote_rewrites_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let template = f.warden.config().paths.openvpn_dir.join("client-template.txt");
        fs::write(&template, "client\nremote old.example.com 1194\n").unwrap();
        f.warden.create("alice", None, t0()).await.unwrap();
        f.warden.create("bob", None, t0()).await.unwrap();

        let result = f.warden.update_remote("vpn.example.com", 443).await.unwrap();
        assert!(result.template_updated);
        assert_eq!(result.bundles_updated, 2);
        assert!(result.errors.is_empty());

        let alice = fs::read_to_string(f.warden.config().paths.bundle_path("alice")).unwrap();
        assert!(alice.starts_with("client\nremote vpn.example.com 443\n<ca>"));
        // 备份文件不算客户端
        assert_eq!(f.warden.key_names(), vec!["alice".to_string(), "bob".to_string()]);

        for (host, port) in [("", 443), ("evil.com 1\nremote x", 443), ("vpn.example.com", 0)] {
            let err = f.warden.update_remote(host, port).await.unwrap_err();
            assert!(matches!(err, AdminError::InvalidRemote(_)));
        }
    }

    #[tokio::test]
    async fn test_status_joins_sections() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        f.warden.create("alice", None, t0()).await.unwrap();
        f.warden.create("bob", None, t0()).await.unwrap();
        fs::write(
            dir.path().join("status.log"),
            "OpenVPN CLIENT LIST\nalice,1.2.3.4:5,10,20,S1\nbob,1.2.3.5:6,1,2,S1\nROUTING TABLE\n10.8.0.2,alice,1.2.3.4:5,x\nEND\n",
        )
        .unwrap();

        let report = f.warden.status().await;
        assert_eq!(report.online_count, 1);
        assert_eq!(report.key_count, 2);
        assert_eq!(report.online[0].name, "alice");
        assert_eq!(report.online[0].tunnel_addr, "10.8.0.2");
        assert_eq!(report.online[0].bytes_sent, 20);
    }

    #[tokio::test]
    async fn test_clear_traffic_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let status = dir.path().join("status.log");

        fs::write(&status, "OpenVPN CLIENT LIST\nalice,1.2.3.4:5,1000,200,S1\n").unwrap();
        let snap = f.warden.snapshot().await;
        assert!(!f.warden.accrue(&snap).await);

        fs::write(&status, "OpenVPN CLIENT LIST\nalice,1.2.3.4:5,1500,300,S1\n").unwrap();
        let snap = f.warden.snapshot().await;
        assert!(f.warden.accrue(&snap).await);

        let report = f.warden.traffic_report().await;
        assert_eq!(report[0].rx, 500);
        assert_eq!(report[0].tx, 100);
        assert!(f.warden.config().paths.traffic_db().exists());

        let backup = f.warden.clear_traffic().await.unwrap();
        assert!(backup.is_some());
        assert!(f.warden.traffic_report().await.is_empty());
        assert!(f.notifier.sent().is_empty());
    }
}
