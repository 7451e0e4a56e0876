//! 客户端访问控制
//!
//! 两份状态：
//! - 逻辑有效期表 `clients_meta.json`，与证书本身的有效期无关
//! - ccd 目录下每个客户端一个开关文件，内容为 `disable` 或 `enable`，由 OpenVPN 读取

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::session_control::SessionControl;
use super::store;

/// 有效期时间戳格式，固定 UTC 并以 `Z` 结尾
const EXPIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

const MILLIS_PER_DAY: i64 = 86_400_000;

const MAX_NAME_LEN: usize = 64;

/// 客户端名会用作文件名和管理命令参数，只允许安全字符
pub fn validate_client_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

pub fn format_expire(at: &DateTime<Utc>) -> String {
    at.format(EXPIRE_FORMAT).to_string()
}

pub fn parse_expire(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, EXPIRE_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// 剩余整天数，向下取整，已过期为负数（哪怕只过了几毫秒）
pub fn days_left(expire_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expire_at - now).num_milliseconds().div_euclid(MILLIS_PER_DAY)
}

/// ccd 开关状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessFlag {
    Enabled,
    Disabled,
}

impl AccessFlag {
    fn file_content(self) -> &'static str {
        match self {
            AccessFlag::Enabled => "enable\n",
            AccessFlag::Disabled => "disable\n",
        }
    }
}

#[derive(Debug, Serialize)]
struct StoredRecord {
    expire: String,
}

pub struct AccessStore {
    meta_path: PathBuf,
    ccd_dir: PathBuf,
    records: BTreeMap<String, DateTime<Utc>>,
    control: Arc<dyn SessionControl>,
}

impl AccessStore {
    /// 加载有效期表，文件缺失或损坏时从空表开始
    pub fn load(meta_path: PathBuf, ccd_dir: PathBuf, control: Arc<dyn SessionControl>) -> Self {
        let records = match store::read_json::<BTreeMap<String, serde_json::Value>>(&meta_path) {
            Ok(Some(raw)) => decode_records(raw),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("⚠️ 有效期表无法加载，使用空表: {:#}", e);
                BTreeMap::new()
            }
        };

        info!("📅 已加载 {} 条客户端有效期记录", records.len());

        Self {
            meta_path,
            ccd_dir,
            records,
            control,
        }
    }

    pub fn control(&self) -> &Arc<dyn SessionControl> {
        &self.control
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn expiry(&self, name: &str) -> Option<DateTime<Utc>> {
        self.records.get(name).copied()
    }

    /// 有效期与剩余天数，没有记录表示不限期
    pub fn get_expiry(&self, name: &str, now: DateTime<Utc>) -> Option<(DateTime<Utc>, i64)> {
        self.expiry(name).map(|at| (at, days_left(at, now)))
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, DateTime<Utc>)> {
        self.records.iter().map(|(name, at)| (name.as_str(), *at))
    }

    /// 从 `now` 起续期 `days` 天（至少 1 天），同时解除封禁
    ///
    /// 有效期表写盘失败只记日志；开关文件写失败或天数溢出会返回错误。
    pub fn set_expiry_from_now(
        &mut self,
        name: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let days = days.max(1);
        let expire_at = Duration::try_days(days)
            .and_then(|d| now.trunc_subsecs(0).checked_add_signed(d))
            .ok_or_else(|| anyhow!("有效天数超出范围: {}", days))?;
        self.records.insert(name.to_string(), expire_at);

        if let Err(e) = self.save() {
            warn!("⚠️ 保存有效期表失败: {:#}", e);
        }

        self.unblock(name)?;
        info!("📅 客户端 {} 有效期设为 {} ({} 天)", name, format_expire(&expire_at), days);
        Ok(expire_at)
    }

    /// 删除有效期记录并写盘
    pub fn remove_expiry(&mut self, name: &str) -> Result<bool> {
        if self.records.remove(name).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn save(&self) -> Result<()> {
        let stored: BTreeMap<&str, StoredRecord> = self
            .records
            .iter()
            .map(|(name, at)| (name.as_str(), StoredRecord { expire: format_expire(at) }))
            .collect();
        store::write_json_atomic(&self.meta_path, &stored)
    }

    fn flag_path(&self, name: &str) -> PathBuf {
        self.ccd_dir.join(name)
    }

    /// 开关文件不存在视为启用
    pub fn access_flag(&self, name: &str) -> AccessFlag {
        match fs::read_to_string(self.flag_path(name)) {
            Ok(content) if content.to_lowercase().contains("disable") => AccessFlag::Disabled,
            _ => AccessFlag::Enabled,
        }
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.access_flag(name) == AccessFlag::Disabled
    }

    fn write_flag(&self, name: &str, flag: AccessFlag) -> Result<()> {
        fs::create_dir_all(&self.ccd_dir)
            .with_context(|| format!("无法创建 ccd 目录: {}", self.ccd_dir.display()))?;
        let path = self.flag_path(name);
        fs::write(&path, flag.file_content())
            .with_context(|| format!("写入开关文件失败: {}", path.display()))
    }

    /// 封禁并踢下线，返回踢线命令是否发出
    pub async fn block(&self, name: &str) -> Result<bool> {
        self.write_flag(name, AccessFlag::Disabled)?;
        info!("🚫 已封禁客户端 {}", name);
        Ok(self.control.terminate(name).await)
    }

    /// 解除封禁，写入 `enable` 而不是删除文件
    pub fn unblock(&self, name: &str) -> Result<()> {
        self.write_flag(name, AccessFlag::Enabled)?;
        info!("✅ 已启用客户端 {}", name);
        Ok(())
    }

    pub fn remove_flag(&self, name: &str) -> Result<bool> {
        remove_if_exists(&self.flag_path(name))
    }
}

fn decode_records(raw: BTreeMap<String, serde_json::Value>) -> BTreeMap<String, DateTime<Utc>> {
    let mut records = BTreeMap::new();
    for (name, value) in raw {
        let parsed = value
            .get("expire")
            .and_then(|v| v.as_str())
            .and_then(parse_expire);
        match parsed {
            Some(at) => {
                records.insert(name, at);
            }
            None => warn!("⚠️ 丢弃无法解析的有效期记录: {} = {}", name, value),
        }
    }
    records
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("删除文件失败: {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session_control::tests::RecordingControl;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap()
    }

    fn store_in(dir: &Path, control: Arc<RecordingControl>) -> AccessStore {
        AccessStore::load(dir.join("clients_meta.json"), dir.join("ccd"), control)
    }

    #[test]
    fn test_validate_client_name() {
        assert!(validate_client_name("alice"));
        assert!(validate_client_name("bob.phone-2_x@home"));
        assert!(!validate_client_name(""));
        assert!(!validate_client_name("."));
        assert!(!validate_client_name(".."));
        assert!(!validate_client_name("../etc/passwd"));
        assert!(!validate_client_name("a b"));
        assert!(!validate_client_name("kill\nall"));
        assert!(!validate_client_name(&"x".repeat(65)));
    }

    #[test]
    fn test_days_left_floors() {
        let now = t0();
        assert_eq!(days_left(now + Duration::days(30), now + Duration::minutes(1)), 29);
        assert_eq!(days_left(now + Duration::hours(5), now), 0);
        assert_eq!(days_left(now - Duration::hours(1), now), -1);
        assert_eq!(days_left(now - Duration::days(2), now), -2);
        // 刚过期不到一秒也算 -1
        assert_eq!(days_left(now, now + Duration::milliseconds(500)), -1);
        assert_eq!(days_left(now + Duration::days(1), now + Duration::milliseconds(1)), 0);
    }

    #[test]
    fn test_set_expiry_enables_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(RecordingControl::default());
        let mut store = store_in(dir.path(), control.clone());

        fs::create_dir_all(dir.path().join("ccd")).unwrap();
        fs::write(dir.path().join("ccd").join("alice"), "disable\n").unwrap();
        assert!(store.is_disabled("alice"));

        let at = store.set_expiry_from_now("alice", 30, t0()).unwrap();
        assert_eq!(at, t0() + Duration::days(30));
        assert!(!store.is_disabled("alice"));
        assert_eq!(
            fs::read_to_string(dir.path().join("ccd").join("alice")).unwrap(),
            "enable\n"
        );

        let (expire, left) = store.get_expiry("alice", t0() + Duration::minutes(1)).unwrap();
        assert_eq!(expire, t0() + Duration::days(30));
        assert_eq!(left, 29);

        // 重新加载后内容一致
        let reloaded = store_in(dir.path(), control);
        assert_eq!(reloaded.expiry("alice"), Some(t0() + Duration::days(30)));
        let raw = fs::read_to_string(dir.path().join("clients_meta.json")).unwrap();
        assert!(raw.contains("\"2025-10-01T12:00:00Z\""));
    }

    #[test]
    fn test_days_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), Arc::new(RecordingControl::default()));
        let at = store.set_expiry_from_now("bob", 0, t0()).unwrap();
        assert_eq!(at, t0() + Duration::days(1));
        let at = store.set_expiry_from_now("bob", -7, t0()).unwrap();
        assert_eq!(at, t0() + Duration::days(1));
    }

    #[test]
    fn test_overflowing_days_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), Arc::new(RecordingControl::default()));
        assert!(store.set_expiry_from_now("zed", i64::MAX, t0()).is_err());
        assert!(store.set_expiry_from_now("zed", 100_000_000, t0()).is_err());
        assert!(!store.contains("zed"));
        assert!(!dir.path().join("ccd").join("zed").exists());
    }

    #[test]
    fn test_corrupt_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("clients_meta.json"), "{\"alice\": ").unwrap();
        let store = store_in(dir.path(), Arc::new(RecordingControl::default()));
        assert_eq!(store.records().count(), 0);
        assert!(store.get_expiry("alice", t0()).is_none());
    }

    #[test]
    fn test_bad_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("clients_meta.json"),
            r#"{"alice": {"expire": "2025-10-01T12:00:00Z"}, "bob": {"expire": "soon"}, "carol": {}}"#,
        )
        .unwrap();
        let store = store_in(dir.path(), Arc::new(RecordingControl::default()));
        assert!(store.contains("alice"));
        assert!(!store.contains("bob"));
        assert!(!store.contains("carol"));
    }

    #[tokio::test]
    async fn test_block_offline_client() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(RecordingControl::failing());
        let store = store_in(dir.path(), control.clone());

        // 没有在线会话，踢线失败也不报错
        let sent = store.block("bob").await.unwrap();
        assert!(!sent);
        assert!(store.is_disabled("bob"));
        assert_eq!(
            fs::read_to_string(dir.path().join("ccd").join("bob")).unwrap(),
            "disable\n"
        );
        assert_eq!(control.calls(), vec!["bob".to_string()]);

        store.unblock("bob").unwrap();
        assert_eq!(store.access_flag("bob"), AccessFlag::Enabled);
        assert!(store.remove_flag("bob").unwrap());
        assert!(!store.remove_flag("bob").unwrap());
    }
}
