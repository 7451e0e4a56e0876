//! 到期处理
//!
//! - `enforce_expiries`：逻辑有效期已过且仍启用的客户端 → 写 `disable` 并踢线
//! - `ExpiryWatch`：剩余天数等于提醒提前量时通知管理员，同一个到期时间只提醒一次

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, info};

use super::access::{days_left, format_expire, AccessStore};

/// 单个客户端在到期检查中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// 没有有效期记录，或未到期且开关为启用
    Active,
    /// 已过期但开关仍为启用，只在一次检查内部短暂存在
    ExpiredPending,
    /// 开关为禁用，不看有效期记录
    Disabled,
}

pub fn client_state(store: &AccessStore, name: &str, now: DateTime<Utc>) -> ClientState {
    if store.is_disabled(name) {
        return ClientState::Disabled;
    }
    match store.expiry(name) {
        Some(at) if now > at => ClientState::ExpiredPending,
        _ => ClientState::Active,
    }
}

/// 一次到期检查的结果
#[derive(Debug, Default, Clone, Serialize)]
pub struct EnforceReport {
    /// 本次被禁用的客户端
    pub disabled: Vec<String>,
    /// 踢线命令成功发出的数量
    pub terminated: usize,
    /// 开关写入失败的客户端
    pub failed: Vec<String>,
}

/// 禁用所有已过期的客户端
///
/// 已禁用的客户端直接跳过，重复执行不会再次踢线。
pub async fn enforce_expiries(store: &AccessStore, now: DateTime<Utc>) -> EnforceReport {
    let mut report = EnforceReport::default();

    let expired: Vec<String> = store
        .records()
        .filter(|(name, _)| client_state(store, name, now) == ClientState::ExpiredPending)
        .map(|(name, _)| name.to_string())
        .collect();

    for name in expired {
        match store.block(&name).await {
            Ok(sent) => {
                if sent {
                    report.terminated += 1;
                }
                report.disabled.push(name);
            }
            Err(e) => {
                error!("❌ 禁用过期客户端 {} 失败: {:#}", name, e);
                report.failed.push(name);
            }
        }
    }

    if !report.disabled.is_empty() {
        info!("⏰ 到期检查: 已禁用 {} 个过期客户端 {:?}", report.disabled.len(), report.disabled);
    }

    report
}

/// 一条待发送的到期提醒
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryNotice {
    pub name: String,
    pub expire_at: DateTime<Utc>,
    pub days_left: i64,
}

impl ExpiryNotice {
    pub fn message(&self) -> String {
        format!(
            "⚠️ 客户端 {} 将在 {} 天后到期 ({})，如需继续使用请续期。",
            self.name,
            self.days_left,
            format_expire(&self.expire_at)
        )
    }
}

/// 到期提醒去重
pub struct ExpiryWatch {
    lead_days: i64,
    /// 客户端名 → 已提醒过的到期时间
    notified: HashMap<String, DateTime<Utc>>,
}

impl ExpiryWatch {
    pub fn new(lead_days: i64) -> Self {
        Self {
            lead_days,
            notified: HashMap::new(),
        }
    }

    /// 找出需要提醒的客户端，同时清理过时的标记
    pub fn due(&mut self, store: &AccessStore, now: DateTime<Utc>) -> Vec<ExpiryNotice> {
        // 记录被删除或到期时间变了（续期），允许以后重新提醒
        self.notified
            .retain(|name, at| store.expiry(name).is_some_and(|current| current == *at));

        store
            .records()
            .filter_map(|(name, expire_at)| {
                let left = days_left(expire_at, now);
                if left != self.lead_days || store.is_disabled(name) {
                    return None;
                }
                if self.notified.get(name) == Some(&expire_at) {
                    return None;
                }
                Some(ExpiryNotice {
                    name: name.to_string(),
                    expire_at,
                    days_left: left,
                })
            })
            .collect()
    }

    /// 通知成功送达后调用
    pub fn mark_notified(&mut self, notice: &ExpiryNotice) {
        self.notified.insert(notice.name.clone(), notice.expire_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session_control::tests::RecordingControl;
    use chrono::{Duration, TimeZone};
    use std::path::Path;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap()
    }

    fn store_in(dir: &Path, control: Arc<RecordingControl>) -> AccessStore {
        AccessStore::load(dir.join("clients_meta.json"), dir.join("ccd"), control)
    }

    #[tokio::test]
    async fn test_expired_client_is_disabled_once() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(RecordingControl::default());
        let mut store = store_in(dir.path(), control.clone());

        store.set_expiry_from_now("alice", 30, t0()).unwrap();
        store.set_expiry_from_now("bob", 60, t0()).unwrap();

        let now = t0() + Duration::days(31);
        assert_eq!(client_state(&store, "alice", now), ClientState::ExpiredPending);

        let report = enforce_expiries(&store, now).await;
        assert_eq!(report.disabled, vec!["alice".to_string()]);
        assert_eq!(report.terminated, 1);
        assert!(store.is_disabled("alice"));
        assert!(!store.is_disabled("bob"));
        assert_eq!(client_state(&store, "alice", now), ClientState::Disabled);

        // 第二次检查不会重复踢线
        let report = enforce_expiries(&store, now).await;
        assert!(report.disabled.is_empty());
        assert_eq!(control.calls(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_terminate_still_disables() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(RecordingControl::failing());
        let mut store = store_in(dir.path(), control.clone());
        store.set_expiry_from_now("carol", 1, t0()).unwrap();

        let report = enforce_expiries(&store, t0() + Duration::days(2)).await;
        assert_eq!(report.disabled, vec!["carol".to_string()]);
        assert_eq!(report.terminated, 0);
        assert!(store.is_disabled("carol"));
    }

    #[tokio::test]
    async fn test_renewal_reactivates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), Arc::new(RecordingControl::default()));
        store.set_expiry_from_now("dave", 1, t0()).unwrap();

        let later = t0() + Duration::days(3);
        enforce_expiries(&store, later).await;
        assert!(store.is_disabled("dave"));

        store.set_expiry_from_now("dave", 10, later).unwrap();
        assert_eq!(client_state(&store, "dave", later), ClientState::Active);
    }

    #[test]
    fn test_expiry_notice_once_per_expire_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), Arc::new(RecordingControl::default()));
        store.set_expiry_from_now("erin", 2, t0()).unwrap();
        store.set_expiry_from_now("frank", 10, t0()).unwrap();

        let mut watch = ExpiryWatch::new(1);
        let now = t0() + Duration::hours(12);

        let due = watch.due(&store, now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "erin");
        assert_eq!(due[0].days_left, 1);
        assert!(due[0].message().contains("erin"));

        // 未送达时下次仍会提醒
        assert_eq!(watch.due(&store, now).len(), 1);

        watch.mark_notified(&due[0]);
        assert!(watch.due(&store, now).is_empty());

        // 续期后重新走到提前量时可以再次提醒
        store.set_expiry_from_now("erin", 3, now).unwrap();
        assert!(watch.due(&store, now).is_empty());
        let due = watch.due(&store, now + Duration::days(1) + Duration::hours(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "erin");
    }

    #[tokio::test]
    async fn test_disabled_clients_are_not_notified() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), Arc::new(RecordingControl::default()));
        store.set_expiry_from_now("gina", 2, t0()).unwrap();
        store.block("gina").await.unwrap();

        let mut watch = ExpiryWatch::new(1);
        assert!(watch.due(&store, t0() + Duration::hours(12)).is_empty());
    }
}
