//! 监控循环
//!
//! 每轮：解析 status → 累计流量 → （到间隔时）到期检查与到期提醒 → 在线数告警。
//! 单轮内部的错误只记日志，不会中断循环。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::MonitorConfig;
use super::enforcer::{EnforceReport, ExpiryWatch};
use super::warden::Warden;

/// 在线数告警，带频率限制
pub struct OnlineAlarm {
    min_online: usize,
    interval: Duration,
    last_alert: Option<Instant>,
}

impl OnlineAlarm {
    pub fn new(min_online: usize, interval: Duration) -> Self {
        Self {
            min_online,
            interval,
            last_alert: None,
        }
    }

    /// 需要告警时返回告警文本；在线数恢复到阈值以上时重置限流
    pub fn evaluate(&mut self, online: usize, keys: usize, now: Instant) -> Option<String> {
        let message = if online == 0 && keys > 0 {
            "❌ 所有客户端均已离线！".to_string()
        } else if online > 0 && online < self.min_online {
            format!("⚠️ 在线客户端过少: {}/{}", online, keys)
        } else {
            if online >= self.min_online {
                self.last_alert = None;
            }
            return None;
        };

        match self.last_alert {
            Some(last) if now.duration_since(last) <= self.interval => None,
            _ => Some(message),
        }
    }

    /// 告警送达后再开始限流
    pub fn mark_sent(&mut self, now: Instant) {
        self.last_alert = Some(now);
    }
}

/// 循环在多轮之间保留的状态
pub struct MonitorState {
    alarm: OnlineAlarm,
    watch: ExpiryWatch,
    enforce_interval: Duration,
    last_enforce: Option<Instant>,
}

impl MonitorState {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            alarm: OnlineAlarm::new(config.min_online_alert, config.alert_interval()),
            watch: ExpiryWatch::new(config.expiry_notice_days),
            enforce_interval: config.enforce_interval(),
            last_enforce: None,
        }
    }

    fn enforce_due(&self, now: Instant) -> bool {
        match self.last_enforce {
            None => true,
            Some(last) => now.duration_since(last) > self.enforce_interval,
        }
    }
}

/// 单轮结果
#[derive(Debug, Default)]
pub struct PollSummary {
    pub online: usize,
    pub keys: usize,
    pub traffic_changed: bool,
    pub enforced: Option<EnforceReport>,
    pub notices_sent: usize,
    pub alert_sent: bool,
}

/// 执行一轮监控，`now` 用于有效期计算，`instant` 用于各种间隔
pub async fn poll_once(
    warden: &Warden,
    state: &mut MonitorState,
    now: DateTime<Utc>,
    instant: Instant,
) -> PollSummary {
    let mut summary = PollSummary::default();

    let snapshot = warden.snapshot().await;
    // 先记流量再做到期检查，保证过期客户端最后一段会话也被计入
    summary.traffic_changed = warden.accrue(&snapshot).await;

    if state.enforce_due(instant) {
        summary.enforced = Some(warden.enforce(now).await);

        let notices = warden.expiry_notices(&mut state.watch, now).await;
        for notice in notices {
            match warden.notifier().notify(&notice.message()).await {
                Ok(()) => {
                    state.watch.mark_notified(&notice);
                    summary.notices_sent += 1;
                }
                Err(e) => warn!("⚠️ 到期提醒发送失败 {}: {:#}", notice.name, e),
            }
        }
        state.last_enforce = Some(instant);
    }

    summary.online = snapshot.online_count();
    summary.keys = warden.key_names().len();

    if let Some(message) = state.alarm.evaluate(summary.online, summary.keys, instant) {
        match warden.notifier().notify(&message).await {
            Ok(()) => {
                state.alarm.mark_sent(instant);
                summary.alert_sent = true;
            }
            Err(e) => warn!("⚠️ 在线告警发送失败: {:#}", e),
        }
    }

    debug!(
        "监控轮询: 在线 {}/{}，流量变化 {}",
        summary.online, summary.keys, summary.traffic_changed
    );
    summary
}

/// 监控主循环，收到取消信号后写出流量表并返回
pub async fn run_monitor(warden: Arc<Warden>, token: CancellationToken) {
    let config = warden.config().monitor.clone();
    let mut state = MonitorState::new(&config);
    let mut interval = tokio::time::interval(config.poll_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        "👀 监控循环启动: 轮询 {}s，到期检查 {}s",
        config.poll_interval_secs, config.enforce_interval_secs
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        tokio::select! {
            _ = token.cancelled() => break,
            summary = poll_once(&warden, &mut state, Utc::now(), Instant::now()) => {
                if let Some(report) = &summary.enforced {
                    if !report.failed.is_empty() {
                        warn!("⚠️ {} 个过期客户端未能禁用，下次检查重试", report.failed.len());
                    }
                }
                if summary.alert_sent || summary.notices_sent > 0 {
                    info!("📣 已通知管理员: 在线告警 {}，到期提醒 {}", summary.alert_sent, summary.notices_sent);
                }
            }
        }
    }

    warden.flush_traffic().await;
    info!("监控循环已停止");
}
