//! 流量累计
//!
//! status 文件给出的是单个会话内的累计字节数，断线重连后从 0 重新计数。
//! 这里为每个客户端记一份会话基线，只把同一会话内的正增量加到总账上；
//! `connected_since` 变了说明换了会话，只重设基线不记账。

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::status::LiveSession;
use super::store;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// 单个客户端的累计流量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct TrafficUsage {
    pub rx: u64,
    pub tx: u64,
}

impl TrafficUsage {
    pub fn total(&self) -> u64 {
        self.rx.saturating_add(self.tx)
    }
}

/// 会话基线，只存在内存里
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionBaseline {
    connected_since: String,
    rx: u64,
    tx: u64,
}

/// 报表中的一行
#[derive(Debug, Clone, Serialize)]
pub struct TrafficRow {
    pub name: String,
    pub rx: u64,
    pub tx: u64,
    pub total: u64,
    /// 总量，单位 GB，保留两位小数
    pub total_gb: String,
}

pub fn format_gb(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / BYTES_PER_GB)
}

/// 流量总账
pub struct TrafficLedger {
    path: PathBuf,
    usage: BTreeMap<String, TrafficUsage>,
    baselines: HashMap<String, SessionBaseline>,
    save_interval: Duration,
    last_save: Option<Instant>,
    /// 有尚未写盘的变更
    dirty: bool,
}

impl TrafficLedger {
    /// 加载总账，兼容旧格式；文件损坏时从空账开始
    pub fn load(path: PathBuf, save_interval: Duration) -> Self {
        let usage = match store::read_json::<BTreeMap<String, serde_json::Value>>(&path) {
            Ok(Some(raw)) => raw
                .into_iter()
                .map(|(name, value)| {
                    let entry = normalize_entry(&value);
                    (name, entry)
                })
                .collect(),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("⚠️ 流量表无法加载，使用空表: {:#}", e);
                BTreeMap::new()
            }
        };

        info!("📊 已加载 {} 个客户端的流量记录", usage.len());

        Self {
            path,
            usage,
            baselines: HashMap::new(),
            save_interval,
            last_save: None,
            dirty: false,
        }
    }

    pub fn usage(&self, name: &str) -> Option<TrafficUsage> {
        self.usage.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.usage.contains_key(name)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// 按本轮 status 数据累计流量，返回总账是否有变化
    pub fn accrue(&mut self, sessions: &[LiveSession]) -> bool {
        let mut changed = false;

        for s in sessions {
            let entry = self.usage.entry(s.name.clone()).or_default();

            let same_session = self
                .baselines
                .get(&s.name)
                .is_some_and(|b| b.connected_since == s.connected_since);

            if !same_session {
                debug!("客户端 {} 新会话 ({})，重设流量基线", s.name, s.connected_since);
                self.baselines.insert(
                    s.name.clone(),
                    SessionBaseline {
                        connected_since: s.connected_since.clone(),
                        rx: s.bytes_recv,
                        tx: s.bytes_sent,
                    },
                );
                continue;
            }

            let Some(baseline) = self.baselines.get_mut(&s.name) else {
                continue;
            };

            // 同一会话内计数回退或不变：不记账，只前移基线
            if s.bytes_recv > baseline.rx {
                entry.rx = entry.rx.saturating_add(s.bytes_recv - baseline.rx);
                changed = true;
            }
            baseline.rx = s.bytes_recv;

            if s.bytes_sent > baseline.tx {
                entry.tx = entry.tx.saturating_add(s.bytes_sent - baseline.tx);
                changed = true;
            }
            baseline.tx = s.bytes_sent;
        }

        if changed {
            self.dirty = true;
        }
        changed
    }

    /// 写盘；非强制时只在有变更且距上次写盘超过节流间隔时才写，返回是否真的写了
    pub fn save(&mut self, force: bool, now: Instant) -> Result<bool> {
        if !force {
            if !self.dirty {
                return Ok(false);
            }
            if let Some(last) = self.last_save {
                if now.duration_since(last) < self.save_interval {
                    return Ok(false);
                }
            }
        }

        store::write_json_atomic(&self.path, &self.usage)?;
        self.last_save = Some(now);
        self.dirty = false;
        Ok(true)
    }

    /// 清空全部统计：先备份旧文件，再整体替换为空表并强制写盘
    pub fn clear(&mut self) -> Result<Option<PathBuf>> {
        let backup = match store::archive_copy(&self.path) {
            Ok(b) => b,
            Err(e) => {
                warn!("⚠️ 备份流量表失败: {:#}", e);
                None
            }
        };

        self.usage.clear();
        self.baselines.clear();
        self.save(true, Instant::now())?;

        info!("🧹 流量统计已清空");
        Ok(backup)
    }

    /// 删除客户端时整条移除（不是清零），并立即写盘
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        self.baselines.remove(name);
        if self.usage.remove(name).is_none() {
            return Ok(false);
        }
        self.save(true, Instant::now())?;
        Ok(true)
    }

    /// 按总量降序的报表
    pub fn report(&self) -> Vec<TrafficRow> {
        let mut rows: Vec<TrafficRow> = self
            .usage
            .iter()
            .map(|(name, u)| TrafficRow {
                name: name.clone(),
                rx: u.rx,
                tx: u.tx,
                total: u.total(),
                total_gb: format_gb(u.total()),
            })
            .collect();
        rows.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
        rows
    }
}

/// 兼容历史数据：整数视为只有接收量，无法识别的形状记为 0
fn normalize_entry(value: &serde_json::Value) -> TrafficUsage {
    match value {
        serde_json::Value::Object(map) => TrafficUsage {
            rx: map.get("rx").map(as_counter).unwrap_or(0),
            tx: map.get("tx").map(as_counter).unwrap_or(0),
        },
        other => TrafficUsage {
            rx: as_counter(other),
            tx: 0,
        },
    }
}

fn as_counter(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        serde_json::Value::String(s) => s.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}
