//! OpenVPN status 文件解析
//!
//! status 文件（version 1）包含两段表格：
//! - `OpenVPN CLIENT LIST`：每个连接一行，带累计收发字节与连接开始时间
//! - `ROUTING TABLE`：隧道内地址 → 客户端名
//!
//! 只有出现在路由表里的客户端才算在线，连接列表里可能残留服务端已经断开的会话。
//! 文件缺失、截断或格式异常时一律返回空结果，不报错。

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

const CLIENT_LIST_HEADER: &str = "OpenVPN CLIENT LIST";
const ROUTING_TABLE_HEADER: &str = "ROUTING TABLE";
const GLOBAL_STATS_HEADER: &str = "GLOBAL STATS";
const END_MARKER: &str = "END";

/// 本轮解析出的一个连接
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveSession {
    pub name: String,
    pub real_address: String,
    pub real_port: Option<u16>,
    /// 本会话内累计接收字节（新会话从 0 开始）
    pub bytes_recv: u64,
    /// 本会话内累计发送字节
    pub bytes_sent: u64,
    /// 连接开始时间，原样保留，只用于判断是否换了会话
    pub connected_since: String,
}

/// 一次 status 解析的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub sessions: Vec<LiveSession>,
    pub online: BTreeSet<String>,
    /// 客户端名 → 隧道内地址
    pub tunnel_addrs: BTreeMap<String, String>,
}

impl StatusSnapshot {
    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.online.contains(name)
    }

    pub fn session(&self, name: &str) -> Option<&LiveSession> {
        self.sessions.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    ClientList,
    RoutingTable,
}

/// 读取并解析 status 文件，读取失败视为本轮无数据
pub async fn read_status(path: &Path) -> StatusSnapshot {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_status(&content),
        Err(e) => {
            debug!("读取 status 文件 {} 失败: {}", path.display(), e);
            StatusSnapshot::default()
        }
    }
}

/// 解析 status 文本
pub fn parse_status(content: &str) -> StatusSnapshot {
    let mut snapshot = StatusSnapshot::default();
    let mut section = Section::None;

    for raw in content.lines() {
        let line = raw.trim();

        if line.starts_with(CLIENT_LIST_HEADER) {
            section = Section::ClientList;
            continue;
        }
        if line.starts_with(ROUTING_TABLE_HEADER) {
            section = Section::RoutingTable;
            continue;
        }
        if line.is_empty() || line.starts_with(GLOBAL_STATS_HEADER) || line == END_MARKER {
            section = Section::None;
            continue;
        }

        match section {
            Section::ClientList => {
                if let Some(session) = parse_client_row(line) {
                    snapshot.sessions.push(session);
                }
            }
            Section::RoutingTable => {
                if let Some((tunnel_addr, name)) = parse_routing_row(line) {
                    snapshot.online.insert(name.to_string());
                    snapshot.tunnel_addrs.insert(name.to_string(), tunnel_addr.to_string());
                }
            }
            Section::None => {}
        }
    }

    snapshot
}

/// `Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since`
fn parse_client_row(line: &str) -> Option<LiveSession> {
    if line.starts_with("Updated,") || line.starts_with("Common Name,") {
        return None;
    }

    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 5 {
        return None;
    }

    let name = parts[0].trim();
    if name.is_empty() {
        return None;
    }

    let (bytes_recv, bytes_sent) = match (parts[2].trim().parse::<u64>(), parts[3].trim().parse::<u64>()) {
        (Ok(r), Ok(s)) => (r, s),
        _ => {
            debug!("跳过计数无法解析的连接行: {}", line);
            return None;
        }
    };

    let (real_address, real_port) = split_address(parts[1].trim());

    Some(LiveSession {
        name: name.to_string(),
        real_address,
        real_port,
        bytes_recv,
        bytes_sent,
        connected_since: parts[4].trim().to_string(),
    })
}

/// `Virtual Address,Common Name,Real Address,Last Ref`
fn parse_routing_row(line: &str) -> Option<(&str, &str)> {
    if line.starts_with("Virtual Address,") {
        return None;
    }

    let mut parts = line.split(',');
    let tunnel_addr = parts.next()?.trim();
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    Some((tunnel_addr, name))
}

/// `1.2.3.4:51820` → (`1.2.3.4`, Some(51820))
fn split_address(addr: &str) -> (String, Option<u16>) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.trim_start_matches('[').trim_end_matches(']').to_string(), Some(p)),
            Err(_) => (addr.to_string(), None),
        },
        None => (addr.to_string(), None),
    }
}
