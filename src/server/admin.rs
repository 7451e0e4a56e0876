//! 管理操作的公共类型：错误、批量选择语法、请求与结果

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 面向管理员的错误
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("无效的客户端名: {0}")]
    InvalidName(String),

    #[error("客户端不存在: {0}")]
    UnknownClient(String),

    #[error("客户端已存在: {0}")]
    AlreadyExists(String),

    #[error("选择无效")]
    InvalidSelection(Vec<String>),

    #[error("没有选中任何客户端")]
    NothingSelected,

    #[error("有效天数超出范围: {0}（最多 {max} 天）", max = MAX_EXPIRY_DAYS)]
    InvalidDays(i64),

    #[error("无效的服务器地址: {0}")]
    InvalidRemote(String),

    #[error("内部错误: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AdminError {
    /// 附加说明，供 API 的 `details` 字段
    pub fn details(&self) -> Vec<String> {
        match self {
            AdminError::InvalidSelection(errors) => errors.clone(),
            _ => Vec::new(),
        }
    }
}

pub type AdminResult<T> = std::result::Result<T, AdminError>;

/// 解析批量选择：`all`、单个序号 `3`、闭区间 `2-5`（反向自动交换），逗号或空白分隔
///
/// 返回升序去重后的 1 起始序号，以及所有无法接受的片段。
pub fn parse_bulk_selection(text: &str, max_index: usize) -> (Vec<usize>, Vec<String>) {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return (Vec::new(), vec!["输入为空".to_string()]);
    }
    if text == "all" {
        return ((1..=max_index).collect(), Vec::new());
    }

    let mut chosen = std::collections::BTreeSet::new();
    let mut errors = Vec::new();

    for part in text.split(|c: char| c == ',' || c.is_whitespace()) {
        if part.is_empty() {
            continue;
        }

        if is_digits(part) {
            match part.parse::<usize>() {
                Ok(idx) if (1..=max_index).contains(&idx) => {
                    chosen.insert(idx);
                }
                _ => errors.push(format!("序号超出范围: {}", part)),
            }
            continue;
        }

        let range = part
            .split_once('-')
            .filter(|(a, b)| is_digits(a) && is_digits(b));
        let Some((a, b)) = range else {
            errors.push(format!("无法识别的片段: {}", part));
            continue;
        };

        match (a.parse::<usize>(), b.parse::<usize>()) {
            (Ok(a), Ok(b)) => {
                let (lo, hi) = if a > b { (b, a) } else { (a, b) };
                if lo < 1 || hi > max_index {
                    errors.push(format!("区间超出范围: {}", part));
                    continue;
                }
                chosen.extend(lo..=hi);
            }
            _ => errors.push(format!("区间超出范围: {}", part)),
        }
    }

    (chosen.into_iter().collect(), errors)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// 单次续期的最大天数
pub const MAX_EXPIRY_DAYS: i64 = 36_500;

/// 解析天数：无法解析时使用默认值，结果至少为 1，超过上限直接拒绝
pub fn parse_days(text: Option<&str>, default_days: i64) -> AdminResult<i64> {
    let days = text
        .and_then(|t| t.trim().parse::<i64>().ok())
        .unwrap_or(default_days)
        .max(1);
    if days > MAX_EXPIRY_DAYS {
        return Err(AdminError::InvalidDays(days));
    }
    Ok(days)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Block,
    Unblock,
    Remove,
}

impl std::fmt::Display for BulkAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BulkAction::Block => "block",
            BulkAction::Unblock => "unblock",
            BulkAction::Remove => "remove",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for BulkAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(BulkAction::Block),
            "unblock" => Ok(BulkAction::Unblock),
            "remove" | "delete" => Ok(BulkAction::Remove),
            other => Err(format!("未知操作: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    /// 天数，文本形式，无法解析时取默认值
    #[serde(default)]
    pub days: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenewRequest {
    #[serde(default)]
    pub days: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRequest {
    pub action: BulkAction,
    pub selection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFailure {
    pub name: String,
    pub reason: String,
}

/// 批量操作结果，单个失败不影响其它条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSummary {
    pub action: BulkAction,
    pub requested: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<BulkFailure>,
    /// 仅批量删除时有值：CRL 是否重新生成成功
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crl_updated: Option<bool>,
}

impl BulkSummary {
    pub fn new(action: BulkAction, requested: Vec<String>) -> Self {
        Self {
            action,
            requested,
            succeeded: Vec::new(),
            failed: Vec::new(),
            crl_updated: None,
        }
    }

    pub fn fail(&mut self, name: &str, reason: impl Into<String>) {
        self.failed.push(BulkFailure {
            name: name.to_string(),
            reason: reason.into(),
        });
    }
}
