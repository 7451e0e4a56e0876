//! JSON 文件持久化
//!
//! 整表写入：先写 `<file>.tmp`，再原子 rename 覆盖，崩溃时不会留下半写文件。

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// 原子写入 JSON
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("无法创建目录: {}", parent.display()))?;
        }
    }

    let tmp = tmp_path(path);
    let json = serde_json::to_vec(value)?;
    fs::write(&tmp, json).with_context(|| format!("写入临时文件失败: {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("替换文件失败: {}", path.display()))?;
    Ok(())
}

/// 读取 JSON 文件，文件不存在时返回 `Ok(None)`
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("读取文件失败: {}", path.display())),
    };
    let value = serde_json::from_str(&content)
        .with_context(|| format!("解析 JSON 失败: {}", path.display()))?;
    Ok(Some(value))
}

/// 带时间戳后缀备份一份文件，返回备份路径；源文件不存在时返回 `Ok(None)`
pub fn archive_copy(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let suffix = Utc::now().format("%Y%m%d_%H%M%S");
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".bak_{}", suffix));
    let backup = PathBuf::from(name);
    fs::copy(path, &backup)
        .with_context(|| format!("备份文件失败: {}", backup.display()))?;
    Ok(Some(backup))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_atomic_write_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("table.json");

        let mut map = BTreeMap::new();
        map.insert("alice".to_string(), 1u64);
        write_json_atomic(&path, &map).unwrap();

        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
        let back: BTreeMap<String, u64> = read_json(&path).unwrap().unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_read_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(read_json::<BTreeMap<String, u64>>(&path).unwrap().is_none());

        fs::write(&path, "{not json").unwrap();
        assert!(read_json::<BTreeMap<String, u64>>(&path).is_err());
    }

    #[test]
    fn test_archive_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.json");
        assert!(archive_copy(&path).unwrap().is_none());

        fs::write(&path, "{}").unwrap();
        let backup = archive_copy(&path).unwrap().unwrap();
        assert!(backup.to_string_lossy().contains("traffic.json.bak_"));
        assert_eq!(fs::read_to_string(backup).unwrap(), "{}");
    }
}
