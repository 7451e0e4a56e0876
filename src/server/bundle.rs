//! 客户端 .ovpn 配置文件生成
//!
//! 模板 `client-template.txt` 后面依次内联 CA、证书、私钥，
//! 再按 server.conf 使用的是 tls-crypt 还是 tls-auth 内联对应密钥。
//! 服务器地址变更时，模板与所有已生成的 .ovpn 一起改写 `remote` 行。

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::config::PathsConfig;
use super::store;

const CERT_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const CERT_END: &str = "-----END CERTIFICATE-----";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    None,
    Crypt,
    Auth,
}

/// 按服务端配置判断 TLS 附加密钥模式，tls-crypt 优先
pub fn detect_tls_mode(server_conf: &str) -> TlsMode {
    if server_conf.contains("tls-crypt") {
        TlsMode::Crypt
    } else if server_conf.contains("tls-auth") {
        TlsMode::Auth
    } else {
        TlsMode::None
    }
}

/// 只取证书文件中的 PEM 段，去掉 easy-rsa 输出的文本描述
pub fn extract_pem_cert(content: &str) -> String {
    let mut pem = Vec::new();
    let mut inside = false;
    for line in content.lines() {
        if line.contains(CERT_BEGIN) {
            inside = true;
        }
        if inside {
            pem.push(line);
        }
        if line.contains(CERT_END) {
            break;
        }
    }
    pem.join("\n").trim().to_string()
}

pub struct BundleParts<'a> {
    pub template: &'a str,
    pub ca: &'a str,
    pub cert: &'a str,
    pub key: &'a str,
    pub tls: Option<(TlsMode, &'a str)>,
}

pub fn render_bundle(parts: &BundleParts<'_>) -> String {
    let mut out = String::new();
    out.push_str(parts.template.trim_end());
    out.push('\n');
    push_block(&mut out, "ca", parts.ca);
    push_block(&mut out, "cert", &extract_pem_cert(parts.cert));
    push_block(&mut out, "key", parts.key);

    match parts.tls {
        Some((TlsMode::Crypt, secret)) => push_block(&mut out, "tls-crypt", secret),
        Some((TlsMode::Auth, secret)) => {
            out.push_str("key-direction 1\n");
            push_block(&mut out, "tls-auth", secret);
        }
        _ => {}
    }
    out
}

fn push_block(out: &mut String, tag: &str, body: &str) {
    out.push_str(&format!("<{}>\n{}\n</{}>\n", tag, body.trim(), tag));
}

fn template_path(paths: &PathsConfig) -> PathBuf {
    paths.openvpn_dir.join("client-template.txt")
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("无法读取 {}", path.display()))
}

/// 为已签发证书的客户端写出 `<keys_dir>/<name>.ovpn`
pub fn write_bundle(paths: &PathsConfig, name: &str) -> Result<PathBuf> {
    let template = read(&template_path(paths))?;
    let ca = read(&paths.easyrsa_dir.join("pki").join("ca.crt"))?;
    let cert = read(&paths.issued_cert(name))?;
    let key = read(&paths.private_key(name))?;

    let server_conf = fs::read_to_string(paths.openvpn_dir.join("server.conf")).unwrap_or_default();
    let mode = detect_tls_mode(&server_conf);
    let tls_secret = match mode {
        TlsMode::Crypt => fs::read_to_string(paths.openvpn_dir.join("tls-crypt.key")).ok(),
        TlsMode::Auth => fs::read_to_string(paths.openvpn_dir.join("tls-auth.key")).ok(),
        TlsMode::None => None,
    };

    let content = render_bundle(&BundleParts {
        template: &template,
        ca: &ca,
        cert: &cert,
        key: &key,
        tls: tls_secret.as_deref().map(|s| (mode, s)),
    });

    fs::create_dir_all(&paths.keys_dir)
        .with_context(|| format!("无法创建目录: {}", paths.keys_dir.display()))?;
    let target = paths.bundle_path(name);
    fs::write(&target, content).with_context(|| format!("写入 {} 失败", target.display()))?;
    info!("📦 已生成客户端配置: {}", target.display());
    Ok(target)
}

/// 把所有 `remote` 行替换为新地址，没有则追加一行
pub fn replace_remote_line(text: &str, host: &str, port: u16) -> String {
    let remote = format!("remote {} {}", host, port);
    let mut replaced = false;
    let mut lines: Vec<&str> = text
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("remote ") {
                replaced = true;
                remote.as_str()
            } else {
                line
            }
        })
        .collect();
    if !replaced {
        lines.push(&remote);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// 批量改写 remote 行的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteUpdate {
    pub template_updated: bool,
    pub bundles_updated: usize,
    pub errors: Vec<String>,
}

/// 内容有变化才写，写之前先留一份 `.bak_` 备份；返回是否改写
fn rewrite_remote(path: &Path, host: &str, port: u16) -> Result<bool> {
    let old = read(path)?;
    let new = replace_remote_line(&old, host, port);
    if new == old {
        return Ok(false);
    }
    store::archive_copy(path)?;
    fs::write(path, new).with_context(|| format!("写入 {} 失败", path.display()))?;
    Ok(true)
}

/// 改写模板与 `keys_dir` 下所有 .ovpn 的服务器地址，单个文件失败不影响其它文件
pub fn update_remote(paths: &PathsConfig, names: &[String], host: &str, port: u16) -> RemoteUpdate {
    let mut result = RemoteUpdate::default();

    let template = template_path(paths);
    if template.exists() {
        match rewrite_remote(&template, host, port) {
            Ok(changed) => result.template_updated = changed,
            Err(e) => {
                warn!("⚠️ 改写模板失败: {:#}", e);
                result.errors.push(format!("{:#}", e));
            }
        }
    } else {
        warn!("⚠️ 没有找到客户端模板: {}", template.display());
    }

    for name in names {
        match rewrite_remote(&paths.bundle_path(name), host, port) {
            Ok(true) => result.bundles_updated += 1,
            Ok(false) => {}
            Err(e) => {
                warn!("⚠️ 改写 {} 失败: {:#}", name, e);
                result.errors.push(format!("{}: {:#}", name, e));
            }
        }
    }

    info!(
        "🌐 remote 已改为 {}:{}，模板 {}，客户端配置 {} 个，错误 {} 个",
        host,
        port,
        result.template_updated,
        result.bundles_updated,
        result.errors.len()
    );
    result
}
