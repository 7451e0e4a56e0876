//! 证书签发与吊销
//!
//! 通过 easy-rsa 命令行完成，核心逻辑只依赖 `CertAuthority` 接口。

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::config::PathsConfig;

/// 外部命令执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    /// stdout 与 stderr 合并后的输出
    pub output: String,
}

#[async_trait]
pub trait CertAuthority: Send + Sync {
    /// 签发客户端证书（无密码私钥）
    async fn issue(&self, name: &str) -> Result<CommandOutcome>;

    async fn revoke(&self, name: &str) -> Result<CommandOutcome>;

    /// 重新生成 CRL 并发布
    async fn gen_crl(&self) -> Result<CommandOutcome>;

    fn has_certificate(&self, name: &str) -> bool;
}

/// easy-rsa 3
pub struct EasyRsa {
    paths: PathsConfig,
}

impl EasyRsa {
    pub fn new(paths: PathsConfig) -> Self {
        Self { paths }
    }

    fn crl_source(&self) -> PathBuf {
        self.paths.easyrsa_dir.join("pki").join("crl.pem")
    }

    async fn run(&self, args: &[&str], envs: &[(&str, &str)]) -> Result<CommandOutcome> {
        let program = self.paths.easyrsa_dir.join("easyrsa");
        debug!("执行 {} {}", program.display(), args.join(" "));

        let output = Command::new(&program)
            .args(args)
            .envs(envs.iter().copied())
            .current_dir(&self.paths.easyrsa_dir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("无法执行 {}", program.display()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutcome {
            success: output.status.success(),
            output: text,
        })
    }

    /// 复制 CRL 到 OpenVPN 读取的位置，权限 0644
    fn publish_crl(&self) -> Result<()> {
        let source = self.crl_source();
        let target = &self.paths.crl_target;
        fs::copy(&source, target)
            .with_context(|| format!("复制 CRL 失败: {} -> {}", source.display(), target.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(target, fs::Permissions::from_mode(0o644))
                .with_context(|| format!("设置 CRL 权限失败: {}", target.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CertAuthority for EasyRsa {
    async fn issue(&self, name: &str) -> Result<CommandOutcome> {
        let outcome = self
            .run(
                &["--batch", "build-client-full", name, "nopass"],
                &[("EASYRSA_CERT_EXPIRE", "3650")],
            )
            .await?;
        if outcome.success {
            info!("🔐 已签发客户端证书: {}", name);
        }
        Ok(outcome)
    }

    async fn revoke(&self, name: &str) -> Result<CommandOutcome> {
        let outcome = self.run(&["--batch", "revoke", name], &[]).await?;
        if outcome.success {
            info!("🔐 已吊销客户端证书: {}", name);
        }
        Ok(outcome)
    }

    async fn gen_crl(&self) -> Result<CommandOutcome> {
        let outcome = self.run(&["gen-crl"], &[("EASYRSA_CRL_DAYS", "3650")]).await?;
        if !outcome.success {
            return Ok(outcome);
        }

        if self.crl_source().exists() {
            self.publish_crl()?;
            info!("📜 CRL 已更新: {}", self.paths.crl_target.display());
        } else {
            warn!("⚠️ gen-crl 成功但没有找到 {}", self.crl_source().display());
        }
        Ok(outcome)
    }

    fn has_certificate(&self, name: &str) -> bool {
        self.paths.issued_cert(name).exists()
    }
}
