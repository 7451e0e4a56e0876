//! OpenVPN 管理接口：踢掉在线会话
//!
//! 先走 TCP 管理端口，失败时回退到本地 unix 管理套接字。
//! 踢线是尽力而为的：返回 `true` 只代表命令发出去了，不代表服务端确认断开。

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::ManagementConfig;

/// 发送命令后等待服务端输出的时间
const RESPONSE_SETTLE: Duration = Duration::from_millis(150);

const READ_CHUNK: usize = 65535;

/// 会话控制通道
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// 踢掉客户端的在线会话，任何失败都只返回 `false`
    async fn terminate(&self, client: &str) -> bool;
}

/// 基于 OpenVPN management 接口的实现
pub struct ManagementControl {
    addr: String,
    timeout: Duration,
    socket: PathBuf,
    kill_command: String,
}

impl ManagementControl {
    pub fn new(config: &ManagementConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.host, config.port),
            timeout: config.timeout(),
            socket: config.socket.clone(),
            kill_command: config.kill_command.clone(),
        }
    }

    fn kill_line(&self, client: &str) -> String {
        format!("{} {}", self.kill_command.trim(), client)
    }

    /// 通过 TCP 管理端口执行一条命令，返回问候语加命令输出
    pub async fn tcp_command(&self, command: &str) -> Result<String> {
        let mut stream = timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| anyhow!("连接管理端口超时: {}", self.addr))?
            .with_context(|| format!("无法连接管理端口: {}", self.addr))?;

        let mut output = Vec::new();

        // 问候语 (>INFO:OpenVPN Management Interface ...)
        self.read_once(&mut stream, &mut output).await;

        let line = format!("{}\n", command.trim());
        timeout(self.timeout, stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| anyhow!("发送管理命令超时"))?
            .context("发送管理命令失败")?;

        tokio::time::sleep(RESPONSE_SETTLE).await;
        self.drain(&mut stream, &mut output).await;

        let _ = timeout(self.timeout, stream.write_all(b"quit\n")).await;

        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// 读一次，超时或出错都视为没有数据
    async fn read_once(&self, stream: &mut TcpStream, output: &mut Vec<u8>) -> usize {
        let mut buf = vec![0u8; READ_CHUNK];
        match timeout(self.timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => {
                output.extend_from_slice(&buf[..n]);
                n
            }
            _ => 0,
        }
    }

    /// 读到对端关闭、超时或者一次没读满为止
    async fn drain(&self, stream: &mut TcpStream, output: &mut Vec<u8>) {
        loop {
            let n = self.read_once(stream, output).await;
            if n == 0 || n < READ_CHUNK {
                break;
            }
        }
    }

    /// 本地 unix 管理套接字，只写入命令不等待输出
    #[cfg(unix)]
    async fn socket_command(&self, command: &str) -> Result<()> {
        use tokio::net::UnixStream;

        let mut stream = timeout(self.timeout, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| anyhow!("连接管理套接字超时: {}", self.socket.display()))?
            .with_context(|| format!("无法连接管理套接字: {}", self.socket.display()))?;

        let line = format!("{}\n", command.trim());
        timeout(self.timeout, stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| anyhow!("写入管理套接字超时"))?
            .context("写入管理套接字失败")?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn socket_command(&self, _command: &str) -> Result<()> {
        Err(anyhow!("当前平台不支持 unix 管理套接字"))
    }
}

#[async_trait]
impl SessionControl for ManagementControl {
    async fn terminate(&self, client: &str) -> bool {
        let command = self.kill_line(client);

        match self.tcp_command(&command).await {
            Ok(output) if !output.trim().is_empty() => {
                let summary: String = output.trim().chars().take(120).collect();
                info!("🔌 [mgmt] {} -> {}", command, summary);
                return true;
            }
            Ok(_) => debug!("[mgmt] {} 没有任何输出，尝试本地套接字", command),
            Err(e) => debug!("[mgmt] TCP 管理端口不可用: {:#}", e),
        }

        if !self.socket.exists() {
            warn!("⚠️ 无法踢下线 {}: 管理端口与本地套接字均不可用", client);
            return false;
        }

        match self.socket_command(&command).await {
            Ok(()) => {
                info!("🔌 [mgmt] unix {}", command);
                true
            }
            Err(e) => {
                warn!("⚠️ [mgmt] unix 套接字踢下线 {} 失败: {:#}", client, e);
                false
            }
        }
    }
}
