//! 管理命令行客户端
//!
//! 通过本机管理 API 操作正在运行的守护进程，所有写操作都由守护进程完成。

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::server::internal_api::SECRET_HEADER;
use crate::server::status::read_status;
use crate::server::traffic::format_gb;

/// 管理 API 客户端
pub struct AdminClient {
    base_url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl AdminClient {
    pub fn new(base_url: &str, secret: Option<String>) -> Result<Self> {
        // 签发证书可能较慢
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .no_proxy()
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let req = match &self.secret {
            Some(secret) => req.header(SECRET_HEADER, secret),
            None => req,
        };

        let resp = req
            .send()
            .await
            .with_context(|| format!("无法连接守护进程 {}，请确认 ovpn-guard run 正在运行", self.base_url))?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }

        let message = body["error"].as_str().unwrap_or("未知错误").to_string();
        let details: Vec<String> = body["details"]
            .as_array()
            .map(|a| a.iter().filter_map(|d| d.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        if details.is_empty() {
            Err(anyhow!("{} ({})", message, status))
        } else {
            Err(anyhow!("{} ({})\n  {}", message, status, details.join("\n  ")))
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        debug!("GET {}", path);
        self.send(self.client.get(self.url(path))).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        debug!("POST {}", path);
        self.send(self.client.post(self.url(path)).json(&body)).await
    }

    pub async fn status(&self) -> Result<Value> {
        self.get("/internal/status").await
    }

    pub async fn clients(&self) -> Result<Value> {
        self.get("/internal/clients").await
    }

    pub async fn create(&self, name: &str, days: Option<&str>) -> Result<Value> {
        self.post("/internal/clients", serde_json::json!({"name": name, "days": days}))
            .await
    }

    pub async fn renew(&self, name: &str, days: &str) -> Result<Value> {
        self.post(
            &format!("/internal/clients/{}/renew", name),
            serde_json::json!({"days": days}),
        )
        .await
    }

    pub async fn block(&self, name: &str) -> Result<Value> {
        self.post(&format!("/internal/clients/{}/block", name), serde_json::json!({}))
            .await
    }

    pub async fn unblock(&self, name: &str) -> Result<Value> {
        self.post(&format!("/internal/clients/{}/unblock", name), serde_json::json!({}))
            .await
    }

    pub async fn remove(&self, name: &str) -> Result<Value> {
        let req = self.client.delete(self.url(&format!("/internal/clients/{}", name)));
        self.send(req).await
    }

    pub async fn bulk_candidates(&self, action: &str) -> Result<Value> {
        self.get(&format!("/internal/clients/bulk?action={}", action)).await
    }

    pub async fn bulk(&self, action: &str, selection: &str) -> Result<Value> {
        self.post(
            "/internal/clients/bulk",
            serde_json::json!({"action": action, "selection": selection}),
        )
        .await
    }

    pub async fn traffic(&self) -> Result<Value> {
        self.get("/internal/traffic").await
    }

    pub async fn clear_traffic(&self) -> Result<Value> {
        self.post("/internal/traffic/clear", serde_json::json!({})).await
    }

    pub async fn update_remote(&self, host: &str, port: u16) -> Result<Value> {
        self.post("/internal/remote", serde_json::json!({"host": host, "port": port}))
            .await
    }
}

fn text<'a>(v: &'a Value, key: &str) -> &'a str {
    v[key].as_str().unwrap_or("-")
}

pub async fn print_status(client: &AdminClient) -> Result<()> {
    let status = client.status().await?;
    println!(
        "在线: {}/{}",
        status["online_count"].as_u64().unwrap_or(0),
        status["key_count"].as_u64().unwrap_or(0)
    );

    if let Some(online) = status["online"].as_array() {
        for c in online {
            println!(
                "  {:<24} {:<15} {:<22} ↓{} ↑{}  自 {}",
                text(c, "name"),
                text(c, "tunnel_addr"),
                text(c, "real_address"),
                format_gb(c["bytes_recv"].as_u64().unwrap_or(0)),
                format_gb(c["bytes_sent"].as_u64().unwrap_or(0)),
                text(c, "connected_since"),
            );
        }
    }
    Ok(())
}

pub async fn print_clients(client: &AdminClient) -> Result<()> {
    let clients = client.clients().await?;
    let list = clients.as_array().cloned().unwrap_or_default();
    if list.is_empty() {
        println!("没有客户端");
        return Ok(());
    }

    for (i, c) in list.iter().enumerate() {
        let flag = if c["flag"] == "disabled" { "🚫" } else { "✅" };
        let online = if c["online"].as_bool().unwrap_or(false) { "🟢" } else { "⚪" };
        let expiry = match c["days_left"].as_i64() {
            Some(days) => format!("{} ({} 天)", text(c, "expire"), days),
            None => "不限期".to_string(),
        };
        println!(
            "{:>3}. {} {} {:<24} {:<32} {}",
            i + 1,
            flag,
            online,
            text(c, "name"),
            expiry,
            text(c, "traffic")
        );
    }
    Ok(())
}

pub async fn create(client: &AdminClient, name: &str, days: Option<&str>) -> Result<()> {
    let created = client.create(name, days).await?;
    println!("客户端 {} 已创建", text(&created, "name"));
    println!("有效期至: {} (~{} 天)", text(&created, "expire"), created["days"]);
    println!("配置文件: {}", text(&created, "bundle"));
    Ok(())
}

pub async fn renew(client: &AdminClient, name: &str, days: &str) -> Result<()> {
    let renewed = client.renew(name, days).await?;
    println!("客户端 {} 已续期并启用，有效期至 {}", name, text(&renewed, "expire"));
    Ok(())
}

pub async fn block(client: &AdminClient, name: &str) -> Result<()> {
    let result = client.block(name).await?;
    if result["terminated"].as_bool().unwrap_or(false) {
        println!("客户端 {} 已封禁，已发送踢线命令", name);
    } else {
        println!("客户端 {} 已封禁（踢线命令未能发送）", name);
    }
    Ok(())
}

pub async fn unblock(client: &AdminClient, name: &str) -> Result<()> {
    client.unblock(name).await?;
    println!("客户端 {} 已启用", name);
    Ok(())
}

pub async fn remove(client: &AdminClient, name: &str) -> Result<()> {
    let removed = client.remove(name).await?;
    println!("客户端 {} 已删除", name);
    if !removed["crl_updated"].as_bool().unwrap_or(false) {
        println!("⚠️ CRL 未能更新，请检查 easy-rsa");
    }
    Ok(())
}

/// 没有给出选择时只列出候选
pub async fn bulk(client: &AdminClient, action: &str, selection: Option<&str>) -> Result<()> {
    let Some(selection) = selection else {
        let candidates = client.bulk_candidates(action).await?;
        let list = candidates.as_array().cloned().unwrap_or_default();
        if list.is_empty() {
            println!("没有可操作的客户端");
        }
        for (i, name) in list.iter().enumerate() {
            println!("{:>3}. {}", i + 1, name.as_str().unwrap_or("-"));
        }
        println!("格式: all | 1 | 1,2,5 | 3-7 | 1,2,5-9");
        return Ok(());
    };

    let summary = client.bulk(action, selection).await?;
    let count = |key: &str| summary[key].as_array().map(|a| a.len()).unwrap_or(0);
    println!("请求: {}", count("requested"));
    println!("成功: {}", count("succeeded"));
    println!("失败: {}", count("failed"));
    if let Some(failed) = summary["failed"].as_array() {
        for f in failed {
            println!("  {}: {}", text(f, "name"), text(f, "reason"));
        }
    }
    if let Some(crl) = summary["crl_updated"].as_bool() {
        println!("CRL: {}", if crl { "已更新" } else { "更新失败" });
    }
    Ok(())
}

pub async fn traffic(client: &AdminClient, clear: bool) -> Result<()> {
    if clear {
        let result = client.clear_traffic().await?;
        match result["backup"].as_str() {
            Some(backup) => println!("流量统计已清空，备份: {}", backup),
            None => println!("流量统计已清空"),
        }
        return Ok(());
    }

    let rows = client.traffic().await?;
    let rows = rows.as_array().cloned().unwrap_or_default();
    if rows.is_empty() {
        println!("暂无流量数据");
        return Ok(());
    }
    println!("流量使用:");
    for r in &rows {
        println!("  • {}: {}", text(r, "name"), text(r, "total_gb"));
    }
    Ok(())
}

pub async fn update_remote(client: &AdminClient, host: &str, port: u16) -> Result<()> {
    let result = client.update_remote(host, port).await?;
    println!("服务器地址已改为 {} {}", host, port);
    println!(
        "模板: {}",
        if result["template_updated"].as_bool().unwrap_or(false) { "已更新" } else { "未变化" }
    );
    println!("客户端配置: {} 个已更新", result["bundles_updated"].as_u64().unwrap_or(0));
    if let Some(errors) = result["errors"].as_array() {
        for e in errors {
            println!("  ⚠️ {}", e.as_str().unwrap_or("-"));
        }
    }
    Ok(())
}

/// 离线解析 status 文件并以 JSON 输出
pub async fn parse_status_file(path: &Path) -> Result<()> {
    let snapshot = read_status(path).await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let app = Router::new().route(
            "/internal/clients/bulk",
            get(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "选择无效", "details": ["序号超出范围: 9"]})),
                )
            }),
        );
        let base = spawn(app).await;

        let client = AdminClient::new(&base, None).unwrap();
        let err = client.bulk_candidates("block").await.unwrap_err().to_string();
        assert!(err.contains("选择无效"));
        assert!(err.contains("序号超出范围: 9"));
    }

    #[tokio::test]
    async fn test_secret_header_is_sent() {
        let app = Router::new().route(
            "/internal/status",
            get(|headers: axum::http::HeaderMap| async move {
                let ok = headers
                    .get(SECRET_HEADER)
                    .and_then(|v| v.to_str().ok())
                    == Some("abc");
                if ok {
                    (StatusCode::OK, Json(serde_json::json!({"online_count": 3})))
                } else {
                    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "invalid secret"})))
                }
            }),
        );
        let base = spawn(app).await;

        let client = AdminClient::new(&format!("{}/", base), Some("abc".to_string())).unwrap();
        assert_eq!(client.status().await.unwrap()["online_count"], 3);

        let anonymous = AdminClient::new(&base, None).unwrap();
        assert!(anonymous.status().await.is_err());
    }
}
