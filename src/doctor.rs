// SPDX-License-Identifier: MIT
//! `devicebroker doctor` — a handful of fast, read-only sanity checks run
//! before standing up the real server, so a bad `--sock-name` or an
//! unreachable web application shows up immediately instead of as a
//! confusing runtime error once devices start connecting.

use std::time::Duration;

use crate::config::BrokerConfig;

pub struct DoctorResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

pub async fn run_doctor(config: &BrokerConfig) -> Vec<DoctorResult> {
    vec![
        check_device_port(config).await,
        check_ipc_socket(config).await,
        check_webapp_reachable(config).await,
    ]
}

async fn check_device_port(config: &BrokerConfig) -> DoctorResult {
    let addr = format!("{}:{}", config.host, config.port);
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            drop(listener);
            DoctorResult { name: "device websocket port", passed: true, detail: format!("{addr} is free") }
        }
        Err(e) => DoctorResult {
            name: "device websocket port",
            passed: false,
            detail: format!("cannot bind {addr}: {e}"),
        },
    }
}

async fn check_ipc_socket(config: &BrokerConfig) -> DoctorResult {
    let sock_name = &config.sock_name;
    if let Some(colon) = sock_name.rfind(':') {
        let addr = sock_name.clone();
        let port_ok = sock_name[colon + 1..].parse::<u16>().is_ok();
        if !port_ok {
            return DoctorResult {
                name: "ipc socket",
                passed: false,
                detail: format!("'{sock_name}' is not a valid host:port"),
            };
        }
        match tokio::net::TcpListener::bind(&sock_name[..]).await {
            Ok(listener) => {
                drop(listener);
                DoctorResult { name: "ipc socket", passed: true, detail: format!("{addr} is free") }
            }
            Err(e) => DoctorResult { name: "ipc socket", passed: false, detail: format!("cannot bind {addr}: {e}") },
        }
    } else {
        let path = std::path::Path::new(sock_name);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        match std::fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => {
                DoctorResult { name: "ipc socket", passed: true, detail: format!("{} is writable", dir.display()) }
            }
            Ok(_) => DoctorResult {
                name: "ipc socket",
                passed: false,
                detail: format!("{} exists but is not a directory", dir.display()),
            },
            Err(e) => DoctorResult {
                name: "ipc socket",
                passed: false,
                detail: format!("directory {} is not accessible: {e}", dir.display()),
            },
        }
    }
}

async fn check_webapp_reachable(config: &BrokerConfig) -> DoctorResult {
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(c) => c,
        Err(e) => {
            return DoctorResult {
                name: "web application",
                passed: false,
                detail: format!("failed to build http client: {e}"),
            }
        }
    };

    match client.get(&config.webapp_url).send().await {
        // Any response at all — even a 404 — proves the host is reachable;
        // the broker doesn't know the webapp's actual routes well enough to
        // pick a "correct" path to probe.
        Ok(resp) => DoctorResult {
            name: "web application",
            passed: true,
            detail: format!("{} responded with {}", config.webapp_url, resp.status()),
        },
        Err(e) => DoctorResult {
            name: "web application",
            passed: false,
            detail: format!("{} is unreachable: {e}", config.webapp_url),
        },
    }
}

pub fn print_doctor_results(results: &[DoctorResult]) {
    for r in results {
        let mark = if r.passed { "ok" } else { "FAIL" };
        println!("[{mark}] {}: {}", r.name, r.detail);
    }
}
