//! BluFi CLI
//!
//! 命令行配网工具：扫描设备、查看设备周围的 WiFi、下发 WiFi 凭据

use anyhow::{Context, Result};
use blufi_core::{BluFiSession, BtleplugTransport, ProvisionerSettings, SimpleStatusCallback};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

type Session = BluFiSession<BtleplugTransport>;

#[derive(Parser)]
#[command(name = "blufi", version, about = "BluFi - BLE WiFi 配网工具")]
struct Cli {
    /// 以 JSON 输出结果 (状态信息输出到 stderr)
    #[arg(long, global = true)]
    json: bool,
    /// 详细日志
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近的 BluFi 设备
    Scan {
        /// 扫描时长 (秒)，默认使用配置文件中的值
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// 列出设备扫描到的 WiFi
    WifiList {
        /// 设备地址
        #[arg(short, long)]
        device: String,
        /// 等待设备上报的时长 (秒)，默认使用配置文件中的值
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// 下发 WiFi 凭据
    Provision {
        /// 设备地址
        #[arg(short, long)]
        device: String,
        #[arg(short, long)]
        ssid: String,
        #[arg(short, long)]
        password: String,
        /// 跳过安全协商，以明文发送凭据
        #[arg(long)]
        skip_negotiation: bool,
    },
    /// 查看配置
    Config {
        /// 把当前配置写入配置文件
        #[arg(long)]
        save: bool,
    },
}

#[derive(Serialize)]
struct ProvisionReport<'a> {
    device: &'a str,
    ssid: &'a str,
    encrypted: bool,
    success: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = ProvisionerSettings::load();

    // 桥接 log crate（blufi-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if cli.verbose || settings.verbose {
        "debug,blufi_core=trace"
    } else {
        "warn,blufi_core=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();

    tracing::debug!("Settings: {:?}", settings);
    let json = cli.json;

    match cli.command {
        Commands::Scan { timeout } => {
            let duration = timeout.map_or(settings.scan_duration(), Duration::from_secs);
            let session = Session::with_settings(BtleplugTransport::new(), settings);
            session.init().await.context("蓝牙适配器不可用")?;

            if !json {
                println!("🔍 扫描 BluFi 设备 ({}s)...", duration.as_secs());
            }
            let devices = session.scan(duration).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("   未发现设备");
            } else {
                for (i, dev) in devices.iter().enumerate() {
                    let rssi = dev
                        .rssi
                        .map_or_else(|| "?".to_string(), |r| format!("{} dBm", r));
                    println!("   [{}] {} ({}) {}", i, dev.name, dev.id, rssi);
                }
            }
        }
        Commands::WifiList { device, timeout } => {
            let window = timeout.map_or(settings.timings.wifi_list_window(), Duration::from_secs);
            let mut session = Session::with_settings(BtleplugTransport::new(), settings);
            let printer = attach_status_printer(&mut session, json);
            connect_device(&mut session, &device, true).await?;

            let result = session.get_wifi_list(window).await;
            session.disconnect().await;
            finish_status_printer(session, printer).await;
            let networks = result?;

            if json {
                println!("{}", serde_json::to_string_pretty(&networks)?);
            } else {
                for net in &networks {
                    println!("   📶 {:>4} dBm  {}", net.signal_strength, net.ssid);
                }
            }
        }
        Commands::Provision {
            device,
            ssid,
            password,
            skip_negotiation,
        } => {
            let mut session = Session::with_settings(BtleplugTransport::new(), settings);
            let printer = attach_status_printer(&mut session, json);
            connect_device(&mut session, &device, !skip_negotiation).await?;

            let encrypted = session.is_negotiated();
            let result = session.configure_wifi(&ssid, &password).await;
            session.disconnect().await;
            finish_status_printer(session, printer).await;
            let outcome = result?;

            if json {
                let report = ProvisionReport {
                    device: &device,
                    ssid: &ssid,
                    encrypted,
                    success: outcome.success,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if outcome.success {
                println!("✅ 设备已连接到 {}", ssid);
            } else {
                println!("❌ 设备未报告连接成功，请检查密码或信号");
            }

            if !outcome.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if save {
                settings.save().context("保存配置失败")?;
                println!("💾 配置已保存");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// 把会话状态打印到终端；JSON 模式下输出到 stderr
///
/// 返回的任务在回调被释放、所有状态打印完后结束，结果为打印的行数。
fn attach_status_printer(session: &mut Session, json: bool) -> JoinHandle<usize> {
    let (callback, rx) = SimpleStatusCallback::new();
    session.set_status_callback(Arc::new(callback));
    spawn_status_printer(rx, json)
}

fn spawn_status_printer(mut rx: mpsc::Receiver<String>, json: bool) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut printed = 0;
        while let Some(status) = rx.recv().await {
            if json {
                eprintln!("   {}", status);
            } else {
                println!("   {}", status);
            }
            printed += 1;
        }
        printed
    })
}

/// 释放会话 (连同状态回调)，等待剩余状态打印完毕
async fn finish_status_printer(session: Session, printer: JoinHandle<usize>) {
    drop(session);
    if let Err(e) = printer.await {
        tracing::warn!("Status printer failed: {}", e);
    }
}

/// 初始化适配器、连接并 (可选) 协商；失败时断开连接
async fn connect_device(session: &mut Session, device: &str, negotiate: bool) -> Result<()> {
    let result = async {
        session.init().await.context("蓝牙适配器不可用")?;
        session
            .connect(device)
            .await
            .with_context(|| format!("连接 {} 失败", device))?;
        if negotiate {
            session.negotiate().await.context("安全协商失败")?;
        }
        anyhow::Ok(())
    }
    .await;

    if result.is_err() {
        session.disconnect().await;
    }
    result
}
