use chrono::Utc;
use rpcfleet::pm::rendezvous;
use rpcfleet::pm::stats::ResourceUsage;
use rpcfleet::pm::wire::GuestInfo;
use rpcfleet::{Config, ControlClient};
use std::path::Path;

struct AppRow {
    app: String,
    url: String,
    status: &'static str,
    pid: Option<u32>,
    uptime_secs: Option<i64>,
    memory: Option<u64>,
    cpu: Option<f64>,
}

/// `rpcfleet list`: tabulate the fleet. Running apps come from the host's
/// roster; configured-but-offline served apps show as stopped. Memory and
/// CPU are sampled locally by PID so a hung guest still shows numbers.
pub async fn run_list(config: &Config, config_path: &Path) -> anyhow::Result<()> {
    let guests = if rendezvous::is_host_online(config_path).await {
        let mut client = ControlClient::connect(config.clone(), config_path).await?;
        let guests = client.list().await?;
        client.leave().await;
        guests
    } else {
        Vec::new()
    };

    let rows = build_rows(config, &guests).await;
    print_table(&rows);

    Ok(())
}

async fn build_rows(config: &Config, guests: &[GuestInfo]) -> Vec<AppRow> {
    let now = Utc::now().timestamp();
    let mut rows = Vec::new();

    for app in &config.apps {
        let guest = guests.iter().find(|g| g.app == app.name);

        match guest {
            Some(guest) => {
                let usage = ResourceUsage::query(guest.pid).await;

                rows.push(AppRow {
                    app: app.name.clone(),
                    url: app.url.clone(),
                    status: "running",
                    pid: Some(guest.pid),
                    uptime_secs: Some((now - guest.start_time).max(0)),
                    memory: usage.memory_rss_bytes,
                    cpu: usage.cpu_percent,
                });
            }
            None if app.serve => {
                rows.push(AppRow {
                    app: app.name.clone(),
                    url: app.url.clone(),
                    status: "stopped",
                    pid: None,
                    uptime_secs: None,
                    memory: None,
                    cpu: None,
                });
            }
            None => {}
        }
    }

    rows
}

fn print_table(rows: &[AppRow]) {
    let header = ["App", "URL", "Status", "Pid", "Uptime", "Memory", "CPU"];

    let cells: Vec<[String; 7]> = rows
        .iter()
        .map(|row| {
            [
                row.app.clone(),
                row.url.clone(),
                row.status.to_string(),
                row.pid.map(|p| p.to_string()).unwrap_or_else(na),
                row.uptime_secs.map(format_uptime).unwrap_or_else(na),
                row.memory
                    .map(ResourceUsage::format_memory)
                    .unwrap_or_else(na),
                row.cpu
                    .map(|c| format!("{:.2} %", c))
                    .unwrap_or_else(na),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let print_row = |cols: &[String]| {
        let line = cols
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ");
        println!("{}", line.trim_end());
    };

    print_row(&header.map(|h| h.to_string()));
    for row in &cells {
        print_row(row.as_slice());
    }
}

fn na() -> String {
    "N/A".to_string()
}

fn format_uptime(secs: i64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
