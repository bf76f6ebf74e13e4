// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The catalog directory service: managers advertise themselves in periodic UDP datagrams of
//! `key value` lines, and workers discover them with a TCP query that returns a stream of
//! nvpair records (one `key value` line per field, records separated by blank lines).


use std::time::Duration;

use log::debug;
use regex::Regex;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use wire::{tcp_connect, Link, LinkError};

pub const CATALOG_HOST: &str = "catalog.cse.nd.edu";
pub const CATALOG_PORT: u16 = 9097;

/// Seconds an announcement stays fresh; announcements repeat at shorter intervals.
pub const DEFAULT_LIFETIME: u64 = 60;

const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// One manager as seen in the catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagerEntry {
    pub entry_type: String,
    pub project: String,
    /// The manager's hostname.
    pub name: String,
    /// The address the catalog observed the announcement from.
    pub address: String,
    pub port: u16,
    pub preferred_connection: Option<String>,
    pub network_interfaces: Vec<String>,
    pub ssl: bool,
}

impl ManagerEntry {
    pub fn matches(&self, project_regex: &Regex) -> bool {
        self.entry_type == "vine_master" && project_regex.is_match(&self.project)
    }

    fn from_record(record: &[(String, String)]) -> Option<ManagerEntry> {
        let mut entry = ManagerEntry::default();
        for (key, value) in record {
            match key.as_str() {
                "type" => entry.entry_type = value.clone(),
                "project" => entry.project = value.clone(),
                "name" => entry.name = value.clone(),
                "address" => entry.address = value.clone(),
                "port" => entry.port = value.parse().ok()?,
                "manager_preferred_connection" => {
                    entry.preferred_connection = Some(value.clone())
                }
                "network_interfaces" => {
                    entry.network_interfaces =
                        value.split(',').map(str::to_owned).collect();
                }
                "ssl" => entry.ssl = value == "1" || value == "true",
                _ => {}
            }
        }
        if entry.entry_type.is_empty() || entry.address.is_empty() || entry.port == 0 {
            None
        } else {
            Some(entry)
        }
    }
}

/// Parse a stream of blank-line-separated nvpair records.
fn parse_records(text: &str) -> Vec<ManagerEntry> {
    let mut entries = Vec::new();
    let mut record: Vec<(String, String)> = Vec::new();
    for line in text.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !record.is_empty() {
                if let Some(entry) = ManagerEntry::from_record(&record) {
                    entries.push(entry);
                }
                record.clear();
            }
        } else if let Some((key, value)) = line.split_once(' ') {
            record.push((key.to_owned(), value.trim().to_owned()));
        }
    }
    entries
}

///
/// Query every known manager from the catalog. The catalog speaks plain HTTP for queries; the
/// response body is the nvpair stream.
///
pub async fn query_managers(host: &str, port: u16) -> Result<Vec<ManagerEntry>, String> {
    let stop = Instant::now() + QUERY_TIMEOUT;
    let stream = tcp_connect(host, port, stop)
        .await
        .map_err(|e| format!("could not reach catalog {host}:{port}: {e}"))?;
    let mut link = Link::from_tcp(stream);
    link.write_line("GET /query.text HTTP/1.0\r", stop)
        .await
        .map_err(|e| format!("catalog query failed: {e}"))?;
    link.write_line("\r", stop)
        .await
        .map_err(|e| format!("catalog query failed: {e}"))?;

    let mut body = String::new();
    let mut in_headers = true;
    loop {
        match link.read_line(stop).await {
            Ok(line) => {
                if in_headers {
                    if line.is_empty() {
                        in_headers = false;
                    }
                } else {
                    body.push_str(&line);
                    body.push('\n');
                }
            }
            Err(LinkError::Closed) => break,
            Err(e) => return Err(format!("catalog query failed: {e}")),
        }
    }

    let entries = parse_records(&body);
    debug!("catalog {host}:{port} returned {} entries", entries.len());
    Ok(entries)
}

/// What a manager (or a foreman's embedded manager) announces about itself.
#[derive(Clone, Debug, Default)]
pub struct ManagerSummary {
    pub project: String,
    pub name: String,
    pub port: u16,
    pub owner: String,
    pub starttime: u64,
    pub priority: i64,
    pub capacity: i64,
    pub tasks_waiting: u64,
    pub tasks_running: u64,
    pub tasks_complete: u64,
    pub workers_init: u64,
    pub workers_ready: u64,
    pub workers_busy: u64,
    pub workers_full: u64,
    pub cores_total: i64,
    pub memory_total: i64,
    pub disk_total: i64,
    pub version: String,
    pub lifetime: u64,
}

impl ManagerSummary {
    pub fn to_update_text(&self) -> String {
        let mut text = String::new();
        let mut push = |key: &str, value: String| {
            text.push_str(key);
            text.push(' ');
            text.push_str(&value);
            text.push('\n');
        };
        push("type", "vine_master".to_owned());
        push("project", self.project.clone());
        push("name", self.name.clone());
        push("port", self.port.to_string());
        push("owner", self.owner.clone());
        push("starttime", self.starttime.to_string());
        push("priority", self.priority.to_string());
        push("capacity", self.capacity.to_string());
        push("tasks_waiting", self.tasks_waiting.to_string());
        push("tasks_running", self.tasks_running.to_string());
        push("tasks_complete", self.tasks_complete.to_string());
        push("workers_init", self.workers_init.to_string());
        push("workers_ready", self.workers_ready.to_string());
        push("workers_busy", self.workers_busy.to_string());
        push("workers_full", self.workers_full.to_string());
        push("cores_total", self.cores_total.to_string());
        push("memory_total", self.memory_total.to_string());
        push("disk_total", self.disk_total.to_string());
        push("version", self.version.clone());
        push(
            "lifetime",
            if self.lifetime == 0 {
                DEFAULT_LIFETIME.to_string()
            } else {
                self.lifetime.to_string()
            },
        );
        text
    }

    /// Send one announcement datagram to the catalog.
    pub async fn announce(&self, catalog_host: &str, catalog_port: u16) -> Result<(), String> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| format!("could not bind announcement socket: {e}"))?;
        socket
            .send_to(
                self.to_update_text().as_bytes(),
                (catalog_host, catalog_port),
            )
            .await
            .map_err(|e| format!("could not announce to {catalog_host}:{catalog_port}: {e}"))?;
        Ok(())
    }
}
