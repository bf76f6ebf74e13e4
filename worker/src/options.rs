// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};

use crate::resources::ManualResources;

pub const DEFAULT_IDLE_TIMEOUT: u64 = 900;
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 900;
pub const DEFAULT_MIN_BACKOFF: u64 = 1;
pub const DEFAULT_MAX_BACKOFF: u64 = 8;

/// How the worker finds a manager.
#[derive(Clone, Debug)]
pub enum Mode {
    /// Explicit `host:port` candidates, tried in order.
    Direct(Vec<(String, u16)>),
    /// Query the catalog for projects matching the regex.
    Project(String),
}

#[derive(Clone, Debug)]
pub struct Options {
    pub mode: Mode,
    pub catalog: (String, u16),
    pub password: Option<String>,
    pub idle_timeout: u64,
    pub connect_timeout: u64,
    pub min_backoff: u64,
    pub max_backoff: u64,
    pub manual: ManualResources,
    pub os_name: String,
    pub arch_name: String,
    pub workdir: Option<PathBuf>,
    pub ssl: bool,
    pub features: Vec<String>,
    pub single_shot: bool,
    /// The ppid at startup; exit when it changes.
    pub initial_ppid: Option<u32>,
    /// Overrides the manager's preferred connection hint.
    pub connection_mode: Option<String>,
    pub transfer_port: u16,
    pub symlink_fallback: bool,
    pub from_factory: Option<String>,
    /// Run in foreman mode: re-export a manager endpoint on this port.
    pub foreman_port: Option<u16>,
    /// Project name the foreman's embedded manager announces to the catalog.
    pub foreman_project: Option<String>,
}

fn command() -> Command {
    Command::new("vine_worker")
        .about("Executes tasks on behalf of a manager, found directly or via the catalog.")
        .arg(
            Arg::new("manager-name")
                .short('M')
                .long("manager-name")
                .value_name("NAME")
                .help("Name of manager (project) to contact. May be a regular expression."),
        )
        .arg(
            Arg::new("catalog")
                .short('C')
                .long("catalog")
                .value_name("HOST:PORT")
                .help("Catalog server to query for managers."),
        )
        .arg(
            Arg::new("password")
                .short('P')
                .long("password")
                .value_name("FILE")
                .help("Password file for authenticating to the manager."),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECONDS")
                .help("Set both --idle-timeout and --connect-timeout."),
        )
        .arg(
            Arg::new("idle-timeout")
                .long("idle-timeout")
                .value_name("SECONDS")
                .help("Disconnect after this time if the manager sends no work."),
        )
        .arg(
            Arg::new("connect-timeout")
                .long("connect-timeout")
                .value_name("SECONDS")
                .help("Abort after this time if no managers are available."),
        )
        .arg(
            Arg::new("min-backoff")
                .short('i')
                .long("min-backoff")
                .value_name("SECONDS")
                .help("Initial backoff interval after a failed connection attempt."),
        )
        .arg(
            Arg::new("max-backoff")
                .short('b')
                .long("max-backoff")
                .value_name("SECONDS")
                .help("Maximum backoff interval after failed connection attempts."),
        )
        .arg(
            Arg::new("cores")
                .long("cores")
                .value_name("N")
                .help("Cores reported to the manager; 'all' measures."),
        )
        .arg(
            Arg::new("memory")
                .long("memory")
                .value_name("MB")
                .help("Memory reported to the manager; 'all' measures."),
        )
        .arg(
            Arg::new("disk")
                .long("disk")
                .value_name("MB")
                .help("Disk reported to the manager; 'all' measures."),
        )
        .arg(
            Arg::new("gpus")
                .long("gpus")
                .value_name("N")
                .help("GPUs reported to the manager; defaults to 0."),
        )
        .arg(
            Arg::new("wall-time")
                .long("wall-time")
                .value_name("SECONDS")
                .help("Maximum number of seconds the worker may be active."),
        )
        .arg(
            Arg::new("arch")
                .short('A')
                .long("arch")
                .value_name("ARCH")
                .help("Architecture string reported instead of uname's."),
        )
        .arg(
            Arg::new("os")
                .short('O')
                .long("os")
                .value_name("OS")
                .help("Operating system string reported instead of uname's."),
        )
        .arg(
            Arg::new("workdir")
                .short('s')
                .long("workdir")
                .value_name("PATH")
                .help("Location for creating the worker's workspace."),
        )
        .arg(
            Arg::new("ssl")
                .long("ssl")
                .action(ArgAction::SetTrue)
                .help("Require TLS when connecting to the manager."),
        )
        .arg(
            Arg::new("feature")
                .long("feature")
                .value_name("NAME")
                .action(ArgAction::Append)
                .help("Advertise a user-defined capability. May repeat."),
        )
        .arg(
            Arg::new("single-shot")
                .long("single-shot")
                .action(ArgAction::SetTrue)
                .help("Quit immediately after the first manager disconnection."),
        )
        .arg(
            Arg::new("parent-death")
                .long("parent-death")
                .action(ArgAction::SetTrue)
                .help("Exit if the parent process dies."),
        )
        .arg(
            Arg::new("connection-mode")
                .long("connection-mode")
                .value_name("MODE")
                .help("Override the manager's address preference: by_ip, by_hostname, or by_apparent_ip."),
        )
        .arg(
            Arg::new("transfer-port")
                .long("transfer-port")
                .value_name("PORT")
                .help("Listening port for worker-to-worker transfers; default any."),
        )
        .arg(
            Arg::new("disable-symlinks")
                .long("disable-symlinks")
                .action(ArgAction::SetTrue)
                .help("Forbid the symlink fallback when hard links fail during stage-in."),
        )
        .arg(
            Arg::new("from-factory")
                .long("from-factory")
                .value_name("NAME")
                .help("Report the factory that started this worker."),
        )
        .arg(
            Arg::new("foreman-port")
                .long("foreman-port")
                .value_name("PORT")
                .help("Run as a foreman, re-exporting a manager endpoint on this port."),
        )
        .arg(
            Arg::new("foreman-project")
                .long("foreman-project")
                .value_name("NAME")
                .help("Project name the foreman announces to the catalog."),
        )
        .arg(
            Arg::new("manager")
                .value_name("HOST PORT")
                .num_args(0..=2)
                .help("Manager address: HOST PORT, or \"HOST:PORT;HOST:PORT;...\""),
        )
}

fn parse_resource(value: Option<&String>) -> Result<Option<i64>, String> {
    match value {
        None => Ok(None),
        Some(text) if text == "all" => Ok(None),
        Some(text) => text
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("expected a number or 'all', got {text:?}")),
    }
}

fn parse_secs(value: Option<&String>, default: u64) -> Result<u64, String> {
    match value {
        None => Ok(default),
        Some(text) => text
            .parse()
            .map_err(|_| format!("expected seconds, got {text:?}")),
    }
}

/// Parse `HOST:PORT;HOST:PORT;...` or a bare host with a default port.
pub fn parse_manager_addresses(spec: &str, default_port: u16) -> Result<Vec<(String, u16)>, String> {
    let mut addresses = Vec::new();
    for part in spec.split(';').filter(|p| !p.is_empty()) {
        match part.rsplit_once(':') {
            // A second colon means an IPv6 literal, not a port.
            Some((host, port)) if !host.contains(':') => {
                let port = port
                    .parse()
                    .map_err(|_| format!("invalid port for manager {part:?}"))?;
                addresses.push((host.to_owned(), port));
            }
            _ => {
                if default_port == 0 {
                    return Err(format!("no port given for manager {part:?}"));
                }
                addresses.push((part.to_owned(), default_port));
            }
        }
    }
    if addresses.is_empty() {
        return Err("no manager has been specified".to_owned());
    }
    Ok(addresses)
}

/// Read CORES/MEMORY/DISK/GPUS from the environment, unsetting each so that task commands
/// cannot observe the worker-level value.
fn resources_from_env(manual: &mut ManualResources) {
    let mut take = |name: &str, slot: &mut Option<i64>| {
        if let Ok(value) = std::env::var(name) {
            if let Ok(parsed) = value.parse() {
                *slot = Some(parsed);
            }
            std::env::remove_var(name);
        }
    };
    take("CORES", &mut manual.cores);
    take("MEMORY", &mut manual.memory);
    take("DISK", &mut manual.disk);
    take("GPUS", &mut manual.gpus);
}

pub fn parse<I, T>(args: I) -> Result<Options, String>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = command()
        .try_get_matches_from(args)
        .map_err(|e| e.to_string())?;

    let mut manual = ManualResources {
        cores: parse_resource(matches.get_one::<String>("cores"))?,
        memory: parse_resource(matches.get_one::<String>("memory"))?,
        disk: parse_resource(matches.get_one::<String>("disk"))?,
        gpus: parse_resource(matches.get_one::<String>("gpus"))?,
        wall_time_secs: matches
            .get_one::<String>("wall-time")
            .map(|t| {
                t.parse()
                    .map_err(|_| format!("expected seconds for --wall-time, got {t:?}"))
            })
            .transpose()?,
    };
    resources_from_env(&mut manual);

    let mode = match matches.get_one::<String>("manager-name") {
        Some(project) => Mode::Project(project.clone()),
        None => {
            let positional: Vec<&String> = matches
                .get_many::<String>("manager")
                .map(|values| values.collect())
                .unwrap_or_default();
            match positional.as_slice() {
                [spec] => Mode::Direct(parse_manager_addresses(spec, 0)?),
                [host, port] => {
                    let port: u16 = port
                        .parse()
                        .map_err(|_| format!("invalid manager port {port:?}"))?;
                    Mode::Direct(parse_manager_addresses(host, port)?)
                }
                _ => return Err("specify a manager address or -M PROJECT".to_owned()),
            }
        }
    };

    let catalog = match matches.get_one::<String>("catalog") {
        Some(spec) => match spec.rsplit_once(':') {
            Some((host, port)) => (
                host.to_owned(),
                port.parse()
                    .map_err(|_| format!("invalid catalog port in {spec:?}"))?,
            ),
            None => (spec.clone(), catalog::CATALOG_PORT),
        },
        None => (catalog::CATALOG_HOST.to_owned(), catalog::CATALOG_PORT),
    };

    let password = match matches.get_one::<String>("password") {
        Some(file) => Some(
            std::fs::read_to_string(file)
                .map(|text| text.trim_end().to_owned())
                .map_err(|e| format!("couldn't load password from {file}: {e}"))?,
        ),
        None => None,
    };

    let both_timeouts = matches.get_one::<String>("timeout");
    let idle_timeout = parse_secs(
        matches.get_one::<String>("idle-timeout").or(both_timeouts),
        DEFAULT_IDLE_TIMEOUT,
    )?;
    let connect_timeout = parse_secs(
        matches
            .get_one::<String>("connect-timeout")
            .or(both_timeouts),
        DEFAULT_CONNECT_TIMEOUT,
    )?;

    let min_backoff = parse_secs(matches.get_one::<String>("min-backoff"), DEFAULT_MIN_BACKOFF)?;
    let max_backoff = parse_secs(matches.get_one::<String>("max-backoff"), DEFAULT_MAX_BACKOFF)?;
    if max_backoff < min_backoff {
        return Err(format!(
            "maximum backoff interval must be at least the initial backoff interval of {min_backoff}s"
        ));
    }

    let connection_mode = match matches.get_one::<String>("connection-mode") {
        Some(mode)
            if mode == "by_ip" || mode == "by_hostname" || mode == "by_apparent_ip" =>
        {
            Some(mode.clone())
        }
        Some(mode) => {
            return Err(format!(
                "connection-mode should be one of by_ip, by_hostname, by_apparent_ip; got {mode:?}"
            ))
        }
        None => None,
    };

    let uname = uname::uname().map_err(|e| format!("could not read uname: {e}"))?;
    let os_name = matches
        .get_one::<String>("os")
        .cloned()
        .unwrap_or_else(|| uname.sysname.clone());
    let arch_name = matches
        .get_one::<String>("arch")
        .cloned()
        .unwrap_or_else(|| uname.machine.clone());

    Ok(Options {
        mode,
        catalog,
        password,
        idle_timeout,
        connect_timeout,
        min_backoff,
        max_backoff,
        manual,
        os_name,
        arch_name,
        workdir: matches.get_one::<String>("workdir").map(PathBuf::from),
        ssl: matches.get_flag("ssl"),
        features: matches
            .get_many::<String>("feature")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
        single_shot: matches.get_flag("single-shot"),
        initial_ppid: if matches.get_flag("parent-death") {
            Some(nix::unistd::getppid().as_raw() as u32)
        } else {
            None
        },
        connection_mode,
        transfer_port: parse_secs(matches.get_one::<String>("transfer-port"), 0)? as u16,
        symlink_fallback: !matches.get_flag("disable-symlinks"),
        from_factory: matches.get_one::<String>("from-factory").cloned(),
        foreman_port: matches
            .get_one::<String>("foreman-port")
            .map(|p| p.parse().map_err(|_| format!("invalid foreman port {p:?}")))
            .transpose()?,
        foreman_project: matches.get_one::<String>("foreman-project").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::{parse, parse_manager_addresses, Mode};

    #[test]
    fn direct_host_port() {
        let options = parse(["vine_worker", "manager.cluster", "9123"]).unwrap();
        match options.mode {
            Mode::Direct(ref addresses) => {
                assert_eq!(addresses, &[("manager.cluster".to_owned(), 9123)]);
            }
            ref other => panic!("expected direct mode, got {other:?}"),
        }
    }

    #[test]
    fn semicolon_list() {
        let addresses = parse_manager_addresses("a:1;b:2;c:3", 0).unwrap();
        assert_eq!(
            addresses,
            vec![
                ("a".to_owned(), 1),
                ("b".to_owned(), 2),
                ("c".to_owned(), 3),
            ]
        );
    }

    #[test]
    fn project_mode_and_overrides() {
        let options = parse([
            "vine_worker",
            "-M",
            "simulation.*",
            "--cores",
            "8",
            "--gpus",
            "all",
            "-t",
            "60",
        ])
        .unwrap();
        match options.mode {
            Mode::Project(ref regex) => assert_eq!(regex, "simulation.*"),
            ref other => panic!("expected project mode, got {other:?}"),
        }
        assert_eq!(options.manual.cores, Some(8));
        assert_eq!(options.manual.gpus, None);
        assert_eq!(options.idle_timeout, 60);
        assert_eq!(options.connect_timeout, 60);
    }

    #[test]
    fn backoff_bounds_are_validated() {
        assert!(parse(["vine_worker", "host", "1", "-i", "10", "-b", "2"]).is_err());
    }

    #[test]
    fn missing_manager_is_an_error() {
        assert!(parse(["vine_worker"]).is_err());
    }
}
