// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Text sidecars recorded beside each cache entry, so that a worker restarting against the
//! same workspace can resume without refetching.

use std::path::Path;

use crate::CacheLevel;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Numeric source kind, matching `EntrySource::kind()`.
    pub entry_type: u32,
    pub cache_level: CacheLevel,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub transfer_time: u64,
    pub source: Option<String>,
}

impl Meta {
    pub fn load(path: &Path) -> Result<Meta, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("could not read {}: {e}", path.display()))?;

        let mut meta = Meta {
            entry_type: 0,
            cache_level: CacheLevel::Task,
            mode: 0o644,
            size: 0,
            mtime: 0,
            transfer_time: 0,
            source: None,
        };

        for line in text.lines() {
            let (key, value) = match line.split_once(' ') {
                Some(pair) => pair,
                None => return Err(format!("bad sidecar line in {}: {line}", path.display())),
            };
            match key {
                "type" => meta.entry_type = parse(value, path, line)?,
                "cache_level" => {
                    meta.cache_level = CacheLevel::from_wire(parse(value, path, line)?)
                }
                "mode" => {
                    meta.mode = u32::from_str_radix(value, 8)
                        .map_err(|_| format!("bad sidecar line in {}: {line}", path.display()))?
                }
                "size" => meta.size = parse(value, path, line)?,
                "mtime" => meta.mtime = parse(value, path, line)?,
                "transfer_time" => meta.transfer_time = parse(value, path, line)?,
                "source" => meta.source = Some(value.to_owned()),
                _ => return Err(format!("bad sidecar line in {}: {line}", path.display())),
            }
        }

        Ok(meta)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let mut text = format!(
            "type {}\ncache_level {}\nmode {:o}\nsize {}\nmtime {}\ntransfer_time {}\n",
            self.entry_type,
            self.cache_level.to_wire(),
            self.mode,
            self.size,
            self.mtime,
            self.transfer_time,
        );
        if let Some(source) = &self.source {
            text.push_str(&format!("source {source}\n"));
        }
        std::fs::write(path, text).map_err(|e| format!("could not write {}: {e}", path.display()))
    }
}

fn parse<T: std::str::FromStr>(value: &str, path: &Path, line: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("bad sidecar line in {}: {line}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::Meta;
    use crate::CacheLevel;

    #[test]
    fn sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.meta");
        let meta = Meta {
            entry_type: 1,
            cache_level: CacheLevel::Workflow,
            mode: 0o755,
            size: 12345,
            mtime: 1_700_000_000,
            transfer_time: 250_000,
            source: Some("https://example.com/data".to_owned()),
        };
        meta.save(&path).unwrap();
        assert_eq!(Meta::load(&path).unwrap(), meta);
    }

    #[test]
    fn junk_sidecar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.meta");
        std::fs::write(&path, "not a sidecar\n").unwrap();
        assert!(Meta::load(&path).is_err());
    }
}
