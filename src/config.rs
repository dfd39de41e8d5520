// src/config.rs
//
// =============================================================================
// KILN: SERVER CONFIGURATION
// =============================================================================
//
// Flat text format: `key: value` lines, indented continuation lines
// belonging to the previous key, `#` comments, and environment
// substitution `${VAR}` / `${VAR=default}` on every value.
//
// Required keys: slices, workdirs, method packages.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{KilnError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub slices: usize,
    /// name -> path, in declaration order.
    pub workdirs: Vec<(String, PathBuf)>,
    pub method_packages: Vec<PathBuf>,
    pub target_workdir: String,
    pub listen: Option<String>,
    pub board_listen: Option<String>,
    pub urd: Option<String>,
    pub result_directory: Option<PathBuf>,
    pub input_directory: Option<PathBuf>,
    /// Directory of the config file itself.
    pub project_directory: PathBuf,
}

impl Config {
    pub fn workdir_path(&self, name: &str) -> Result<&Path> {
        self.workdirs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.as_path())
            .ok_or_else(|| KilnError::NoSuchWorkdir(name.to_string()))
    }
}

/// Replace `${FOO=BAR}` with env FOO, falling back to BAR.
/// (`${FOO}` without default substitutes the empty string if unset;
/// plain `$FOO` is not special.)
fn interpolate(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        match tail.find('}') {
            Some(end) => {
                let var = &tail[..end];
                let (name, default) = match var.split_once('=') {
                    Some((n, d)) => (n, d),
                    None => (var, ""),
                };
                match env::var(name) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => out.push_str(default),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn parse_pair(thing: &str, val: &str, lineno: usize) -> Result<(String, PathBuf)> {
    let parts: Vec<&str> = val.split_whitespace().collect();
    if parts.len() != 2 || !parts[1].starts_with('/') {
        return Err(KilnError::Server(format!(
            "line {}: invalid {} specification {:?} (expected 'name /path')",
            lineno, thing, val,
        )));
    }
    Ok((parts[0].to_string(), PathBuf::from(parts[1])))
}

pub fn load_config(filename: impl AsRef<Path>) -> Result<Config> {
    let filename = filename.as_ref();
    let text = fs::read_to_string(filename).map_err(|e| {
        KilnError::Server(format!("cannot read config {}: {}", filename.display(), e))
    })?;

    const MULTIVALUED: &[&str] = &["workdirs", "method packages"];
    const KNOWN: &[&str] = &[
        "slices",
        "workdirs",
        "method packages",
        "target workdir",
        "listen",
        "board listen",
        "urd",
        "result directory",
        "input directory",
    ];

    let mut single: BTreeMap<String, (String, usize)> = BTreeMap::new();
    let mut multi: BTreeMap<String, Vec<(String, usize)>> = BTreeMap::new();
    let mut key: Option<String> = None;

    for (lineno, raw) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = raw.split('#').next().unwrap_or("").trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let val;
        if line == line.trim_start() {
            // New `key: value` line.
            let (k, v) = line.split_once(':').ok_or_else(|| {
                KilnError::Server(format!("line {} of config: expected a \":\"", lineno))
            })?;
            if !KNOWN.contains(&k) {
                return Err(KilnError::Server(format!(
                    "line {} of config: unknown key {:?}",
                    lineno, k,
                )));
            }
            key = Some(k.to_string());
            val = v;
        } else {
            // Continuation of the previous key.
            if key.is_none() {
                return Err(KilnError::Server(format!(
                    "line {} of config: first line indented",
                    lineno,
                )));
            }
            val = line;
        }
        let k = key.clone().unwrap();
        let v = interpolate(val).trim().to_string();
        if v.is_empty() {
            continue;
        }
        if MULTIVALUED.contains(&k.as_str()) {
            multi.entry(k).or_default().push((v, lineno));
        } else if single.insert(k.clone(), (v, lineno)).is_some() {
            return Err(KilnError::Server(format!(
                "line {} of config: {:?} doesn't take multiple values",
                lineno, k,
            )));
        }
    }

    let slices = match single.get("slices") {
        Some((v, lineno)) => v.parse::<usize>().map_err(|_| {
            KilnError::Server(format!("line {} of config: bad slices {:?}", lineno, v))
        })?,
        None => return Err(KilnError::Server("missing required key 'slices'".into())),
    };
    if slices == 0 {
        return Err(KilnError::Server("slices must be at least 1".into()));
    }

    let mut workdirs = Vec::new();
    for (v, lineno) in multi.remove("workdirs").unwrap_or_default() {
        let pair = parse_pair("workdir", &v, lineno)?;
        if workdirs.iter().any(|(n, _): &(String, _)| *n == pair.0) {
            return Err(KilnError::Server(format!(
                "line {} of config: duplicate workdir {:?}",
                lineno, pair.0,
            )));
        }
        workdirs.push(pair);
    }
    if workdirs.is_empty() {
        return Err(KilnError::Server("missing required key 'workdirs'".into()));
    }

    let method_packages: Vec<PathBuf> = multi
        .remove("method packages")
        .unwrap_or_default()
        .into_iter()
        .map(|(v, _)| PathBuf::from(v))
        .collect();
    if method_packages.is_empty() {
        return Err(KilnError::Server(
            "missing required key 'method packages'".into(),
        ));
    }

    let target_workdir = match single.remove("target workdir") {
        Some((v, lineno)) => {
            if !workdirs.iter().any(|(n, _)| *n == v) {
                return Err(KilnError::Server(format!(
                    "line {} of config: target workdir {:?} not in workdirs",
                    lineno, v,
                )));
            }
            v
        }
        None => workdirs[0].0.clone(),
    };

    let take = |single: &mut BTreeMap<String, (String, usize)>, k: &str| {
        single.remove(k).map(|(v, _)| v)
    };
    let mut single = single;
    let cfg = Config {
        slices,
        workdirs,
        method_packages,
        target_workdir,
        listen: take(&mut single, "listen"),
        board_listen: take(&mut single, "board listen"),
        urd: take(&mut single, "urd"),
        result_directory: take(&mut single, "result directory").map(PathBuf::from),
        input_directory: take(&mut single, "input directory").map(PathBuf::from),
        project_directory: filename
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf(),
    };
    debug!(
        "loaded config: {} slices, {} workdirs, target {:?}",
        cfg.slices,
        cfg.workdirs.len(),
        cfg.target_workdir
    );
    Ok(cfg)
}
