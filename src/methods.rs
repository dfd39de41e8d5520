// src/methods.rs
//
// =============================================================================
// KILN: METHOD REGISTRY
// =============================================================================
//
// Methods pair a declarative MethodSpec (schemas) with a registered
// MethodRuntime (the executable phases). Discovery happens at server
// start and on explicit refresh: each configured package directory is
// scanned (methods.conf entries, or a_<name>.* autodiscovery), matched
// against the provided runtimes, and each method's source is hashed.
//
// The source hash is the sha256 of a deterministic tar of the method's
// source files (sorted entries, zeroed metadata). method.tar.gz written
// into a job is the gzip of those same tar bytes, so the recorded hash
// always matches the packaged source.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::core::MethodSpec;
use crate::error::{KilnError, Result};
use crate::launch::MethodRuntime;
use crate::workdir::JobDir;

/// Package name under which built-in methods (dataset_type et al) are
/// registered; they need no on-disk source.
pub const BUILTIN_PACKAGE: &str = "kiln.standard";

pub struct LoadedMethod {
    pub spec: MethodSpec,
    pub hash: String,
    pub source_files: Vec<PathBuf>,
    pub runtime: Arc<dyn MethodRuntime>,
}

#[derive(Default)]
pub struct MethodRegistry {
    provided: BTreeMap<String, (MethodSpec, Arc<dyn MethodRuntime>)>,
    loaded: BTreeMap<String, LoadedMethod>,
    failed: Vec<String>,
}

impl MethodRegistry {
    pub fn new() -> MethodRegistry {
        let mut reg = MethodRegistry::default();
        crate::standard::register_builtins(&mut reg);
        reg
    }

    /// Register an implementation. Discovery decides whether it is
    /// actually reachable (its package configured, its source present).
    pub fn provide(&mut self, spec: MethodSpec, runtime: Arc<dyn MethodRuntime>) {
        self.provided.insert(spec.name.clone(), (spec, runtime));
    }

    /// Scan the configured packages and (re)build the loaded set.
    pub fn discover(&mut self, config: &Config) -> Result<()> {
        self.loaded.clear();
        self.failed.clear();

        // Builtins are always available.
        for (name, (spec, runtime)) in &self.provided {
            if spec.package == BUILTIN_PACKAGE {
                self.loaded.insert(
                    name.clone(),
                    LoadedMethod {
                        spec: spec.clone(),
                        hash: synthetic_hash(spec),
                        source_files: Vec::new(),
                        runtime: runtime.clone(),
                    },
                );
            }
        }

        for package_dir in &config.method_packages {
            let names = read_methods_conf(package_dir)?;
            for name in names {
                if let Some(prev) = self.loaded.get(&name) {
                    return Err(KilnError::Server(format!(
                        "method {:?} defined both in {:?} and {}",
                        name,
                        package_dir,
                        prev.spec.package,
                    )));
                }
                let sources = source_files(package_dir, &name)?;
                if sources.is_empty() {
                    self.failed.push(format!("{} (no source)", name));
                    continue;
                }
                match self.provided.get(&name) {
                    Some((spec, runtime)) => {
                        let hash = hash_source(&sources)?;
                        self.loaded.insert(
                            name.clone(),
                            LoadedMethod {
                                spec: spec.clone(),
                                hash,
                                source_files: sources,
                                runtime: runtime.clone(),
                            },
                        );
                    }
                    None => self.failed.push(format!("{} (no implementation)", name)),
                }
            }
        }
        if !self.failed.is_empty() {
            warn!("failed to load: {}", self.failed.join(", "));
        }
        info!("updated {} methods", self.loaded.len());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&LoadedMethod> {
        self.loaded
            .get(name)
            .ok_or_else(|| KilnError::BadOption(format!("unknown method {:?}", name)))
    }

    pub fn names(&self) -> Vec<String> {
        self.loaded.keys().cloned().collect()
    }

    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    /// method -> source hash, the validity filter for the database.
    pub fn hashes(&self) -> BTreeMap<String, String> {
        self.loaded
            .iter()
            .map(|(name, m)| (name.clone(), m.hash.clone()))
            .collect()
    }

    /// Write method.tar.gz for a freshly allocated job.
    pub fn package_source(&self, name: &str, job: &JobDir) -> Result<()> {
        let method = self.get(name)?;
        let tar_bytes = tar_source(&method.source_files)?;
        let file = fs::File::create(job.filename("method.tar.gz"))?;
        let mut gz = GzEncoder::new(file, flate2::Compression::default());
        gz.write_all(&tar_bytes)?;
        gz.finish()?.sync_all().ok();
        Ok(())
    }
}

/// Names from methods.conf ("name [interpreter]" per line, # comments),
/// or a_<name>.* autodiscovery when there is no conf file.
fn read_methods_conf(package_dir: &Path) -> Result<Vec<String>> {
    let conf = package_dir.join("methods.conf");
    if conf.is_file() {
        let mut names = Vec::new();
        let text = fs::read_to_string(&conf)?;
        for (lineno, line) in text.lines().enumerate() {
            let data: Vec<&str> = line
                .split('#')
                .next()
                .unwrap_or("")
                .split_whitespace()
                .collect();
            match data.len() {
                0 => continue,
                1 | 2 => names.push(data[0].to_string()),
                _ => {
                    return Err(KilnError::Server(format!(
                        "trailing garbage on {}:{}: {}",
                        conf.display(),
                        lineno + 1,
                        line,
                    )))
                }
            }
        }
        Ok(names)
    } else if package_dir.is_dir() {
        let mut names = Vec::new();
        for entry in fs::read_dir(package_dir)? {
            let entry = entry?;
            let fname = entry.file_name();
            let fname = match fname.to_str() {
                Some(s) => s,
                None => continue,
            };
            if let Some(rest) = fname.strip_prefix("a_") {
                let name = rest.split('.').next().unwrap_or(rest);
                if !name.is_empty() && !names.contains(&name.to_string()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    } else {
        Err(KilnError::Server(format!(
            "method package {} does not exist",
            package_dir.display(),
        )))
    }
}

/// All files belonging to one method: a_<name>.* (there may be several,
/// e.g. an implementation note next to the source).
fn source_files(package_dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !package_dir.is_dir() {
        return Ok(files);
    }
    let prefix = format!("a_{}.", name);
    for entry in fs::read_dir(package_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let fname = entry.file_name();
        if let Some(s) = fname.to_str() {
            if s.starts_with(&prefix) || s == format!("a_{}", name) {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Deterministic tar: sorted paths, zeroed mtime/uid/gid, fixed mode.
fn tar_source(files: &[PathBuf]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for path in files {
        let data = fs::read(path)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| KilnError::Server(format!("unrepresentable path {:?}", path)))?;
        builder
            .append_data(&mut header, name, data.as_slice())
            .map_err(KilnError::Io)?;
    }
    builder
        .into_inner()
        .map_err(KilnError::Io)
}

fn hash_source(files: &[PathBuf]) -> Result<String> {
    let tar_bytes = tar_source(files)?;
    let mut hasher = Sha256::new();
    hasher.update(&tar_bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Builtins have no on-disk source; their hash changes when the schema
/// does.
fn synthetic_hash(spec: &MethodSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.name.as_bytes());
    for (name, ospec) in &spec.options {
        hasher.update(name.as_bytes());
        hasher.update(format!("{:?}", ospec).as_bytes());
    }
    for input in spec.datasets.iter().chain(&spec.jobs) {
        hasher.update(input.name.as_bytes());
        hasher.update([input.is_list as u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OptionSpec, PhaseMask};
    use crate::launch::NoopRuntime;

    fn spec(name: &str, package: &str) -> MethodSpec {
        MethodSpec {
            name: name.into(),
            package: package.into(),
            description: String::new(),
            options: vec![("a".into(), OptionSpec::Str { default: None })],
            datasets: vec![],
            jobs: vec![],
            phases: PhaseMask::default(),
        }
    }

    fn config_with_package(dir: &Path) -> Config {
        Config {
            slices: 2,
            workdirs: vec![("w".into(), dir.join("wd"))],
            method_packages: vec![dir.to_path_buf()],
            target_workdir: "w".into(),
            listen: None,
            board_listen: None,
            urd: None,
            result_directory: None,
            input_directory: None,
            project_directory: dir.to_path_buf(),
        }
    }

    #[test]
    fn discovery_matches_conf_to_runtimes() {
        let t = tempfile::tempdir().unwrap();
        fs::write(t.path().join("methods.conf"), "demo\nmissing # no impl\n").unwrap();
        fs::write(t.path().join("a_demo.src"), "demo source v1").unwrap();
        fs::write(t.path().join("a_missing.src"), "x").unwrap();
        let mut reg = MethodRegistry::new();
        reg.provide(spec("demo", "pkg"), Arc::new(NoopRuntime));
        reg.discover(&config_with_package(t.path())).unwrap();
        assert!(reg.get("demo").is_ok());
        assert!(reg.get("missing").is_err());
        assert_eq!(reg.failed().len(), 1);
    }

    #[test]
    fn hash_changes_with_source() {
        let t = tempfile::tempdir().unwrap();
        fs::write(t.path().join("a_demo.src"), "v1").unwrap();
        let mut reg = MethodRegistry::new();
        reg.provide(spec("demo", "pkg"), Arc::new(NoopRuntime));
        reg.discover(&config_with_package(t.path())).unwrap();
        let h1 = reg.get("demo").unwrap().hash.clone();
        fs::write(t.path().join("a_demo.src"), "v2").unwrap();
        reg.discover(&config_with_package(t.path())).unwrap();
        let h2 = reg.get("demo").unwrap().hash.clone();
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_is_deterministic() {
        let t = tempfile::tempdir().unwrap();
        fs::write(t.path().join("a_demo.src"), "same").unwrap();
        let files = source_files(t.path(), "demo").unwrap();
        assert_eq!(hash_source(&files).unwrap(), hash_source(&files).unwrap());
    }

    #[test]
    fn builtins_always_load() {
        let t = tempfile::tempdir().unwrap();
        fs::create_dir(t.path().join("empty")).unwrap();
        let mut reg = MethodRegistry::new();
        let cfg = Config {
            method_packages: vec![t.path().join("empty")],
            ..config_with_package(t.path())
        };
        reg.discover(&cfg).unwrap();
        assert!(reg.get("dataset_type").is_ok());
    }
}
