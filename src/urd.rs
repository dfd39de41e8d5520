// src/urd.rs
//
// =============================================================================
// KILN: URD PROVENANCE LOG
// =============================================================================
//
// Append-only log mapping (user, list, timestamp) to an entry: the
// joblist built at that time, a snapshot of every entry it depended
// on, a caption and the build job. Within one (user, list) timestamps
// are strictly increasing; overwriting an existing timestamp requires
// the update flag.
//
// Ghosts are derived, not stored: an entry is a ghost while any of its
// recorded dependency snapshots no longer matches the live entry it
// points at (missing, itself a ghost, or different joblist/caption).
// Re-adding the old value therefore un-ghosts dependents, exactly as a
// log replay would.
//
// On disk: one line-oriented file per (user, list). Version 4 lines
// are TAB-separated with JSON-escaped fields; version 3 used '|'
// separation. Both are readable. Appends happen under an exclusive
// lock directory next to the file.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::core::JobId;
use crate::error::{KilnError, Result};

const LOG_VERSION: u32 = 4;

// ----------------------------------------------------------------------------
// Data model
// ----------------------------------------------------------------------------

/// Snapshot of a dependency at the time it was used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrdDep {
    pub timestamp: String,
    pub joblist: Vec<(String, JobId)>,
    #[serde(default)]
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrdEntry {
    pub timestamp: String,
    #[serde(default)]
    pub caption: String,
    pub joblist: Vec<(String, JobId)>,
    /// "user/list" -> snapshot.
    #[serde(default)]
    pub deps: BTreeMap<String, UrdDep>,
    #[serde(default)]
    pub build_job: Option<JobId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddResult {
    pub new: bool,
    pub changed: bool,
    pub is_ghost: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deps: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TruncateResult {
    /// Entries removed from this list.
    pub count: usize,
    /// Entries elsewhere that became ghosts because of it.
    pub deps: usize,
}

/// Normalise a (timestamp, optional +integer) pair to its string form.
pub fn timestamp_with_serial(ts: &str, serial: Option<u64>) -> String {
    match serial {
        Some(n) => format!("{}+{}", ts, n),
        None => ts.to_string(),
    }
}

// ----------------------------------------------------------------------------
// The log
// ----------------------------------------------------------------------------

type ListKey = String; // "user/list"

pub struct UrdLog {
    dir: PathBuf,
    state: Mutex<BTreeMap<ListKey, BTreeMap<String, UrdEntry>>>,
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('/')
        .filter(|(u, l)| !u.is_empty() && !l.is_empty() && !l.contains('/'))
        .ok_or_else(|| KilnError::Server(format!("bad urd list key {:?}", key)))
}

impl UrdLog {
    /// Open the database directory and replay every list file.
    pub fn open(dir: impl AsRef<Path>) -> Result<UrdLog> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let log = UrdLog {
            dir,
            state: Mutex::new(BTreeMap::new()),
        };
        log.replay()?;
        Ok(log)
    }

    fn list_path(&self, user: &str, list: &str) -> PathBuf {
        self.dir.join(user).join(format!("{}.urd", list))
    }

    fn replay(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.clear();
        for user_entry in read_dir_sorted(&self.dir)? {
            if !user_entry.is_dir() {
                continue;
            }
            let user = match user_entry.file_name().and_then(|n| n.to_str()) {
                Some(u) => u.to_string(),
                None => continue,
            };
            for file in read_dir_sorted(&user_entry)? {
                let name = match file.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n,
                    None => continue,
                };
                let list = match name.strip_suffix(".urd") {
                    Some(l) => l.to_string(),
                    None => continue,
                };
                let key = format!("{}/{}", user, list);
                let entries = state.entry(key.clone()).or_default();
                for (lineno, line) in fs::read_to_string(&file)?.lines().enumerate() {
                    match parse_line(line) {
                        Ok(Some(LogLine::Add(entry))) => {
                            entries.insert(entry.timestamp.clone(), entry);
                        }
                        Ok(Some(LogLine::Truncate(ts))) => {
                            entries.retain(|t, _| *t < ts);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("{}:{}: {}", file.display(), lineno + 1, e);
                        }
                    }
                }
                debug!("replayed {} ({} entries)", key, entries.len());
            }
        }
        Ok(())
    }

    fn append_line(&self, user: &str, list: &str, line: &str) -> Result<()> {
        let path = self.list_path(user, list);
        fs::create_dir_all(path.parent().unwrap())?;
        let _lock = FileLock::take(&path)?;
        let mut fh = OpenOptions::new().create(true).append(true).open(&path)?;
        fh.write_all(line.as_bytes())?;
        fh.write_all(b"\n")?;
        fh.sync_data().ok();
        Ok(())
    }

    /// All known "user/list" keys.
    pub fn list(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Append (or update) an entry. `auth_user` must match the key's
    /// user part.
    pub fn add(
        &self,
        auth_user: &str,
        key: &str,
        entry: UrdEntry,
        update: bool,
    ) -> Result<AddResult> {
        let (user, list) = split_key(key)?;
        if user != auth_user {
            return Err(KilnError::UrdPermission(key.to_string()));
        }
        if entry.timestamp.is_empty() || entry.timestamp.starts_with(|c: char| !c.is_ascii_alphanumeric()) {
            return Err(KilnError::Server(format!(
                "bad timestamp {:?}",
                entry.timestamp,
            )));
        }
        let mut state = self.state.lock().unwrap();
        let entries = state.entry(key.to_string()).or_default();
        let existing = entries.get(&entry.timestamp).cloned();
        let (new, changed) = match &existing {
            Some(old) if *old == entry => (false, false),
            Some(_) => {
                if !update {
                    return Err(KilnError::UrdConflict(format!(
                        "{}/{}",
                        key, entry.timestamp,
                    )));
                }
                (false, true)
            }
            None => {
                // Append-only: fresh timestamps only at the end.
                if let Some((latest, _)) = entries.iter().next_back() {
                    if !update && entry.timestamp.as_str() <= latest.as_str() {
                        return Err(KilnError::UrdConflict(format!(
                            "{}/{} is not after {}",
                            key, entry.timestamp, latest,
                        )));
                    }
                }
                (true, false)
            }
        };
        if new || changed {
            let line = format_line(&entry);
            entries.insert(entry.timestamp.clone(), entry.clone());
            drop(state);
            self.append_line(user, list, &line)?;
        } else {
            drop(state);
        }
        let state = self.state.lock().unwrap();
        let is_ghost = ghost_in(&state, key, &entry.timestamp);
        Ok(AddResult {
            new,
            changed,
            is_ghost,
            deps: (!entry.deps.is_empty()).then_some(entry.deps.len()),
        })
    }

    /// Fetch one entry: an exact timestamp, "first", "latest", or
    /// "<=bound". Ghosted entries are not returned.
    pub fn get(&self, key: &str, timestamp: &str) -> Result<Option<UrdEntry>> {
        split_key(key)?;
        let state = self.state.lock().unwrap();
        let entries = match state.get(key) {
            Some(e) => e,
            None => return Ok(None),
        };
        let live = |ts: &str| !ghost_in(&state, key, ts);
        let found = match timestamp {
            "first" => entries.keys().find(|ts| live(ts)),
            "latest" => entries.keys().rev().find(|ts| live(ts)),
            bound if bound.starts_with("<=") => {
                let bound = &bound[2..];
                entries
                    .keys()
                    .rev()
                    .find(|ts| ts.as_str() <= bound && live(ts))
            }
            exact => entries.keys().find(|ts| ts.as_str() == exact && live(ts)),
        };
        Ok(found.map(|ts| entries[ts].clone()))
    }

    /// Timestamps strictly after `since`, ghosts excluded, in order.
    pub fn since(&self, key: &str, since: &str) -> Result<Vec<String>> {
        split_key(key)?;
        let state = self.state.lock().unwrap();
        let entries = match state.get(key) {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };
        Ok(entries
            .keys()
            .filter(|ts| ts.as_str() > since)
            .filter(|ts| !ghost_in(&state, key, ts))
            .cloned()
            .collect())
    }

    /// Remove every entry with timestamp >= ts (pass "0" to empty the
    /// list). The removal is logged, so replay reaches the same state.
    pub fn truncate(&self, auth_user: &str, key: &str, ts: &str) -> Result<TruncateResult> {
        let (user, list) = split_key(key)?;
        if user != auth_user {
            return Err(KilnError::UrdPermission(key.to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let ghosts_before = count_ghosts(&state, key);
        let entries = state.entry(key.to_string()).or_default();
        let to_remove: Vec<String> = entries
            .keys()
            .filter(|t| t.as_str() >= ts)
            .cloned()
            .collect();
        for t in &to_remove {
            entries.remove(t);
        }
        let count = to_remove.len();
        let ghosts_after = count_ghosts(&state, key);
        drop(state);
        if count > 0 {
            self.append_line(
                user,
                list,
                &format!("{}\t{}\ttruncate\t{}", LOG_VERSION, now_stamp(), json_field(ts)),
            )?;
        }
        Ok(TruncateResult {
            count,
            deps: ghosts_after.saturating_sub(ghosts_before),
        })
    }

    /// Whether an entry is currently ghosted.
    pub fn is_ghost(&self, key: &str, ts: &str) -> bool {
        let state = self.state.lock().unwrap();
        ghost_in(&state, key, ts)
    }
}

// ----------------------------------------------------------------------------
// Ghost derivation
// ----------------------------------------------------------------------------

fn ghost_in(
    state: &BTreeMap<ListKey, BTreeMap<String, UrdEntry>>,
    key: &str,
    ts: &str,
) -> bool {
    let mut visiting = BTreeSet::new();
    ghost_rec(state, key, ts, &mut visiting)
}

fn ghost_rec(
    state: &BTreeMap<ListKey, BTreeMap<String, UrdEntry>>,
    key: &str,
    ts: &str,
    visiting: &mut BTreeSet<(String, String)>,
) -> bool {
    let entry = match state.get(key).and_then(|e| e.get(ts)) {
        Some(e) => e,
        None => return true, // missing counts as ghosted for dependents
    };
    if !visiting.insert((key.to_string(), ts.to_string())) {
        return false; // dependency cycle: don't ghost on our own account
    }
    for (dep_key, dep) in &entry.deps {
        let live = state.get(dep_key).and_then(|e| e.get(&dep.timestamp));
        let matches = match live {
            Some(live) => live.joblist == dep.joblist && live.caption == dep.caption,
            None => false,
        };
        if !matches || ghost_rec(state, dep_key, &dep.timestamp, visiting) {
            visiting.remove(&(key.to_string(), ts.to_string()));
            return true;
        }
    }
    visiting.remove(&(key.to_string(), ts.to_string()));
    false
}

fn count_ghosts(state: &BTreeMap<ListKey, BTreeMap<String, UrdEntry>>, skip_key: &str) -> usize {
    let mut n = 0;
    for (key, entries) in state {
        if key == skip_key {
            continue;
        }
        for ts in entries.keys() {
            if ghost_in(state, key, ts) {
                n += 1;
            }
        }
    }
    n
}

// ----------------------------------------------------------------------------
// Line format
// ----------------------------------------------------------------------------

enum LogLine {
    Add(UrdEntry),
    Truncate(String),
}

fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn json_field<T: Serialize>(v: T) -> String {
    serde_json::to_string(&v).expect("urd field encodes")
}

/// v4: TAB separation, JSON-escaped fields.
fn format_line(entry: &UrdEntry) -> String {
    [
        LOG_VERSION.to_string(),
        now_stamp(),
        "add".to_string(),
        json_field(&entry.timestamp),
        json_field(&entry.caption),
        json_field(&entry.deps),
        json_field(&entry.joblist),
        json_field(&entry.build_job),
    ]
    .join("\t")
}

fn parse_line(line: &str) -> Result<Option<LogLine>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let (version, fields): (u32, Vec<&str>) = if line.contains('\t') {
        let fields: Vec<&str> = line.split('\t').collect();
        (parse_version(fields[0])?, fields)
    } else {
        // version 3 used '|' separation with raw fields
        let fields: Vec<&str> = line.split('|').collect();
        (parse_version(fields[0])?, fields)
    };
    if fields.len() < 4 {
        return Err(KilnError::Server(format!("truncated urd line: {:?}", line)));
    }
    let verb = fields[2];
    match (version, verb) {
        (4, "add") => {
            if fields.len() < 8 {
                return Err(KilnError::Server(format!("truncated urd line: {:?}", line)));
            }
            Ok(Some(LogLine::Add(UrdEntry {
                timestamp: serde_json::from_str(fields[3])?,
                caption: serde_json::from_str(fields[4])?,
                deps: serde_json::from_str(fields[5])?,
                joblist: serde_json::from_str(fields[6])?,
                build_job: serde_json::from_str(fields[7])?,
            })))
        }
        (4, "truncate") => Ok(Some(LogLine::Truncate(serde_json::from_str(fields[3])?))),
        (3, "add") => {
            if fields.len() < 8 {
                return Err(KilnError::Server(format!("truncated urd line: {:?}", line)));
            }
            Ok(Some(LogLine::Add(UrdEntry {
                timestamp: fields[3].to_string(),
                caption: fields[4].to_string(),
                deps: serde_json::from_str(fields[5])?,
                joblist: serde_json::from_str(fields[6])?,
                build_job: if fields[7].is_empty() {
                    None
                } else {
                    Some(fields[7].parse()?)
                },
            })))
        }
        (3, "truncate") => Ok(Some(LogLine::Truncate(fields[3].to_string()))),
        (v, verb) => Err(KilnError::Server(format!(
            "unsupported urd line (version {}, verb {:?})",
            v, verb,
        ))),
    }
}

fn parse_version(field: &str) -> Result<u32> {
    field
        .parse()
        .map_err(|_| KilnError::Server(format!("bad urd line version {:?}", field)))
}

/// Exclusive advisory lock: an atomically created directory next to
/// the list file, held for one append.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn take(for_file: &Path) -> Result<FileLock> {
        let path = for_file.with_extension("lock");
        for _ in 0..200 {
            match fs::create_dir(&path) {
                Ok(()) => return Ok(FileLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(KilnError::Server(format!(
            "urd lock stuck at {}",
            path.display(),
        )))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_dir(&self.path);
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        out.push(entry?.path());
    }
    out.sort();
    Ok(out)
}
