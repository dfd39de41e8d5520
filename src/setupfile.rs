// src/setupfile.rs
//
// =============================================================================
// KILN: JOB SETUP & COMPLETION RECORDS
// =============================================================================
//
// setup.json (version 4): what a job was asked to do. Written by the
// resolver before execution; starttime/exectime updated by the server
// around the launch.
// post.json (version 1): the completion record. Written only on
// success; a job without it is invalid and ignored by the database.
//
// Options are stored as plain JSON; the ordered "_typing" pairs record
// which option leaves need coercion back into calendar/path/set types
// after a plain JSON load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::core::{DatasetId, JobId, RefOrList};
use crate::error::{KilnError, Result};
use crate::workdir::{JobDir, POST_FILENAME, SETUP_FILENAME};

pub const SETUP_VERSION: u32 = 4;
pub const POST_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecTime {
    pub total: f64,
    pub prepare: f64,
    pub analysis: f64,
    pub synthesis: f64,
    pub per_slice: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup {
    pub version: u32,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default)]
    pub caption: String,
    pub jobid: JobId,
    /// Hex sha of the method source tar at submit time.
    pub hash: String,
    pub slices: usize,
    pub seed: u64,
    #[serde(default)]
    pub options: serde_json::Map<String, Json>,
    #[serde(default)]
    pub datasets: Vec<(String, RefOrList<DatasetId>)>,
    #[serde(default)]
    pub jobs: Vec<(String, RefOrList<JobId>)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_directory: Option<PathBuf>,
    /// Seconds since epoch; set when the launcher takes the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starttime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exectime: Option<ExecTime>,
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    /// Ordered [path, typename] pairs for post-load coercion.
    #[serde(rename = "_typing", default, skip_serializing_if = "Vec::is_empty")]
    pub typing: Vec<(String, String)>,
}

impl Setup {
    pub fn total_time(&self) -> Option<f64> {
        self.exectime.as_ref().map(|e| e.total)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub version: u32,
    pub starttime: f64,
    pub endtime: f64,
    pub exectime: ExecTime,
    /// Produced files, job-relative, sorted.
    pub files: Vec<String>,
    /// Subjob id -> whether the build was actually needed.
    pub subjobs: BTreeMap<String, bool>,
}

/// Write-then-rename, so readers never observe a partial file.
pub fn save_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut bytes = serde_json::to_vec_pretty(data)?;
    bytes.push(b'\n');
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

pub fn save_setup(job: &JobDir, setup: &Setup) -> Result<()> {
    save_json(&job.filename(SETUP_FILENAME), setup)
}

pub fn load_setup(job: &JobDir) -> Result<Setup> {
    let path = job.filename(SETUP_FILENAME);
    if !path.is_file() {
        return Err(KilnError::NoSuchJob(job.id.to_string()));
    }
    let setup: Setup = load_json(&path)?;
    if setup.version != SETUP_VERSION {
        return Err(KilnError::Server(format!(
            "don't know how to load setup.json version {} (in {})",
            setup.version, job.id,
        )));
    }
    Ok(setup)
}

pub fn save_post(job: &JobDir, post: &Post) -> Result<()> {
    save_json(&job.filename(POST_FILENAME), post)
}

pub fn load_post(job: &JobDir) -> Result<Post> {
    let path = job.filename(POST_FILENAME);
    if !path.is_file() {
        return Err(KilnError::NoSuchJob(job.id.to_string()));
    }
    let post: Post = load_json(&path)?;
    if post.version != POST_VERSION {
        return Err(KilnError::Server(format!(
            "don't know how to load post.json version {} (in {})",
            post.version, job.id,
        )));
    }
    Ok(post)
}
