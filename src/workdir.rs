// src/workdir.rs
//
// =============================================================================
// KILN: WORKDIR STORE
// =============================================================================
//
// Filesystem-backed store of all jobs for one named workdir:
// - translates (workdirName, N) <-> paths,
// - allocates strictly increasing job numbers (in-process mutex plus a
//   lock directory so multiple processes can't overlap),
// - tracks the <name>-LATEST symlink,
// - enumerates candidate and valid job directories.
//
// The store never deletes anything. Directories that match the name
// pattern but lack setup.json are ignored by lookups and only surfaced
// through garbage() for a separate GC to deal with.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};

use crate::core::JobId;
use crate::error::{KilnError, Result};

pub const SETUP_FILENAME: &str = "setup.json";
pub const POST_FILENAME: &str = "post.json";

/// Handle to one job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDir {
    pub id: JobId,
    pub path: PathBuf,
}

impl JobDir {
    pub fn filename(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn sliced_filename(&self, name: &str, sliceno: usize) -> PathBuf {
        self.path.join(format!("{}.{}", name, sliceno))
    }

    pub fn has_setup(&self) -> bool {
        self.filename(SETUP_FILENAME).is_file()
    }

    pub fn has_post(&self) -> bool {
        self.filename(POST_FILENAME).is_file()
    }
}

pub struct Workdir {
    pub name: String,
    pub path: PathBuf,
    pub slices: usize,
    alloc: Mutex<()>,
}

impl Workdir {
    /// Open (or initialise) a workdir. The slice count is fixed at
    /// creation and recorded in `.slices`; reopening with a different
    /// count is an error.
    pub fn open(name: &str, path: impl AsRef<Path>, slices: usize) -> Result<Workdir> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        let marker = path.join(".slices");
        match fs::read_to_string(&marker) {
            Ok(text) => {
                let recorded: usize = text.trim().parse().map_err(|_| {
                    KilnError::Server(format!("corrupt {}", marker.display()))
                })?;
                if recorded != slices {
                    return Err(KilnError::Server(format!(
                        "workdir {} has {} slices, config says {}",
                        name, recorded, slices,
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::write(&marker, format!("{}\n", slices))?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Workdir {
            name: name.to_string(),
            path,
            slices,
            alloc: Mutex::new(()),
        })
    }

    pub fn job_path(&self, id: &JobId) -> PathBuf {
        self.path.join(id.to_string())
    }

    pub fn job_dir(&self, id: &JobId) -> JobDir {
        JobDir {
            id: id.clone(),
            path: self.job_path(id),
        }
    }

    /// Job numbers present as `<name>-<digits>` directories, whether or
    /// not they have a setup file.
    pub fn list_jobs(&self) -> Result<BTreeSet<u64>> {
        let prefix = format!("{}-", self.name);
        let mut found = BTreeSet::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let fname = entry.file_name();
            let fname = match fname.to_str() {
                Some(s) => s,
                None => continue,
            };
            if let Some(digits) = fname.strip_prefix(&prefix) {
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(n) = digits.parse() {
                        found.insert(n);
                    }
                }
            }
        }
        Ok(found)
    }

    /// Jobs with a setup file (candidates for the database).
    pub fn valid_jobs(&self) -> Result<BTreeSet<JobId>> {
        Ok(self
            .list_jobs()?
            .into_iter()
            .map(|n| JobId::new(&self.name, n))
            .filter(|id| self.job_dir(id).has_setup())
            .collect())
    }

    /// Pattern-matching directories without a setup file. Never removed
    /// here; a separate GC may claim them.
    pub fn garbage(&self) -> Result<Vec<JobId>> {
        Ok(self
            .list_jobs()?
            .into_iter()
            .map(|n| JobId::new(&self.name, n))
            .filter(|id| !self.job_dir(id).has_setup())
            .collect())
    }

    /// Allocate `count` fresh job directories with numbers strictly
    /// greater than anything on disk. Concurrent callers (including
    /// other processes) never receive overlapping ranges: allocation
    /// holds the in-process mutex and a lock directory for the scan +
    /// mkdir sequence.
    pub fn allocate(&self, count: usize) -> Result<Vec<JobDir>> {
        let _guard = self.alloc.lock().expect("allocator poisoned");
        let _lock = AllocLock::take(&self.path)?;
        let next = self.list_jobs()?.iter().next_back().map_or(0, |n| n + 1);
        let mut out = Vec::with_capacity(count);
        for n in next..next + count as u64 {
            let id = JobId::new(&self.name, n);
            let dir = self.job_dir(&id);
            fs::create_dir(&dir.path).map_err(|e| {
                KilnError::WorkdirFull(format!("{} ({})", self.name, e))
            })?;
            debug!("allocated {}", id);
            out.push(dir);
        }
        if let Some(last) = out.last() {
            self.set_latest(&last.id)?;
        }
        Ok(out)
    }

    /// Job the `<name>-LATEST` symlink points to, if any.
    pub fn tip(&self) -> Option<JobId> {
        let link = self.path.join(format!("{}-LATEST", self.name));
        let target = fs::read_link(link).ok()?;
        target.file_name()?.to_str()?.parse().ok()
    }

    fn set_latest(&self, id: &JobId) -> Result<()> {
        let link = self.path.join(format!("{}-LATEST", self.name));
        let tmp = self.path.join(format!(".{}-LATEST.tmp", self.name));
        let _ = fs::remove_file(&tmp);
        #[cfg(unix)]
        std::os::unix::fs::symlink(id.to_string(), &tmp)?;
        #[cfg(not(unix))]
        fs::write(&tmp, id.to_string())?;
        fs::rename(&tmp, &link)?;
        Ok(())
    }
}

/// Cross-process allocation lock: an atomically created directory.
/// Held for the duration of one scan + mkdir sequence, so waiting a
/// little and retrying is always enough.
struct AllocLock {
    path: PathBuf,
}

impl AllocLock {
    fn take(workdir: &Path) -> Result<AllocLock> {
        let path = workdir.join(".allocate.lock");
        for attempt in 0..200 {
            match fs::create_dir(&path) {
                Ok(()) => return Ok(AllocLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 {
                        debug!("waiting for allocation lock in {}", workdir.display());
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(KilnError::Server(format!(
            "allocation lock stuck in {}",
            workdir.display(),
        )))
    }
}

impl Drop for AllocLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!("failed to release {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wd(slices: usize) -> (tempfile::TempDir, Workdir) {
        let dir = tempfile::tempdir().unwrap();
        let w = Workdir::open("test", dir.path().join("test"), slices).unwrap();
        (dir, w)
    }

    #[test]
    fn allocate_is_strictly_increasing() {
        let (_t, w) = wd(2);
        let a = w.allocate(2).unwrap();
        assert_eq!(a[0].id, JobId::new("test", 0));
        assert_eq!(a[1].id, JobId::new("test", 1));
        let b = w.allocate(1).unwrap();
        assert_eq!(b[0].id, JobId::new("test", 2));
        assert_eq!(w.tip(), Some(JobId::new("test", 2)));
    }

    #[test]
    fn numbers_never_reused_after_holes() {
        let (_t, w) = wd(2);
        let a = w.allocate(3).unwrap();
        fs::remove_dir_all(&a[2].path).unwrap();
        let b = w.allocate(1).unwrap();
        // test-2 was deleted but the scan only sees 0 and 1; a fresh
        // number beyond everything on disk is still chosen.
        assert_eq!(b[0].id.number, 2);
        let c = w.allocate(1).unwrap();
        assert_eq!(c[0].id.number, 3);
    }

    #[test]
    fn setup_less_dirs_are_garbage_not_valid() {
        let (_t, w) = wd(2);
        let a = w.allocate(1).unwrap();
        assert_eq!(w.valid_jobs().unwrap().len(), 0);
        assert_eq!(w.garbage().unwrap(), vec![a[0].id.clone()]);
        fs::write(a[0].filename(SETUP_FILENAME), b"{}").unwrap();
        assert_eq!(w.valid_jobs().unwrap().len(), 1);
        assert!(w.garbage().unwrap().is_empty());
    }

    #[test]
    fn reopen_with_wrong_slices_fails() {
        let dir = tempfile::tempdir().unwrap();
        Workdir::open("w", dir.path().join("w"), 3).unwrap();
        assert!(Workdir::open("w", dir.path().join("w"), 4).is_err());
    }

    #[test]
    fn ignores_foreign_directories() {
        let (_t, w) = wd(2);
        fs::create_dir(w.path.join("other-1")).unwrap();
        fs::create_dir(w.path.join("test-nan")).unwrap();
        assert!(w.list_jobs().unwrap().is_empty());
    }
}
