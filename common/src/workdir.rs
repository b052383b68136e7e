//! Task work directories: content-addressed identity and sandbox allocation.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<hash[0..2]>/<hash[2..]>/
//!     .hash          identity marker
//!     .command.sh    task script
//!     .command.out   stdout
//!     .command.err   stderr
//!     .exitcode      written when the script exits
//! ```

use sha2::{Digest, Sha256};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::error::{Result, TaskError};
use crate::task::{ContextValue, TaskDescriptor, TaskId};

pub const HASH_FILE: &str = ".hash";
pub const SCRIPT_FILE: &str = ".command.sh";
pub const STDOUT_FILE: &str = ".command.out";
pub const STDERR_FILE: &str = ".command.err";
pub const EXIT_CODE_FILE: &str = ".exitcode";

/// Deterministic identity of a task: same process, script, inputs and
/// environment always give the same hash.
pub fn identity(task: &TaskDescriptor) -> TaskId {
    let mut hasher = Sha256::new();
    field(&mut hasher, "name", task.name.as_bytes());
    field(&mut hasher, "script", task.script.as_bytes());
    // BTreeMap iteration is ordered, so the hash does not depend on
    // insertion order.
    for (k, v) in &task.inputs {
        field(&mut hasher, "input", k.as_bytes());
        hash_value(&mut hasher, v);
    }
    for (k, v) in &task.env {
        field(&mut hasher, "env", k.as_bytes());
        field(&mut hasher, "=", v.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn field(hasher: &mut Sha256, tag: &str, bytes: &[u8]) {
    hasher.update(tag.as_bytes());
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_value(hasher: &mut Sha256, v: &ContextValue) {
    match v {
        ContextValue::Null => field(hasher, "null", &[]),
        ContextValue::Str(s) => field(hasher, "str", s.as_bytes()),
        ContextValue::Path(p) => field(hasher, "path", p.to_string_lossy().as_bytes()),
        ContextValue::List(items) => {
            field(hasher, "list", &(items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkDirManager {
    root: PathBuf,
}

impl WorkDirManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the directory for `id` lives, whether or not it exists yet.
    pub fn path_for(&self, id: &str) -> PathBuf {
        let split = id.len().min(2);
        self.root.join(&id[..split]).join(&id[split..])
    }

    /// Creates (or reuses) the directory bound to `id`. Idempotent, and safe
    /// to call concurrently: the leaf is created with an exclusive mkdir, so
    /// a second caller observes the first caller's directory.
    pub fn allocate(&self, id: &str) -> Result<PathBuf> {
        let dir = self.path_for(id);
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).map_err(|e| TaskError::storage(parent, e))?;
        }

        match fs::create_dir(&dir) {
            Ok(()) => {
                debug!("created work dir {}", dir.display());
                fs::write(dir.join(HASH_FILE), id)
                    .map_err(|e| TaskError::storage(&dir, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !dir.is_dir() {
                    return Err(TaskError::storage(
                        &dir,
                        io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
                    ));
                }
                self.check_marker(&dir, id)?;
                debug!("reusing work dir {}", dir.display());
            }
            Err(e) => return Err(TaskError::storage(&dir, e)),
        }
        Ok(dir)
    }

    fn check_marker(&self, dir: &Path, id: &str) -> Result<()> {
        let marker = dir.join(HASH_FILE);
        match fs::read_to_string(&marker) {
            Ok(found) if found.trim() == id => Ok(()),
            Ok(found) if found.trim().is_empty() => {
                // another caller created the dir and has not written the
                // marker yet
                Ok(())
            }
            Ok(found) => Err(TaskError::WorkDirCollision {
                path: dir.to_path_buf(),
                found: found.trim().to_string(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::write(&marker, id).map_err(|e| TaskError::storage(dir, e))
            }
            Err(e) => Err(TaskError::storage(&marker, e)),
        }
    }

    /// A previous run of `id` finished successfully in its directory.
    pub fn is_cached(&self, id: &str) -> bool {
        let dir = self.path_for(id);
        let marker_ok = fs::read_to_string(dir.join(HASH_FILE))
            .map(|m| m.trim() == id)
            .unwrap_or(false);
        marker_ok && read_exit_code(&dir) == Some(0)
    }

    /// Writes the task script and stages path inputs as symlinks.
    pub fn prepare(&self, dir: &Path, task: &TaskDescriptor) -> Result<()> {
        let mut script = String::from("#!/bin/bash\nset -e\n");
        for (k, v) in &task.env {
            script.push_str(&format!("export {}={}\n", k, shell_quote(v)));
        }
        script.push_str(&task.script);
        if !task.script.ends_with('\n') {
            script.push('\n');
        }
        let script_path = dir.join(SCRIPT_FILE);
        fs::write(&script_path, script).map_err(|e| TaskError::storage(&script_path, e))?;

        for input in task.inputs.values().flat_map(|v| v.paths()) {
            let name = match input.file_name() {
                Some(name) => name,
                None => continue,
            };
            let link = dir.join(name);
            if input.is_relative() {
                continue;
            }
            if fs::symlink_metadata(&link).is_ok() {
                fs::remove_file(&link).map_err(|e| TaskError::storage(&link, e))?;
            }
            symlink(input, &link).map_err(|e| TaskError::storage(&link, e))?;
        }
        Ok(())
    }

    /// Clears the files a previous attempt left behind.
    pub fn reset_attempt(&self, dir: &Path) -> Result<()> {
        for name in [EXIT_CODE_FILE, STDOUT_FILE, STDERR_FILE] {
            let p = dir.join(name);
            match fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(TaskError::storage(p, e)),
            }
        }
        Ok(())
    }
}

pub fn read_exit_code(dir: &Path) -> Option<i32> {
    fs::read_to_string(dir.join(EXIT_CODE_FILE))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn write_exit_code(dir: &Path, code: i32) -> io::Result<()> {
    fs::write(dir.join(EXIT_CODE_FILE), code.to_string())
}

fn shell_quote(v: &str) -> String {
    format!("'{}'", v.replace('\'', r"'\''"))
}

fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link)?;

    #[cfg(windows)]
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)?;
    } else {
        std::os::windows::fs::symlink_file(target, link)?;
    }
    Ok(())
}
