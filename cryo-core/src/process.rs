//! Facts about a live process, read from procfs.
//!
//! The state is gathered before a dump, saved next to the images and read
//! back on restore, so the restore can make the same decisions about shell
//! jobs, external files and sockets.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CryoError, CryoResult};

/// File the state is saved under, inside the images directory.
pub const STATE_FILE: &str = "process_state.json";

const TCP_ESTABLISHED: &str = "01";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub pid: u32,
    pub sid: u32,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
    #[serde(default)]
    pub open_files: Vec<OpenFile>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub gpu_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenFile {
    pub fd: i32,
    pub path: String,
    pub mount_id: u64,
    pub inode: u64,
    pub dev: u64,
    pub rdev: u64,
    pub is_tty: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub id: u64,
    pub parent_id: u64,
    pub root: String,
    pub mount_point: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Tcp,
    Unix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub kind: ConnectionKind,
    pub inode: u64,
}

impl ProcessState {
    /// A process started from a shell is in someone else's session.
    pub fn is_shell_job(&self) -> bool {
        self.sid != self.pid
    }

    pub fn has_tcp_established(&self) -> bool {
        self.connections.iter().any(|c| c.kind == ConnectionKind::Tcp)
    }

    pub fn has_unix_sockets(&self) -> bool {
        self.connections
            .iter()
            .any(|c| c.kind == ConnectionKind::Unix)
    }

    /// Open files living outside the process's own mounts, with the key
    /// the engine knows them by.
    pub fn external_files(&self) -> Vec<(&OpenFile, String)> {
        self.open_files
            .iter()
            .filter(|f| self.is_external(f))
            .map(|f| (f, f.external_key()))
            .collect()
    }

    pub fn is_external(&self, file: &OpenFile) -> bool {
        let anonymous = ["pipe", "socket", "anon_inode"]
            .iter()
            .any(|prefix| file.path.starts_with(prefix));
        let internal = self.mounts.iter().any(|m| m.id == file.mount_id);
        !(internal || anonymous)
    }
}

impl OpenFile {
    /// `tty[rdev:dev]` for terminals, `file[mnt:inode]` otherwise.
    pub fn external_key(&self) -> String {
        if self.is_tty {
            format!("tty[{:x}:{:x}]", self.rdev, self.dev)
        } else {
            format!("file[{:x}:{:x}]", self.mount_id, self.inode)
        }
    }

    pub fn uses_io_uring(&self) -> bool {
        self.path.contains("io_uring")
    }
}

/// Reads the state of `pid` from `/proc`.
pub fn read_state(pid: u32) -> CryoResult<ProcessState> {
    read_state_from(Path::new("/proc"), pid)
}

pub fn read_state_from(proc_root: &Path, pid: u32) -> CryoResult<ProcessState> {
    let dir = proc_root.join(pid.to_string());
    if !dir.exists() {
        return Err(CryoError::not_found(format!("process {} not found", pid)));
    }
    let context = |what: &str| format!("failed to read {} of process {}", what, pid);

    let stat = fs::read_to_string(dir.join("stat")).map_err(|e| CryoError::io(context("stat"), e))?;
    let sid = parse_sid(&stat).ok_or_else(|| {
        CryoError::internal(format!("malformed /proc/{}/stat", pid))
    })?;

    let status =
        fs::read_to_string(dir.join("status")).map_err(|e| CryoError::io(context("status"), e))?;
    let uids = parse_ids(&status, "Uid:");
    let gids = parse_ids(&status, "Gid:");

    let mountinfo = fs::read_to_string(dir.join("mountinfo"))
        .map_err(|e| CryoError::io(context("mountinfo"), e))?;
    let mounts = parse_mountinfo(&mountinfo);

    let open_files = read_open_files(&dir).map_err(|e| CryoError::io(context("open files"), e))?;
    let connections = read_connections(&dir, &open_files);

    Ok(ProcessState {
        pid,
        sid,
        uids,
        gids,
        open_files,
        mounts,
        connections,
        gpu_enabled: false,
    })
}

/// Session id is the sixth field; the command name may contain spaces and
/// parentheses, so parse from the last `)`.
fn parse_sid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(3)?.parse().ok()
}

fn parse_ids(status: &str, key: &str) -> Vec<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .map(|ids| ids.split_whitespace().filter_map(|id| id.parse().ok()).collect())
        .unwrap_or_default()
}

fn parse_mountinfo(mountinfo: &str) -> Vec<Mount> {
    mountinfo
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.parse().ok()?;
            let parent_id = fields.next()?.parse().ok()?;
            let _dev = fields.next()?;
            let root = unescape(fields.next()?);
            let mount_point = unescape(fields.next()?);
            Some(Mount {
                id,
                parent_id,
                root,
                mount_point,
            })
        })
        .collect()
}

/// mountinfo escapes whitespace and backslashes as octal.
fn unescape(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn read_open_files(dir: &Path) -> io::Result<Vec<OpenFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir.join("fd"))? {
        let entry = entry?;
        let Some(fd) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        // Descriptors can close while we look.
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        let path = target.to_string_lossy().into_owned();
        let (inode, dev, rdev) = match fs::metadata(entry.path()) {
            Ok(meta) => (meta.ino(), meta.dev(), meta.rdev()),
            Err(_) => (0, 0, 0),
        };
        let mount_id = fs::read_to_string(dir.join("fdinfo").join(fd.to_string()))
            .ok()
            .and_then(|info| {
                info.lines()
                    .find_map(|l| l.strip_prefix("mnt_id:"))
                    .and_then(|id| id.trim().parse().ok())
            })
            .unwrap_or(0);
        files.push(OpenFile {
            fd,
            is_tty: is_tty_path(&target),
            path,
            mount_id,
            inode,
            dev,
            rdev,
        });
    }
    files.sort_by_key(|f| f.fd);
    Ok(files)
}

fn is_tty_path(path: &Path) -> bool {
    let path = path.to_string_lossy();
    path.starts_with("/dev/pts/") || path.starts_with("/dev/tty") || path == "/dev/console"
}

/// Established TCP and unix sockets among the process's descriptors.
fn read_connections(dir: &Path, files: &[OpenFile]) -> Vec<Connection> {
    let sockets: Vec<u64> = files
        .iter()
        .filter_map(|f| f.path.strip_prefix("socket:["))
        .filter_map(|rest| rest.trim_end_matches(']').parse().ok())
        .collect();
    if sockets.is_empty() {
        return Vec::new();
    }

    let mut connections = Vec::new();
    for table in ["net/tcp", "net/tcp6"] {
        if let Ok(content) = fs::read_to_string(dir.join(table)) {
            for inode in established_tcp_inodes(&content) {
                if sockets.contains(&inode) {
                    connections.push(Connection {
                        kind: ConnectionKind::Tcp,
                        inode,
                    });
                }
            }
        }
    }
    if let Ok(content) = fs::read_to_string(dir.join("net/unix")) {
        for inode in unix_inodes(&content) {
            if sockets.contains(&inode) {
                connections.push(Connection {
                    kind: ConnectionKind::Unix,
                    inode,
                });
            }
        }
    }
    connections
}

fn established_tcp_inodes(table: &str) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.get(3) != Some(&TCP_ESTABLISHED) {
                return None;
            }
            fields.get(9)?.parse().ok()
        })
        .collect()
}

fn unix_inodes(table: &str) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(6)?.parse().ok())
        .collect()
}
