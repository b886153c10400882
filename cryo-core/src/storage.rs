// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint storage backends and image filesystems.
//!
//! [`Storage`] is where finished checkpoints live (a local directory tree,
//! or a remote object store). [`ImageFs`] is the view adapters use to read
//! or write extra files next to the engine images of one operation; it is
//! either a real directory or the streaming filesystem.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Directory-like checkpoint storage.
///
/// Methods are blocking; async callers run them under
/// `tokio::task::spawn_blocking`.
pub trait Storage: Send + Sync + fmt::Debug {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;
    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;
    fn delete(&self, path: &str) -> io::Result<()>;
    fn is_dir(&self, path: &str) -> io::Result<bool>;
    /// Lists entry names (not full paths) under `path`.
    fn read_dir(&self, path: &str) -> io::Result<Vec<String>>;
    /// Remote backends cannot hand the engine a real directory.
    fn is_remote(&self) -> bool;
}

/// Storage on the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Storage for LocalStorage {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(File::create(path)?))
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn is_dir(&self, path: &str) -> io::Result<bool> {
        Ok(fs::metadata(path)?.is_dir())
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn is_remote(&self) -> bool {
        false
    }
}

/// File access to the image directory of one operation.
pub trait ImageFs: Send + Sync {
    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>>;
    fn create(&self, name: &str) -> io::Result<Box<dyn Write + Send>>;
    /// Directory the engine sees.
    fn root(&self) -> &Path;
}

/// An image filesystem backed by a real directory.
#[derive(Debug, Clone)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} escapes the image directory", name),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl ImageFs for DirFs {
    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.resolve(name)?)?))
    }

    fn create(&self, name: &str) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(File::create(self.resolve(name)?)?))
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// Serializes `value` as JSON into `name` inside the image filesystem.
pub fn save_json<T: Serialize>(fs: &dyn ImageFs, name: &str, value: &T) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let mut file = fs.create(name)?;
    file.write_all(&data)?;
    file.flush()
}

/// Reads `name` from the image filesystem and deserializes it from JSON.
pub fn load_json<T: DeserializeOwned>(fs: &dyn ImageFs, name: &str) -> io::Result<T> {
    let mut data = Vec::new();
    fs.open(name)?.read_to_end(&mut data)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn path_str(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_local_storage_create_open_delete() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new();
        let path = path_str(&dir, "img-0");

        storage
            .create(&path)
            .unwrap()
            .write_all(b"shard")
            .unwrap();

        let mut data = String::new();
        storage
            .open(&path)
            .unwrap()
            .read_to_string(&mut data)
            .unwrap();
        assert_eq!(data, "shard");

        assert!(!storage.is_dir(&path).unwrap());
        storage.delete(&path).unwrap();
        assert!(storage.open(&path).is_err());
        assert!(!storage.is_remote());
    }

    #[test]
    fn test_local_storage_read_dir_sorted_names() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new();
        for name in ["img-1", "img-0", "process_state.json"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let root = dir.path().to_string_lossy().into_owned();
        assert!(storage.is_dir(&root).unwrap());
        assert_eq!(
            storage.read_dir(&root).unwrap(),
            vec!["img-0", "img-1", "process_state.json"]
        );
    }

    #[test]
    fn test_local_storage_delete_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("ckpt");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("core.img"), b"x").unwrap();

        LocalStorage::new()
            .delete(&nested.to_string_lossy())
            .unwrap();
        assert!(!nested.exists());
    }

    #[test]
    fn test_dir_fs_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let fs = DirFs::new(dir.path());

        let mut value = BTreeMap::new();
        value.insert("pid".to_string(), 42);
        save_json(&fs, "state.json", &value).unwrap();

        let loaded: BTreeMap<String, i32> = load_json(&fs, "state.json").unwrap();
        assert_eq!(loaded, value);
        assert_eq!(fs.root(), dir.path());
    }

    #[test]
    fn test_dir_fs_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let fs = DirFs::new(dir.path());
        assert!(fs.create("../outside").is_err());
        assert!(fs.open("/etc/passwd").is_err());
    }
}
