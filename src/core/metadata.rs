//! Known-topics record persisted next to the stores.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicsMeta {
    #[serde(default)]
    pub topics: Vec<TopicRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRecord {
    pub name: String,
}

impl TopicsMeta {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut topics: Vec<TopicRecord> = names
            .into_iter()
            .map(|name| TopicRecord { name: name.into() })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Self { topics }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(|record| record.name.as_str())
    }
}

/// Reads the record at `path`. A missing or empty file means no topics yet.
pub fn read_metadata(path: &Path) -> Result<TopicsMeta> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(TopicsMeta::default()),
        Err(err) => return Err(err.into()),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(TopicsMeta::default());
    }
    Ok(serde_json::from_slice(&data)?)
}

/// Writes the record to a uniquely named temp file in the same directory,
/// syncs it, then renames it over `path`. Readers see the old or the new
/// record, never a partial one.
pub fn write_metadata(path: &Path, meta: &TopicsMeta) -> Result<()> {
    let data = serde_json::to_vec(meta)?;
    let tmp = temp_path(path);
    let written = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", rand::random::<u64>()));
    path.with_file_name(name)
}
