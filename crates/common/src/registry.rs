//! 域名注册表
//!
//! 每行一条记录：`name:backend:ssl:document_root:last_modified[:created]`，
//! `#` 开头的行为注释。写入时持有咨询锁，先写临时文件再 rename，
//! 进程中断不会留下半写的注册表。读取不做缓存，每次都重新解析文件。

use crate::error::{Result, SiteError};
use crate::fsutil::{MODE_PUBLIC, write_atomic};
use crate::lock::FileLock;
use crate::models::{Backend, DomainRecord, SslState};
use crate::validation::{validate_document_root, validate_domain};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 插入或整体覆盖同名记录
    pub fn upsert(&self, record: &DomainRecord) -> Result<()> {
        let name = validate_domain(&record.name)?;
        if name != record.name {
            return Err(SiteError::validation(format!(
                "registry keys must be normalized ({} != {})",
                record.name, name
            )));
        }
        validate_document_root(&record.document_root)?;

        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut lines = self.read_raw_lines()?;
        let before = lines.len();
        lines.retain(|line| line_key(line) != Some(record.name.as_str()));
        let replaced = lines.len() != before;
        lines.push(format_record(record));
        self.write_lines(&lines)?;

        info!(
            domain = %record.name,
            backend = %record.backend,
            ssl = %record.ssl_state,
            replaced,
            "registry record written"
        );
        Ok(())
    }

    /// 删除记录；不存在时返回 `Ok(false)`
    pub fn remove(&self, name: &str) -> Result<bool> {
        let name = name.trim().to_ascii_lowercase();
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut lines = self.read_raw_lines()?;
        let before = lines.len();
        lines.retain(|line| line_key(line) != Some(name.as_str()));
        if lines.len() == before {
            debug!(domain = %name, "registry remove: no such record");
            return Ok(false);
        }
        self.write_lines(&lines)?;
        info!(domain = %name, "registry record removed");
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Result<DomainRecord> {
        let name = name.trim().to_ascii_lowercase();
        self.list()?
            .find(|record| record.name == name)
            .ok_or_else(|| SiteError::not_found(format!("domain {}", name)))
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            Ok(_) => Ok(true),
            Err(SiteError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// 遍历所有记录；文件不存在时为空。
    /// 整个文件先做 UTF-8 校验，结构性错误返回 `Registry`，只有单行格式错误会被跳过
    pub fn list(&self) -> Result<RegistryIter> {
        let lines = self.read_raw_lines()?;
        Ok(RegistryIter {
            lines: lines.into_iter(),
            line_no: 0,
            path: self.path.clone(),
        })
    }

    fn read_raw_lines(&self) -> Result<Vec<String>> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let text = String::from_utf8(bytes).map_err(|_| {
                    SiteError::registry(format!("{} is not valid UTF-8", self.path.display()))
                })?;
                Ok(text.lines().map(str::to_string).collect())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(SiteError::registry(format!(
                "cannot read {}: {}",
                self.path.display(),
                err
            ))),
        }
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        write_atomic(&self.path, content.as_bytes(), MODE_PUBLIC)?;
        Ok(())
    }
}

/// 注册表记录迭代器；格式错误的行记录警告后跳过
pub struct RegistryIter {
    lines: std::vec::IntoIter<String>,
    line_no: usize,
    path: PathBuf,
}

impl Iterator for RegistryIter {
    type Item = DomainRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            if is_comment(&line) {
                continue;
            }
            match parse_record(&line) {
                Ok(record) => return Some(record),
                Err(reason) => warn!(
                    path = %self.path.display(),
                    line = self.line_no,
                    reason = %reason,
                    "skipping malformed registry line"
                ),
            }
        }
        None
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn line_key(line: &str) -> Option<&str> {
    if is_comment(line) {
        return None;
    }
    line.split(':').next().map(str::trim)
}

pub fn format_record(record: &DomainRecord) -> String {
    format!(
        "{}:{}:{}:{}:{}:{}",
        record.name,
        record.backend,
        record.ssl_state,
        record.document_root.display(),
        record.last_modified_at.timestamp(),
        record.created_at.timestamp()
    )
}

pub fn parse_record(line: &str) -> std::result::Result<DomainRecord, String> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(format!("expected 5 or 6 fields, found {}", fields.len()));
    }

    let name = validate_domain(fields[0]).map_err(|e| e.description())?;
    let backend: Backend = fields[1].parse()?;
    let ssl_state: SslState = fields[2].parse()?;
    let document_root = PathBuf::from(fields[3]);
    validate_document_root(&document_root).map_err(|e| e.description())?;
    let last_modified_at = parse_timestamp(fields[4])?;
    let created_at = match fields.get(5) {
        Some(raw) => parse_timestamp(raw)?,
        None => last_modified_at,
    };

    Ok(DomainRecord {
        name,
        backend,
        document_root,
        ssl_state,
        created_at,
        last_modified_at,
    })
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    let secs: i64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("invalid timestamp {}", raw))?;
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| format!("timestamp out of range {}", raw))
}
