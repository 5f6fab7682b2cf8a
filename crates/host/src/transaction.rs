//! 配置文件事务
//!
//! 记录每一步文件系统变更及其原始状态，失败时按相反顺序撤销。
//! 未提交就被丢弃的事务（错误提前返回、中断）会在 Drop 中自动回滚。

use sitekeeper_common::fsutil::{MODE_PUBLIC, write_atomic};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
enum Step {
    Wrote { path: PathBuf, previous: Option<Vec<u8>> },
    Linked { link: PathBuf, previous: Option<PathBuf> },
    CreatedDir { path: PathBuf },
    Removed { path: PathBuf, previous: Vec<u8> },
    Unlinked { link: PathBuf, target: PathBuf },
}

#[derive(Debug, Default)]
pub struct ConfigTransaction {
    steps: Vec<Step>,
    done: bool,
}

impl ConfigTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 原子写入文件，保留旧内容以便回滚
    pub fn write_file(&mut self, path: &Path, content: &[u8]) -> io::Result<()> {
        let previous = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };
        write_atomic(path, content, MODE_PUBLIC)?;
        self.steps.push(Step::Wrote {
            path: path.to_path_buf(),
            previous,
        });
        Ok(())
    }

    /// 创建目录（含父目录）；回滚时只删除本事务新建的最上层目录
    pub fn create_dir_all(&mut self, path: &Path) -> io::Result<()> {
        let topmost_missing = path
            .ancestors()
            .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
            .last()
            .map(Path::to_path_buf);
        fs::create_dir_all(path)?;
        if let Some(created) = topmost_missing {
            self.steps.push(Step::CreatedDir { path: created });
        }
        Ok(())
    }

    /// 创建或替换符号链接
    pub fn symlink(&mut self, target: &Path, link: &Path) -> io::Result<()> {
        let previous = fs::read_link(link).ok();
        if previous.as_deref() == Some(target) {
            return Ok(());
        }
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::symlink_metadata(link).is_ok() {
            fs::remove_file(link)?;
        }
        symlink(target, link)?;
        self.steps.push(Step::Linked {
            link: link.to_path_buf(),
            previous,
        });
        Ok(())
    }

    /// 删除普通文件；不存在时不记录任何步骤
    pub fn remove_file(&mut self, path: &Path) -> io::Result<()> {
        let previous = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        fs::remove_file(path)?;
        self.steps.push(Step::Removed {
            path: path.to_path_buf(),
            previous,
        });
        Ok(())
    }

    /// 删除符号链接；不存在时不记录任何步骤
    pub fn unlink(&mut self, link: &Path) -> io::Result<()> {
        let target = match fs::read_link(link) {
            Ok(target) => target,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        fs::remove_file(link)?;
        self.steps.push(Step::Unlinked {
            link: link.to_path_buf(),
            target,
        });
        Ok(())
    }

    pub fn commit(mut self) {
        debug!(steps = self.steps.len(), "config transaction committed");
        self.steps.clear();
        self.done = true;
    }

    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        self.done = true;
        let steps = std::mem::take(&mut self.steps);
        if steps.is_empty() {
            return;
        }
        debug!(steps = steps.len(), "rolling back config transaction");
        for step in steps.into_iter().rev() {
            if let Err(err) = undo_step(&step) {
                warn!(?step, error = %err, "rollback step failed");
            }
        }
    }
}

impl Drop for ConfigTransaction {
    fn drop(&mut self) {
        if !self.done {
            self.undo();
        }
    }
}

fn undo_step(step: &Step) -> io::Result<()> {
    match step {
        Step::Wrote {
            path,
            previous: Some(bytes),
        } => write_atomic(path, bytes, MODE_PUBLIC),
        Step::Wrote {
            path,
            previous: None,
        } => remove_if_exists(path),
        Step::Linked { link, previous } => {
            remove_if_exists(link)?;
            match previous {
                Some(target) => symlink(target, link),
                None => Ok(()),
            }
        }
        Step::CreatedDir { path } => match fs::remove_dir_all(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        },
        Step::Removed { path, previous } => write_atomic(path, previous, MODE_PUBLIC),
        Step::Unlinked { link, target } => {
            remove_if_exists(link)?;
            symlink(target, link)
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
