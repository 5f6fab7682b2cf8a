//! systemd / dpkg 封装

use crate::system::{CommandRunner, CommandSpec};
use sitekeeper_common::Result;
use std::collections::BTreeSet;
use tracing::info;

pub struct ServiceManager<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> ServiceManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    pub async fn is_active(&self, unit: &str) -> Result<bool> {
        let output = self
            .runner
            .run(&CommandSpec::new("systemctl").args(["is-active", "--quiet", unit]))
            .await?;
        Ok(output.success())
    }

    pub async fn reload(&self, unit: &str) -> Result<()> {
        self.runner
            .run_checked(&CommandSpec::new("systemctl").args(["reload", unit]))
            .await?;
        info!(unit, "service reloaded");
        Ok(())
    }
}

pub struct PackageManager<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> PackageManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    pub async fn is_installed(&self, package: &str) -> Result<bool> {
        Ok(self.installed(&[package]).await?.contains(package))
    }

    /// 返回 `packages` 中已安装的子集，一次 dpkg-query 完成
    pub async fn installed(&self, packages: &[&str]) -> Result<BTreeSet<String>> {
        if packages.is_empty() {
            return Ok(BTreeSet::new());
        }
        // 只要有一个包名未知 dpkg-query 就返回 1，但已知包的状态仍会输出
        let output = self
            .runner
            .run(
                &CommandSpec::new("dpkg-query")
                    .arg("-W")
                    .arg("-f=${Package} ${Status}\\n")
                    .args(packages.iter().copied()),
            )
            .await?;
        Ok(parse_installed(&output.stdout))
    }
}

fn parse_installed(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter(|line| line.ends_with("install ok installed"))
        .filter_map(|line| line.split_whitespace().next())
        .map(|pkg| pkg.split(':').next().unwrap_or(pkg).to_string())
        .collect()
}
