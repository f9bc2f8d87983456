//! 命令行构建器

use std::path::Path;

/// 按固定顺序累积 argv
#[derive(Debug, Clone, Default)]
pub struct CmdBuilder {
    argv: Vec<String>,
}

impl CmdBuilder {
    pub fn new(exe: impl AsRef<Path>) -> Self {
        Self {
            argv: vec![exe.as_ref().display().to_string()],
        }
    }

    pub fn arg(&mut self, a: impl ToString) -> &mut Self {
        self.argv.push(a.to_string());
        self
    }

    pub fn path(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.argv.push(p.as_ref().display().to_string());
        self
    }

    /// `flag value` 两个独立参数
    pub fn opt(&mut self, flag: &str, value: impl ToString) -> &mut Self {
        self.argv.push(flag.to_string());
        self.argv.push(value.to_string());
        self
    }

    pub fn arg_if(&mut self, cond: bool, a: impl ToString) -> &mut Self {
        if cond {
            self.argv.push(a.to_string());
        }
        self
    }

    pub fn args<I, S>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.argv.extend(items.into_iter().map(|s| s.to_string()));
        self
    }

    pub fn build(&self) -> Vec<String> {
        self.argv.clone()
    }
}
