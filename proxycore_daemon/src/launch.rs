//! Command lines for the core and bridge processes.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::Path;
use thiserror::Error;

/// Error type for launching helper processes
#[derive(Error, Debug)]
pub enum LaunchError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary not configured
    #[error("No binary configured for {0}")]
    MissingBinary(&'static str),

    /// Argument refers to a placeholder nobody filled in
    #[error("Unknown placeholder {placeholder} in argument '{argument}'")]
    UnknownPlaceholder { argument: String, placeholder: String },
}

/// Values for `{name}` placeholders in configured argument lists.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    values: BTreeMap<&'static str, String>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(self, path: &Path) -> Self {
        self.set("config", path.display().to_string())
    }

    pub fn fd(self, fd: RawFd) -> Self {
        self.set("fd", fd.to_string())
    }

    pub fn port(self, port: u16) -> Self {
        self.set("port", port.to_string())
    }

    pub fn address(self, address: &str) -> Self {
        self.set("address", address.to_string())
    }

    pub fn cache_dir(self, dir: &Path) -> Self {
        self.set("cache_dir", dir.display().to_string())
    }

    fn set(mut self, key: &'static str, value: String) -> Self {
        self.values.insert(key, value);
        self
    }

    /// Expand every placeholder in `args`.
    pub fn apply(&self, args: &[String]) -> Result<Vec<String>, LaunchError> {
        args.iter().map(|arg| self.expand(arg)).collect()
    }

    fn expand(&self, arg: &str) -> Result<String, LaunchError> {
        let mut out = String::with_capacity(arg.len());
        let mut rest = arg;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };

            let name = &after[..end];
            match self.values.get(name) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(LaunchError::UnknownPlaceholder {
                        argument: arg.to_string(),
                        placeholder: format!("{{{}}}", name),
                    })
                }
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

/// A resolved program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn build(
        what: &'static str,
        program: &str,
        args: &[String],
        placeholders: &Placeholders,
    ) -> Result<Self, LaunchError> {
        if program.trim().is_empty() {
            return Err(LaunchError::MissingBinary(what));
        }
        Ok(Self {
            program: program.to_string(),
            args: placeholders.apply(args)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_substitution() {
        let placeholders = Placeholders::new()
            .config(Path::new("/tmp/core/bridge.yml"))
            .fd(7)
            .port(2080)
            .address("127.0.0.1");

        let expanded = placeholders
            .apply(&args(&["{config}", "--fd={fd}", "socks://{address}:{port}", "plain"]))
            .unwrap();
        assert_eq!(
            expanded,
            args(&["/tmp/core/bridge.yml", "--fd=7", "socks://127.0.0.1:2080", "plain"])
        );
    }

    #[test]
    fn test_unknown_placeholder() {
        let result = Placeholders::new().apply(&args(&["{config}"]));
        assert!(matches!(
            result,
            Err(LaunchError::UnknownPlaceholder { ref placeholder, .. }) if placeholder == "{config}"
        ));
    }

    #[test]
    fn test_unterminated_brace_is_literal() {
        let expanded = Placeholders::new().apply(&args(&["{json"])).unwrap();
        assert_eq!(expanded, args(&["{json"]));
    }

    #[test]
    fn test_command_line_requires_binary() {
        let result = CommandLine::build("bridge", " ", &[], &Placeholders::new());
        assert!(matches!(result, Err(LaunchError::MissingBinary("bridge"))));

        let line = CommandLine::build(
            "core",
            "xray",
            &args(&["run", "-c", "{config}"]),
            &Placeholders::new().config(Path::new("/tmp/core.json")),
        )
        .unwrap();
        assert_eq!(line.program, "xray");
        assert_eq!(line.args, args(&["run", "-c", "/tmp/core.json"]));
    }
}
