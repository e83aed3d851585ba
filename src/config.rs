//! Kernel command-line parsing: `[OPTION ...] [ACTION ...]`.
//!
//! The kernel is handed its command line by the boot loader as a single
//! string. Options configure the kernel before any action runs; actions are
//! executed once, in order, after boot. There is no interactive shell here —
//! `run`/`ls`/`cat`/`rm` are one-shot boot actions, not a REPL.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// One boot-time action, parsed from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// `run 'PROG ARGS'` — load an ELF and wait for it to exit.
    Run(String),
    Ls,
    Cat(String),
    Rm(String),
    Put(String),
    Get(String),
}

/// Parsed kernel configuration, read once at boot and never mutated after.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub power_off: bool,
    pub format: bool,
    pub mlfqs: bool,
    pub random_seed: Option<u64>,
    pub user_pool_pages: Option<usize>,
    pub run_threads_tests: bool,
    pub actions: Vec<Action>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            power_off: false,
            format: false,
            mlfqs: false,
            random_seed: None,
            user_pool_pages: None,
            run_threads_tests: false,
            actions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownOption(String),
    UnknownAction(String),
    MissingArgument(String),
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ConfigError::UnknownOption(s) => write!(f, "unknown option '{}'", s),
            ConfigError::UnknownAction(s) => write!(f, "unknown action '{}'", s),
            ConfigError::MissingArgument(s) => write!(f, "missing argument for '{}'", s),
        }
    }
}

/// Parse the raw kernel command line. Unknown options/actions are an error —
/// the caller is expected to panic on them, matching the reference kernel's
/// "unknown options/actions panic" contract.
pub fn parse(cmdline: &str) -> Result<KernelConfig, ConfigError> {
    let mut cfg = KernelConfig::default();
    let mut tokens = tokenize(cmdline).into_iter().peekable();

    while let Some(tok) = tokens.peek() {
        if !tok.starts_with('-') {
            break;
        }
        let tok = tokens.next().unwrap();
        match tok.as_str() {
            "-h" => {}
            "-q" => cfg.power_off = true,
            "-f" => cfg.format = true,
            "-mlfqs" => cfg.mlfqs = true,
            "-threads-tests" => cfg.run_threads_tests = true,
            other if other.starts_with("-rs=") => {
                let val = &other[4..];
                cfg.random_seed = val.parse::<u64>().ok();
            }
            other if other.starts_with("-ul=") => {
                let val = &other[4..];
                cfg.user_pool_pages = val.parse::<usize>().ok();
            }
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
    }

    while let Some(tok) = tokens.next() {
        match tok.as_str() {
            "run" => {
                let arg = tokens.next().ok_or_else(|| ConfigError::MissingArgument("run".to_string()))?;
                cfg.actions.push(Action::Run(arg));
            }
            "ls" => cfg.actions.push(Action::Ls),
            "cat" => {
                let arg = tokens.next().ok_or_else(|| ConfigError::MissingArgument("cat".to_string()))?;
                cfg.actions.push(Action::Cat(arg));
            }
            "rm" => {
                let arg = tokens.next().ok_or_else(|| ConfigError::MissingArgument("rm".to_string()))?;
                cfg.actions.push(Action::Rm(arg));
            }
            "put" => {
                let arg = tokens.next().ok_or_else(|| ConfigError::MissingArgument("put".to_string()))?;
                cfg.actions.push(Action::Put(arg));
            }
            "get" => {
                let arg = tokens.next().ok_or_else(|| ConfigError::MissingArgument("get".to_string()))?;
                cfg.actions.push(Action::Get(arg));
            }
            other => return Err(ConfigError::UnknownAction(other.to_string())),
        }
    }

    Ok(cfg)
}

/// Split the command line into tokens, honoring single-quoted strings so that
/// `run 'echo x y z'` stays one token for the argument.
fn tokenize(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    let mut cur = String::new();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    out.push(core::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_options_and_run_action() {
        let cfg = parse("-q -mlfqs run 'echo x y z'").unwrap();
        assert!(cfg.power_off);
        assert!(cfg.mlfqs);
        assert_eq!(cfg.actions, alloc::vec![Action::Run("echo x y z".to_string())]);
    }

    #[test]
    fn parses_ul_and_rs() {
        let cfg = parse("-ul=128 -rs=42").unwrap();
        assert_eq!(cfg.user_pool_pages, Some(128));
        assert_eq!(cfg.random_seed, Some(42));
    }

    #[test]
    fn rejects_unknown_option() {
        assert!(parse("-bogus").is_err());
    }

    #[test]
    fn rejects_unknown_action() {
        assert!(parse("frobnicate").is_err());
    }

    #[test]
    fn multiple_actions_in_order() {
        let cfg = parse("ls cat foo.txt rm bar.txt").unwrap();
        assert_eq!(
            cfg.actions,
            alloc::vec![
                Action::Ls,
                Action::Cat("foo.txt".to_string()),
                Action::Rm("bar.txt".to_string()),
            ]
        );
    }
}
