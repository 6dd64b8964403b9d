//! The implementation of the `GPD_LOG*` environment variables.
//!
//! Note that IR logging is only meaningfully available when the `gpd` feature is enabled:
//! otherwise we expose no-op functions.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should the compiler's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log the start and end of each compilation pass.
    Pass,
    /// Log every placement, copy and spill the scheduler makes.
    Sched,
}

#[derive(Debug)]
pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        Self::from_var(env::var("GPD_LOG").ok().as_deref())
    }

    /// A [Log] which discards everything.
    pub(crate) fn disabled() -> Self {
        Self {
            level: Verbosity::Disabled,
            path: None,
        }
    }

    fn from_var(var: Option<&str>) -> Result<Self, Box<dyn Error>> {
        let Some(s) = var else {
            return Ok(Self {
                path: None,
                level: Verbosity::Error,
            });
        };
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any existing log so that later appends don't follow a previous run.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("GPD_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid GPD_LOG level '{s}': {e}"))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("GPD_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// Would a message at `level` be logged? Callers can use this to avoid formatting messages
    /// that would be discarded.
    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `level`. Messages logged at [Verbosity::Disabled] are
    /// discarded.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if !self.enabled(level) {
            return;
        }
        let prefix = match level {
            Verbosity::Disabled => return,
            Verbosity::Error => "gpir-error",
            Verbosity::Warning => "gpir-warning",
            Verbosity::Pass => "gpir-pass",
            Verbosity::Sched => "gpir-sched",
        };
        match &self.path {
            Some(p) => {
                let s = format!("{prefix}: {msg}\n");
                File::options()
                    .append(true)
                    .open(p)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => {
                eprintln!("{prefix}: {msg}");
            }
        }
    }
}

/// The points in compilation at which the program can be dumped.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[allow(dead_code)]
pub(crate) enum IRPhase {
    /// The program as handed to the compiler.
    Input,
    PostLower,
    PostValueRegalloc,
    /// The program with its bundles, before virtual registers are resolved.
    PostSched,
    PostRegalloc,
}

impl IRPhase {
    #[allow(dead_code)]
    fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        match s {
            "input" => Ok(Self::Input),
            "post-lower" => Ok(Self::PostLower),
            "post-value-regalloc" => Ok(Self::PostValueRegalloc),
            "post-sched" => Ok(Self::PostSched),
            "post-regalloc" => Ok(Self::PostRegalloc),
            _ => Err(format!("Invalid GPD_LOG_IR value: {s}").into()),
        }
    }
}

#[cfg(not(feature = "gpd"))]
mod internals {
    use super::IRPhase;
    pub(crate) fn should_log_ir(_: IRPhase) -> bool {
        false
    }
    pub(crate) fn log_ir(_: &str) {}
}

#[cfg(feature = "gpd")]
mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let x = env::var("GPD_LOG_IR").ok()?;
        let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
            [path, phases] => (*path, *phases),
            [phases] => ("-", *phases),
            _ => {
                eprintln!(
                    "gpir-error: GPD_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"
                );
                return None;
            }
        };
        let mut log_phases = HashSet::new();
        for x in phases.split(',') {
            match IRPhase::from_str(x) {
                Ok(p) => {
                    log_phases.insert(p);
                }
                Err(e) => eprintln!("gpir-error: {e}"),
            }
        }
        if path != "-" {
            File::create(path).ok();
        }
        Some((path.to_string(), log_phases))
    });

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        LOG_IR
            .as_ref()
            .is_some_and(|(_, phases)| phases.contains(&phase))
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};
