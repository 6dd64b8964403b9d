//! Compile a program DAG into scheduled, register-allocated instruction bundles.
//!
//! Compilation runs these passes in order, each mutating the [Prog] in place:
//!
//!   1. [well_formed::check_well_formed] and a topological re-sequencing of each block;
//!   2. [lower] and [well_formed::check_supported];
//!   3. value register allocation ([value_regalloc]);
//!   4. scheduling ([sched]);
//!   5. physical register allocation ([regalloc]).

use crate::log::{
    IRPhase, Log, Verbosity, log_ir, should_log_ir,
    stats::{Counts, Phase, Stats},
};
use std::{env, error::Error, time::Instant};
use thiserror::Error;

pub mod instr;
mod lower;
pub mod node;
pub mod op;
mod regalloc;
mod sched;
mod value_regalloc;
mod well_formed;

use node::Prog;

/// A failure to compile a program.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("Malformed program: {0}")]
    /// The input program breaks a structural rule (e.g. it contains a cycle or an operand without a
    /// matching edge). This is a bug in whatever built the program.
    Malformed(String),
    #[error("General error: {0}")]
    /// The program uses an operation this backend cannot express.
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong when compiling that is probably the result of a bug in the compiler.
    InternalError(String),
    #[error("Resource exhausted: {0}")]
    /// The program needs more bundle slots or registers than can be found for it, even after
    /// copying and spilling.
    ResourceExhausted(String),
    #[error("Limit exceeded: {0}")]
    /// An index space (nodes, virtual registers, the constant pool) ran out.
    LimitExceeded(String),
}

/// The hardware resources a compilation may use.
#[derive(Clone, Debug)]
pub struct Config {
    /// The number of value registers, which hold ALU results between bundles.
    pub value_regs: usize,
    /// The number of registers (of 4 components each) in the physical register file.
    pub phys_regs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            value_regs: 11,
            phys_regs: 16,
        }
    }
}

impl Config {
    /// The default configuration, overridden by the `GP_VALUE_REGS` and `GP_PHYS_REGS`
    /// environment variables if they are set.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Self::from_lookup(|x| env::var(x).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(x) = lookup("GP_VALUE_REGS") {
            config.value_regs = x
                .parse()
                .map_err(|e| format!("Invalid GP_VALUE_REGS '{x}': {e}"))?;
        }
        if let Some(x) = lookup("GP_PHYS_REGS") {
            config.phys_regs = x
                .parse()
                .map_err(|e| format!("Invalid GP_PHYS_REGS '{x}': {e}"))?;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.value_regs == 0 || self.value_regs > 256 {
            return Err(format!("{} value registers is out of range", self.value_regs).into());
        }
        Ok(())
    }
}

/// A compiler for the geometry processor. A `Compiler` holds only settings, so one can compile
/// many programs, from many threads.
#[derive(Debug)]
pub struct Compiler {
    config: Config,
    log: Log,
    stats: Stats,
}

impl Compiler {
    pub fn new(config: Config) -> Result<Self, Box<dyn Error>> {
        config.validate()?;
        Ok(Self {
            config,
            log: Log::new()?,
            stats: Stats::new(),
        })
    }

    /// Compile `prog` in place. On success each block of `prog` holds its bundles (see
    /// [Prog::instrs]) and every location is resolved. On failure no block holds any bundles.
    pub fn compile(&self, prog: &mut Prog) -> Result<(), CompilationError> {
        let r = self.compile_passes(prog);
        match &r {
            Ok(counts) => self.stats.compiled_ok(counts),
            Err(e) => {
                for b in prog.blocks.iter_mut() {
                    b.instrs.clear();
                }
                self.stats.compiled_err();
                self.log.log(Verbosity::Error, &e.to_string());
            }
        }
        self.stats.output();
        r.map(|_| ())
    }

    fn compile_passes(&self, prog: &mut Prog) -> Result<Counts, CompilationError> {
        let mut counts = Counts::default();
        self.log_ir(IRPhase::Input, prog);

        self.timed(Phase::Check, || {
            well_formed::check_well_formed(prog)?;
            for b in prog.blocks.indices() {
                prog.topo_sort(b)?;
            }
            Ok(())
        })?;

        self.timed(Phase::Lower, || {
            lower::lower(prog)?;
            well_formed::check_supported(prog)
        })?;
        counts.constants = prog.constants.len();
        self.log_ir(IRPhase::PostLower, prog);

        counts.value_spills = self.timed(Phase::ValueRegalloc, || {
            value_regalloc::alloc(prog, self.config.value_regs)
        })?;
        self.log_ir(IRPhase::PostValueRegalloc, prog);

        let sched_stats = self.timed(Phase::Sched, || sched::schedule(prog, &self.log))?;
        counts.copies = sched_stats.copies;
        counts.sched_spills = sched_stats.spills;
        counts.dup_loads = sched_stats.dup_loads;
        counts.bundles = prog.blocks.iter().map(|b| b.instrs.len()).sum();
        self.log_ir(IRPhase::PostSched, prog);

        counts.phys_regs = self.timed(Phase::Regalloc, || {
            regalloc::alloc(prog, self.config.phys_regs)
        })?;
        self.log_ir(IRPhase::PostRegalloc, prog);

        if cfg!(debug_assertions) {
            well_formed::check_schedule(prog)?;
        }
        Ok(counts)
    }

    /// Run `f`, recording how long it took as `phase`.
    fn timed<T, F>(&self, phase: Phase, f: F) -> Result<T, CompilationError>
    where
        F: FnOnce() -> Result<T, CompilationError>,
    {
        let start = Instant::now();
        let r = f();
        let d = start.elapsed();
        self.stats.phase_duration(phase, d);
        if self.log.enabled(Verbosity::Pass) {
            self.log.log(
                Verbosity::Pass,
                &format!("{phase} {}", if r.is_ok() { "ok" } else { "failed" }),
            );
        }
        r
    }

    fn log_ir(&self, phase: IRPhase, prog: &Prog) {
        if should_log_ir(phase) {
            log_ir(&format!("--- Begin {phase:?} ---\n{prog}--- End {phase:?} ---\n"));
        }
    }
}
