//! This module records statistics about compilations. Durations are wall-clock time, so they are
//! only a rough guide.

use std::{
    env, fs,
    ops::DerefMut,
    sync::Mutex,
    time::Duration,
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if the end user defines the environment variable `GPD_LOG_STATS`.
#[derive(Debug)]
pub(crate) struct Stats {
    // Most compilations record nothing, so the check for "are stats to be recorded?" should be as
    // cheap as possible: only if they are is the `Mutex` locked.
    inner: Option<Mutex<StatsInner>>,
}

/// The counts one compilation contributes.
#[derive(Debug, Default)]
pub(crate) struct Counts {
    pub(crate) bundles: usize,
    pub(crate) constants: usize,
    pub(crate) copies: usize,
    pub(crate) dup_loads: usize,
    pub(crate) sched_spills: usize,
    pub(crate) value_spills: usize,
    pub(crate) phys_regs: usize,
}

#[derive(Debug)]
struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    compiled_ok: u64,
    compiled_err: u64,
    counts: Counts,
    /// The time spent in each [Phase].
    durations: [Duration; Phase::COUNT],
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self::from_var(env::var("GPD_LOG_STATS").ok())
    }

    fn from_var(path: Option<String>) -> Self {
        Self {
            inner: path.map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    /// If `GPD_LOG_STATS` was specified, update `inner` by running the function `f`, otherwise
    /// return immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            if let Ok(mut lk) = mtx.lock() {
                f(lk.deref_mut());
            }
        }
    }

    pub(crate) fn compiled_ok(&self, counts: &Counts) {
        self.update_with(|inner| {
            inner.compiled_ok += 1;
            let c = &mut inner.counts;
            c.bundles += counts.bundles;
            c.constants += counts.constants;
            c.copies += counts.copies;
            c.dup_loads += counts.dup_loads;
            c.sched_spills += counts.sched_spills;
            c.value_spills += counts.value_spills;
            c.phys_regs = c.phys_regs.max(counts.phys_regs);
        });
    }

    pub(crate) fn compiled_err(&self) {
        self.update_with(|inner| inner.compiled_err += 1);
    }

    /// Add `d` to the time spent in `phase`.
    pub(crate) fn phase_duration(&self, phase: Phase, d: Duration) {
        self.update_with(|inner| {
            inner.durations[phase as usize] = inner.durations[phase as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            compiled_ok: 0,
            compiled_err: 0,
            counts: Counts::default(),
            durations: [Duration::new(0, 0); Phase::COUNT],
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is sorted by field name so that it can be
    /// matched textually.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let c = &self.counts;
        let mut fields = vec![
            ("programs_compiled_ok".to_owned(), self.compiled_ok.to_string()),
            ("programs_compiled_err".to_owned(), self.compiled_err.to_string()),
            ("bundles".to_owned(), c.bundles.to_string()),
            ("constants".to_owned(), c.constants.to_string()),
            ("copies".to_owned(), c.copies.to_string()),
            ("dup_loads".to_owned(), c.dup_loads.to_string()),
            ("sched_spills".to_owned(), c.sched_spills.to_string()),
            ("value_spills".to_owned(), c.value_spills.to_string()),
            ("phys_regs_max".to_owned(), c.phys_regs.to_string()),
        ];
        for v in Phase::iter() {
            fields.push((v.to_string(), fmt_duration(self.durations[v as usize])));
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The phases of a compilation whose durations are recorded.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter)]
// Each variant's `to_string` is its key in the JSON stats, and variants must range over
// `0..Phase::COUNT`.
pub(crate) enum Phase {
    #[strum(to_string = "duration_check")]
    Check,
    #[strum(to_string = "duration_lower")]
    Lower,
    #[strum(to_string = "duration_value_regalloc")]
    ValueRegalloc,
    #[strum(to_string = "duration_sched")]
    Sched,
    #[strum(to_string = "duration_regalloc")]
    Regalloc,
}
