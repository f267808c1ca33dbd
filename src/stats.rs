//! Collecting and reporting building statistics.

use std::io::Write;

/// Trait for collecting (and summarizing or reporting) events during construction
/// of a Consensus hash function.
pub trait BuildStatsCollector {
    /// Called whenever backtracking exhausts the splitting tasks and the search
    /// restarts with the given, fresh root seed. Default implementation does nothing.
    #[inline(always)] fn root_seed_changed(&mut self, _root_seed: u64) {}

    /// Called once per level of the splitting tree by the levelwise construction,
    /// with the number of keys per task and the number of bits occupied by the level.
    /// Default implementation does nothing.
    #[inline(always)] fn level(&mut self, _level: usize, _task_size: usize, _level_bits: usize) {}

    /// Called once at the end of the building process. Default implementation does nothing.
    #[inline(always)] fn end(&mut self, _success: bool) {}
}

/// Ignores all events and does nothing.
impl BuildStatsCollector for () {}

/// Reports events occurred during building to the wrapped writer.
pub struct BuildStatsPrinter<W: Write = std::io::Stdout>(W);

impl BuildStatsPrinter<std::io::Stdout> {
    /// Reports events occurred during building to the standard output.
    pub fn stdout() -> Self { Self(std::io::stdout()) }
}

impl<W: Write> BuildStatsCollector for BuildStatsPrinter<W> {
    fn root_seed_changed(&mut self, root_seed: u64) {
        writeln!(self.0, "restarting search with root seed {}", root_seed).unwrap();
    }

    fn level(&mut self, level: usize, task_size: usize, level_bits: usize) {
        writeln!(self.0, "level {} ({} keys each): {} bits", level, task_size, level_bits).unwrap();
    }

    fn end(&mut self, success: bool) {
        writeln!(self.0, "completed {}", if success { "successfully" } else { "unsuccessfully" }).unwrap();
    }
}
