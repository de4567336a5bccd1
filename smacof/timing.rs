use std::fmt;
use std::time::Duration;

/// Phases whose elapsed time is accumulated per worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimingPhase {
    /// BofZ, its multiply with the current points, and the merge.
    Bc,
    Cg,
    /// Every application of the iteration matrix inside CG.
    Mm,
    Stress,
    TemperatureLoop,
}

impl TimingPhase {
    pub const ALL: [TimingPhase; 5] = [
        TimingPhase::Bc,
        TimingPhase::Cg,
        TimingPhase::Mm,
        TimingPhase::Stress,
        TimingPhase::TemperatureLoop,
    ];

    pub fn describe(self) -> &'static str {
        match self {
            Self::Bc => "BC",
            Self::Cg => "CG",
            Self::Mm => "MM",
            Self::Stress => "stress",
            Self::TemperatureLoop => "temperature loop",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TimingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Accumulated time and call count per phase.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PhaseTimings {
    elapsed: [Duration; 5],
    calls: [u64; 5],
}

impl PhaseTimings {
    pub fn record(&mut self, phase: TimingPhase, elapsed: Duration) {
        self.elapsed[phase.index()] += elapsed;
        self.calls[phase.index()] += 1;
    }

    pub fn elapsed(&self, phase: TimingPhase) -> Duration {
        self.elapsed[phase.index()]
    }

    pub fn calls(&self, phase: TimingPhase) -> u64 {
        self.calls[phase.index()]
    }
}

impl fmt::Display for PhaseTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, phase) in TimingPhase::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{phase} {} ({} calls)",
                format_elapsed(self.elapsed(*phase)),
                self.calls(*phase)
            )?;
        }
        Ok(())
    }
}

/// Renders a duration as `{d}d:{HH}H:{MM}M:{SS}S:{mmm}mS`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_millis();
    let millis = total % 1000;
    let seconds = (total / 1000) % 60;
    let minutes = (total / 60_000) % 60;
    let hours = (total / 3_600_000) % 24;
    let days = total / 86_400_000;
    format!("{days}d:{hours:02}H:{minutes:02}M:{seconds:02}S:{millis:03}mS")
}

/// Observer for the progress of an annealing run. Only the root worker reports.
pub trait AnnealObserver {
    fn on_initial_stress(&mut self, stress: f64) {
        let _ = stress;
    }
    fn on_iteration(&mut self, loop_num: usize, iteration: usize, stress: f64) {
        let _ = (loop_num, iteration, stress);
    }
    fn on_temperature_end(&mut self, loop_num: usize, temperature: f64, iterations: usize, stress: f64) {
        let _ = (loop_num, temperature, iterations, stress);
    }
}

#[derive(Default)]
pub struct NoopObserver;

impl AnnealObserver for NoopObserver {}

/// Records every stress value the root worker reports.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StressTrace {
    pub initial: Option<f64>,
    /// `(loop, stress)` after every SMACOF iteration.
    pub iterations: Vec<(usize, f64)>,
    /// `(loop, temperature, stress)` at the end of every temperature loop.
    pub loops: Vec<(usize, f64, f64)>,
}

impl AnnealObserver for StressTrace {
    fn on_initial_stress(&mut self, stress: f64) {
        self.initial = Some(stress);
    }

    fn on_iteration(&mut self, loop_num: usize, _iteration: usize, stress: f64) {
        self.iterations.push((loop_num, stress));
    }

    fn on_temperature_end(&mut self, loop_num: usize, temperature: f64, _iterations: usize, stress: f64) {
        self.loops.push((loop_num, temperature, stress));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formatting_matches_the_log_layout() {
        assert_eq!(format_elapsed(Duration::from_millis(0)), "0d:00H:00M:00S:000mS");
        let elapsed = Duration::from_millis(((2 * 24 + 3) * 3600 + 4 * 60 + 5) * 1000 + 67);
        assert_eq!(format_elapsed(elapsed), "2d:03H:04M:05S:067mS");
    }

    #[test]
    fn timings_accumulate_per_phase() {
        let mut timings = PhaseTimings::default();
        timings.record(TimingPhase::Cg, Duration::from_millis(5));
        timings.record(TimingPhase::Cg, Duration::from_millis(7));
        timings.record(TimingPhase::Stress, Duration::ZERO);
        assert_eq!(timings.elapsed(TimingPhase::Cg), Duration::from_millis(12));
        assert_eq!(timings.calls(TimingPhase::Cg), 2);
        assert_eq!(timings.calls(TimingPhase::Stress), 1);
        assert_eq!(timings.calls(TimingPhase::Bc), 0);
    }
}
