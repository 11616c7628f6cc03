//! Wall-time breakdown by solver phase.

use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone)]
pub enum PerfSection {
    FunctionEvals,
    Residuals,
    Echelonize,
    Factorization,
    Solve,
    Stepping,
    Sensitivities,
}

#[derive(Debug, Default, Clone)]
pub struct PerfTimers {
    pub function_evals: Duration,
    pub residuals: Duration,
    pub echelonize: Duration,
    pub factorization: Duration,
    pub solve: Duration,
    pub stepping: Duration,
    pub sensitivities: Duration,
}

impl PerfTimers {
    pub fn scoped(&mut self, section: PerfSection) -> PerfGuard<'_> {
        PerfGuard {
            section,
            start: Instant::now(),
            timers: self,
        }
    }

    pub fn add(&mut self, section: PerfSection, dt: Duration) {
        match section {
            PerfSection::FunctionEvals => self.function_evals += dt,
            PerfSection::Residuals => self.residuals += dt,
            PerfSection::Echelonize => self.echelonize += dt,
            PerfSection::Factorization => self.factorization += dt,
            PerfSection::Solve => self.solve += dt,
            PerfSection::Stepping => self.stepping += dt,
            PerfSection::Sensitivities => self.sensitivities += dt,
        }
    }
}

pub struct PerfGuard<'a> {
    section: PerfSection,
    start: Instant,
    timers: &'a mut PerfTimers,
}

impl Drop for PerfGuard<'_> {
    fn drop(&mut self) {
        self.timers.add(self.section, self.start.elapsed());
    }
}
