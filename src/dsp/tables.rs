use std::f32::consts::PI;
use std::sync::OnceLock;

/// Quarter-wave sine table: only 0..PI/2 is stored, the rest of the cycle is reconstructed by
/// mirroring/negating the quadrant. No interpolation — a compiled tape evaluates this once per
/// sample and the additional branch is cheaper than a second memory fetch plus a lerp.
pub const QUARTER_WAVE_SIZE: usize = 2048;

pub struct SineTable {
    quarter: [f32; QUARTER_WAVE_SIZE],
}

impl SineTable {
    pub fn new() -> Self {
        let mut quarter = [0.0; QUARTER_WAVE_SIZE];
        for (i, slot) in quarter.iter_mut().enumerate() {
            let angle = (i as f32) / (QUARTER_WAVE_SIZE as f32) * (PI / 2.0);
            *slot = angle.sin();
        }
        Self { quarter }
    }

    /// `phase` is expected in `[0.0, 1.0)`, one full cycle. Values outside that range are
    /// wrapped. Reconstructs the full cycle from the first quadrant by symmetry:
    /// `sin(x) = sin(pi - x) = -sin(x - pi) = -sin(2pi - x)`.
    #[inline]
    pub fn sin(&self, phase: f32) -> f32 {
        let phase = phase - phase.floor();
        let quadrant = (phase * 4.0) as usize & 3;
        let within = phase * 4.0 - (quadrant as f32);
        let index = ((within * QUARTER_WAVE_SIZE as f32) as usize).min(QUARTER_WAVE_SIZE - 1);

        match quadrant {
            0 => self.quarter[index],
            1 => self.quarter[QUARTER_WAVE_SIZE - 1 - index],
            2 => -self.quarter[index],
            _ => -self.quarter[QUARTER_WAVE_SIZE - 1 - index],
        }
    }

    #[inline]
    pub fn cos(&self, phase: f32) -> f32 {
        self.sin(phase + 0.25)
    }
}

impl Default for SineTable {
    fn default() -> Self {
        Self::new()
    }
}

static SINE_TABLE: OnceLock<SineTable> = OnceLock::new();

pub fn get_sine_table() -> &'static SineTable {
    SINE_TABLE.get_or_init(SineTable::new)
}

#[inline]
pub fn table_sin(phase: f32) -> f32 {
    get_sine_table().sin(phase)
}

#[inline]
pub fn table_cos(phase: f32) -> f32 {
    get_sine_table().cos(phase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_std_sine_closely() {
        let table = SineTable::new();
        for i in 0..997 {
            let phase = i as f32 / 997.0;
            let expected = (phase * 2.0 * PI).sin();
            let got = table.sin(phase);
            assert!((got - expected).abs() < 0.01, "phase {phase}: {got} vs {expected}");
        }
    }

    #[test]
    fn quarter_points_are_exact_landmarks() {
        let table = SineTable::new();
        assert!((table.sin(0.0) - 0.0).abs() < 1e-3);
        assert!((table.sin(0.25) - 1.0).abs() < 1e-3);
        assert!((table.sin(0.75) - (-1.0)).abs() < 1e-3);
    }
}
