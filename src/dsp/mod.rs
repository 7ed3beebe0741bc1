pub mod biquad;
pub mod delay_line;
pub mod math;
pub mod tables;

pub use biquad::{BiquadFilter, FilterType};
pub use math::*;
pub use tables::{SineTable, get_sine_table, table_cos, table_sin};
