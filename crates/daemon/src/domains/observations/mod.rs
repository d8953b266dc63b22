mod parse_observations;

pub use parse_observations::*;
