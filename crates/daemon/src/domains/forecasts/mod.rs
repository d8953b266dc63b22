mod decode_forecast;

pub use decode_forecast::*;
