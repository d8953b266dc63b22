mod batch;
mod domains;
mod fetcher;
mod utils;

pub use batch::*;
pub use domains::*;
pub use fetcher::*;
pub use utils::*;
