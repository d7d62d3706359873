pub mod log_setup;
pub mod parallel;
pub mod slot;

pub use log_setup::setup_logging;
pub use parallel::{for_each_row, try_for_each_row, parallel_chunked, RowTaskFailure};
pub use slot::Slot;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}
