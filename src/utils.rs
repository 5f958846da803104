//! Small helpers shared across the crate, in the style of the teacher
//! crate's `utils` module.

use std::io::Write;

use log::LevelFilter;

/// Initialize the global logger with a formatter that includes the file
/// and line of the log call. Safe to call more than once; only the first
/// call takes effect.
pub fn init_log() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .format_timestamp_secs()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} - {}] [{}:{}] {}",
                record.level(),
                record.target(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init();
}

/// Ceiling division, used by the checkpoint capacity oracle to compute
/// how many end-checkpoint records a DPT/transaction-table of a given
/// size packs into.
pub fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(7, 3), 3);
        assert_eq!(ceil_div(6, 3), 2);
        assert_eq!(ceil_div(0, 3), 0);
    }
}
