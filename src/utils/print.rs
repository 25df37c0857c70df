//! Logging helper macros with a parenthesized component prefix.
//!
//! Coordinator modules tag their lines with a short prefix ("r" for the
//! roster call side, "u" for the updater, "j" for the journal, "t" for
//! transport) so interleaved output from concurrent tasks stays readable.

/// Log TRACE message with parenthesized prefix.
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log INFO message with parenthesized prefix.
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log WARN message with parenthesized prefix.
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized prefix.
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log an error string to the logger, then return an `Err(RosterError)`
/// holding the same (prefixed) string.
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {{
        pf_error!($prefix; $fmt_str $(, $fmt_arg)*);
        Err(RosterError::msg(format!(
            concat!("({}) ", $fmt_str),
            $prefix $(, $fmt_arg)*
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::RosterError;

    #[test]
    fn logged_err_no_args() {
        assert_eq!(
            logged_err!("r"; "slot table corrupted"),
            Err::<(), RosterError>(RosterError::msg(
                "(r) slot table corrupted"
            ))
        );
    }

    #[test]
    fn logged_err_with_args() {
        assert_eq!(
            logged_err!("u"; "work unit for {} dropped", 7),
            Err::<(), RosterError>(RosterError::msg(
                "(u) work unit for 7 dropped"
            ))
        );
    }
}
