//! Error reporting helpers.

use std::fmt::Write;

use anyhow::Error;

/// Render an error as a multi-line report: the error itself, every wrapped
/// cause underneath it, and the captured backtrace. Fatal startup failures
/// get formatted through this before tracing is necessarily set up, so the
/// caller decides where the report goes.
pub(crate) fn fatal_report(err: &Error) -> String {
    let mut report = format!("Error: {}", err);
    for cause in err.chain().skip(1) {
        let _ = write!(report, "\n  caused by: {}", cause);
    }
    let _ = write!(report, "\n{}", err.backtrace());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{format_err, Context};

    #[test]
    fn report_lists_the_error_and_every_cause() {
        let err = Err::<(), Error>(format_err!("connection refused"))
            .context("could not reach the elevation service")
            .unwrap_err();
        let report = fatal_report(&err);
        assert!(report.starts_with("Error: could not reach the elevation service"));
        assert!(report.contains("caused by: connection refused"));
    }

    #[test]
    fn report_without_causes_is_a_single_error_line() {
        let err = format_err!("no free port");
        let report = fatal_report(&err);
        assert!(report.starts_with("Error: no free port"));
        assert!(!report.contains("caused by:"));
    }
}
