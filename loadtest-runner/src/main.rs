//! The `impala-loadtest` binary.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

fn main() -> anyhow::Result<()> {
    loadtest_runner::cli::execute()
}
