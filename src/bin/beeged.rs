//! beege daemon binary.
//!
//! See [`beeged::cli`] for usage.

fn main() -> anyhow::Result<()> {
    beeged::cli::run()
}
