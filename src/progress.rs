//! Progress bars of the batch phases.

use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Result;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:20.bold.dim} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})";

pub fn bar(len: usize, prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(ProgressStyle::default_bar().template(BAR_TEMPLATE)?.progress_chars("#>-"));
    pb.set_prefix(prefix.to_string());
    Ok(pb)
}
