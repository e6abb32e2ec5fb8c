//! Pipeline entry point.
//!
//! Thin wrapper around [`cubefind::Pipeline`]: parse the command line, load
//! the parameter file, run the stages, and map any failure to an `ERROR:`
//! line and a non-zero exit status.

use anyhow::Result;
use clap::Parser;

use cubefind::config::{Opt, Parameters};
use cubefind::Pipeline;

fn main() {
    let opt = Opt::parse();
    cubefind::init_logging(opt.quiet);

    if let Err(err) = run(&opt) {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
}

fn run(opt: &Opt) -> Result<()> {
    let mut par = Parameters::load(opt.parfile.as_deref())?;
    par.apply_overrides(opt)?;
    Pipeline::new(par).run()
}
