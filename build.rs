//! Build script rendering the `playrun` manual pages.
//!
//! Writes `playrun.1` plus one `playrun-<subcommand>.1` page per subcommand
//! into `OUT_DIR` for packaging.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn render(man: &Man, target: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut page = Vec::new();
    man.render(&mut page)?;
    fs::write(target, page)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or("OUT_DIR was not set")?;

    let root = cli::Cli::command();
    for sub in root.get_subcommands() {
        let title = format!("playrun-{}", sub.get_name());
        let man = Man::new(sub.clone()).title(title.as_str());
        render(&man, &out_dir.join(format!("{title}.1")))?;
    }
    render(&Man::new(root), &out_dir.join("playrun.1"))
}
