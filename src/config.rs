//! Command-line surface.

use clap::Parser;

/// Exit codes of the tool.
pub const EX_FAILURES: i32 = 1;
pub const EX_USAGE: i32 = 64;
pub const EX_SOFTWARE: i32 = 70;

/// Assay - fast interactive test runner
#[derive(Parser, Debug)]
#[command(name = "assay", version, about = "Fast interactive test runner")]
pub struct Cli {
    /// Directory, source file, or dotted module name to test
    #[arg(required = true, value_name = "NAME")]
    pub names: Vec<String>,

    /// Run the suite once without the terminal UI; exit status
    /// reflects the tally
    #[arg(long)]
    pub batch: bool,

    /// Print test names as they pass (batch mode only)
    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    /// Flag combinations the tool refuses to guess about.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && !self.batch {
            return Err("--verbose requires --batch".to_string());
        }
        Ok(())
    }
}

/// Parse the real command line, exiting 64 on misuse.
pub fn parse() -> Cli {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e)
            if e.kind() == clap::error::ErrorKind::DisplayHelp
                || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            e.exit()
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EX_USAGE);
        }
    };
    if let Err(message) = cli.validate() {
        eprintln!("assay: {message}");
        std::process::exit(EX_USAGE);
    }
    cli
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_names_are_required() {
        assert!(Cli::try_parse_from(["assay"]).is_err());
        let cli = Cli::try_parse_from(["assay", "pkg.tests"]).unwrap();
        assert_eq!(cli.names, ["pkg.tests"]);
        assert!(!cli.batch);
    }

    #[test]
    fn several_names_are_accepted() {
        let cli = Cli::try_parse_from(["assay", "a", "b", "c"]).unwrap();
        assert_eq!(cli.names.len(), 3);
    }

    #[test]
    fn verbose_outside_batch_is_invalid() {
        let cli = Cli::try_parse_from(["assay", "--verbose", "m"]).unwrap();
        assert!(cli.validate().is_err());
        let cli = Cli::try_parse_from(["assay", "--batch", "--verbose", "m"]).unwrap();
        assert!(cli.validate().is_ok());
    }
}
