use deobfu::*;

use std::path::PathBuf;

use clap::Parser;

/// Inspect and validate serialized patch sets
#[derive(Parser, Debug)]
#[clap(about, version, author)]
struct Args {
    #[clap(subcommand)]
    command: Command,
    /// Disable terminal logging, even for high severity alerts. Strongly
    /// discouraged for normal use.
    #[clap(long)]
    debug_disable_terminal_logging: bool,
    /// Force blocking for terminal logging. If too many messages are being
    /// spewed the logger, by default, does not block, but instead dumps a
    /// dropped-messages alert. This option forces it to block and dump even
    /// if too many are being sent.
    #[clap(long)]
    debug_forced_blocking_terminal_logging: bool,
    /// Path to send log (as JSON) to
    #[clap(long = "--log")]
    log_file: Option<PathBuf>,
    /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
    #[clap(short, long, parse(from_occurrences))]
    debug: usize,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print every patch in a serialized patch set
    Inspect {
        /// Path to a patch-set blob, as stored under the image metadata key
        /// or exported to a file
        patch_set: PathBuf,
    },
    /// Validate every patch program in a serialized patch set by evaluating
    /// it against a recording IR builder
    Check {
        /// Path to a patch-set blob
        patch_set: PathBuf,
    },
}

fn load(path: &PathBuf) -> Vec<(u64, patch::Patch)> {
    let blob = std::fs::read_to_string(path).expect("patch set file could not be read");
    match persist::decode_patch_set(&blob) {
        Ok(entries) => entries,
        Err(err) => {
            log::error!("Rejected patch set"; "path" => %path.display(), "error" => %err);
            std::process::exit(1);
        }
    }
}

fn main() {
    let args = Args::parse();

    let _log_guard = slog_scope::set_global_logger(log::FileAndTermDrain::new(
        args.debug,
        args.debug_disable_terminal_logging,
        args.debug_forced_blocking_terminal_logging,
        args.log_file,
    ));

    match args.command {
        Command::Inspect { patch_set } => {
            for (address, patch) in load(&patch_set) {
                println!(
                    "{:#x}: {} bytes, {} tokens",
                    address,
                    patch.size,
                    patch.tokens.len()
                );
                for token in &patch.tokens {
                    match token {
                        patch::Token::Operand(value) => println!("\toperand\t{:#x}", value),
                        patch::Token::Instruction(op) => println!("\tbuild\t{:?}", op),
                    }
                }
            }
        }
        Command::Check { patch_set } => {
            let mut failures = 0usize;
            let entries = load(&patch_set);
            let total = entries.len();
            for (address, patch) in entries {
                let mut il = il::RecordingIl::new();
                match patch.evaluate(&mut il) {
                    Ok(()) => println!(
                        "{:#x}: ok ({} instructions)",
                        address,
                        il.instructions().len()
                    ),
                    Err(err) => {
                        failures += 1;
                        println!("{:#x}: FAILED: {}", address, err);
                    }
                }
            }
            println!("{}/{} patches ok", total - failures, total);
            if failures > 0 {
                std::process::exit(1);
            }
        }
    }
}
