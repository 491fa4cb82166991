use std::process::ExitCode;

use clap::Parser;
use decryptor_dumper::{
    analysis::{DecryptorScanner, ImageView, Signature, WithBase},
    pelite::pe64::PeView,
};

#[derive(Parser)]
#[command(version, about = "Recover the value decryptors of a memory dump", long_about = None)]
struct CliArgs {
    #[arg(value_name = "DUMP", help = "Memory dump of the game's executable image")]
    dump: String,

    #[arg(
        short, long,
        value_name = "VA",
        help = "Virtual address the dump was taken at, if it is not a mapped PE image",
        value_parser=clap_num::maybe_hex::<u64>
    )]
    base: Option<u64>,

    #[arg(
        short,
        long,
        value_name = "SIG",
        help = "Signature preceding the name and object pointer decryptors"
    )]
    anchor: Option<Signature>,

    #[arg(
        short,
        long,
        help = "Enable trace logs, including the annotated listing of every analyzed window"
    )]
    trace: bool,
}

fn scan(scanner: &DecryptorScanner, image: impl ImageView + Sync) -> ExitCode {
    log::info!("scanning image based at {:x}", image.base_va());
    match scanner.scan(&image) {
        Ok(decryptors) => {
            println!("Found decryptors:\n");
            print!("{decryptors}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let level = match args.trace {
        true => log::LevelFilter::Trace,
        false => log::LevelFilter::Info,
    };
    if let Err(e) = simplelog::SimpleLogger::init(level, simplelog::Config::default()) {
        eprintln!("failed to initialize logging: {e}");
    }

    let bytes = match std::fs::read(&args.dump) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("failed to read {}: {e}", args.dump);
            return ExitCode::FAILURE;
        }
    };
    if bytes.is_empty() {
        log::error!("{} is empty", args.dump);
        return ExitCode::FAILURE;
    }

    let mut scanner = DecryptorScanner::new().trace_slices(args.trace);
    if let Some(anchor) = args.anchor {
        scanner = scanner.anchor_signature(anchor);
    }

    match PeView::from_bytes(&bytes) {
        Ok(pe) => scan(&scanner, pe),
        Err(e) => {
            log::debug!("not a mapped PE image ({e}), scanning as a flat buffer");
            let image = WithBase::new(&bytes[..], args.base.unwrap_or(0));
            log::info!("flat dump covers {:x}..{:x}", image.base_va(), image.end_va());
            scan(&scanner, image)
        }
    }
}
