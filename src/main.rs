#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use structopt::StructOpt;

use ripdeflate::{CompressionLevel, CompressionMethod, Deflate, Gzip, Zlib};

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Gzip,
    Zlib,
    Deflate,
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" | "gz" => Ok(Self::Gzip),
            "zlib" => Ok(Self::Zlib),
            "deflate" | "raw" => Ok(Self::Deflate),
            other => Err(anyhow!("unknown format {:?}", other)),
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "ripdeflate", about = "DEFLATE, ZLIB and GZIP codec")]
struct Opts {
    /// Decompress instead of compressing
    #[structopt(short = "d", long = "decompress")]
    decompress: bool,

    /// Container format: gzip, zlib or deflate
    #[structopt(short = "f", long = "format", default_value = "gzip")]
    format: Format,

    /// Compression level, 0 (store) to 9 (best)
    #[structopt(short = "l", long = "level", default_value = "6")]
    level: CompressionLevel,

    /// Decoder window size as a power of two (8 to 15)
    #[structopt(long = "window-bits", default_value = "15")]
    window_bits: u8,

    /// Log checksum mismatches instead of failing
    #[structopt(long = "no-check")]
    no_check: bool,

    /// Verbosity, repeat for more
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: usize,

    /// Input file, stdin if omitted
    #[structopt(parse(from_os_str))]
    input: Option<PathBuf>,

    /// Output file, stdout if omitted
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
}

fn run<M: CompressionMethod>(
    method: &M,
    decompress: bool,
    input: impl Read,
    mut output: impl Write,
) -> Result<u64> {
    let count = if decompress {
        method.uncompress(input, &mut output)
    } else {
        method.compress(input, &mut output)
    };
    output.flush().context("failed to flush output")?;
    count.with_context(|| {
        format!(
            "{} {} failed",
            method.name(),
            if decompress { "decompression" } else { "compression" }
        )
    })
}

fn main() -> Result<()> {
    let opts = Opts::from_args();
    stderrlog::new()
        .verbosity(opts.verbose)
        .init()
        .context("failed to initialize logging")?;

    if opts.no_check && !opts.decompress {
        bail!("--no-check only applies to decompression");
    }

    let deflate = Deflate::new()
        .with_level(opts.level)
        .with_window_bits(opts.window_bits)?;

    let input: Box<dyn Read> = match &opts.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };
    let output: Box<dyn Write> = match &opts.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let count = match opts.format {
        Format::Gzip => run(
            &Gzip::new()
                .with_deflate(deflate)
                .with_check_crc(!opts.no_check),
            opts.decompress,
            input,
            output,
        )?,
        Format::Zlib => run(
            &Zlib::new()
                .with_deflate(deflate)
                .with_check_adler(!opts.no_check),
            opts.decompress,
            input,
            output,
        )?,
        Format::Deflate => run(&deflate, opts.decompress, input, output)?,
    };

    info!("processed {} uncompressed bytes", count);
    Ok(())
}
